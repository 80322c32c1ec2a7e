// src/protocol/constants.rs

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size: version(1) + type(1) + ttl(1) + reserved(1)
/// + timestamp(8) + sender_public_key(32) + signature(65)
pub const HEADER_LEN: usize = 109;

/// Header prefix covered as AEAD associated data: version..sender_public_key
pub const AAD_LEN: usize = 44;

/// Maximum payload size in bytes
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Wire ceiling for TTL
pub const MAX_TTL: u8 = 10;

/// Reserved header byte value
pub const RESERVED: u8 = 0x00;

// Message type codes
pub const TYPE_TEXT: u8 = 0x01;
pub const TYPE_FILE_METADATA: u8 = 0x02;
pub const TYPE_FILE_CHUNK: u8 = 0x03;
pub const TYPE_VOICE: u8 = 0x04;
pub const TYPE_ACK: u8 = 0x10;
pub const TYPE_PING: u8 = 0x11;
pub const TYPE_PONG: u8 = 0x12;
pub const TYPE_PEER_DISCOVERY: u8 = 0x20;
pub const TYPE_PEER_INTRO: u8 = 0x21;
pub const TYPE_KEY_EXCHANGE: u8 = 0x30;
pub const TYPE_SESSION_KEY: u8 = 0x31;

// Discovery collaborator constants. The core does not implement discovery;
// these are the values collaborators must agree on.

/// URI scheme for QR peer-info payloads: `sc://<pubkey-hex>@<host>:<port>`
pub const PEER_URI_SCHEME: &str = "sc";

/// mDNS service type advertised by reachable peers
pub const MDNS_SERVICE_TYPE: &str = "_sc._udp.local";

/// TXT record keys for mDNS advertisements
pub const MDNS_TXT_PEER_ID: &str = "peerId";
pub const MDNS_TXT_PUBLIC_KEY: &str = "publicKey";
pub const MDNS_TXT_WEBRTC: &str = "webrtc";

/// BLE GATT service UUID for the mesh transport
pub const BLE_SERVICE_UUID: &str = "0000FE9A-0000-1000-8000-00805F9B34FB";

/// BLE fragmentation unit for GATT writes
pub const BLE_FRAGMENT_MTU: usize = 512;
