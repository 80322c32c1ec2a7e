//! Error types and handling for the SC mesh core
//!
//! Every fallible operation in the crate returns [`Result`]. The relay engine
//! uses the category/retry classification to decide whether a failure is
//! dropped, retried with backoff, or treated as fatal for the session.

use thiserror::Error;

/// Result type alias for SC mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for monitoring and recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Wire decode and protocol violations
    Protocol,
    /// Cryptographic and security errors
    Security,
    /// Network and transport layer errors
    Network,
    /// Persistence adapter errors
    Storage,
    /// Resource exhaustion (queues, rate limits)
    Resources,
    /// Configuration and setup errors
    Configuration,
    /// Internal invariant violations
    Internal,
}

impl ErrorCategory {
    /// Monitoring severity level for this category
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Security => ErrorSeverity::Critical,
            Self::Network | Self::Storage | Self::Internal => ErrorSeverity::High,
            Self::Resources => ErrorSeverity::Medium,
            Self::Protocol | Self::Configuration => ErrorSeverity::Low,
        }
    }

    /// Recommended retry strategy for this category
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Network => RetryStrategy::ExponentialBackoff { max_retries: 3 },
            Self::Storage => RetryStrategy::ExponentialBackoff { max_retries: 2 },
            Self::Resources => RetryStrategy::LinearBackoff { max_retries: 5 },
            Self::Protocol | Self::Security | Self::Configuration => RetryStrategy::NoRetry,
            Self::Internal => RetryStrategy::NoRetry,
        }
    }
}

/// Error severity levels for alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Retry strategies for error recovery
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    NoRetry,
    LinearBackoff { max_retries: u32 },
    ExponentialBackoff { max_retries: u32 },
}

/// SC mesh error types
///
/// The decode, signature, session, and transport variants mirror the relay
/// pipeline stages; anything a remote peer can trigger carries enough detail
/// to adjust that peer's reputation without string matching.
#[derive(Debug, Error)]
pub enum Error {
    // Wire decode failures. Decode is total: malformed input produces one
    // of these, never a panic.
    #[error("invalid protocol version: expected {expected:#04x}, got {actual:#04x}")]
    InvalidVersion { expected: u8, actual: u8 },

    #[error("invalid message type: {0:#04x}")]
    InvalidType(u8),

    #[error("invalid TTL: {ttl} (max {max})")]
    InvalidTtl { ttl: u8, max: u8 },

    #[error("invalid payload length: {len} (max {max})")]
    InvalidLength { len: usize, max: usize },

    #[error("invalid reserved byte: {0:#04x}")]
    InvalidReserved(u8),

    #[error("timestamp skew out of bounds: {skew_ms} ms")]
    InvalidTimestampSkew { skew_ms: i64 },

    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    // Security
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("AEAD authentication failed")]
    MacFailure,

    #[error("nonce reuse detected for peer {0}")]
    NonceReuse(String),

    #[error("no session established with peer {0}")]
    NoSession(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    // Relay / queueing
    #[error("duplicate envelope")]
    Duplicate,

    #[error("rate limited: {0}")]
    RateLimited(&'static str),

    #[error("peer is blacklisted")]
    Blacklisted,

    #[error("queue overloaded, low-priority enqueue rejected")]
    Overloaded,

    // Transport
    #[error("transient transport failure: {0}")]
    TransportTransient(String),

    #[error("permanent transport failure: {0}")]
    TransportPermanent(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    // Persistence
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("fatal persistence error on identity write: {0}")]
    PersistenceFatal(String),

    #[error("wipe refused: bad confirmation token")]
    WipeRefused,

    // Ambient
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl Error {
    /// Error category for monitoring and recovery policy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidVersion { .. }
            | Self::InvalidType(_)
            | Self::InvalidTtl { .. }
            | Self::InvalidLength { .. }
            | Self::InvalidReserved(_)
            | Self::InvalidTimestampSkew { .. }
            | Self::Truncated { .. }
            | Self::Duplicate
            | Self::Protocol(_) => ErrorCategory::Protocol,
            Self::SignatureInvalid
            | Self::MacFailure
            | Self::NonceReuse(_)
            | Self::NoSession(_)
            | Self::Crypto(_)
            | Self::WipeRefused => ErrorCategory::Security,
            Self::TransportTransient(_)
            | Self::TransportPermanent(_)
            | Self::Timeout(_)
            | Self::Io(_) => ErrorCategory::Network,
            Self::Persistence(_) | Self::PersistenceFatal(_) => ErrorCategory::Storage,
            Self::RateLimited(_) | Self::Overloaded | Self::Blacklisted => {
                ErrorCategory::Resources
            }
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) | Self::InvalidState(_) | Self::NotFound(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Error severity for alerting
    pub fn severity(&self) -> ErrorSeverity {
        self.category().severity()
    }

    /// Recommended retry strategy
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            // Fatal regardless of category: identity writes must not be
            // retried against a failing store.
            Self::PersistenceFatal(_) => RetryStrategy::NoRetry,
            Self::TransportPermanent(_) => RetryStrategy::NoRetry,
            other => other.category().retry_strategy(),
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_strategy(), RetryStrategy::NoRetry)
    }

    /// Whether this error is a wire decode failure (a protocol violation
    /// attributable to the sending peer)
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVersion { .. }
                | Self::InvalidType(_)
                | Self::InvalidTtl { .. }
                | Self::InvalidLength { .. }
                | Self::InvalidReserved(_)
                | Self::InvalidTimestampSkew { .. }
                | Self::Truncated { .. }
        )
    }
}
