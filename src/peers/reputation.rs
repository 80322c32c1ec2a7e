//! Reputation scoring for mesh peers
//!
//! Scores move on observable events only and stay clamped to
//! [[`MIN_REPUTATION`], [`MAX_REPUTATION`]]. Peers falling below
//! [`BLACKLIST_THRESHOLD`] are auto-blacklisted by the registry.

use serde::{Deserialize, Serialize};

/// Reputation score bounds
pub const MIN_REPUTATION: i32 = -100;
pub const MAX_REPUTATION: i32 = 100;
pub const INITIAL_REPUTATION: i32 = 50;

/// Score below which a peer is auto-blacklisted
pub const BLACKLIST_THRESHOLD: i32 = 20;

/// Reputation change amounts
pub const REP_VALID_MESSAGE: i32 = 1;
pub const REP_INVALID_SIGNATURE: i32 = -15;
pub const REP_REPLAY_FLOOD: i32 = -10;
pub const REP_SPAM: i32 = -10;
pub const REP_PROTOCOL_VIOLATION: i32 = -10;
pub const REP_SEVERE_PROTOCOL_VIOLATION: i32 = -15;
pub const REP_SECURITY_ALERT: i32 = -20;

/// Duplicate floods above this rate count as replay flooding
pub const REPLAY_FLOOD_PER_SEC: u32 = 10;

/// Message rates above this per minute count as spam
pub const SPAM_PER_MIN: u32 = 100;

/// Observable events that move a peer's reputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationEvent {
    /// A correctly signed message arrived from the peer
    ValidMessage,
    /// A message carried an invalid signature
    InvalidSignature,
    /// Duplicate flood above the replay threshold
    ReplayFlood,
    /// Sustained message rate above the spam threshold
    Spam,
    /// Malformed frame or other protocol violation
    ProtocolViolation { severe: bool },
    /// A critical security-alert report implicating the peer
    SecurityAlert,
}

impl ReputationEvent {
    /// Score delta for this event
    pub fn delta(&self) -> i32 {
        match self {
            Self::ValidMessage => REP_VALID_MESSAGE,
            Self::InvalidSignature => REP_INVALID_SIGNATURE,
            Self::ReplayFlood => REP_REPLAY_FLOOD,
            Self::Spam => REP_SPAM,
            Self::ProtocolViolation { severe: false } => REP_PROTOCOL_VIOLATION,
            Self::ProtocolViolation { severe: true } => REP_SEVERE_PROTOCOL_VIOLATION,
            Self::SecurityAlert => REP_SECURITY_ALERT,
        }
    }
}

/// Apply a delta with clamping
pub fn apply_delta(score: i32, delta: i32) -> i32 {
    (score + delta).clamp(MIN_REPUTATION, MAX_REPUTATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_match_policy() {
        assert_eq!(ReputationEvent::ValidMessage.delta(), 1);
        assert_eq!(ReputationEvent::InvalidSignature.delta(), -15);
        assert_eq!(ReputationEvent::SecurityAlert.delta(), -20);
        assert_eq!(
            ReputationEvent::ProtocolViolation { severe: true }.delta(),
            -15
        );
    }

    #[test]
    fn test_clamping() {
        assert_eq!(apply_delta(99, 5), MAX_REPUTATION);
        assert_eq!(apply_delta(-95, -20), MIN_REPUTATION);
        assert_eq!(apply_delta(50, -15), 35);
    }
}
