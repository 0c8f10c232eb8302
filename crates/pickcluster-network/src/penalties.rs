//! Penalty definitions for peer misbehaviors.
//!
//! Every peer starts with [`Penalties::INITIAL_TOLERANCE`] points. Penalties
//! are subtracted from it and the peer is disconnected once it reaches zero.

/// Penalty amounts for peer misbehaviors.
pub struct Penalties;

impl Penalties {
    /// Tolerance a freshly connected peer starts with.
    pub const INITIAL_TOLERANCE: i32 = 100;

    /// Sent a message other than `version` before completing the handshake.
    pub const UNEXPECTED_MESSAGE: i32 = 10;

    /// Sent `version` after the handshake already completed.
    pub const DUPLICATE_HANDSHAKE: i32 = 100;
}

/// Penalty reason for logging and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    UnexpectedMessage,
    DuplicateHandshake,
}

impl PenaltyReason {
    pub fn penalty(&self) -> i32 {
        match self {
            Self::UnexpectedMessage => Penalties::UNEXPECTED_MESSAGE,
            Self::DuplicateHandshake => Penalties::DUPLICATE_HANDSHAKE,
        }
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedMessage => write!(f, "message before handshake"),
            Self::DuplicateHandshake => write!(f, "duplicate handshake"),
        }
    }
}
