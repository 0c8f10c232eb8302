//! Error types for difficulty computations.

use thiserror::Error;

/// Consensus errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Target magnitude needs more bytes than the exponent field can count.
    #[error("Target too large: {byte_count} significant bytes, max 255")]
    TargetTooLarge { byte_count: usize },

    /// Not enough block timestamps to measure the retarget timespan.
    #[error("Insufficient history at height {height}: need 2 timestamps, got {got}")]
    InsufficientHistory { height: u32, got: usize },
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
