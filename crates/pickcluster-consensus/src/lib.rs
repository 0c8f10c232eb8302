//! # pickcluster-consensus
//!
//! Compact difficulty target encoding and the periodic retarget rule.
//!
//! Proof-of-work itself is not checked here; this crate only provides the
//! fixed-point "bits" representation the protocol carries and the formula
//! that moves the target between retarget periods.

pub mod difficulty;
mod error;

pub use difficulty::{
    bits_to_target, canonical_target, target_to_bits, DifficultyCalculator, RetargetParams,
};
pub use error::{ConsensusError, ConsensusResult};
