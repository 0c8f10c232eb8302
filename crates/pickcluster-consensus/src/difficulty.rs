//! Compact difficulty targets and retargeting.
//!
//! A target is carried on the wire as a 32-bit "bits" value:
//!
//! ```text
//! [ byte count (8) | sign (1) | mantissa (23) ]
//! ```
//!
//! The byte count is `1 + bit_length / 8` of the magnitude, so the mantissa
//! never reaches the sign bit. Magnitudes shorter than three bytes are
//! shifted up into the mantissa, longer ones keep only their top three bytes.

use crate::{ConsensusError, ConsensusResult};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use tracing::debug;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007F_FFFF;

/// Encode a target in compact form.
///
/// Fails if the magnitude needs more than 255 significant bytes.
pub fn target_to_bits(target: &BigInt) -> ConsensusResult<u32> {
    if target.is_zero() {
        return Ok(0);
    }

    let magnitude = target.magnitude();
    let byte_count = 1 + (magnitude.bits() / 8) as usize;
    if byte_count > 255 {
        return Err(ConsensusError::TargetTooLarge { byte_count });
    }

    let shifted = if byte_count < 3 {
        magnitude << (24 - 8 * byte_count)
    } else {
        magnitude >> (8 * byte_count - 24)
    };
    // Fewer than 23 significant bits remain after the shift.
    let mut bits = shifted.to_u32().unwrap_or_default() & MANTISSA_MASK;
    if target.is_negative() {
        bits |= SIGN_BIT;
    }
    Ok(bits | (byte_count as u32) << 24)
}

/// Decode a compact target. Every 32-bit value decodes.
pub fn bits_to_target(bits: u32) -> BigInt {
    let byte_count = (bits >> 24) as usize;
    let mantissa = BigInt::from(bits & MANTISSA_MASK);

    let magnitude = if byte_count < 3 {
        mantissa >> (24 - 8 * byte_count)
    } else {
        mantissa << (8 * byte_count - 24)
    };

    if bits & SIGN_BIT != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Round `target` onto the compact grid.
pub fn canonical_target(target: &BigInt) -> ConsensusResult<BigInt> {
    target_to_bits(target).map(bits_to_target)
}

/// Retarget parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetargetParams {
    /// Blocks between retargets.
    pub interval: u32,
    /// Intended duration of one interval, in seconds.
    pub target_timespan: u32,
}

impl Default for RetargetParams {
    fn default() -> Self {
        Self {
            interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
        }
    }
}

/// Periodic difficulty retarget.
#[derive(Debug, Clone, Default)]
pub struct DifficultyCalculator {
    params: RetargetParams,
}

impl DifficultyCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: RetargetParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RetargetParams {
        &self.params
    }

    pub fn is_retarget_height(&self, height: u32) -> bool {
        height > 0 && height % self.params.interval == 0
    }

    /// Target required for the block at `next_height`.
    ///
    /// `timestamps` are the block times of the period that just ended, in
    /// chain order. Only the first and last are used. Off a retarget height
    /// `current` is returned as-is.
    pub fn next_target(
        &self,
        next_height: u32,
        current: &BigInt,
        timestamps: &[u32],
    ) -> ConsensusResult<BigInt> {
        if !self.is_retarget_height(next_height) {
            return Ok(current.clone());
        }

        let (first, last) = match (timestamps.first(), timestamps.last()) {
            (Some(first), Some(last)) if timestamps.len() >= 2 => (*first, *last),
            _ => {
                return Err(ConsensusError::InsufficientHistory {
                    height: next_height,
                    got: timestamps.len(),
                })
            }
        };

        let period = i64::from(self.params.target_timespan);
        let actual = i64::from(last) - i64::from(first);
        let clamped = actual.clamp(period / 4, period * 4);

        let scaled = current * BigInt::from(clamped) / BigInt::from(period);
        let target = canonical_target(&scaled)?;

        debug!(
            height = next_height,
            timespan = actual,
            clamped,
            bits = format!("0x{:08x}", target_to_bits(&target)?),
            "Retarget"
        );
        Ok(target)
    }
}
