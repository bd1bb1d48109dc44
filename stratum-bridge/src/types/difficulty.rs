//! Target and difficulty conversion.
//!
//! A target is the 256-bit upper bound a valid proof-of-work hash must fall
//! under. Difficulty is the inversely related, human-scaled value used on the
//! stratum side:
//!
//! ```text
//! difficulty = MAX_TARGET / target
//! ```
//!
//! Block headers carry the target in compact "bits" form (an 8-bit exponent
//! and 24-bit mantissa). Share difficulty on a connection is a float because
//! vardiff proposes fractional values.

use ruint::aliases::U256;

/// Decode a compact "bits" field into a full 256-bit target.
///
/// The encoding is the usual base-256 scientific notation used by block
/// headers: the top byte is the exponent (byte length of the target), the
/// low 24 bits the mantissa.
pub fn target_from_bits(bits: u32) -> U256 {
    let exponent = bits >> 24;
    let mantissa = U256::from(bits & 0x00ff_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        let shift = 8 * (exponent - 3) as usize;
        if shift >= 256 {
            return U256::MAX;
        }
        // Shifted-out high bits would mean a malformed header; saturate.
        if mantissa.bit_len() + shift > 256 {
            return U256::MAX;
        }
        mantissa << shift
    }
}

/// Convert a target into the difficulty it represents.
pub fn target_to_difficulty(target: &U256) -> f64 {
    let target = u256_to_f64(target);
    if target <= 0.0 {
        return f64::MAX;
    }
    u256_to_f64(&U256::MAX) / target
}

/// Convert a difficulty into the largest target that satisfies it.
///
/// Inverse of [`target_to_difficulty`] within float tolerance.
pub fn difficulty_to_target(difficulty: f64) -> U256 {
    if difficulty <= 1.0 {
        return U256::MAX;
    }
    u256_from_f64(u256_to_f64(&U256::MAX) / difficulty)
}

fn u256_to_f64(value: &U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 2f64.powi(64) + limb as f64)
}

fn u256_from_f64(value: f64) -> U256 {
    if value < 1.0 {
        return U256::ZERO;
    }
    if !value.is_finite() {
        return U256::MAX;
    }
    // Decompose the float into mantissa * 2^exp and rebuild in 256 bits.
    let bits = value.to_bits();
    let exp = ((bits >> 52) & 0x7ff) as i64 - 1075;
    let mantissa = U256::from((bits & ((1u64 << 52) - 1)) | (1u64 << 52));
    if exp >= 0 {
        if exp as usize + 53 > 256 {
            return U256::MAX;
        }
        mantissa << exp as usize
    } else if exp <= -64 {
        U256::ZERO
    } else {
        mantissa >> (-exp) as usize
    }
}

/// Per-connection difficulty holder.
///
/// Holds the single owning difficulty value for one connection. Not
/// internally locked; callers serialize access through the owning mining
/// state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StratumDiff {
    value: f64,
}

impl StratumDiff {
    pub fn new() -> Self {
        Self { value: 0.0 }
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn decodes_classic_compact_bits() {
        // 0x1d00ffff: mantissa 0xffff shifted up by 26 bytes.
        let target = target_from_bits(0x1d00ffff);
        assert_eq!(target, U256::from(0xffffu64) << 208);
    }

    #[test]
    fn decodes_small_exponent() {
        // exponent 2: mantissa shifted down one byte
        let target = target_from_bits(0x02_00ffff);
        assert_eq!(target, U256::from(0xffu64));
    }

    #[test]
    fn harder_bits_mean_higher_difficulty() {
        let easy = target_to_difficulty(&target_from_bits(0x1d00ffff));
        let hard = target_to_difficulty(&target_from_bits(0x1b00ffff));
        assert!(hard > easy);
    }

    #[test_case(0x1d00ffff)]
    #[test_case(0x1b0404cb)]
    #[test_case(0x207fffff)]
    fn difficulty_round_trips_through_target(bits: u32) {
        let target = target_from_bits(bits);
        let difficulty = target_to_difficulty(&target);
        let recovered = difficulty_to_target(difficulty);

        let original = super::u256_to_f64(&target);
        let recovered = super::u256_to_f64(&recovered);
        let relative_error = ((original - recovered) / original).abs();
        assert!(
            relative_error < 1e-9,
            "bits {bits:#010x}: relative error {relative_error}"
        );
    }

    #[test]
    fn difficulty_one_or_less_saturates_to_max_target() {
        assert_eq!(difficulty_to_target(1.0), U256::MAX);
        assert_eq!(difficulty_to_target(0.0), U256::MAX);
    }

    #[test]
    fn stratum_diff_holds_value() {
        let mut diff = StratumDiff::new();
        assert_eq!(diff.value(), 0.0);
        diff.set_value(1000.0);
        assert_eq!(diff.value(), 1000.0);
    }
}
