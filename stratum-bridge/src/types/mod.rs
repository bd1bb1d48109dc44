//! Shared numeric types.

pub mod difficulty;

pub use difficulty::{
    difficulty_to_target, target_from_bits, target_to_difficulty, StratumDiff,
};
