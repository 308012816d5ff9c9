//! Difficulty retargeting, proof checks and cumulative work.
//!
//! Difficulty is a count of leading zero bits required of the block hash,
//! MSB first over the 32-byte digest. The work contributed by a block is
//! `2^difficulty`; chain segments compare by the sum of their block works.

use primitive_types::U256;

use crate::constants::{BLOCK_TARGET_SPACING_MS, MIN_DIFFICULTY, RETARGET_INTERVAL};
use crate::Hash256;

/// Number of leading zero bits in `hash`, MSB first.
pub fn leading_zero_bits(hash: &Hash256) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

pub fn hash_meets_difficulty(hash: &Hash256, difficulty: u8) -> bool {
    leading_zero_bits(hash) >= u32::from(difficulty)
}

/// Difficulty required of the block after a retarget boundary, given the
/// duration of the last `RETARGET_INTERVAL` blocks. Outside boundaries the
/// caller passes the parent difficulty through unchanged.
pub fn retarget(parent_difficulty: u8, actual_ms: u64) -> u8 {
    let expected_ms = BLOCK_TARGET_SPACING_MS * RETARGET_INTERVAL;
    if actual_ms < expected_ms / 2 {
        parent_difficulty.saturating_add(1)
    } else if actual_ms > expected_ms * 2 {
        parent_difficulty.saturating_sub(1).max(MIN_DIFFICULTY)
    } else {
        parent_difficulty
    }
}

/// Work contributed by a block of the given difficulty, `2^difficulty`.
pub fn block_work(difficulty: u8) -> U256 {
    U256::one() << u32::from(difficulty)
}

/// Cumulative work of a chain segment.
pub fn chain_work<I: IntoIterator<Item = u8>>(difficulties: I) -> U256 {
    difficulties
        .into_iter()
        .fold(U256::zero(), |total, difficulty| {
            total.saturating_add(block_work(difficulty))
        })
}
