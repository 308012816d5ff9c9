//! Consensus rules shared across the node: constants, subsidy schedule,
//! difficulty retargeting and cumulative work arithmetic.

pub mod constants;
pub mod difficulty;
pub mod subsidy;

pub use difficulty::{block_work, chain_work, hash_meets_difficulty, leading_zero_bits, retarget};
pub use subsidy::block_subsidy;

/// 32-byte SHA-256 digest.
pub type Hash256 = [u8; 32];

/// Lowercase 64-character hex form of a hash.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    hex::encode(hash)
}

pub fn hash256_from_hex(value: &str) -> Option<Hash256> {
    let bytes = hex::decode(value).ok()?;
    let mut out = [0u8; 32];
    if bytes.len() != out.len() {
        return None;
    }
    out.copy_from_slice(&bytes);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_roundtrip() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[31] = 0x01;
        let hex = hash256_to_hex(&hash);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab"));
        assert_eq!(hash256_from_hex(&hex), Some(hash));
    }

    #[test]
    fn hash_hex_rejects_bad_length() {
        assert_eq!(hash256_from_hex("abcd"), None);
        assert_eq!(hash256_from_hex("zz"), None);
    }
}
