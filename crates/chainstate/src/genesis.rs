//! Hard-coded genesis parameters.
//!
//! The genesis block is definitional: it is inserted at store construction
//! and never re-validated.

use emberd_consensus::constants::BASE_SUBSIDY;
use emberd_primitives::keys::PublicKeyBytes;
use emberd_primitives::{Block, Transaction};

pub const GENESIS_TIMESTAMP_MS: u64 = 1_749_376_247_272;

pub const GENESIS_DIFFICULTY: u8 = 1;

pub const GENESIS_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

pub const GENESIS_NONCE: [u8; 32] = [
    0x2b, 0x0e, 0x9a, 0x5c, 0x41, 0xd3, 0x77, 0x08, 0xf1, 0x6a, 0xbe, 0x52, 0x0c, 0x94, 0xe3, 0x6d,
    0x85, 0x1f, 0x40, 0xab, 0x63, 0x27, 0xd9, 0x14, 0xcc, 0x72, 0x38, 0xe0, 0x5b, 0xa6, 0x09, 0xf7,
];

/// Uncompressed point the genesis coinbase pays to.
pub const GENESIS_PUBLIC_KEY: PublicKeyBytes = [
    0x04, 0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87, 0x0b,
    0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16, 0xf8, 0x17,
    0x98, 0x48, 0x3a, 0xda, 0x77, 0x26, 0xa3, 0xc4, 0x65, 0x5d, 0xa4, 0xfb, 0xfc, 0x0e, 0x11, 0x08,
    0xa8, 0xfd, 0x17, 0xb4, 0x48, 0xa6, 0x85, 0x54, 0x19, 0x9c, 0x47, 0xd0, 0x8f, 0xfb, 0x10, 0xd4,
    0xb8,
];

pub fn genesis_block() -> Block {
    let coinbase = Transaction::coinbase(&GENESIS_PUBLIC_KEY, BASE_SUBSIDY, 0, GENESIS_MESSAGE);
    Block {
        height: 0,
        timestamp: GENESIS_TIMESTAMP_MS,
        prev_hash: [0u8; 32],
        difficulty: GENESIS_DIFFICULTY,
        nonce: GENESIS_NONCE,
        txs: vec![coinbase],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_stable() {
        let first = genesis_block();
        let second = genesis_block();
        assert_eq!(first.hash(), second.hash());
        assert_eq!(first.height, 0);
        assert_eq!(first.prev_hash, [0u8; 32]);
        assert_eq!(
            first.coinbase().expect("coinbase").coinbase_message(),
            GENESIS_MESSAGE.to_vec()
        );
    }
}
