//! Block structure, codec and hashing.
//!
//! The block hash is the SHA-256 of the full serialization, nonce and
//! transactions included. The first transaction is always the coinbase.

use emberd_consensus::{hash256_to_hex, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256;
use crate::transaction::Transaction;

/// Serialized header size: height, timestamp, prev hash, difficulty, nonce.
pub const HEADER_BYTES: usize = 81;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub height: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub prev_hash: Hash256,
    /// Required count of leading zero bits in the block hash.
    pub difficulty: u8,
    pub nonce: [u8; 32],
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_BYTES + self.tx_bytes());
        encoder.write_u64_be(self.height);
        encoder.write_u64_be(self.timestamp);
        encoder.write_bytes(&self.prev_hash);
        encoder.write_u8(self.difficulty);
        encoder.write_bytes(&self.nonce);
        for tx in &self.txs {
            tx.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_u64_be()?;
        let timestamp = decoder.read_u64_be()?;
        let prev_hash = decoder.read_fixed::<32>()?;
        let difficulty = decoder.read_u8()?;
        let nonce = decoder.read_fixed::<32>()?;
        let txs = Transaction::decode_many(decoder.read_bytes(decoder.remaining())?)?;
        Ok(Self {
            height,
            timestamp,
            prev_hash,
            difficulty,
            nonce,
            txs,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256(&self.encode())
    }

    pub fn hash_hex(&self) -> String {
        hash256_to_hex(&self.hash())
    }

    /// Total serialized transaction bytes, the quantity the capacity rule
    /// bounds.
    pub fn tx_bytes(&self) -> usize {
        self.txs.iter().map(Transaction::bytes_length).sum()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txs.first()
    }
}
