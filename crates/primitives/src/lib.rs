//! Core block/transaction types and their fixed-layout binary serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod keys;
pub mod transaction;

pub use block::Block;
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::sha256;
pub use keys::{verify, KeyError, Keypair, PublicKeyBytes, PUBLIC_KEY_BYTES};
pub use transaction::{Transaction, TxInput, TxOutput};
