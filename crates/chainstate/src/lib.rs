//! Chain store, UTXO set and validation for the active chain.

pub mod genesis;
pub mod store;
pub mod utxo;
pub mod validation;

pub use store::{ChainStore, StoredBlock};
pub use utxo::{Utxo, UtxoSet};
pub use validation::{TxError, ValidationError};
