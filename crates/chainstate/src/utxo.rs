//! Unspent transaction outputs at the active tip.

use std::collections::HashMap;

use emberd_consensus::Hash256;
use emberd_primitives::keys::PublicKeyBytes;
use emberd_primitives::{Transaction, TxInput, TxOutput};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Utxo {
    /// Block whose acceptance created this output.
    pub block_hash: Hash256,
    pub txid: Hash256,
    pub index: u32,
    pub output: TxOutput,
}

pub type OutPointKey = (Hash256, u32);

/// The UTXO state at the active tip exactly. Cloned for speculative
/// validation and swapped wholesale on reorg commit.
#[derive(Clone, Debug, Default)]
pub struct UtxoSet {
    entries: HashMap<OutPointKey, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, utxo: Utxo) {
        self.entries.insert((utxo.txid, utxo.index), utxo);
    }

    /// Idempotent on missing entries.
    pub fn remove(&mut self, txid: &Hash256, index: u32) {
        self.entries.remove(&(*txid, index));
    }

    pub fn get(&self, txid: &Hash256, index: u32) -> Option<&Utxo> {
        self.entries.get(&(*txid, index))
    }

    pub fn resolve(&self, input: &TxInput) -> Option<&Utxo> {
        self.get(&input.prev_txid, input.prev_index)
    }

    pub fn contains_input(&self, input: &TxInput) -> bool {
        self.resolve(input).is_some()
    }

    pub fn balance(&self, public_key: &PublicKeyBytes) -> u64 {
        self.entries
            .values()
            .filter(|utxo| utxo.output.public_key == *public_key)
            .map(|utxo| utxo.output.amount)
            .sum()
    }

    pub fn filter<F: Fn(&Utxo) -> bool>(&self, pred: F) -> Vec<Utxo> {
        self.entries
            .values()
            .filter(|utxo| pred(utxo))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.entries.values()
    }

    /// Spends the transaction's inputs and credits its outputs. The caller
    /// has already validated; a coinbase's synthetic input resolves to
    /// nothing and the removal is a no-op.
    pub fn apply_transaction(&mut self, block_hash: &Hash256, tx: &Transaction) {
        for input in &tx.inputs {
            self.remove(&input.prev_txid, input.prev_index);
        }
        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.add(Utxo {
                block_hash: *block_hash,
                txid,
                index: index as u32,
                output: output.clone(),
            });
        }
    }
}
