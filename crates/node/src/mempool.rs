//! Pending transactions awaiting inclusion, ordered by fee.
//!
//! The mempool records which outpoints its transactions claim so a second
//! spender of the same output is rejected before insertion. Validation
//! happens in the sync engine; `add` only records.

use std::collections::{HashMap, HashSet};

use emberd_chainstate::UtxoSet;
use emberd_consensus::Hash256;
use emberd_primitives::Transaction;

#[derive(Clone, Debug)]
pub struct PendingTx {
    pub tx: Transaction,
    pub fees: u64,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, PendingTx>,
    spent: HashSet<(Hash256, u32)>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    /// Whether some pending transaction already spends this outpoint.
    pub fn claims(&self, prev_txid: &Hash256, index: u32) -> bool {
        self.spent.contains(&(*prev_txid, index))
    }

    pub fn claims_any_input(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.claims(&input.prev_txid, input.prev_index))
    }

    pub fn get(&self, txid: &Hash256) -> Option<&PendingTx> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingTx> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    /// Records the transaction and its outpoint claims. The caller has
    /// already validated.
    pub fn add(&mut self, entry: PendingTx) {
        let txid = entry.tx.txid();
        for input in &entry.tx.inputs {
            self.spent.insert((input.prev_txid, input.prev_index));
        }
        self.entries.insert(txid, entry);
    }

    /// Releases the transaction's claims.
    pub fn remove(&mut self, txid: &Hash256) -> Option<PendingTx> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            self.spent.remove(&(input.prev_txid, input.prev_index));
        }
        Some(entry)
    }

    /// Stable fee-descending order, txid as the tiebreak.
    pub fn order_by_fees_desc(&self) -> Vec<&PendingTx> {
        let mut keyed: Vec<(&Hash256, &PendingTx)> = self.entries.iter().collect();
        keyed.sort_by(|a, b| b.1.fees.cmp(&a.1.fees).then_with(|| a.0.cmp(b.0)));
        keyed.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Drops every pending transaction with an input no longer unspent,
    /// returning the removed txids. Run after each chain mutation.
    pub fn evict_unresolvable(&mut self, utxo: &UtxoSet) -> Vec<Hash256> {
        let stale: Vec<Hash256> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .tx
                    .inputs
                    .iter()
                    .any(|input| utxo.resolve(input).is_none())
            })
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &stale {
            self.remove(txid);
        }
        stale
    }
}
