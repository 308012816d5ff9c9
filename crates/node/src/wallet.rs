//! Spend construction for the local account.
//!
//! Inputs are selected largest-first from the account's unspent outputs,
//! skipping any already claimed by a pending transaction. The fee is the
//! minimum rate over the final serialization; change returns to the
//! account.

use std::fmt;

use emberd_chainstate::{Utxo, UtxoSet};
use emberd_consensus::constants::MIN_FEE_RATE;
use emberd_primitives::keys::{Keypair, PublicKeyBytes};
use emberd_primitives::transaction::{COUNTS_BYTES, INPUT_BYTES, OUTPUT_BYTES};
use emberd_primitives::{Transaction, TxInput, TxOutput};

use crate::mempool::Mempool;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WalletError {
    Insufficient { available: u64, required: u64 },
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::Insufficient {
                available,
                required,
            } => write!(
                f,
                "balance {available} cannot cover amount plus fees {required}"
            ),
        }
    }
}

impl std::error::Error for WalletError {}

fn fee_for(inputs: usize, outputs: usize) -> u64 {
    (COUNTS_BYTES + INPUT_BYTES * inputs + OUTPUT_BYTES * outputs) as u64 * MIN_FEE_RATE
}

pub fn build_send_transaction(
    keypair: &Keypair,
    to: &PublicKeyBytes,
    amount: u64,
    utxo: &UtxoSet,
    mempool: &Mempool,
) -> Result<Transaction, WalletError> {
    let mut owned: Vec<Utxo> = utxo.filter(|entry| {
        entry.output.public_key == *keypair.public() && !mempool.claims(&entry.txid, entry.index)
    });
    owned.sort_by(|a, b| {
        b.output
            .amount
            .cmp(&a.output.amount)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.index.cmp(&b.index))
    });

    let available: u64 = owned.iter().map(|entry| entry.output.amount).sum();
    let mut selected: Vec<&Utxo> = Vec::new();
    let mut sum_in: u64 = 0;
    for entry in &owned {
        selected.push(entry);
        sum_in = sum_in.saturating_add(entry.output.amount);

        // preferred shape: recipient output plus non-zero change
        if let Some(target) = amount.checked_add(fee_for(selected.len(), 2)) {
            if sum_in > target {
                let change = sum_in - target;
                return Ok(assemble(keypair, to, amount, &selected, change));
            }
        }
        // exact shape: the whole selection goes to the recipient and fees
        if let Some(target) = amount.checked_add(fee_for(selected.len(), 1)) {
            if sum_in >= target {
                return Ok(assemble(keypair, to, amount, &selected, 0));
            }
        }
    }

    let required = amount.saturating_add(fee_for(owned.len().max(1), 2));
    Err(WalletError::Insufficient {
        available,
        required,
    })
}

fn assemble(
    keypair: &Keypair,
    to: &PublicKeyBytes,
    amount: u64,
    selected: &[&Utxo],
    change: u64,
) -> Transaction {
    let mut outputs = vec![TxOutput {
        amount,
        public_key: *to,
    }];
    if change > 0 {
        outputs.push(TxOutput {
            amount: change,
            public_key: *keypair.public(),
        });
    }
    let mut tx = Transaction {
        inputs: selected
            .iter()
            .map(|entry| TxInput {
                prev_txid: entry.txid,
                prev_index: entry.index,
                signature: Vec::new(),
            })
            .collect(),
        outputs,
    };
    let txid = tx.txid();
    for input in &mut tx.inputs {
        input.signature = keypair.sign(&txid);
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_chainstate::validation::transaction_fees;

    fn funded_set(keypair: &Keypair, amounts: &[u64]) -> UtxoSet {
        let mut set = UtxoSet::new();
        for (index, amount) in amounts.iter().enumerate() {
            set.add(Utxo {
                block_hash: [0xaa; 32],
                txid: [index as u8 + 1; 32],
                index: 0,
                output: TxOutput {
                    amount: *amount,
                    public_key: *keypair.public(),
                },
            });
        }
        set
    }

    #[test]
    fn builds_a_spend_that_passes_consensus_rules() {
        let keypair = Keypair::generate();
        let receiver = Keypair::generate();
        let utxo = funded_set(&keypair, &[1_000_000]);
        let mempool = Mempool::new();

        let tx = build_send_transaction(&keypair, receiver.public(), 250_000, &utxo, &mempool)
            .expect("build");
        let fees = transaction_fees(&tx, &utxo).expect("valid under consensus rules");
        assert_eq!(fees, tx.bytes_length() as u64);
        assert_eq!(tx.outputs[0].amount, 250_000);
        assert_eq!(tx.outputs[0].public_key, *receiver.public());
        // change returns to the sender
        assert_eq!(tx.outputs[1].public_key, *keypair.public());
        assert_eq!(
            tx.outputs[1].amount,
            1_000_000 - 250_000 - tx.bytes_length() as u64
        );
    }

    #[test]
    fn selects_multiple_inputs_when_needed() {
        let keypair = Keypair::generate();
        let receiver = Keypair::generate();
        let utxo = funded_set(&keypair, &[600, 500, 400_000]);
        let mempool = Mempool::new();

        let tx = build_send_transaction(&keypair, receiver.public(), 400_100, &utxo, &mempool)
            .expect("build");
        assert!(tx.inputs.len() >= 2);
        transaction_fees(&tx, &utxo).expect("valid under consensus rules");
    }

    #[test]
    fn reports_the_shortfall() {
        let keypair = Keypair::generate();
        let receiver = Keypair::generate();
        let utxo = funded_set(&keypair, &[500]);
        let mempool = Mempool::new();

        let err = build_send_transaction(&keypair, receiver.public(), 1_000, &utxo, &mempool)
            .unwrap_err();
        match err {
            WalletError::Insufficient {
                available,
                required,
            } => {
                assert_eq!(available, 500);
                assert!(required > 1_000);
            }
        }
    }

    #[test]
    fn skips_outputs_claimed_by_the_mempool() {
        let keypair = Keypair::generate();
        let receiver = Keypair::generate();
        let utxo = funded_set(&keypair, &[1_000_000]);
        let mut mempool = Mempool::new();

        // a pending transaction already spends the only output
        let pending = build_send_transaction(&keypair, receiver.public(), 100, &utxo, &mempool)
            .expect("build");
        mempool.add(crate::mempool::PendingTx {
            fees: 0,
            tx: pending,
        });

        let err = build_send_transaction(&keypair, receiver.public(), 100, &utxo, &mempool)
            .unwrap_err();
        assert!(matches!(err, WalletError::Insufficient { available: 0, .. }));
    }
}
