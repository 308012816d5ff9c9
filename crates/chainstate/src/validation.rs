//! Block and transaction validation against the active chain.

use std::collections::{HashMap, HashSet};
use std::fmt;

use emberd_consensus::constants::{
    MAX_FUTURE_DRIFT_MS, MIN_FEE_RATE, MTP_WINDOW, RETARGET_INTERVAL,
};
use emberd_consensus::{
    block_subsidy, block_work, chain_work, hash256_to_hex, hash_meets_difficulty, retarget, Hash256,
};
use emberd_primitives::{keys, Block, Transaction};
use primitive_types::U256;

use crate::store::ChainStore;
use crate::utxo::UtxoSet;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxError {
    MissingInput { txid: String, index: u32 },
    DuplicateInput { txid: String, index: u32 },
    Unsigned { txid: String },
    BadSignature { txid: String },
    OutputsExceedInputs { txid: String },
    FeeBelowMinimum { txid: String, fees: u64, required: u64 },
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::MissingInput { txid, index } => {
                write!(f, "tx {txid}: input {index} does not resolve to an unspent output")
            }
            TxError::DuplicateInput { txid, index } => {
                write!(f, "tx {txid}: input {index} is referenced twice")
            }
            TxError::Unsigned { txid } => write!(f, "tx {txid}: unsigned input"),
            TxError::BadSignature { txid } => write!(f, "tx {txid}: signature does not verify"),
            TxError::OutputsExceedInputs { txid } => {
                write!(f, "tx {txid}: outputs exceed inputs")
            }
            TxError::FeeBelowMinimum {
                txid,
                fees,
                required,
            } => write!(f, "tx {txid}: fees {fees} below required {required}"),
        }
    }
}

impl std::error::Error for TxError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    Proof { hash: String, difficulty: u8 },
    Continuity(String),
    Capacity { bytes: usize, max: usize },
    Tx(TxError),
    Coinbase(String),
    /// Incoming branch carries less cumulative work than the local one.
    InsufficientWork,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Proof { hash, difficulty } => {
                write!(f, "hash {hash} fails {difficulty} leading zero bits")
            }
            ValidationError::Continuity(message) => write!(f, "{message}"),
            ValidationError::Capacity { bytes, max } => {
                write!(f, "block carries {bytes} transaction bytes, max {max}")
            }
            ValidationError::Tx(err) => write!(f, "{err}"),
            ValidationError::Coinbase(message) => write!(f, "coinbase: {message}"),
            ValidationError::InsufficientWork => {
                write!(f, "incoming branch has insufficient cumulative work")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<TxError> for ValidationError {
    fn from(err: TxError) -> Self {
        ValidationError::Tx(err)
    }
}

/// Resolves blocks across the chain store and a pending, not-yet-committed
/// segment, so ancestor walks work while validating a fork.
pub struct BlockLookup<'a> {
    store: &'a ChainStore,
    pending: HashMap<Hash256, &'a Block>,
}

impl<'a> BlockLookup<'a> {
    pub fn new(store: &'a ChainStore) -> Self {
        Self {
            store,
            pending: HashMap::new(),
        }
    }

    pub fn with_segment(store: &'a ChainStore, segment: &'a [Block]) -> Self {
        let pending = segment.iter().map(|block| (block.hash(), block)).collect();
        Self { store, pending }
    }

    pub fn get(&self, hash: &Hash256) -> Option<&'a Block> {
        self.pending
            .get(hash)
            .copied()
            .or_else(|| self.store.get_block(hash))
    }

    /// Walks `steps` parents back from `from`, clamping at genesis.
    pub fn ancestor(&self, from: &'a Block, steps: u64) -> Option<&'a Block> {
        let mut current = from;
        for _ in 0..steps {
            if current.height == 0 {
                break;
            }
            current = self.get(&current.prev_hash)?;
        }
        Some(current)
    }
}

/// Median time past of a child of `parent`: the timestamp at the middle of
/// an 11-block window ending at the child, i.e. the parent's 5th ancestor.
pub fn median_time_past<'a>(lookup: &BlockLookup<'a>, parent: &'a Block) -> Option<u64> {
    lookup
        .ancestor(parent, MTP_WINDOW / 2)
        .map(|block| block.timestamp)
}

/// Difficulty required of the child of `parent`. Recomputed only when the
/// parent sits on a retarget boundary; genesis never retargets.
pub fn expected_difficulty<'a>(lookup: &BlockLookup<'a>, parent: &'a Block) -> Option<u8> {
    if parent.height == 0 || parent.height % RETARGET_INTERVAL != 0 {
        return Some(parent.difficulty);
    }
    let anchor = lookup.ancestor(parent, RETARGET_INTERVAL)?;
    let duration = parent.timestamp.saturating_sub(anchor.timestamp);
    Some(retarget(parent.difficulty, duration))
}

/// Validation rules for a non-coinbase transaction against a UTXO snapshot,
/// without applying it. Returns the fees it pays.
pub fn transaction_fees(tx: &Transaction, utxo: &UtxoSet) -> Result<u64, TxError> {
    let txid = tx.txid();
    let txid_hex = hash256_to_hex(&txid);

    let mut seen: HashSet<(Hash256, u32)> = HashSet::new();
    let mut sum_in: u64 = 0;
    for input in &tx.inputs {
        if !seen.insert((input.prev_txid, input.prev_index)) {
            return Err(TxError::DuplicateInput {
                txid: txid_hex,
                index: input.prev_index,
            });
        }
        let Some(entry) = utxo.resolve(input) else {
            return Err(TxError::MissingInput {
                txid: txid_hex,
                index: input.prev_index,
            });
        };
        if !input.is_signed() {
            return Err(TxError::Unsigned { txid: txid_hex });
        }
        if !keys::verify(&txid, &input.signature, &entry.output.public_key) {
            return Err(TxError::BadSignature { txid: txid_hex });
        }
        sum_in = sum_in.saturating_add(entry.output.amount);
    }

    let sum_out = tx
        .outputs
        .iter()
        .try_fold(0u64, |total, output| total.checked_add(output.amount))
        .ok_or_else(|| TxError::OutputsExceedInputs {
            txid: txid_hex.clone(),
        })?;
    if sum_in < sum_out {
        return Err(TxError::OutputsExceedInputs { txid: txid_hex });
    }

    let fees = sum_in - sum_out;
    let required = tx.bytes_length() as u64 * MIN_FEE_RATE;
    if fees < required {
        return Err(TxError::FeeBelowMinimum {
            txid: txid_hex,
            fees,
            required,
        });
    }
    Ok(fees)
}

fn connect_transaction(
    block_hash: &Hash256,
    tx: &Transaction,
    utxo: &mut UtxoSet,
) -> Result<u64, TxError> {
    let fees = transaction_fees(tx, utxo)?;
    utxo.apply_transaction(block_hash, tx);
    Ok(fees)
}

fn validate_coinbase(
    block: &Block,
    block_hash: &Hash256,
    fees_total: u64,
    utxo: &mut UtxoSet,
) -> Result<(), ValidationError> {
    let coinbase = block
        .coinbase()
        .ok_or_else(|| ValidationError::Coinbase("block has no transactions".to_string()))?;
    if coinbase.inputs.len() != 1 {
        return Err(ValidationError::Coinbase(format!(
            "expected one input, found {}",
            coinbase.inputs.len()
        )));
    }
    if u64::from(coinbase.inputs[0].prev_index) != block.height {
        return Err(ValidationError::Coinbase(format!(
            "input index {} does not encode height {}",
            coinbase.inputs[0].prev_index, block.height
        )));
    }
    if coinbase.outputs.len() != 1 {
        return Err(ValidationError::Coinbase(format!(
            "expected one output, found {}",
            coinbase.outputs.len()
        )));
    }
    let allowed = block_subsidy(block.height).saturating_add(fees_total);
    if coinbase.outputs[0].amount > allowed {
        return Err(ValidationError::Coinbase(format!(
            "reward {} exceeds subsidy plus fees {}",
            coinbase.outputs[0].amount, allowed
        )));
    }
    utxo.apply_transaction(block_hash, coinbase);
    Ok(())
}

/// Full connect rules for `block` as the child of `parent`, updating `utxo`
/// in place on success. `utxo` must be the state at `parent`.
pub fn validate_block(
    lookup: &BlockLookup<'_>,
    parent: &Block,
    block: &Block,
    utxo: &mut UtxoSet,
    now_ms: u64,
    max_data_bytes: usize,
) -> Result<(), ValidationError> {
    if block.height != parent.height + 1 {
        return Err(ValidationError::Continuity(format!(
            "height {} does not follow parent height {}",
            block.height, parent.height
        )));
    }
    let mtp = median_time_past(lookup, parent).ok_or_else(|| {
        ValidationError::Continuity("missing ancestor for median time past".to_string())
    })?;
    if block.timestamp < mtp {
        return Err(ValidationError::Continuity(format!(
            "timestamp {} below median time past {mtp}",
            block.timestamp
        )));
    }
    if block.timestamp > now_ms + MAX_FUTURE_DRIFT_MS {
        return Err(ValidationError::Continuity(format!(
            "timestamp {} too far in the future",
            block.timestamp
        )));
    }
    let expected = expected_difficulty(lookup, parent).ok_or_else(|| {
        ValidationError::Continuity("missing ancestor for retarget window".to_string())
    })?;
    if block.difficulty != expected {
        return Err(ValidationError::Continuity(format!(
            "difficulty {} does not match required {expected}",
            block.difficulty
        )));
    }
    let parent_hash = parent.hash();
    if parent.height > 0 && !hash_meets_difficulty(&parent_hash, parent.difficulty) {
        return Err(ValidationError::Proof {
            hash: hash256_to_hex(&parent_hash),
            difficulty: parent.difficulty,
        });
    }
    let bytes = block.tx_bytes();
    if bytes > max_data_bytes {
        return Err(ValidationError::Capacity {
            bytes,
            max: max_data_bytes,
        });
    }
    if block.prev_hash != parent_hash {
        return Err(ValidationError::Continuity(
            "prev hash does not match parent".to_string(),
        ));
    }
    let hash = block.hash();
    if !hash_meets_difficulty(&hash, block.difficulty) {
        return Err(ValidationError::Proof {
            hash: hash256_to_hex(&hash),
            difficulty: block.difficulty,
        });
    }
    if block.txs.is_empty() {
        return Err(ValidationError::Coinbase(
            "block has no transactions".to_string(),
        ));
    }

    let mut fees_total: u64 = 0;
    for tx in &block.txs[1..] {
        fees_total = fees_total.saturating_add(connect_transaction(&hash, tx, utxo)?);
    }
    validate_coinbase(block, &hash, fees_total, utxo)
}

/// Validates a parent-linked segment (oldest first) forward from the fork
/// point, starting from `base_utxo`. Returns the UTXO state at the new tip.
pub fn validate_segment(
    store: &ChainStore,
    fork_hash: &Hash256,
    segment: &[Block],
    base_utxo: UtxoSet,
    now_ms: u64,
    max_data_bytes: usize,
) -> Result<UtxoSet, ValidationError> {
    let lookup = BlockLookup::with_segment(store, segment);
    let mut parent = lookup
        .get(fork_hash)
        .ok_or_else(|| ValidationError::Continuity("unknown fork point".to_string()))?;
    let mut utxo = base_utxo;
    for block in segment {
        validate_block(&lookup, parent, block, &mut utxo, now_ms, max_data_bytes)?;
        parent = block;
    }
    Ok(utxo)
}

/// Cumulative work of the incoming segment.
pub fn segment_work(segment: &[Block]) -> U256 {
    chain_work(segment.iter().map(|block| block.difficulty))
}

/// Cumulative work of the active suffix past `fork_hash`, following `next`.
pub fn local_suffix_work(store: &ChainStore, fork_hash: &Hash256) -> U256 {
    let mut total = U256::zero();
    let mut cursor = store.get(fork_hash).and_then(|stored| stored.next);
    while let Some(hash) = cursor {
        let Some(stored) = store.get(&hash) else {
            break;
        };
        total = total.saturating_add(block_work(stored.block.difficulty));
        cursor = stored.next;
    }
    total
}

/// Deterministically rebuilds the UTXO state at `target` by replaying every
/// block from genesis along the `prev_hash` path. `None` if `target` or any
/// ancestor is missing from the store.
pub fn utxo_at(store: &ChainStore, target: &Hash256) -> Option<UtxoSet> {
    let mut path = Vec::new();
    let mut current = store.get_block(target)?;
    loop {
        path.push(current);
        if current.height == 0 {
            break;
        }
        current = store.get_block(&current.prev_hash)?;
    }

    let mut utxo = UtxoSet::new();
    for block in path.iter().rev() {
        let hash = block.hash();
        for tx in &block.txs {
            utxo.apply_transaction(&hash, tx);
        }
    }
    Some(utxo)
}
