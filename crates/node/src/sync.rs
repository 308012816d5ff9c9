//! Single-consumer sync engine.
//!
//! Every state mutation flows through the command queue: inbound block and
//! transaction inventories, locally mined blocks, wallet sends and miner
//! control. The engine drains one command to completion before the next,
//! which serialises reorgs; a rejected command never leaves partial state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use emberd_chainstate::validation::{
    expected_difficulty, local_suffix_work, segment_work, transaction_fees, utxo_at,
    validate_segment, BlockLookup, ValidationError,
};
use emberd_consensus::{block_subsidy, hash256_from_hex, hash256_to_hex, Hash256};
use emberd_log::{log_debug, log_info, log_warn};
use emberd_primitives::keys::PublicKeyBytes;
use emberd_primitives::{Block, Transaction};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::mempool::PendingTx;
use crate::miner::{self, MinerHandle, MinerOutcome};
use crate::node::{NodeContext, NodeState};
use crate::p2p::Peer;
use crate::protocol::{
    BlockSummary, GetBlock, GetTx, TxBodies, TxIds, GAP_FILL_BATCH_MAX, GAP_FILL_BATCH_START,
    MSG_BLOCKINV, MSG_GETBLOCK, MSG_GETTX, MSG_TXINV,
};
use crate::wallet;

pub enum Command {
    BlockInv {
        peer: Arc<Peer>,
        hash: Hash256,
        height: u64,
    },
    TxInv {
        peer: Arc<Peer>,
        txids: Vec<String>,
    },
    MinedBlock {
        block: Block,
        reply: Option<oneshot::Sender<Result<Hash256, String>>>,
    },
    Mine {
        data: String,
        reply: Option<oneshot::Sender<Result<Hash256, String>>>,
    },
    StartMineLoop {
        data: String,
    },
    StopMine,
    SubmitTransaction {
        to: PublicKeyBytes,
        amount: u64,
        reply: oneshot::Sender<Result<Hash256, String>>,
    },
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn run(ctx: Arc<NodeContext>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if ctx.is_shutdown() {
            break;
        }
        match command {
            Command::BlockInv { peer, hash, height } => {
                match ingest_block_inv(&ctx, &peer, hash).await {
                    Ok(Some((tip_hash, tip_height))) => broadcast_tip(&ctx, tip_hash, tip_height),
                    Ok(None) => {}
                    Err(err) => log_debug!(
                        "blockinv {} (height {height}) from {} rejected: {err}",
                        hash256_to_hex(&hash),
                        peer.remote_addr
                    ),
                }
            }
            Command::TxInv { peer, txids } => {
                if let Err(err) = ingest_tx_inv(&ctx, &peer, txids).await {
                    log_debug!("txinv from {} failed: {err}", peer.remote_addr);
                }
            }
            Command::MinedBlock { block, reply } => {
                let hash = block.hash();
                match connect_segment(&ctx, vec![block]) {
                    Ok((tip_hash, tip_height)) => {
                        broadcast_tip(&ctx, tip_hash, tip_height);
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(hash));
                        }
                        if let Some(data) = ctx.mine_loop_data() {
                            start_miner(&ctx, data, None);
                        }
                    }
                    Err(err) => {
                        log_warn!("mined block {} rejected: {err}", hash256_to_hex(&hash));
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(err));
                        }
                    }
                }
            }
            Command::Mine { data, reply } => start_miner(&ctx, data, reply),
            Command::StartMineLoop { data } => {
                ctx.set_mine_loop(Some(data.clone()));
                start_miner(&ctx, data, None);
            }
            Command::StopMine => {
                ctx.set_mine_loop(None);
                ctx.cancel_miner();
            }
            Command::SubmitTransaction { to, amount, reply } => {
                let result = submit_transaction(&ctx, to, amount);
                if let Ok(txid) = &result {
                    let inv = TxIds {
                        txids: vec![hash256_to_hex(txid)],
                    };
                    ctx.peers
                        .broadcast(MSG_TXINV, serde_json::to_value(&inv).unwrap_or_default());
                }
                let _ = reply.send(result);
            }
        }
    }
}

/// Fetches the announced block, fills any ancestor gap by batched backward
/// requests, validates and commits. `Ok(None)` when the hash was already
/// known.
async fn ingest_block_inv(
    ctx: &Arc<NodeContext>,
    peer: &Arc<Peer>,
    hash: Hash256,
) -> Result<Option<(Hash256, u64)>, String> {
    if ctx.state().chain.contains(&hash) {
        return Ok(None);
    }

    let hash_hex = hash256_to_hex(&hash);
    let body = peer
        .request(MSG_GETBLOCK, json!({ "hash": [hash_hex.clone()] }))
        .await
        .map_err(|err| err.to_string())?;
    let body = body
        .get(&hash_hex)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if body.is_empty() {
        return Err("peer does not have the announced block".to_string());
    }
    let block = decode_block_hex(&body)?;
    if block.hash() != hash {
        return Err("announced hash does not match the block body".to_string());
    }

    let mut segment: VecDeque<Block> = VecDeque::from([block]);
    let mut batch = GAP_FILL_BATCH_START;
    loop {
        let front = segment.front().expect("segment is non-empty");
        let parent_hash = front.prev_hash;
        if ctx.state().chain.contains(&parent_hash) {
            break;
        }
        let frontier = hash256_to_hex(&front.hash());
        let response = peer
            .request(MSG_GETBLOCK, json!({ "frontier": frontier, "batch": batch }))
            .await
            .map_err(|err| err.to_string())?;
        let mut fetched = decode_block_map(&response)?;

        let mut advanced = false;
        loop {
            let need = segment.front().expect("segment is non-empty").prev_hash;
            if ctx.state().chain.contains(&need) {
                break;
            }
            match fetched.remove(&need) {
                Some(parent) => {
                    segment.push_front(parent);
                    advanced = true;
                }
                None => break,
            }
        }
        if !advanced {
            return Err("gap fill stalled: peer did not return the required ancestors".to_string());
        }
        batch = (batch * 2).min(GAP_FILL_BATCH_MAX);
    }

    connect_segment(ctx, segment.into()).map(Some)
}

/// Validates a parent-linked segment against the chain and commits it
/// atomically: cancel the miner, unlink the displaced suffix, insert the
/// new blocks, swap the UTXO set, reconcile the mempool.
fn connect_segment(
    ctx: &Arc<NodeContext>,
    segment: Vec<Block>,
) -> Result<(Hash256, u64), String> {
    let Some(first) = segment.first() else {
        return Err("empty segment".to_string());
    };
    let fork_hash = first.prev_hash;

    let mut state = ctx.state();
    let extends_tip = state
        .chain
        .get(&fork_hash)
        .ok_or_else(|| "segment does not connect to the chain".to_string())?
        .next
        .is_none();
    let base_utxo = if extends_tip {
        state.utxo.clone()
    } else {
        let incoming = segment_work(&segment);
        let local = local_suffix_work(&state.chain, &fork_hash);
        if incoming < local {
            return Err(ValidationError::InsufficientWork.to_string());
        }
        utxo_at(&state.chain, &fork_hash)
            .ok_or_else(|| "missing ancestors for reorg replay".to_string())?
    };

    let new_utxo = validate_segment(
        &state.chain,
        &fork_hash,
        &segment,
        base_utxo,
        now_ms(),
        ctx.max_data_bytes,
    )
    .map_err(|err| err.to_string())?;

    ctx.cancel_miner();
    let tip = segment.last().expect("segment is non-empty");
    let tip_hash = tip.hash();
    let tip_height = tip.height;
    let removed = state.chain.commit_segment(fork_hash, segment);
    state.utxo = new_utxo;
    let NodeState { mempool, utxo, .. } = &mut *state;
    let evicted = mempool.evict_unresolvable(utxo);

    if !removed.is_empty() {
        log_info!("reorg displaced {} block(s)", removed.len());
    }
    if !evicted.is_empty() {
        log_debug!("evicted {} stale mempool transaction(s)", evicted.len());
    }
    log_info!(
        "tip advanced to {} at height {tip_height}",
        hash256_to_hex(&tip_hash)
    );
    Ok((tip_hash, tip_height))
}

fn broadcast_tip(ctx: &Arc<NodeContext>, hash: Hash256, height: u64) {
    let summary = BlockSummary {
        hash: hash256_to_hex(&hash),
        height,
    };
    ctx.peers.broadcast(
        MSG_BLOCKINV,
        serde_json::to_value(&summary).unwrap_or_default(),
    );
}

/// Fetches the offered transactions we do not have, validates each against
/// the UTXO set and the mempool's claims, inserts the survivors and gossips
/// them on.
async fn ingest_tx_inv(
    ctx: &Arc<NodeContext>,
    peer: &Arc<Peer>,
    txids: Vec<String>,
) -> Result<(), String> {
    let unknown: Vec<String> = {
        let state = ctx.state();
        txids
            .into_iter()
            .filter(|hex| match hash256_from_hex(hex) {
                Some(txid) => !state.mempool.contains(&txid),
                None => false,
            })
            .collect()
    };
    if unknown.is_empty() {
        return Ok(());
    }

    let response = peer
        .request(MSG_GETTX, json!({ "txids": unknown }))
        .await
        .map_err(|err| err.to_string())?;
    let bodies: TxBodies = serde_json::from_value(response)
        .map_err(|err| format!("malformed gettx response: {err}"))?;

    let mut valid = Vec::new();
    {
        let mut state = ctx.state();
        let NodeState { utxo, mempool, .. } = &mut *state;
        for body in &bodies.txs {
            let Ok(bytes) = hex::decode(body) else {
                log_debug!("discarding transaction with invalid hex");
                continue;
            };
            let tx = match Transaction::decode(&bytes) {
                Ok(tx) => tx,
                Err(err) => {
                    log_debug!("discarding undecodable transaction: {err}");
                    continue;
                }
            };
            let txid = tx.txid();
            if mempool.contains(&txid) {
                continue;
            }
            let fees = match transaction_fees(&tx, utxo) {
                Ok(fees) => fees,
                Err(err) => {
                    log_debug!("rejecting transaction: {err}");
                    continue;
                }
            };
            if mempool.claims_any_input(&tx) {
                log_debug!(
                    "rejecting transaction {}: input already claimed",
                    hash256_to_hex(&txid)
                );
                continue;
            }
            mempool.add(PendingTx { tx, fees });
            valid.push(hash256_to_hex(&txid));
        }
    }

    if !valid.is_empty() {
        ctx.peers.broadcast(
            MSG_TXINV,
            serde_json::to_value(&TxIds { txids: valid }).unwrap_or_default(),
        );
    }
    Ok(())
}

fn submit_transaction(
    ctx: &Arc<NodeContext>,
    to: PublicKeyBytes,
    amount: u64,
) -> Result<Hash256, String> {
    let keypair = ctx.wallet_keypair();
    let mut state = ctx.state();
    let NodeState { utxo, mempool, .. } = &mut *state;
    let tx = wallet::build_send_transaction(&keypair, &to, amount, utxo, mempool)
        .map_err(|err| err.to_string())?;
    let fees = transaction_fees(&tx, utxo).map_err(|err| err.to_string())?;
    let txid = tx.txid();
    mempool.add(PendingTx { tx, fees });
    log_info!("queued transaction {} paying {amount}", hash256_to_hex(&txid));
    Ok(txid)
}

/// Builds a candidate on the current tip and starts a proof search for it.
/// A search already running is cancelled first.
fn start_miner(
    ctx: &Arc<NodeContext>,
    data: String,
    reply: Option<oneshot::Sender<Result<Hash256, String>>>,
) {
    let candidate = {
        let state = ctx.state();
        build_candidate(ctx, &state, data.as_bytes())
    };
    let candidate = match candidate {
        Ok(candidate) => candidate,
        Err(err) => {
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }
    };
    let handle = MinerHandle::new();
    ctx.set_miner(Arc::clone(&handle));
    log_info!(
        "mining block {} at difficulty {}",
        candidate.height,
        candidate.difficulty
    );
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        match miner::search(candidate, handle).await {
            MinerOutcome::Found(block) => ctx.enqueue(Command::MinedBlock { block, reply }),
            MinerOutcome::Cancelled => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err("mining cancelled".to_string()));
                }
            }
        }
    });
}

/// Candidate assembly: coinbase first, then mempool transactions in
/// fee-descending order while they fit under the block data limit.
fn build_candidate(
    ctx: &Arc<NodeContext>,
    state: &NodeState,
    message: &[u8],
) -> Result<Block, String> {
    let parent = state.chain.tip().clone();
    let lookup = BlockLookup::new(&state.chain);
    let difficulty = expected_difficulty(&lookup, &parent)
        .ok_or_else(|| "missing ancestors for retarget window".to_string())?;
    let height = parent.height + 1;

    let mut coinbase = Transaction::coinbase(&ctx.wallet_public(), 0, height, message);
    let mut total_bytes = coinbase.bytes_length();
    let mut fees_total: u64 = 0;
    let mut selected: Vec<Transaction> = Vec::new();
    for entry in state.mempool.order_by_fees_desc() {
        let bytes = entry.tx.bytes_length();
        if total_bytes + bytes > ctx.max_data_bytes {
            continue;
        }
        total_bytes += bytes;
        fees_total = fees_total.saturating_add(entry.fees);
        selected.push(entry.tx.clone());
    }
    coinbase.outputs[0].amount = block_subsidy(height).saturating_add(fees_total);

    let mut txs = Vec::with_capacity(1 + selected.len());
    txs.push(coinbase);
    txs.extend(selected);
    Ok(Block {
        height,
        timestamp: now_ms(),
        prev_hash: parent.hash(),
        difficulty,
        nonce: [0u8; 32],
        txs,
    })
}

fn decode_block_hex(body: &str) -> Result<Block, String> {
    let bytes = hex::decode(body).map_err(|err| format!("invalid block hex: {err}"))?;
    Block::decode(&bytes).map_err(|err| format!("invalid block bytes: {err}"))
}

fn decode_block_map(data: &Value) -> Result<HashMap<Hash256, Block>, String> {
    let object = data
        .as_object()
        .ok_or_else(|| "getblock response is not an object".to_string())?;
    let mut out = HashMap::new();
    for (hash_hex, body) in object {
        let Some(hash) = hash256_from_hex(hash_hex) else {
            continue;
        };
        let Some(body) = body.as_str() else {
            continue;
        };
        if body.is_empty() {
            continue;
        }
        let block = decode_block_hex(body)?;
        if block.hash() != hash {
            return Err("fetched block does not match its hash".to_string());
        }
        out.insert(hash, block);
    }
    Ok(out)
}

/// `getblock` responder: bodies by hash (missing keys map to empty hex), or
/// up to `batch` ancestors of `frontier`, exclusive of the frontier itself.
pub fn respond_getblock(ctx: &NodeContext, data: &Value) -> Value {
    let request: GetBlock = serde_json::from_value(data.clone()).unwrap_or_default();
    let state = ctx.state();
    let mut out = serde_json::Map::new();
    if let Some(hashes) = request.hash {
        for hash_hex in hashes {
            let body = hash256_from_hex(&hash_hex)
                .and_then(|hash| state.chain.get_block(&hash))
                .map(|block| hex::encode(block.encode()))
                .unwrap_or_default();
            out.insert(hash_hex, Value::String(body));
        }
    } else if let Some(frontier_hex) = request.frontier {
        let batch = request
            .batch
            .unwrap_or(GAP_FILL_BATCH_START)
            .min(GAP_FILL_BATCH_MAX);
        let frontier = hash256_from_hex(&frontier_hex);
        if let Some(mut current) = frontier.and_then(|hash| state.chain.get_block(&hash)) {
            for _ in 0..batch {
                if current.height == 0 {
                    break;
                }
                let Some(parent) = state.chain.get_block(&current.prev_hash) else {
                    break;
                };
                out.insert(
                    hash256_to_hex(&current.prev_hash),
                    Value::String(hex::encode(parent.encode())),
                );
                current = parent;
            }
        }
    }
    Value::Object(out)
}

/// `gettx` responder: raw serializations of the requested pending
/// transactions, or of everything pending when no ids were given.
pub fn respond_gettx(ctx: &NodeContext, data: &Value) -> Value {
    let request: GetTx = serde_json::from_value(data.clone()).unwrap_or_default();
    let state = ctx.state();
    let txs: Vec<String> = match request.txids {
        Some(txids) => txids
            .iter()
            .filter_map(|hex_id| hash256_from_hex(hex_id))
            .filter_map(|txid| state.mempool.get(&txid))
            .map(|entry| hex::encode(entry.tx.encode()))
            .collect(),
        None => state
            .mempool
            .entries()
            .map(|entry| hex::encode(entry.tx.encode()))
            .collect(),
    };
    json!({ "txs": txs })
}

/// `getpeers` responder: advertised addresses of the other live peers,
/// excluding the requester's own and unadvertised entries.
pub fn respond_getpeers(ctx: &NodeContext, requester: &Peer) -> Value {
    let requester_address = requester.listen_address();
    let peers: Vec<String> = ctx
        .peers
        .list()
        .iter()
        .filter(|peer| peer.id != requester.id)
        .filter_map(|peer| peer.listen_address())
        .filter(|address| Some(address) != requester_address.as_ref())
        .collect();
    json!({ "peers": peers })
}
