//! Node wiring: the shared context, startup and the public operation
//! surface used by the shell and by tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use emberd_chainstate::validation::utxo_at;
use emberd_chainstate::{ChainStore, Utxo, UtxoSet};
use emberd_consensus::constants::DEFAULT_MAX_BLOCK_DATA_BYTES;
use emberd_consensus::Hash256;
use emberd_log::log_info;
use emberd_primitives::keys::{KeyError, Keypair, PublicKeyBytes};
use emberd_primitives::{Block, Transaction};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::mempool::Mempool;
use crate::miner::MinerHandle;
use crate::p2p::{self, KnownAddrs, PeerTable};
use crate::sync::{self, Command};

#[derive(Clone, Debug)]
pub struct NodeSettings {
    /// Port to bind the WebSocket listener on; 0 picks an ephemeral port.
    pub port: u16,
    /// `host:port` advertised to peers for discovery, if any.
    pub listen_address: Option<String>,
    pub max_data_bytes: usize,
    pub initial_peers: Vec<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            port: 0,
            listen_address: None,
            max_data_bytes: DEFAULT_MAX_BLOCK_DATA_BYTES,
            initial_peers: Vec::new(),
        }
    }
}

/// Chain state guarded by one lock. The sync engine is the only mutator;
/// peer responders take short read holds.
pub struct NodeState {
    pub chain: ChainStore,
    pub utxo: UtxoSet,
    pub mempool: Mempool,
}

pub struct NodeContext {
    pub node_id: String,
    pub listen_address: Option<String>,
    pub max_data_bytes: usize,
    pub peers: PeerTable,
    pub known_addrs: KnownAddrs,
    pub commands: mpsc::UnboundedSender<Command>,
    state: Mutex<NodeState>,
    wallet: Mutex<Keypair>,
    miner: Mutex<Option<Arc<MinerHandle>>>,
    mine_loop: Mutex<Option<String>>,
    dialing: Mutex<HashSet<String>>,
    shutdown: AtomicBool,
}

impl NodeContext {
    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn enqueue(&self, command: Command) {
        let _ = self.commands.send(command);
    }

    pub fn wallet_keypair(&self) -> Keypair {
        self.wallet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn wallet_public(&self) -> PublicKeyBytes {
        *self
            .wallet
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .public()
    }

    pub fn set_wallet(&self, keypair: Keypair) {
        *self.wallet.lock().unwrap_or_else(PoisonError::into_inner) = keypair;
    }

    /// Cancels any running proof search. The search task itself reports the
    /// terminal outcome.
    pub fn cancel_miner(&self) {
        let handle = self
            .miner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    pub fn set_miner(&self, handle: Arc<MinerHandle>) {
        let previous = self
            .miner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn mine_loop_data(&self) -> Option<String> {
        self.mine_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_mine_loop(&self, data: Option<String>) {
        *self
            .mine_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = data;
    }

    /// In-flight dial guard so the recovery loop never dials one address
    /// twice concurrently.
    pub fn dialing_insert(&self, address: &str) -> bool {
        self.dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string())
    }

    pub fn dialing_remove(&self, address: &str) {
        self.dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }
}

pub struct Node {
    ctx: Arc<NodeContext>,
    port: u16,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub async fn start(settings: NodeSettings) -> Result<Arc<Self>, String> {
        let listener = TcpListener::bind(("0.0.0.0", settings.port))
            .await
            .map_err(|err| format!("failed to bind port {}: {err}", settings.port))?;
        let port = listener
            .local_addr()
            .map_err(|err| err.to_string())?
            .port();

        let chain = ChainStore::new();
        let utxo = utxo_at(&chain, &chain.tip_hash())
            .ok_or_else(|| "failed to replay genesis".to_string())?;
        let (commands, command_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(NodeContext {
            node_id: Uuid::new_v4().to_string(),
            listen_address: settings.listen_address,
            max_data_bytes: settings.max_data_bytes,
            peers: PeerTable::default(),
            known_addrs: KnownAddrs::default(),
            commands,
            state: Mutex::new(NodeState {
                chain,
                utxo,
                mempool: Mempool::new(),
            }),
            wallet: Mutex::new(Keypair::generate()),
            miner: Mutex::new(None),
            mine_loop: Mutex::new(None),
            dialing: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        });
        log_info!("node {} listening on port {port}", ctx.node_id);

        let engine = tokio::spawn(sync::run(Arc::clone(&ctx), command_rx));
        let server = tokio::spawn(p2p::serve(Arc::clone(&ctx), listener));
        let refresh = tokio::spawn(p2p::refresh_loop(Arc::clone(&ctx)));

        let node = Arc::new(Self {
            ctx,
            port,
            tasks: Mutex::new(vec![engine, server, refresh]),
        });
        for address in settings.initial_peers {
            if let Err(err) = node.add_peer(address.clone()).await {
                emberd_log::log_warn!("failed to connect to {address}: {err}");
            }
        }
        Ok(node)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn node_id(&self) -> &str {
        &self.ctx.node_id
    }

    pub async fn add_peer(&self, address: String) -> Result<(), String> {
        p2p::connect(Arc::clone(&self.ctx), address).await.map(|_| ())
    }

    pub fn peer_count(&self) -> usize {
        self.ctx.peers.len()
    }

    /// Remote endpoints of the live peers, advertised address preferred.
    pub fn peer_addresses(&self) -> Vec<String> {
        self.ctx
            .peers
            .list()
            .iter()
            .map(|peer| {
                peer.listen_address()
                    .unwrap_or_else(|| peer.remote_addr.clone())
            })
            .collect()
    }

    pub fn tip(&self) -> (Hash256, u64) {
        let state = self.ctx.state();
        (state.chain.tip_hash(), state.chain.height())
    }

    pub fn chain_length(&self) -> u64 {
        self.ctx.state().chain.len()
    }

    /// `None` fetches the tip.
    pub fn block(&self, hash: Option<Hash256>) -> Option<Block> {
        let state = self.ctx.state();
        let hash = hash.unwrap_or_else(|| state.chain.tip_hash());
        state.chain.get_block(&hash).cloned()
    }

    pub fn block_transactions(&self, hash: &Hash256) -> Option<Vec<Transaction>> {
        self.ctx
            .state()
            .chain
            .get_block(hash)
            .map(|block| block.txs.clone())
    }

    /// Looks a transaction up on the active chain, then in the mempool.
    pub fn transaction(&self, txid: &Hash256) -> Option<Transaction> {
        let state = self.ctx.state();
        if let Some((_, tx)) = state.chain.find_transaction(txid) {
            return Some(tx.clone());
        }
        state.mempool.get(txid).map(|entry| entry.tx.clone())
    }

    /// `None` queries the node's own account.
    pub fn balance(&self, public_key: Option<PublicKeyBytes>) -> u64 {
        let public_key = public_key.unwrap_or_else(|| self.ctx.wallet_public());
        self.ctx.state().utxo.balance(&public_key)
    }

    pub fn unspent(&self, public_key: Option<PublicKeyBytes>) -> Vec<Utxo> {
        let public_key = public_key.unwrap_or_else(|| self.ctx.wallet_public());
        self.ctx
            .state()
            .utxo
            .filter(|utxo| utxo.output.public_key == public_key)
    }

    pub fn account(&self) -> String {
        hex::encode(self.ctx.wallet_public())
    }

    /// Replaces the node account; returns the derived public key hex.
    pub fn import_private_key(&self, secret_hex: &str) -> Result<String, KeyError> {
        let keypair = Keypair::from_secret_hex(secret_hex)?;
        let public_hex = keypair.public_hex();
        self.ctx.set_wallet(keypair);
        Ok(public_hex)
    }

    pub fn mempool_txids(&self) -> Vec<Hash256> {
        self.ctx.state().mempool.txids()
    }

    /// Mines one block carrying `data` in its coinbase; resolves once the
    /// block is committed to the chain.
    pub async fn mine(&self, data: String) -> Result<Hash256, String> {
        let (reply, outcome) = oneshot::channel();
        self.ctx.enqueue(Command::Mine {
            data,
            reply: Some(reply),
        });
        outcome
            .await
            .map_err(|_| "mining task aborted".to_string())?
    }

    pub fn mine_loop(&self, data: String) {
        self.ctx.enqueue(Command::StartMineLoop { data });
    }

    pub fn stop_mining(&self) {
        self.ctx.enqueue(Command::StopMine);
    }

    /// Builds, signs and broadcasts a spend from the node account.
    pub async fn send(&self, to: PublicKeyBytes, amount: u64) -> Result<Hash256, String> {
        let (reply, outcome) = oneshot::channel();
        self.ctx.enqueue(Command::SubmitTransaction { to, amount, reply });
        outcome.await.map_err(|_| "send task aborted".to_string())?
    }

    /// Terminates peers, stops any miner and blocks new outbound dials.
    pub fn shutdown(&self) {
        self.ctx.set_shutdown();
        self.ctx.cancel_miner();
        self.ctx.peers.close_all();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
