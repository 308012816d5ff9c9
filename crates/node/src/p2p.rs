//! WebSocket peer sessions, request/response correlation, the peer table
//! and address discovery.
//!
//! One socket per peer, one JSON envelope per text frame. Each peer owns a
//! writer task fed by a channel and a reader task that dispatches inbound
//! frames: responses resolve pending requests in place, read-only requests
//! are answered under a short state lock, and inventory announcements are
//! enqueued for the sync engine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use emberd_consensus::hash256_from_hex;
use emberd_log::{log_debug, log_info, log_warn};
use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::node::NodeContext;
use crate::protocol::{
    BlockSummary, Envelope, PeerList, TxIds, BROADCAST_FANOUT, CONNECT_TIMEOUT_MS, MSG_BLOCKINV,
    MSG_GETBLOCK, MSG_GETPEERS, MSG_GETTX, MSG_NODEINFO, MSG_RESPONSE, MSG_TXINV,
    PEER_REFRESH_INTERVAL_MS, REFRESH_SAMPLE, REQUEST_TIMEOUT_MS, TARGET_PEER_COUNT,
};
use crate::sync::{self, Command};

#[derive(Clone, Debug)]
pub enum PeerError {
    Closed,
    Timeout,
    Protocol(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Closed => write!(f, "peer connection closed"),
            PeerError::Timeout => write!(f, "request timed out"),
            PeerError::Protocol(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for PeerError {}

pub struct Peer {
    pub id: u64,
    /// Address we dialed, for outbound connections.
    pub dialed_address: Option<String>,
    /// Remote socket endpoint, for logging.
    pub remote_addr: String,
    remote_node_id: Mutex<Option<String>>,
    listen_address: Mutex<Option<String>>,
    outbound: mpsc::UnboundedSender<Message>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
}

impl Peer {
    pub fn remote_node_id(&self) -> Option<String> {
        self.remote_node_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_remote_node_id(&self, node_id: &str) {
        *self
            .remote_node_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(node_id.to_string());
    }

    pub fn listen_address(&self) -> Option<String> {
        self.listen_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_listen_address(&self, address: &str) {
        *self
            .listen_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(address.to_string());
    }

    /// Fire-and-forget frame.
    pub fn send(&self, kind: &str, data: Value) {
        self.send_envelope(&Envelope {
            kind: kind.to_string(),
            id: None,
            data,
        });
    }

    /// Answer to an inbound request; a no-op when the request carried no id.
    pub fn respond(&self, id: Option<u64>, data: Value) {
        let Some(id) = id else { return };
        self.send_envelope(&Envelope {
            kind: MSG_RESPONSE.to_string(),
            id: Some(id),
            data,
        });
    }

    /// Round trip with a fresh monotonic id; resolves with the matching
    /// `response` frame or times out after [`REQUEST_TIMEOUT_MS`].
    pub async fn request(&self, kind: &str, data: Value) -> Result<Value, PeerError> {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        self.send_envelope(&Envelope {
            kind: kind.to_string(),
            id: Some(id),
            data,
        });
        match timeout(Duration::from_millis(REQUEST_TIMEOUT_MS), receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PeerError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(PeerError::Timeout)
            }
        }
    }

    fn resolve(&self, id: u64, data: Value) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(sender) = sender {
            let _ = sender.send(data);
        }
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn send_envelope(&self, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(text) => {
                let _ = self.outbound.send(Message::Text(text));
            }
            Err(err) => log_warn!("peer {}: failed to encode frame: {err}", self.remote_addr),
        }
    }

    fn abandon_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    next_id: AtomicU64,
}

impl PeerTable {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn insert(&self, peer: Arc<Peer>) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.id, peer);
    }

    fn remove(&self, id: u64) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn is_connected_to(&self, address: &str) -> bool {
        self.list().iter().any(|peer| {
            peer.dialed_address.as_deref() == Some(address)
                || peer.listen_address().as_deref() == Some(address)
        })
    }

    /// Sends to `min(|peers|, 8)` peers chosen uniformly without
    /// replacement.
    pub fn broadcast(&self, kind: &str, data: Value) {
        let peers = self.list();
        let count = peers.len().min(BROADCAST_FANOUT);
        let mut rng = rand::thread_rng();
        for peer in peers.choose_multiple(&mut rng, count) {
            peer.send(kind, data.clone());
        }
    }

    pub fn sample(&self, count: usize) -> Vec<Arc<Peer>> {
        let peers = self.list();
        let count = peers.len().min(count);
        let mut rng = rand::thread_rng();
        peers.choose_multiple(&mut rng, count).cloned().collect()
    }

    pub fn close_all(&self) {
        for peer in self.list() {
            peer.close();
        }
    }
}

/// Discovered `host:port` strings, insertion ordered with O(1) pop.
#[derive(Default)]
pub struct KnownAddrs {
    inner: Mutex<KnownAddrsInner>,
}

#[derive(Default)]
struct KnownAddrsInner {
    queue: VecDeque<String>,
    seen: HashSet<String>,
}

impl KnownAddrs {
    pub fn insert(&self, address: String) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.seen.insert(address.clone()) {
            return false;
        }
        inner.queue.push_back(address);
        true
    }

    pub fn insert_many<I: IntoIterator<Item = String>>(&self, addresses: I) -> usize {
        addresses
            .into_iter()
            .filter(|address| self.insert(address.clone()))
            .count()
    }

    pub fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let address = inner.queue.pop_front()?;
        inner.seen.remove(&address);
        Some(address)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept loop for the node's listener.
pub async fn serve(ctx: Arc<NodeContext>, listener: TcpListener) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("accept failed: {err}");
                continue;
            }
        };
        if ctx.is_shutdown() {
            break;
        }
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    let peer = register_peer(Arc::clone(&ctx), ws, None, remote_addr.to_string());
                    greet(ctx, peer).await;
                }
                Err(err) => log_debug!("inbound handshake with {remote_addr} failed: {err}"),
            }
        });
    }
}

/// Dials `ws://address` with the connect deadline, announces ourselves and
/// registers the peer.
pub async fn connect(ctx: Arc<NodeContext>, address: String) -> Result<Arc<Peer>, String> {
    if ctx.is_shutdown() {
        return Err("node is shutting down".to_string());
    }
    let url = format!("ws://{address}");
    let connected = timeout(
        Duration::from_millis(CONNECT_TIMEOUT_MS),
        tokio_tungstenite::connect_async(url),
    )
    .await
    .map_err(|_| format!("connect to {address} timed out"))?
    .map_err(|err| format!("connect to {address} failed: {err}"))?;
    let (ws, _) = connected;

    let peer = register_peer(
        Arc::clone(&ctx),
        ws,
        Some(address.clone()),
        address.clone(),
    );
    // the connecting side announces itself as soon as the socket is open
    peer.send(
        MSG_NODEINFO,
        json!({ "nodeId": ctx.node_id, "listenAddress": ctx.listen_address }),
    );
    log_info!("connected to peer {address}");
    tokio::spawn(greet(ctx, Arc::clone(&peer)));
    Ok(peer)
}

fn register_peer<S>(
    ctx: Arc<NodeContext>,
    ws: WebSocketStream<S>,
    dialed_address: Option<String>,
    remote_addr: String,
) -> Arc<Peer>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let peer = Arc::new(Peer {
        id: ctx.peers.allocate_id(),
        dialed_address,
        remote_addr,
        remote_node_id: Mutex::new(None),
        listen_address: Mutex::new(None),
        outbound,
        next_request_id: AtomicU64::new(1),
        pending: Mutex::new(HashMap::new()),
    });
    ctx.peers.insert(Arc::clone(&peer));

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let reader_peer = Arc::clone(&peer);
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Err(err) = handle_frame(&ctx, &reader_peer, &text) {
                        log_debug!("peer {}: {err}", reader_peer.remote_addr);
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    log_debug!("peer {}: read failed: {err}", reader_peer.remote_addr);
                    break;
                }
            }
        }
        disconnect(&ctx, &reader_peer);
    });

    peer
}

/// Announcements and discovery on a fresh connection, either side.
async fn greet(ctx: Arc<NodeContext>, peer: Arc<Peer>) {
    let (summary, txids) = {
        let state = ctx.state();
        let tip = state.chain.tip();
        let summary = BlockSummary {
            hash: tip.hash_hex(),
            height: tip.height,
        };
        let txids: Vec<String> = state
            .mempool
            .txids()
            .iter()
            .map(emberd_consensus::hash256_to_hex)
            .collect();
        (summary, txids)
    };
    peer.send(
        MSG_BLOCKINV,
        serde_json::to_value(&summary).unwrap_or_default(),
    );
    if !txids.is_empty() {
        peer.send(
            MSG_TXINV,
            serde_json::to_value(&TxIds { txids }).unwrap_or_default(),
        );
    }
    match peer.request(MSG_GETPEERS, json!({})).await {
        Ok(data) => merge_discovered(&ctx, &data),
        Err(err) => log_debug!("getpeers to {} failed: {err}", peer.remote_addr),
    }
}

fn merge_discovered(ctx: &Arc<NodeContext>, data: &Value) {
    let Ok(list) = serde_json::from_value::<PeerList>(data.clone()) else {
        return;
    };
    let own = ctx.listen_address.clone();
    let learned = ctx.known_addrs.insert_many(
        list.peers
            .into_iter()
            .filter(|address| !address.is_empty() && Some(address) != own.as_ref()),
    );
    if learned > 0 {
        log_debug!("discovered {learned} peer address(es)");
    }
}

fn handle_frame(
    ctx: &Arc<NodeContext>,
    peer: &Arc<Peer>,
    text: &str,
) -> Result<(), PeerError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|err| PeerError::Protocol(format!("malformed frame: {err}")))?;
    match envelope.kind.as_str() {
        MSG_NODEINFO => handle_nodeinfo(ctx, peer, &envelope.data)?,
        MSG_RESPONSE => {
            if let Some(id) = envelope.id {
                peer.resolve(id, envelope.data);
            }
        }
        MSG_BLOCKINV => {
            let summary: BlockSummary = serde_json::from_value(envelope.data)
                .map_err(|err| PeerError::Protocol(format!("malformed blockinv: {err}")))?;
            let hash = hash256_from_hex(&summary.hash)
                .ok_or_else(|| PeerError::Protocol("malformed blockinv hash".to_string()))?;
            ctx.enqueue(Command::BlockInv {
                peer: Arc::clone(peer),
                hash,
                height: summary.height,
            });
        }
        MSG_TXINV => {
            let inv: TxIds = serde_json::from_value(envelope.data)
                .map_err(|err| PeerError::Protocol(format!("malformed txinv: {err}")))?;
            ctx.enqueue(Command::TxInv {
                peer: Arc::clone(peer),
                txids: inv.txids,
            });
        }
        MSG_GETBLOCK => {
            let data = sync::respond_getblock(ctx, &envelope.data);
            peer.respond(envelope.id, data);
        }
        MSG_GETTX => {
            let data = sync::respond_gettx(ctx, &envelope.data);
            peer.respond(envelope.id, data);
        }
        MSG_GETPEERS => {
            let data = sync::respond_getpeers(ctx, peer);
            peer.respond(envelope.id, data);
        }
        other => log_debug!("peer {}: ignoring {other}", peer.remote_addr),
    }
    Ok(())
}

fn handle_nodeinfo(
    ctx: &Arc<NodeContext>,
    peer: &Arc<Peer>,
    data: &Value,
) -> Result<(), PeerError> {
    let Some(node_id) = data.get("nodeId").and_then(Value::as_str) else {
        peer.close();
        return Err(PeerError::Protocol(
            "nodeinfo without a string nodeId".to_string(),
        ));
    };
    if node_id == ctx.node_id {
        log_info!("peer {} is ourselves, closing", peer.remote_addr);
        peer.close();
        return Err(PeerError::Protocol("self connection".to_string()));
    }
    peer.set_remote_node_id(node_id);
    if let Some(listen) = data.get("listenAddress").and_then(Value::as_str) {
        if !listen.is_empty() {
            peer.set_listen_address(listen);
        }
    }
    Ok(())
}

fn disconnect(ctx: &Arc<NodeContext>, peer: &Arc<Peer>) {
    peer.abandon_pending();
    if ctx.peers.remove(peer.id).is_some() {
        log_info!("peer {} disconnected", peer.remote_addr);
    }
    if ctx.is_shutdown() {
        return;
    }
    let ctx = Arc::clone(ctx);
    tokio::spawn(refill_peers(ctx));
}

/// Dials discovered addresses until the live peer count recovers or the
/// address set runs dry.
pub async fn refill_peers(ctx: Arc<NodeContext>) {
    while !ctx.is_shutdown() && ctx.peers.len() < TARGET_PEER_COUNT {
        let Some(address) = ctx.known_addrs.pop() else {
            break;
        };
        if ctx.peers.is_connected_to(&address) {
            continue;
        }
        if !ctx.dialing_insert(&address) {
            continue;
        }
        let result = connect(Arc::clone(&ctx), address.clone()).await;
        ctx.dialing_remove(&address);
        if let Err(err) = result {
            log_debug!("redial failed: {err}");
        }
    }
}

/// Periodic discovery: every minute, ask two random live peers for their
/// peer lists.
pub async fn refresh_loop(ctx: Arc<NodeContext>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(PEER_REFRESH_INTERVAL_MS));
    ticker.tick().await; // the first tick fires immediately
    loop {
        ticker.tick().await;
        if ctx.is_shutdown() {
            break;
        }
        for peer in ctx.peers.sample(REFRESH_SAMPLE) {
            match peer.request(MSG_GETPEERS, json!({})).await {
                Ok(data) => merge_discovered(&ctx, &data),
                Err(err) => log_debug!("peer refresh via {} failed: {err}", peer.remote_addr),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_addrs_dedupe_and_pop_in_order() {
        let addrs = KnownAddrs::default();
        assert!(addrs.insert("a:1".to_string()));
        assert!(addrs.insert("b:2".to_string()));
        assert!(!addrs.insert("a:1".to_string()));
        assert_eq!(addrs.len(), 2);

        assert_eq!(addrs.pop().as_deref(), Some("a:1"));
        assert_eq!(addrs.pop().as_deref(), Some("b:2"));
        assert_eq!(addrs.pop(), None);

        // popped addresses can be learned again
        assert!(addrs.insert("a:1".to_string()));
    }
}
