//! JSON message envelope and payload shapes for the peer protocol.
//!
//! One WebSocket text frame carries one envelope. Requests carry a
//! per-peer monotonic `id`; the responder echoes it on a `response` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MSG_NODEINFO: &str = "nodeinfo";
pub const MSG_BLOCKINV: &str = "blockinv";
pub const MSG_GETBLOCK: &str = "getblock";
pub const MSG_TXINV: &str = "txinv";
pub const MSG_GETTX: &str = "gettx";
pub const MSG_GETPEERS: &str = "getpeers";
pub const MSG_RESPONSE: &str = "response";

pub const REQUEST_TIMEOUT_MS: u64 = 3_000;
pub const CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const PEER_REFRESH_INTERVAL_MS: u64 = 60_000;
/// Broadcasts go to at most this many peers, chosen uniformly.
pub const BROADCAST_FANOUT: usize = 8;
/// Disconnect recovery dials known addresses until this many peers are live.
pub const TARGET_PEER_COUNT: usize = 8;
/// Peers queried per discovery refresh tick.
pub const REFRESH_SAMPLE: usize = 2;
pub const GAP_FILL_BATCH_START: u64 = 2;
pub const GAP_FILL_BATCH_MAX: u64 = 2_048;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockSummary {
    pub hash: String,
    pub height: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetBlock {
    /// Fetch bodies by hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Vec<String>>,
    /// Fetch up to `batch` ancestors of `frontier`, exclusive of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxIds {
    pub txids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetTx {
    /// Absent means "everything pending".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txids: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxBodies {
    pub txs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<String>,
}
