use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A confirmed unspent output as the address cache stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub index: u32,
    pub value: u64,
}

/// Per-address cache entry, persisted to the address file. The two
/// status hashes remember which server-reported state the cached txid
/// and utxo lists correspond to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub txids: Vec<String>,
    pub txid_status_hash: String,
    pub utxos: Vec<Utxo>,
    pub utxo_status_hash: String,
    pub display_address: String,
    pub path: String,
    /// Redeem script for script-wrapped addresses, needed again at
    /// signing time.
    pub redeem_script: Option<String>,
}

/// Height cache entry for one transaction. Height -1 means mempool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxHeight {
    pub height: i64,
    pub first_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub timestamp: u64,
}

/// Derived, in-memory view of an address: cache contents filtered down
/// to transactions we actually hold, with mempool spends applied.
#[derive(Debug, Clone, Default)]
pub struct AddressInfo {
    pub txids: Vec<String>,
    pub utxos: Vec<Utxo>,
    pub used: bool,
    pub balance: u64,
    pub display_address: String,
    pub path: String,
}

/// Subscription state for one address on one server.
#[derive(Debug, Clone, Default)]
pub struct AddressSubscription {
    pub subscribed: bool,
    pub subscribing: bool,
    pub synced: bool,
    pub status_hash: Option<String>,
    pub last_update: u64,
    pub fetching_utxos: bool,
    pub fetching_history: bool,
}

/// Everything we know about one connected server.
#[derive(Debug, Default)]
pub struct ServerState {
    pub fetching_height: bool,
    pub height: Option<i64>,
    pub addresses: HashMap<String, AddressSubscription>,
    /// Items this server has told us about; it may always re-serve
    /// them without competing with other servers.
    pub known_txids: HashSet<String>,
    pub known_headers: HashSet<i64>,
}

/// A utxo ready for transaction building, joined with its height.
#[derive(Debug, Clone)]
pub struct SpendableUtxo {
    pub txid: String,
    pub index: u32,
    pub value: u64,
    pub height: i64,
}

/// Which balance a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    /// Transparent outputs only.
    Public,
    /// Spendable private mints only.
    Minted,
    /// Both.
    Total,
}

type HeightFn = Box<dyn Fn(i64) + Send + Sync>;
type TxidFn = Box<dyn Fn(&str) + Send + Sync>;
type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;
type NotifyFn = Box<dyn Fn() + Send + Sync>;

pub struct EngineCallbacks {
    pub on_balance_changed: NotifyFn,
    pub on_address_used: NotifyFn,
    pub on_height_updated: HeightFn,
    pub on_tx_fetched: TxidFn,
    pub on_progress: ProgressFn,
}

impl Default for EngineCallbacks {
    fn default() -> Self {
        Self {
            on_balance_changed: Box::new(|| {}),
            on_address_used: Box::new(|| {}),
            on_height_updated: Box::new(|_| {}),
            on_tx_fetched: Box::new(|_| {}),
            on_progress: Box::new(|_| {}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simultaneous server connections.
    pub max_connections: usize,
    /// Candidate servers requested from the reputation cache per refill.
    pub candidate_servers: usize,
    pub queue_size: usize,
    pub task_timeout: Duration,
    pub keep_alive: Duration,
    /// Minimum progress-ratio change that triggers a cache flush while
    /// the initial sync is running.
    pub cache_throttle: f64,
    /// Consecutive derivation misses that end a restore scan.
    pub restore_miss_limit: u32,
    pub client_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 2,
            candidate_servers: 8,
            queue_size: 5,
            task_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            cache_throttle: 0.25,
            restore_miss_limit: 100,
            client_name: concat!("sigma-sync ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
