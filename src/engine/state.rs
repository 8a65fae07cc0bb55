//! The shared mutable engine state.
//!
//! Everything the scheduler, the cache handlers and the public API
//! touch lives in [`EngineState`] behind one mutex, so every mutation
//! is a serialized, atomic step. Nothing holds the lock across an
//! await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::server_cache::ServerCache;
use crate::sigma::types::{AnonymitySet, CoinGroup, MintMetadata, MintQuery};
use crate::stratum::ServerConnection;
use crate::tx::ParsedTx;

use super::types::{AddressInfo, AddressRecord, HeaderInfo, ServerState, TxHeight};

/// A server-side query with waiters. Requests coalesce: everyone who
/// asks while one is queued or in flight gets the same answer, and a
/// newer request's parameters replace a queued one's.
pub struct PendingQuery<P, T> {
    queued: Option<(P, Vec<oneshot::Sender<T>>)>,
    in_flight: Vec<oneshot::Sender<T>>,
}

impl<P, T: Clone> PendingQuery<P, T> {
    pub fn request(&mut self, params: P) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        match &mut self.queued {
            Some((queued_params, waiters)) => {
                *queued_params = params;
                waiters.push(tx);
            }
            None => self.queued = Some((params, vec![tx])),
        }
        rx
    }

    /// Claims the queued request for dispatch, moving its waiters to
    /// the in-flight list.
    pub fn take(&mut self) -> Option<P> {
        let (params, waiters) = self.queued.take()?;
        self.in_flight.extend(waiters);
        Some(params)
    }

    pub fn resolve(&mut self, value: T) {
        for waiter in self.in_flight.drain(..) {
            let _ = waiter.send(value.clone());
        }
    }

    pub fn is_requested(&self) -> bool {
        self.queued.is_some()
    }

    /// Drops every waiter, queued or in flight. Their receivers resolve
    /// immediately with an error, which callers map to a default value.
    pub fn cancel(&mut self) {
        self.queued = None;
        self.in_flight.clear();
    }
}

impl<P, T> Default for PendingQuery<P, T> {
    fn default() -> Self {
        Self {
            queued: None,
            in_flight: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct EngineState {
    // Address caches, keyed by script hash.
    pub address_cache: HashMap<String, AddressRecord>,
    pub address_infos: HashMap<String, AddressInfo>,
    /// display address -> script hash
    pub script_hashes: HashMap<String, String>,
    pub used_addresses: HashSet<String>,
    /// Which server currently owns each address's utxo/history fetches.
    pub address_owner: HashMap<String, String>,

    // Transaction caches.
    pub tx_cache: HashMap<String, String>,
    pub parsed_txs: HashMap<String, ParsedTx>,
    pub tx_heights: HashMap<String, TxHeight>,
    pub missing_txs: HashSet<String>,
    pub fetching_txs: HashSet<String>,
    pub missing_txs_verbose: HashSet<String>,

    // Header cache and chain tip.
    pub header_cache: HashMap<i64, HeaderInfo>,
    pub missing_headers: HashSet<i64>,
    pub fetching_headers: HashSet<i64>,
    pub tip_height: i64,

    // Connection pool.
    pub connections: HashMap<String, Arc<dyn ServerConnection>>,
    pub server_states: HashMap<String, ServerState>,
    pub server_cache: ServerCache,
    pub server_list: VecDeque<String>,
    pub reconnect_counter: u32,
    pub reconnect_pending: bool,
    pub running: bool,

    // Sync progress and cache dirt.
    pub progress_ratio: f64,
    pub tx_cache_init_size: usize,
    pub address_cache_dirty: bool,
    pub tx_cache_dirty: bool,
    pub header_cache_dirty: bool,

    // Outstanding sigma queries.
    pub mint_metadata_query: PendingQuery<Vec<MintQuery>, Vec<MintMetadata>>,
    pub anonymity_set_query: PendingQuery<(u64, i64), AnonymitySet>,
    pub used_serials_query: PendingQuery<(), Vec<String>>,
    pub coin_groups_query: PendingQuery<(), Vec<CoinGroup>>,
}

impl EngineState {
    /// The server owning `script_hash`, if it is still connected.
    pub fn owner_of(&self, script_hash: &str) -> Option<&str> {
        let uri = self.address_owner.get(script_hash)?;
        self.connections.contains_key(uri).then_some(uri.as_str())
    }

    /// Whether `uri` may fetch this txid: servers that announced it may
    /// always re-serve it; otherwise it is free for anyone only while
    /// no announcer is connected.
    pub fn server_can_get_tx(&self, uri: &str, txid: &str) -> bool {
        if let Some(state) = self.server_states.get(uri) {
            if state.known_txids.contains(txid) {
                return true;
            }
        }
        !self.connections.keys().any(|u| {
            self.server_states
                .get(u)
                .is_some_and(|s| s.known_txids.contains(txid))
        })
    }

    pub fn server_can_get_header(&self, uri: &str, height: i64) -> bool {
        if let Some(state) = self.server_states.get(uri) {
            if state.known_headers.contains(&height) {
                return true;
            }
        }
        !self.connections.keys().any(|u| {
            self.server_states
                .get(u)
                .is_some_and(|s| s.known_headers.contains(&height))
        })
    }

    /// Registers subscription slots on `uri` for every known address.
    pub fn populate_server_addresses(&mut self, uri: &str) {
        let Some(server) = self.server_states.get_mut(uri) else {
            return;
        };
        for script_hash in self.address_infos.keys() {
            server.addresses.entry(script_hash.clone()).or_default();
        }
    }
}
