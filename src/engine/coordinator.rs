//! The coordinator: owns the connection pool and the engine state, and
//! exposes the wallet-facing API.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{oneshot, Notify};

use crate::error::EngineError;
use crate::persistence::{
    load_or_default, save_json, AddressCacheFile, HeaderCacheFile, ServerCacheFile, TextStore,
    TxCacheFile, ADDRESS_CACHE_FILE, HEADER_CACHE_FILE, SERVER_CACHE_FILE, TX_CACHE_FILE,
};
use crate::sigma::types::{
    AnonymitySet, CoinDeriver, CoinGroup, MintMetadata, MintQuery, PrivateCoin, SpendCoin,
};
use crate::sigma::{self, CoinStore};
use crate::stratum::connection::ConnectOptions;
use crate::stratum::wire::BadVersionError;
use crate::stratum::{messages, Connection, ConnectionEvents, ServerConnection, Task};
use crate::tx::TxDecoder;

use super::cache;
use super::scheduler;
use super::state::EngineState;
use super::types::{
    now_ms, AddressRecord, BalanceKind, EngineCallbacks, EngineConfig, ServerState, SpendableUtxo,
};

/// Dials servers. Swappable so tests can inject scripted connections.
pub trait ConnectFactory: Send + Sync {
    fn connect(
        &self,
        uri: &str,
        options: ConnectOptions,
        events: Arc<dyn ConnectionEvents>,
    ) -> Arc<dyn ServerConnection>;
}

pub struct TcpConnectFactory;

impl ConnectFactory for TcpConnectFactory {
    fn connect(
        &self,
        uri: &str,
        options: ConnectOptions,
        events: Arc<dyn ConnectionEvents>,
    ) -> Arc<dyn ServerConnection> {
        Arc::new(Connection::spawn(uri, options, events))
    }
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) callbacks: EngineCallbacks,
    pub(crate) store: Arc<dyn TextStore>,
    pub(crate) coin_store: CoinStore,
    pub(crate) decoder: Arc<dyn TxDecoder>,
    pub(crate) factory: Box<dyn ConnectFactory>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) close_notify: Notify,
}

impl Inner {
    pub(crate) fn score_up(
        &self,
        state: &mut EngineState,
        uri: &str,
        elapsed: Duration,
        delta: i32,
    ) {
        state
            .server_cache
            .score_up(uri, elapsed.as_millis() as u64, delta);
    }

    pub(crate) fn score_down(&self, state: &mut EngineState, uri: &str, delta: i32) {
        state.server_cache.score_down(uri, delta);
    }

    fn save_address_cache(&self, state: &mut EngineState) {
        if !state.address_cache_dirty {
            return;
        }
        let file = AddressCacheFile {
            addresses: state.address_cache.clone(),
            heights: state.tx_heights.clone(),
        };
        match save_json(self.store.as_ref(), ADDRESS_CACHE_FILE, &file) {
            Ok(()) => state.address_cache_dirty = false,
            Err(e) => log::warn!("[STORE] saving address cache: {e:#}"),
        }
    }

    fn save_tx_cache(&self, state: &mut EngineState) {
        if !state.tx_cache_dirty {
            return;
        }
        let file = TxCacheFile {
            txs: state.tx_cache.clone(),
        };
        match save_json(self.store.as_ref(), TX_CACHE_FILE, &file) {
            Ok(()) => state.tx_cache_dirty = false,
            Err(e) => log::warn!("[STORE] saving tx cache: {e:#}"),
        }
    }

    fn save_header_cache(&self, state: &mut EngineState) {
        if !state.header_cache_dirty {
            return;
        }
        let file = HeaderCacheFile {
            height: state.tip_height,
            headers: state.header_cache.clone(),
        };
        match save_json(self.store.as_ref(), HEADER_CACHE_FILE, &file) {
            Ok(()) => state.header_cache_dirty = false,
            Err(e) => log::warn!("[STORE] saving header cache: {e:#}"),
        }
    }

    fn save_server_cache(&self, state: &mut EngineState) {
        if !state.server_cache.is_dirty() {
            return;
        }
        let file: ServerCacheFile = state.server_cache.scores().clone();
        match save_json(self.store.as_ref(), SERVER_CACHE_FILE, &file) {
            Ok(()) => state.server_cache.mark_clean(),
            Err(e) => log::warn!("[STORE] saving server cache: {e:#}"),
        }
    }

    pub(crate) fn save_all(&self, state: &mut EngineState) {
        self.save_address_cache(state);
        self.save_tx_cache(state);
        self.save_header_cache(state);
        self.save_server_cache(state);
    }

    /// Progress moved: flush everything and tell the caller, but only
    /// on changes past the throttle (or completion) while the initial
    /// sync runs.
    pub(crate) fn flush_progress(&self, state: &mut EngineState) {
        if let Some(ratio) = cache::update_progress(state, self.config.cache_throttle) {
            self.save_all(state);
            (self.callbacks.on_progress)(ratio);
        } else {
            self.flush_if_settled(state);
        }
    }

    /// Once the initial sync is done, dirty caches flush immediately
    /// instead of waiting on progress milestones.
    pub(crate) fn flush_if_settled(&self, state: &mut EngineState) {
        if state.progress_ratio == 1.0 {
            self.save_all(state);
        }
    }

    /// Schedules a delayed refill after a connection drop, with a
    /// linear backoff capped at five seconds.
    fn reconnect(inner: &Arc<Inner>, state: &mut EngineState) {
        if !state.running || state.reconnect_pending {
            return;
        }
        state.reconnect_pending = true;
        // The first retry goes out immediately; only repeat failures
        // back off.
        let delay = reconnect_delay(state.reconnect_counter);
        state.reconnect_counter = state.reconnect_counter.saturating_add(1);
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            inner.state.lock().unwrap().reconnect_pending = false;
            Inner::refill_servers(&inner);
        });
    }

    /// Tops the pool back up to `max_connections`, drawing candidates
    /// from the reputation cache. Plain-tcp servers connect before tls
    /// ones, and each candidate rolls an admission chance that decays
    /// down the list so the pool is not always the same two servers.
    pub(crate) fn refill_servers(inner: &Arc<Inner>) {
        let mut state = inner.state.lock().unwrap();
        if !state.running {
            return;
        }

        if state.server_list.is_empty() {
            let picked = state
                .server_cache
                .select(inner.config.candidate_servers, &["tcp:", "ssl:", "tls:"]);
            let (tcp, tls): (Vec<String>, Vec<String>) =
                picked.into_iter().partition(|uri| uri.starts_with("tcp:"));
            state.server_list = tcp.into_iter().chain(tls).collect();
            log::info!("[ENGINE] refill candidates: {:?}", state.server_list);
        }

        let mut chance: f64 = 1.25;
        let mut rng = rand::thread_rng();
        while state.connections.len() < inner.config.max_connections {
            let Some(uri) = state.server_list.pop_front() else {
                Inner::reconnect(inner, &mut state);
                break;
            };
            if state.connections.contains_key(&uri) {
                continue;
            }
            if !uri.contains("://") {
                continue;
            }
            if chance > 0.5 {
                chance -= 0.25;
            }
            if rng.gen::<f64>() > chance {
                state.server_list.push_back(uri);
                continue;
            }

            log::info!("[ENGINE] connecting to {uri}");
            let events: Arc<dyn ConnectionEvents> = Arc::new(EventBridge {
                inner: Arc::downgrade(inner),
            });
            let options = ConnectOptions {
                client_name: inner.config.client_name.clone(),
                queue_size: inner.config.queue_size,
                task_timeout: inner.config.task_timeout,
                keep_alive: inner.config.keep_alive,
            };
            let connection = inner.factory.connect(&uri, options, events);
            state.connections.insert(uri.clone(), connection);
            state.server_states.insert(uri.clone(), ServerState::default());
            state.populate_server_addresses(&uri);
        }
    }

    fn wake_up_connections(&self) {
        let state = self.state.lock().unwrap();
        for connection in state.connections.values() {
            connection.wake_up();
        }
    }
}

/// Linear refill backoff: zero for the first attempt after a drop,
/// then one second per consecutive failure, capped at five.
pub(crate) fn reconnect_delay(counter: u32) -> Duration {
    Duration::from_secs(counter.min(5) as u64)
}

/// Routes connection events back into the shared state. Holds the
/// coordinator weakly so dangling driver tasks cannot keep it alive.
struct EventBridge {
    inner: Weak<Inner>,
}

impl ConnectionEvents for EventBridge {
    fn on_open(&self, uri: &str, version: &str) {
        let Some(inner) = self.inner.upgrade() else { return };
        log::info!("[ENGINE] {uri} open (protocol {version})");
        inner.state.lock().unwrap().reconnect_counter = 0;
    }

    fn on_close(&self, uri: &str, error: Option<anyhow::Error>) {
        let Some(inner) = self.inner.upgrade() else { return };
        let mut state = inner.state.lock().unwrap();
        state.connections.remove(uri);
        state.server_states.remove(uri);
        if let Some(e) = &error {
            // A version mismatch is permanent; hit the score hard so
            // selection stops offering this server.
            let penalty = if e.downcast_ref::<BadVersionError>().is_some() {
                100
            } else {
                10
            };
            inner.score_down(&mut state, uri, penalty);
        }
        inner.save_all(&mut state);
        Inner::reconnect(&inner, &mut state);
        drop(state);
        inner.close_notify.notify_waiters();
    }

    fn on_queue_space(&self, uri: &str, version: &str) -> Option<Task> {
        let inner = self.inner.upgrade()?;
        scheduler::pick_next_task(&inner, uri, version)
    }

    fn on_height_changed(&self, uri: &str, height: i64) {
        let Some(inner) = self.inner.upgrade() else { return };
        let mut state = inner.state.lock().unwrap();
        if let Some(server) = state.server_states.get_mut(uri) {
            server.height = Some(height);
        }
        cache::update_height(&mut state, &inner.callbacks, height);
    }

    fn on_script_hash_changed(&self, uri: &str, script_hash: &str, status_hash: Option<&str>) {
        let Some(inner) = self.inner.upgrade() else { return };
        let mut state = inner.state.lock().unwrap();
        log::debug!("[ENGINE] {uri} notified change on {script_hash}");
        state
            .address_owner
            .insert(script_hash.to_string(), uri.to_string());
        if let Some(sub) = state
            .server_states
            .get_mut(uri)
            .and_then(|s| s.addresses.get_mut(script_hash))
        {
            sub.status_hash = status_hash.map(str::to_string);
            sub.last_update = now_ms();
        }
    }
}

/// The wallet-facing synchronization engine.
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        config: EngineConfig,
        callbacks: EngineCallbacks,
        store: Arc<dyn TextStore>,
        secure_store: Arc<dyn TextStore>,
        decoder: Arc<dyn TxDecoder>,
    ) -> Self {
        Self::with_factory(
            config,
            callbacks,
            store,
            secure_store,
            decoder,
            Box::new(TcpConnectFactory),
        )
    }

    pub fn with_factory(
        config: EngineConfig,
        callbacks: EngineCallbacks,
        store: Arc<dyn TextStore>,
        secure_store: Arc<dyn TextStore>,
        decoder: Arc<dyn TxDecoder>,
        factory: Box<dyn ConnectFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                callbacks,
                store: store.clone(),
                coin_store: CoinStore::new(secure_store),
                decoder,
                factory,
                state: Mutex::new(EngineState::default()),
                close_notify: Notify::new(),
            }),
        }
    }

    /// Loads every persisted cache and rebuilds the derived state.
    pub fn load(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();

        let tx_file: TxCacheFile = load_or_default(inner.store.as_ref(), TX_CACHE_FILE);
        for (txid, raw) in &tx_file.txs {
            match inner.decoder.decode(raw) {
                Ok(parsed) => {
                    state.parsed_txs.insert(txid.clone(), parsed);
                }
                Err(e) => {
                    log::warn!("[ENGINE] dropping undecodable cached tx {txid}: {e:#}");
                    continue;
                }
            }
            state.tx_cache.insert(txid.clone(), raw.clone());
        }

        let header_file: HeaderCacheFile = load_or_default(inner.store.as_ref(), HEADER_CACHE_FILE);
        state.tip_height = header_file.height;
        state.header_cache = header_file.headers;

        let address_file: AddressCacheFile =
            load_or_default(inner.store.as_ref(), ADDRESS_CACHE_FILE);
        state.address_cache = address_file.addresses;
        state.tx_heights = address_file.heights;

        let wanted: Vec<i64> = state
            .tx_heights
            .values()
            .map(|entry| entry.height)
            .filter(|h| *h > 0 && !state.header_cache.contains_key(h))
            .collect();
        state.missing_headers.extend(wanted);

        let script_hashes: Vec<String> = state.address_cache.keys().cloned().collect();
        for script_hash in &script_hashes {
            let record = &state.address_cache[script_hash];
            let display_address = record.display_address.clone();
            let txids: Vec<String> = record.txids.clone();
            let utxo_txids: Vec<String> =
                record.utxos.iter().map(|u| u.txid.clone()).collect();
            state
                .script_hashes
                .insert(display_address, script_hash.clone());
            for txid in txids.iter().chain(utxo_txids.iter()) {
                cache::handle_new_txid(&mut state, txid, false);
            }
            cache::refresh_address_info(&mut state, &inner.callbacks, script_hash);
        }

        // Spend transactions are tracked verbose so their heights stay
        // fresh.
        for txid in inner.coin_store.spend_txids() {
            cache::handle_new_txid(&mut state, &txid, true);
        }
        Ok(())
    }

    /// Replaces the published server list, merging it with persisted
    /// scores.
    pub fn provide_server_list(&self, servers: Vec<String>) {
        let mut state = self.inner.state.lock().unwrap();
        let scores: ServerCacheFile =
            load_or_default(self.inner.store.as_ref(), SERVER_CACHE_FILE);
        state.server_cache.load(scores, &servers);
    }

    /// Starts syncing.
    pub fn connect(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.running = true;
            state.progress_ratio = 0.0;
            state.tx_cache_init_size = state.tx_cache.len();
        }
        Inner::refill_servers(&self.inner);
    }

    /// Stops syncing and waits for every connection to close.
    pub async fn disconnect(&self) {
        loop {
            let notified = self.inner.close_notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                state.running = false;
                state.server_list.clear();
                if state.connections.is_empty() {
                    // No connection will ever service these; unblock the
                    // waiters the same way a closing connection fails its
                    // pending tasks.
                    state.mint_metadata_query.cancel();
                    state.anonymity_set_query.cancel();
                    state.used_serials_query.cancel();
                    state.coin_groups_query.cancel();
                    self.inner.save_all(&mut state);
                    return;
                }
                for connection in state.connections.values() {
                    connection.disconnect();
                }
            }
            notified.await;
        }
    }

    pub fn add_address(
        &self,
        script_hash: &str,
        display_address: &str,
        path: &str,
        redeem_script: Option<&str>,
    ) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        if state.address_cache.contains_key(script_hash) {
            return;
        }
        state.address_cache.insert(
            script_hash.to_string(),
            AddressRecord {
                display_address: display_address.to_string(),
                path: path.to_string(),
                redeem_script: redeem_script.map(str::to_string),
                ..AddressRecord::default()
            },
        );
        state
            .script_hashes
            .insert(display_address.to_string(), script_hash.to_string());
        cache::refresh_address_info(&mut state, &inner.callbacks, script_hash);
        state.address_cache_dirty = true;
        for server in state.server_states.values_mut() {
            server.addresses.entry(script_hash.to_string()).or_default();
        }
        drop(state);
        inner.wake_up_connections();
    }

    pub fn mark_addresses_used(&self, script_hashes: &[String]) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        for script_hash in script_hashes {
            state.used_addresses.insert(script_hash.clone());
            cache::refresh_address_info(&mut state, &inner.callbacks, script_hash);
        }
    }

    pub fn get_balance(&self, kind: BalanceKind) -> u64 {
        let public: u64 = {
            let state = self.inner.state.lock().unwrap();
            state.address_infos.values().map(|info| info.balance).sum()
        };
        match kind {
            BalanceKind::Public => public,
            BalanceKind::Minted => self.inner.coin_store.minted_balance(),
            BalanceKind::Total => public + self.inner.coin_store.minted_balance(),
        }
    }

    pub fn get_utxos(&self) -> Vec<SpendableUtxo> {
        let state = self.inner.state.lock().unwrap();
        let mut utxos = Vec::new();
        for info in state.address_infos.values() {
            for utxo in &info.utxos {
                if !state.parsed_txs.contains_key(&utxo.txid) {
                    continue;
                }
                let height = state
                    .tx_heights
                    .get(&utxo.txid)
                    .map(|h| h.height)
                    .unwrap_or(-1);
                utxos.push(SpendableUtxo {
                    txid: utxo.txid.clone(),
                    index: utxo.index,
                    value: utxo.value,
                    height,
                });
            }
        }
        utxos
    }

    pub fn get_num_transactions(&self) -> usize {
        self.inner.state.lock().unwrap().tx_cache.len()
    }

    pub fn get_block_height(&self) -> i64 {
        self.inner.state.lock().unwrap().tip_height
    }

    /// Broadcasts on every live connection at once; the first success
    /// wins, and the call fails only when every server rejects it.
    pub async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, EngineError> {
        let connections: Vec<Arc<dyn ServerConnection>> = {
            let state = self.inner.state.lock().unwrap();
            state
                .connections
                .values()
                .filter(|c| c.is_connected())
                .cloned()
                .collect()
        };
        if connections.is_empty() {
            return Err(EngineError::NoConnections);
        }

        struct Race {
            sender: Option<oneshot::Sender<Result<String, EngineError>>>,
            failures: usize,
            total: usize,
            last_error: String,
        }
        let (tx, rx) = oneshot::channel();
        let race = Arc::new(Mutex::new(Race {
            sender: Some(tx),
            failures: 0,
            total: connections.len(),
            last_error: String::new(),
        }));

        for connection in &connections {
            let race = race.clone();
            let task = messages::broadcast_tx(raw_hex, move |result, _elapsed| {
                let mut race = race.lock().unwrap();
                match result {
                    Ok(txid) => {
                        if let Some(sender) = race.sender.take() {
                            let _ = sender.send(Ok(txid));
                        }
                    }
                    Err(e) => {
                        race.failures += 1;
                        race.last_error = e.to_string();
                        if race.failures == race.total {
                            if let Some(sender) = race.sender.take() {
                                let _ = sender
                                    .send(Err(EngineError::BroadcastFailed(race.last_error.clone())));
                            }
                        }
                    }
                }
            });
            connection.submit_task(task);
        }

        rx.await.map_err(|_| EngineError::Disconnected)?
    }

    /// Completes a spend we built ourselves: injects the transaction
    /// into the caches as a mempool entry.
    pub fn save_tx(&self, txid: &str, raw_hex: &str) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        cache::handle_txid_fetch(&mut state, &inner.callbacks, txid, -1);
        cache::handle_tx_fetch(
            &mut state,
            &inner.callbacks,
            inner.decoder.as_ref(),
            txid,
            raw_hex,
        );
        for script_hash in cache::find_affected_addresses(&state, txid) {
            if let Some(record) = state.address_cache.get_mut(&script_hash) {
                record.txids.push(txid.to_string());
            }
            cache::refresh_address_info(&mut state, &inner.callbacks, &script_hash);
        }
        state.address_cache_dirty = true;
        inner.flush_if_settled(&mut state);
    }

    pub fn save_caches(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.save_all(&mut state);
    }

    // =================================================================
    // Sigma operations
    // =================================================================

    pub async fn retrieve_mint_metadata(&self, queries: Vec<MintQuery>) -> Vec<MintMetadata> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            state.mint_metadata_query.request(queries)
        };
        self.inner.wake_up_connections();
        rx.await.unwrap_or_default()
    }

    pub async fn retrieve_anonymity_set(&self, denom: u64, group_id: i64) -> AnonymitySet {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            state.anonymity_set_query.request((denom, group_id))
        };
        self.inner.wake_up_connections();
        rx.await.unwrap_or_default()
    }

    pub async fn retrieve_used_serials(&self) -> Vec<String> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            state.used_serials_query.request(())
        };
        self.inner.wake_up_connections();
        rx.await.unwrap_or_default()
    }

    pub async fn retrieve_latest_coin_ids(&self) -> Vec<CoinGroup> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            state.coin_groups_query.request(())
        };
        self.inner.wake_up_connections();
        rx.await.unwrap_or_default()
    }

    /// One-time wallet restore: rebuilds the coin file from chain data.
    /// A completed restore is remembered and skipped on later calls.
    pub async fn restore_coins(&self, deriver: &dyn CoinDeriver) -> Result<()> {
        let coin_store = &self.inner.coin_store;
        if coin_store.is_restored() {
            return Ok(());
        }
        log::info!("[SIGMA] starting wallet restore");

        let used_serials = self.retrieve_used_serials().await;
        let groups = self.retrieve_latest_coin_ids().await;

        let mut ctx = sigma::RestoreContext {
            used_serials: used_serials.into_iter().collect(),
            groups: Vec::new(),
        };
        for group in &groups {
            let mut commitments = Vec::new();
            for id in 1..=group.id {
                let set = self.retrieve_anonymity_set(group.denom, id).await;
                commitments.extend(set.serialized_coins);
            }
            ctx.groups.push(sigma::RestoreGroup {
                denom: group.denom,
                commitments,
            });
        }

        let coins =
            sigma::reconstruct_coins(&ctx, deriver, self.inner.config.restore_miss_limit)?;
        coin_store.save(&coins)?;
        coin_store.mark_restored()?;
        self.refresh_spend_transactions();
        Ok(())
    }

    /// Refreshes confirmation metadata for every known mint.
    pub async fn refresh_mint_metadata(&self) -> Result<()> {
        let queries = self.inner.coin_store.metadata_queries();
        if queries.is_empty() {
            return Ok(());
        }
        let rows = self.retrieve_mint_metadata(queries).await;
        let tip = self.get_block_height();
        self.inner.coin_store.apply_metadata(&rows, tip)
    }

    /// Plans new mints for `amount` and records them in the coin file.
    pub fn create_mints(&self, amount: u64, deriver: &dyn CoinDeriver) -> Result<Vec<PrivateCoin>> {
        let coins =
            sigma::mint::mint_commitments_for_value(amount, deriver, self.inner.coin_store.max_index())?;
        self.inner.coin_store.append(&coins)?;
        Ok(coins)
    }

    /// Picks coins for a private spend and pairs each with its
    /// anonymity set.
    pub async fn select_coins_for_spend(
        &self,
        amount: u64,
    ) -> Result<Vec<SpendCoin>, EngineError> {
        let approved = sigma::approved_mints(&self.inner.coin_store.load());
        let selected = sigma::select_mints_to_spend(approved, amount)?;

        let mut spend_coins = Vec::with_capacity(selected.len());
        for coin in selected {
            let set = self.retrieve_anonymity_set(coin.value, coin.group_id).await;
            spend_coins.push(SpendCoin {
                value: coin.value,
                index: coin.index,
                group_id: coin.group_id,
                anonymity_set: set.serialized_coins,
                block_hash: set.block_hash,
            });
        }
        Ok(spend_coins)
    }

    /// Marks coins consumed by a broadcast spend and starts tracking
    /// the spend transaction.
    pub fn record_spend(&self, spent_indices: &[u32], txid: &str) -> Result<()> {
        self.inner.coin_store.record_spend(spent_indices, txid)?;
        let mut state = self.inner.state.lock().unwrap();
        cache::handle_new_txid(&mut state, txid, true);
        drop(state);
        self.inner.wake_up_connections();
        Ok(())
    }

    /// Re-queues verbose fetches for spend transactions still shy of
    /// two confirmations, so their heights keep updating.
    pub fn refresh_spend_transactions(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        let tip = state.tip_height;
        let mut refresh_needed = false;
        for txid in inner.coin_store.spend_txids() {
            let height = state.tx_heights.get(&txid).map(|h| h.height).unwrap_or(-1);
            if (height <= 0 || tip - height <= 1) && !state.missing_txs_verbose.contains(&txid) {
                log::info!("[SIGMA] re-fetching spend tx {txid} at height {height}");
                cache::handle_new_txid(&mut state, &txid, true);
                refresh_needed = true;
            }
        }
        drop(state);
        if refresh_needed {
            inner.wake_up_connections();
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}
