#![cfg(test)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::persistence::MemoryStore;
use crate::stratum::connection::ConnectOptions;
use crate::stratum::{ConnectionEvents, ServerConnection, Task, TaskOutcome};
use crate::tx::{OutPoint, ParsedTx, TxDecoder, TxInput, TxOutput};

use super::cache;
use super::coordinator::{reconnect_delay, ConnectFactory, SyncCoordinator};
use super::scheduler;
use super::state::EngineState;
use super::types::{
    AddressRecord, BalanceKind, EngineCallbacks, EngineConfig, ServerState, TxHeight, Utxo,
};

// =====================================================================
// Test doubles
// =====================================================================

/// Decoder for a tiny fake wire format:
/// `in:<txid>:<index>;out:<value>:<script_hash>;...`
struct FakeDecoder;

impl TxDecoder for FakeDecoder {
    fn decode(&self, raw_hex: &str) -> Result<ParsedTx> {
        let mut tx = ParsedTx::default();
        for part in raw_hex.split(';').filter(|p| !p.is_empty()) {
            let fields: Vec<&str> = part.split(':').collect();
            match fields.as_slice() {
                ["in", txid, index] => tx.inputs.push(TxInput {
                    prev: OutPoint {
                        txid: txid.to_string(),
                        index: index.parse()?,
                    },
                }),
                ["out", value, script_hash] => tx.outputs.push(TxOutput {
                    value: value.parse()?,
                    script_hash: script_hash.to_string(),
                }),
                _ => anyhow::bail!("bad fake tx part: {part}"),
            }
        }
        Ok(tx)
    }
}

struct MockConnection {
    uri: String,
    connected: AtomicBool,
    tasks: Mutex<Vec<Task>>,
}

impl MockConnection {
    fn new(uri: &str) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.to_string(),
            connected: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn take_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

impl ServerConnection for MockConnection {
    fn uri(&self) -> &str {
        &self.uri
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
    fn submit_task(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }
    fn wake_up(&self) {}
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

struct MockFactory;

impl ConnectFactory for MockFactory {
    fn connect(
        &self,
        uri: &str,
        _options: ConnectOptions,
        _events: Arc<dyn ConnectionEvents>,
    ) -> Arc<dyn ServerConnection> {
        MockConnection::new(uri)
    }
}

fn coordinator() -> SyncCoordinator {
    SyncCoordinator::with_factory(
        EngineConfig::default(),
        EngineCallbacks::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(FakeDecoder),
        Box::new(MockFactory),
    )
}

/// Wires a mock connection into the coordinator state.
fn attach(coordinator: &SyncCoordinator, uri: &str) -> Arc<MockConnection> {
    let conn = MockConnection::new(uri);
    let mut state = coordinator.inner().state.lock().unwrap();
    state.connections.insert(uri.to_string(), conn.clone());
    state
        .server_states
        .insert(uri.to_string(), ServerState::default());
    state.populate_server_addresses(uri);
    conn
}

fn add_cached_address(state: &mut EngineState, script_hash: &str) {
    state.address_cache.insert(
        script_hash.to_string(),
        AddressRecord {
            display_address: format!("addr-{script_hash}"),
            ..AddressRecord::default()
        },
    );
}

// =====================================================================
// Derived address info
// =====================================================================

#[test]
fn derived_info_filters_unknown_txs_and_applies_mempool() {
    let callbacks = EngineCallbacks::default();
    let decoder = FakeDecoder;
    let mut state = EngineState::default();
    add_cached_address(&mut state, "sh1");

    // A confirmed funding tx and an unconfirmed chained spend that
    // consumes it and pays change back to the same address.
    cache::handle_txid_fetch(&mut state, &callbacks, "fund", 100);
    cache::handle_tx_fetch(&mut state, &callbacks, &decoder, "fund", "out:5000:sh1");
    cache::handle_txid_fetch(&mut state, &callbacks, "spend", -1);
    cache::handle_tx_fetch(
        &mut state,
        &callbacks,
        &decoder,
        "spend",
        "in:fund:0;out:1500:sh1",
    );

    let record = state.address_cache.get_mut("sh1").unwrap();
    record.txids = vec!["fund".into(), "spend".into(), "missing".into()];
    record.utxos = vec![Utxo {
        txid: "fund".into(),
        index: 0,
        value: 5000,
    }];
    cache::refresh_address_info(&mut state, &callbacks, "sh1");

    let info = &state.address_infos["sh1"];
    // "missing" is filtered out; the confirmed utxo is consumed by the
    // pending spend and replaced with the change output.
    assert_eq!(info.txids, vec!["fund".to_string(), "spend".to_string()]);
    assert_eq!(info.utxos.len(), 1);
    assert_eq!(info.utxos[0].txid, "spend");
    assert_eq!(info.balance, 1500);
    assert!(info.used);
}

#[test]
fn balance_and_used_callbacks_fire_on_change() {
    let balance_events = Arc::new(Mutex::new(0));
    let used_events = Arc::new(Mutex::new(0));
    let callbacks = EngineCallbacks {
        on_balance_changed: {
            let counter = balance_events.clone();
            Box::new(move || *counter.lock().unwrap() += 1)
        },
        on_address_used: {
            let counter = used_events.clone();
            Box::new(move || *counter.lock().unwrap() += 1)
        },
        ..EngineCallbacks::default()
    };
    let decoder = FakeDecoder;
    let mut state = EngineState::default();
    add_cached_address(&mut state, "sh1");
    cache::refresh_address_info(&mut state, &callbacks, "sh1");
    assert_eq!(*balance_events.lock().unwrap(), 0);

    cache::handle_txid_fetch(&mut state, &callbacks, "t1", 5);
    cache::handle_tx_fetch(&mut state, &callbacks, &decoder, "t1", "out:700:sh1");
    let record = state.address_cache.get_mut("sh1").unwrap();
    record.txids = vec!["t1".into()];
    record.utxos = vec![Utxo {
        txid: "t1".into(),
        index: 0,
        value: 700,
    }];
    cache::refresh_address_info(&mut state, &callbacks, "sh1");

    assert_eq!(*balance_events.lock().unwrap(), 1);
    assert_eq!(*used_events.lock().unwrap(), 1);

    // No change, no callback.
    cache::refresh_address_info(&mut state, &callbacks, "sh1");
    assert_eq!(*balance_events.lock().unwrap(), 1);
}

#[test]
fn txid_fetch_tracks_heights_and_missing_headers() {
    let callbacks = EngineCallbacks::default();
    let mut state = EngineState::default();

    cache::handle_txid_fetch(&mut state, &callbacks, "t1", 42);
    assert_eq!(state.tx_heights["t1"].height, 42);
    assert!(state.missing_headers.contains(&42));
    assert!(state.missing_txs.contains("t1"));

    // Height zero is treated as mempool.
    cache::handle_txid_fetch(&mut state, &callbacks, "t2", 0);
    assert_eq!(state.tx_heights["t2"].height, -1);
    assert!(!state.missing_headers.contains(&-1));
}

#[test]
fn chain_tip_is_monotone() {
    let heights = Arc::new(Mutex::new(Vec::new()));
    let callbacks = EngineCallbacks {
        on_height_updated: {
            let log = heights.clone();
            Box::new(move |h| log.lock().unwrap().push(h))
        },
        ..EngineCallbacks::default()
    };
    let mut state = EngineState::default();

    cache::update_height(&mut state, &callbacks, 100);
    cache::update_height(&mut state, &callbacks, 99);
    cache::update_height(&mut state, &callbacks, 101);
    assert_eq!(state.tip_height, 101);
    assert_eq!(*heights.lock().unwrap(), vec![100, 101]);
}

#[test]
fn progress_respects_throttle() {
    let mut state = EngineState::default();
    add_cached_address(&mut state, "sh1");
    add_cached_address(&mut state, "sh2");
    state
        .server_states
        .insert("tcp://a:1".into(), ServerState::default());

    let callbacks = EngineCallbacks::default();
    cache::refresh_address_info(&mut state, &callbacks, "sh1");
    cache::refresh_address_info(&mut state, &callbacks, "sh2");
    state.populate_server_addresses("tcp://a:1");

    // Nothing synced yet: ratio 0, no report.
    assert_eq!(cache::update_progress(&mut state, 0.25), None);

    // One of two addresses synced: 0.5 > throttle.
    state
        .server_states
        .get_mut("tcp://a:1")
        .unwrap()
        .addresses
        .get_mut("sh1")
        .unwrap()
        .synced = true;
    assert_eq!(cache::update_progress(&mut state, 0.25), Some(0.5));

    // Both synced: completion always reports.
    state
        .server_states
        .get_mut("tcp://a:1")
        .unwrap()
        .addresses
        .get_mut("sh2")
        .unwrap()
        .synced = true;
    assert_eq!(cache::update_progress(&mut state, 0.25), Some(1.0));
    assert_eq!(cache::update_progress(&mut state, 0.25), None);
}

// =====================================================================
// Scheduler
// =====================================================================

const URI: &str = "tcp://mock:50001";

#[test]
fn first_task_is_height_subscription_and_not_repeated() {
    let coordinator = coordinator();
    attach(&coordinator, URI);

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "blockchain.headers.subscribe");

    // Still in flight: nothing else to do.
    assert!(scheduler::pick_next_task(coordinator.inner(), URI, "1.4").is_none());
}

fn settle_height(coordinator: &SyncCoordinator) {
    let mut state = coordinator.inner().state.lock().unwrap();
    let server = state.server_states.get_mut(URI).unwrap();
    server.fetching_height = false;
    server.height = Some(1000);
}

#[test]
fn headers_outrank_txs_and_are_not_double_fetched() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    settle_height(&coordinator);
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.missing_headers.insert(500);
        state.missing_txs.insert("t1".into());
    }

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "blockchain.block.header");

    // The header is marked in flight, so the next pick moves down the
    // ladder instead of re-fetching it.
    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "blockchain.transaction.get");
    assert!(scheduler::pick_next_task(coordinator.inner(), URI, "1.4").is_none());
}

#[test]
fn legacy_servers_get_the_old_header_call() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    settle_height(&coordinator);
    coordinator
        .inner()
        .state
        .lock()
        .unwrap()
        .missing_headers
        .insert(500);

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.1").unwrap();
    assert_eq!(task.method, "blockchain.block.get_header");
}

#[test]
fn verbose_refetches_outrank_plain_tx_fetches() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    settle_height(&coordinator);
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.missing_txs.insert("plain".into());
        state.missing_txs_verbose.insert("spendtx".into());
    }

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "blockchain.transaction.get");
    assert_eq!(task.params, json!(["spendtx", true]));

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.params, json!(["plain"]));
}

#[test]
fn failed_verbose_fetch_is_retried() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    settle_height(&coordinator);
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.missing_txs_verbose.insert("spendtx".into());
    }

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.params, json!(["spendtx", true]));
    // In flight, so nobody is handed the same fetch twice.
    assert!(scheduler::pick_next_task(coordinator.inner(), URI, "1.4").is_none());

    task.resolve(TaskOutcome::Failed(crate::stratum::TaskError::Server(
        "busy".into(),
    )));
    {
        let state = coordinator.inner().state.lock().unwrap();
        assert!(state.missing_txs_verbose.contains("spendtx"));
        assert!(!state.fetching_txs.contains("spendtx"));
    }

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.params, json!(["spendtx", true]));
}

#[test]
fn tx_announced_by_another_server_is_left_to_it() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    attach(&coordinator, "tcp://other:50001");
    settle_height(&coordinator);
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.server_states.get_mut(URI).unwrap().height = Some(1000);
        state
            .server_states
            .get_mut("tcp://other:50001")
            .unwrap()
            .height = Some(1000);
        state.missing_txs.insert("t1".into());
        state
            .server_states
            .get_mut("tcp://other:50001")
            .unwrap()
            .known_txids
            .insert("t1".into());
    }

    assert!(scheduler::pick_next_task(coordinator.inner(), URI, "1.4").is_none());
    let task = scheduler::pick_next_task(coordinator.inner(), "tcp://other:50001", "1.4").unwrap();
    assert_eq!(task.method, "blockchain.transaction.get");
}

#[test]
fn used_addresses_subscribe_first() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    settle_height(&coordinator);
    {
        let inner = coordinator.inner();
        let callbacks = EngineCallbacks::default();
        let mut state = inner.state.lock().unwrap();
        add_cached_address(&mut state, "cold");
        add_cached_address(&mut state, "hot");
        state.used_addresses.insert("hot".into());
        cache::refresh_address_info(&mut state, &callbacks, "cold");
        cache::refresh_address_info(&mut state, &callbacks, "hot");
        state.populate_server_addresses(URI);
    }

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "blockchain.scripthash.subscribe");
    assert_eq!(task.params, json!(["hot"]));
}

#[test]
fn utxo_and_history_fetches_require_ownership() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    attach(&coordinator, "tcp://other:50001");
    settle_height(&coordinator);
    {
        let inner = coordinator.inner();
        let callbacks = EngineCallbacks::default();
        let mut state = inner.state.lock().unwrap();
        state
            .server_states
            .get_mut("tcp://other:50001")
            .unwrap()
            .height = Some(1000);
        add_cached_address(&mut state, "sh1");
        cache::refresh_address_info(&mut state, &callbacks, "sh1");
        state.populate_server_addresses(URI);
        state.populate_server_addresses("tcp://other:50001");
        for uri in [URI, "tcp://other:50001"] {
            let sub = state
                .server_states
                .get_mut(uri)
                .unwrap()
                .addresses
                .get_mut("sh1")
                .unwrap();
            sub.subscribed = true;
            sub.status_hash = Some("fresh".into());
        }
        state
            .address_owner
            .insert("sh1".into(), "tcp://other:50001".into());
    }

    // The non-owner has nothing to do even though the hash changed.
    assert!(scheduler::pick_next_task(coordinator.inner(), URI, "1.4").is_none());

    let task = scheduler::pick_next_task(coordinator.inner(), "tcp://other:50001", "1.4").unwrap();
    assert_eq!(task.method, "blockchain.scripthash.listunspent");
}

#[test]
fn sigma_queries_are_lowest_priority_and_coalesce() {
    let coordinator = coordinator();
    attach(&coordinator, URI);
    settle_height(&coordinator);
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.missing_txs.insert("t1".into());
        let _rx1 = state.used_serials_query.request(());
        let _rx2 = state.used_serials_query.request(());
    }

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "blockchain.transaction.get");

    let task = scheduler::pick_next_task(coordinator.inner(), URI, "1.4").unwrap();
    assert_eq!(task.method, "sigma.getusedcoinserials");

    // Both waiters were claimed by the dispatched task.
    assert!(scheduler::pick_next_task(coordinator.inner(), URI, "1.4").is_none());
}

// =====================================================================
// Coordinator API
// =====================================================================

fn resolve_ok(task: Task, result: serde_json::Value) {
    task.resolve(TaskOutcome::Done {
        result,
        elapsed: Duration::from_millis(10),
    });
}

#[tokio::test]
async fn broadcast_first_success_wins() {
    let coordinator = Arc::new(coordinator());
    let a = attach(&coordinator, "tcp://a:1");
    let b = attach(&coordinator, "tcp://b:1");

    let handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.broadcast_tx("rawtx").await }
    });
    // Submission happens before the future awaits anything.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut a_tasks = a.take_tasks();
    let mut b_tasks = b.take_tasks();
    assert_eq!(a_tasks.len(), 1);
    assert_eq!(b_tasks.len(), 1);

    let txid = "ab".repeat(32);
    a_tasks
        .pop()
        .unwrap()
        .resolve(TaskOutcome::Failed(crate::stratum::TaskError::Server(
            "rejected".into(),
        )));
    resolve_ok(b_tasks.pop().unwrap(), json!(txid.clone()));

    let result = handle.await.unwrap();
    assert_eq!(result.unwrap(), txid);
}

#[tokio::test]
async fn broadcast_fails_only_when_every_server_fails() {
    let coordinator = Arc::new(coordinator());
    let a = attach(&coordinator, "tcp://a:1");
    let b = attach(&coordinator, "tcp://b:1");

    let handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.broadcast_tx("rawtx").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    for conn in [&a, &b] {
        for task in conn.take_tasks() {
            task.resolve(TaskOutcome::Failed(crate::stratum::TaskError::Server(
                "no".into(),
            )));
        }
    }

    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(crate::error::EngineError::BroadcastFailed(_))
    ));
}

#[tokio::test]
async fn disconnect_resolves_outstanding_sigma_queries() {
    let coordinator = Arc::new(coordinator());

    let handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.retrieve_used_serials().await }
    });
    // Let the query register before shutting down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.disconnect().await;

    // No server ever picked the query up; the caller still gets an
    // answer instead of hanging.
    let serials = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(serials.is_empty());
}

#[tokio::test]
async fn broadcast_without_connections_errors() {
    let coordinator = coordinator();
    let result = coordinator.broadcast_tx("rawtx").await;
    assert!(matches!(result, Err(crate::error::EngineError::NoConnections)));
}

#[test]
fn save_tx_enters_mempool_and_updates_addresses() {
    let coordinator = coordinator();
    {
        let inner = coordinator.inner();
        let mut state = inner.state.lock().unwrap();
        add_cached_address(&mut state, "sh1");
        let callbacks = EngineCallbacks::default();
        cache::refresh_address_info(&mut state, &callbacks, "sh1");
    }

    coordinator.save_tx("mytx", "out:900:sh1");

    let state = coordinator.inner().state.lock().unwrap();
    assert_eq!(state.tx_heights["mytx"].height, -1);
    assert!(state.address_cache["sh1"].txids.contains(&"mytx".to_string()));
    let info = &state.address_infos["sh1"];
    assert_eq!(info.balance, 900);
}

#[test]
fn reconnect_backoff_starts_immediate_and_caps() {
    assert_eq!(reconnect_delay(0), Duration::ZERO);
    assert_eq!(reconnect_delay(3), Duration::from_secs(3));
    assert_eq!(reconnect_delay(9), Duration::from_secs(5));
}

#[test]
fn add_address_keeps_the_redeem_script() {
    let coordinator = coordinator();
    coordinator.add_address("sh1", "addr1", "m/0/0", Some("5121aa51ae"));
    coordinator.add_address("sh2", "addr2", "m/0/1", None);

    let state = coordinator.inner().state.lock().unwrap();
    assert_eq!(
        state.address_cache["sh1"].redeem_script.as_deref(),
        Some("5121aa51ae")
    );
    assert!(state.address_cache["sh2"].redeem_script.is_none());
}

#[test]
fn caches_round_trip_through_load() {
    let store = Arc::new(MemoryStore::new());
    let build = |store: Arc<MemoryStore>| {
        SyncCoordinator::with_factory(
            EngineConfig::default(),
            EngineCallbacks::default(),
            store,
            Arc::new(MemoryStore::new()),
            Arc::new(FakeDecoder),
            Box::new(MockFactory),
        )
    };

    let first = build(store.clone());
    {
        let inner = first.inner();
        let mut state = inner.state.lock().unwrap();
        add_cached_address(&mut state, "sh1");
        state.address_cache_dirty = true;
        let callbacks = EngineCallbacks::default();
        cache::handle_txid_fetch(&mut state, &callbacks, "t1", 77);
        cache::handle_tx_fetch(&mut state, &callbacks, &FakeDecoder, "t1", "out:5:sh1");
        cache::handle_header_fetch(&mut state, &callbacks, 77, 1234);
        cache::update_height(&mut state, &callbacks, 77);
    }
    first.save_caches();

    let second = build(store);
    second.load().unwrap();
    let state = second.inner().state.lock().unwrap();
    assert_eq!(state.tx_cache["t1"], "out:5:sh1");
    assert!(state.parsed_txs.contains_key("t1"));
    assert_eq!(state.tx_heights["t1"].height, 77);
    assert_eq!(state.tip_height, 77);
    assert!(state.address_cache.contains_key("sh1"));
    // Loading rebuilds the display-address reverse index.
    assert_eq!(state.script_hashes["addr-sh1"], "sh1");
    // The header at 77 was saved with the cache, so it is not re-fetched.
    assert_eq!(state.header_cache[&77].timestamp, 1234);
    assert!(state.missing_headers.is_empty());
}

#[test]
fn public_balance_sums_address_infos() {
    let coordinator = coordinator();
    {
        let inner = coordinator.inner();
        let mut state = inner.state.lock().unwrap();
        let callbacks = EngineCallbacks::default();
        add_cached_address(&mut state, "sh1");
        cache::handle_txid_fetch(&mut state, &callbacks, "t1", 3);
        cache::handle_tx_fetch(&mut state, &callbacks, &FakeDecoder, "t1", "out:250:sh1");
        let record = state.address_cache.get_mut("sh1").unwrap();
        record.txids = vec!["t1".into()];
        record.utxos = vec![Utxo {
            txid: "t1".into(),
            index: 0,
            value: 250,
        }];
        cache::refresh_address_info(&mut state, &callbacks, "sh1");
    }
    assert_eq!(coordinator.get_balance(BalanceKind::Public), 250);
    assert_eq!(coordinator.get_balance(BalanceKind::Total), 250);

    let utxos = coordinator.get_utxos();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].height, 3);
}

#[test]
fn spend_refresh_requeues_shallow_transactions() {
    let coordinator = coordinator();
    coordinator
        .inner()
        .coin_store
        .append(&[crate::sigma::PrivateCoin {
            value: 5_000_000,
            index: 0,
            commitment: "c".into(),
            serial_number: "s".into(),
            group_id: 1,
            is_spend: true,
            spend_tx_id: "spendtx".into(),
        }])
        .unwrap();
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.tip_height = 100;
        state.tx_heights.insert(
            "spendtx".into(),
            TxHeight {
                height: 99,
                first_seen: 0,
            },
        );
    }

    // One confirmation: still needs refreshing.
    coordinator.refresh_spend_transactions();
    assert!(coordinator
        .inner()
        .state
        .lock()
        .unwrap()
        .missing_txs_verbose
        .contains("spendtx"));

    // Two confirmations: settled.
    {
        let mut state = coordinator.inner().state.lock().unwrap();
        state.missing_txs_verbose.clear();
        state.tx_heights.get_mut("spendtx").unwrap().height = 98;
    }
    coordinator.refresh_spend_transactions();
    assert!(coordinator
        .inner()
        .state
        .lock()
        .unwrap()
        .missing_txs_verbose
        .is_empty());
}
