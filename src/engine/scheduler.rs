//! Task scheduling: whenever a connection reports queue space, walk the
//! priority ladder and hand it the most urgent piece of work it is
//! allowed to do.
//!
//! Ladder, top to bottom: height subscription, block headers, verbose
//! transaction refetches, missing transactions, utxo listings, address
//! subscriptions (used addresses first), address histories, sigma
//! queries. Headers and transactions are free-for-all items guarded by
//! the can-get rule; utxo and history fetches belong to the address's
//! owning server only.

use std::sync::Arc;

use crate::sigma::types::{AnonymitySet, CoinGroup};
use crate::stratum::{messages, Task};

use super::cache;
use super::coordinator::Inner;
use super::types::now_ms;

pub fn pick_next_task(inner: &Arc<Inner>, uri: &str, version: &str) -> Option<Task> {
    let mut state = inner.state.lock().unwrap();
    let server = state.server_states.get_mut(uri)?;

    // Height subscription, once per connection.
    if server.height.is_none() && !server.fetching_height {
        server.fetching_height = true;
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        return Some(messages::subscribe_height(move |result, elapsed| {
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock().unwrap();
            if let Some(server) = state.server_states.get_mut(&uri) {
                server.fetching_height = false;
            }
            match result {
                Ok(height) => {
                    log::info!("[ENGINE] {uri} reports height {height}");
                    if let Some(server) = state.server_states.get_mut(&uri) {
                        server.height = Some(height);
                    }
                    cache::update_height(&mut state, &inner.callbacks, height);
                    inner.score_up(&mut state, &uri, elapsed, 1);
                }
                Err(e) => {
                    log::info!("[ENGINE] {uri} height subscription failed: {e}");
                    inner.score_down(&mut state, &uri, 10);
                }
            }
        }));
    }

    // Block headers.
    let wanted_header = state
        .missing_headers
        .iter()
        .find(|h| !state.fetching_headers.contains(h) && state.server_can_get_header(uri, **h))
        .copied();
    if let Some(height) = wanted_header {
        state.fetching_headers.insert(height);
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        return Some(messages::fetch_header(
            height,
            version,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                state.fetching_headers.remove(&height);
                match result {
                    Ok(timestamp) => {
                        log::info!("[ENGINE] {uri} sent header {height} @ {timestamp}");
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        cache::handle_header_fetch(&mut state, &inner.callbacks, height, timestamp);
                        inner.flush_if_settled(&mut state);
                    }
                    Err(e) => {
                        log::info!("[ENGINE] {uri} header {height} failed: {e}");
                        let announced = state
                            .server_states
                            .get(&uri)
                            .is_some_and(|s| s.known_headers.contains(&height));
                        if !announced {
                            inner.score_down(&mut state, &uri, 10);
                        }
                    }
                }
            },
        ));
    }

    // Verbose refetches outrank plain fetches; they carry height data
    // our spend bookkeeping is waiting on.
    let wanted_verbose = state
        .missing_txs_verbose
        .iter()
        .find(|txid| !state.fetching_txs.contains(*txid) && state.server_can_get_tx(uri, txid))
        .cloned();
    if let Some(txid) = wanted_verbose {
        // The txid stays in the wanted set until a fetch succeeds, so
        // a failure here leaves it for the next server to pick up.
        state.fetching_txs.insert(txid.clone());
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        let txid_for_fetch = txid.clone();
        return Some(messages::fetch_transaction_verbose(
            &txid_for_fetch,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                state.fetching_txs.remove(&txid);
                match result {
                    Ok(tx) => {
                        log::info!("[ENGINE] {uri} sent verbose tx {txid}");
                        state.missing_txs_verbose.remove(&txid);
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        cache::handle_tx_fetch(
                            &mut state,
                            &inner.callbacks,
                            inner.decoder.as_ref(),
                            &txid,
                            &tx.hex,
                        );
                        cache::handle_txid_fetch(&mut state, &inner.callbacks, &txid, tx.height);
                        inner.flush_if_settled(&mut state);
                    }
                    Err(e) => {
                        log::info!("[ENGINE] {uri} verbose tx {txid} failed: {e}");
                        let announced = state
                            .server_states
                            .get(&uri)
                            .is_some_and(|s| s.known_txids.contains(&txid));
                        if !announced {
                            inner.score_down(&mut state, &uri, 10);
                        }
                    }
                }
            },
        ));
    }

    // Missing transactions.
    let wanted_tx = state
        .missing_txs
        .iter()
        .find(|txid| !state.fetching_txs.contains(*txid) && state.server_can_get_tx(uri, txid))
        .cloned();
    if let Some(txid) = wanted_tx {
        state.fetching_txs.insert(txid.clone());
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        let txid_for_fetch = txid.clone();
        return Some(messages::fetch_transaction(
            &txid_for_fetch,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                state.fetching_txs.remove(&txid);
                match result {
                    Ok(raw) => {
                        log::info!("[ENGINE] {uri} sent tx {txid}");
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        cache::handle_tx_fetch(
                            &mut state,
                            &inner.callbacks,
                            inner.decoder.as_ref(),
                            &txid,
                            &raw,
                        );
                        inner.flush_progress(&mut state);
                    }
                    Err(e) => {
                        log::info!("[ENGINE] {uri} tx {txid} failed: {e}");
                        let announced = state
                            .server_states
                            .get(&uri)
                            .is_some_and(|s| s.known_txids.contains(&txid));
                        if !announced {
                            inner.score_down(&mut state, &uri, 10);
                        }
                    }
                }
            },
        ));
    }

    // Utxo listings, for addresses we own whose state hash moved.
    let wanted_utxo = state
        .server_states
        .get(uri)
        .and_then(|server| {
            server.addresses.iter().find_map(|(script_hash, sub)| {
                let hash = sub.status_hash.as_ref()?;
                let record = state.address_cache.get(script_hash)?;
                (*hash != record.utxo_status_hash
                    && !sub.fetching_utxos
                    && state.owner_of(script_hash) == Some(uri))
                .then(|| (script_hash.clone(), hash.clone()))
            })
        });
    if let Some((script_hash, status_hash)) = wanted_utxo {
        if let Some(sub) = state
            .server_states
            .get_mut(uri)
            .and_then(|s| s.addresses.get_mut(&script_hash))
        {
            sub.fetching_utxos = true;
        }
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        let script_hash_for_fetch = script_hash.clone();
        return Some(messages::fetch_script_hash_utxos(
            &script_hash_for_fetch,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                if let Some(sub) = state
                    .server_states
                    .get_mut(&uri)
                    .and_then(|s| s.addresses.get_mut(&script_hash))
                {
                    sub.fetching_utxos = false;
                }
                match result {
                    Ok(utxos) => {
                        log::info!("[ENGINE] {uri} sent utxos for {script_hash}");
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        cache::handle_utxo_fetch(
                            &mut state,
                            &inner.callbacks,
                            &script_hash,
                            &status_hash,
                            utxos,
                        );
                        inner.flush_if_settled(&mut state);
                    }
                    Err(e) => {
                        log::info!("[ENGINE] {uri} utxos for {script_hash} failed: {e}");
                        inner.score_down(&mut state, &uri, 10);
                    }
                }
            },
        ));
    }

    // Subscriptions, used addresses first.
    let mut subscription_order: Vec<(bool, String)> = state
        .address_infos
        .iter()
        .map(|(script_hash, info)| (info.used, script_hash.clone()))
        .collect();
    subscription_order.sort_by_key(|(used, _)| !*used);
    let wanted_subscription = subscription_order.into_iter().find_map(|(_, script_hash)| {
        let sub = state.server_states.get(uri)?.addresses.get(&script_hash)?;
        (!sub.subscribed && !sub.subscribing).then_some(script_hash)
    });
    if let Some(script_hash) = wanted_subscription {
        if let Some(sub) = state
            .server_states
            .get_mut(uri)
            .and_then(|s| s.addresses.get_mut(&script_hash))
        {
            sub.subscribing = true;
        }
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        let script_hash_for_sub = script_hash.clone();
        return Some(messages::subscribe_script_hash(
            &script_hash_for_sub,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                match result {
                    Ok(status_hash) => {
                        log::info!("[ENGINE] {uri} subscribed to {script_hash}");
                        // Subscription latency counts toward response
                        // time but earns no score.
                        inner.score_up(&mut state, &uri, elapsed, 0);
                        let cached_hash = state
                            .address_cache
                            .get(&script_hash)
                            .map(|r| r.txid_status_hash.clone())
                            .unwrap_or_default();
                        state
                            .address_owner
                            .insert(script_hash.clone(), uri.clone());
                        if let Some(sub) = state
                            .server_states
                            .get_mut(&uri)
                            .and_then(|s| s.addresses.get_mut(&script_hash))
                        {
                            sub.subscribing = false;
                            sub.subscribed = true;
                            sub.status_hash = status_hash.clone();
                            sub.last_update = now_ms();
                            match &status_hash {
                                Some(hash) if *hash != cached_hash => {}
                                _ => {
                                    sub.synced = true;
                                    inner.flush_progress(&mut state);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::info!("[ENGINE] {uri} subscribe {script_hash} failed: {e}");
                        if let Some(sub) = state
                            .server_states
                            .get_mut(&uri)
                            .and_then(|s| s.addresses.get_mut(&script_hash))
                        {
                            sub.subscribing = false;
                        }
                        inner.score_down(&mut state, &uri, 10);
                    }
                }
            },
        ));
    }

    // Histories, same ownership rule as utxos.
    let wanted_history = state
        .server_states
        .get(uri)
        .and_then(|server| {
            server.addresses.iter().find_map(|(script_hash, sub)| {
                let hash = sub.status_hash.as_ref()?;
                let record = state.address_cache.get(script_hash)?;
                (*hash != record.txid_status_hash
                    && !sub.fetching_history
                    && state.owner_of(script_hash) == Some(uri))
                .then(|| (script_hash.clone(), hash.clone()))
            })
        });
    if let Some((script_hash, status_hash)) = wanted_history {
        if let Some(sub) = state
            .server_states
            .get_mut(uri)
            .and_then(|s| s.addresses.get_mut(&script_hash))
        {
            sub.fetching_history = true;
        }
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        let script_hash_for_fetch = script_hash.clone();
        return Some(messages::fetch_script_hash_history(
            &script_hash_for_fetch,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                if let Some(sub) = state
                    .server_states
                    .get_mut(&uri)
                    .and_then(|s| s.addresses.get_mut(&script_hash))
                {
                    sub.fetching_history = false;
                }
                match result {
                    Ok(history) => {
                        log::info!("[ENGINE] {uri} sent history for {script_hash}");
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        cache::handle_history_fetch(
                            &mut state,
                            &inner.callbacks,
                            &uri,
                            &script_hash,
                            &status_hash,
                            history,
                        );
                        inner.flush_progress(&mut state);
                    }
                    Err(e) => {
                        log::info!("[ENGINE] {uri} history for {script_hash} failed: {e}");
                        inner.score_down(&mut state, &uri, 10);
                    }
                }
            },
        ));
    }

    // Sigma queries, lowest priority. Failures resolve the waiters with
    // an empty value so callers never hang on a flaky server.
    if let Some(queries) = state.mint_metadata_query.take() {
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        return Some(messages::fetch_mint_metadata(
            queries,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                let rows = match result {
                    Ok(rows) => {
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        rows
                    }
                    Err(e) => {
                        log::info!("[SIGMA] {uri} mint metadata failed: {e}");
                        inner.score_down(&mut state, &uri, 10);
                        Vec::new()
                    }
                };
                state.mint_metadata_query.resolve(rows);
            },
        ));
    }

    if let Some((denom, group_id)) = state.anonymity_set_query.take() {
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        return Some(messages::fetch_anonymity_set(
            denom,
            group_id,
            move |result, elapsed| {
                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state.lock().unwrap();
                let set = match result {
                    Ok(set) => {
                        inner.score_up(&mut state, &uri, elapsed, 1);
                        set
                    }
                    Err(e) => {
                        log::info!("[SIGMA] {uri} anonymity set {denom}/{group_id} failed: {e}");
                        inner.score_down(&mut state, &uri, 10);
                        AnonymitySet::default()
                    }
                };
                state.anonymity_set_query.resolve(set);
            },
        ));
    }

    if state.used_serials_query.take().is_some() {
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        return Some(messages::fetch_used_coin_serials(move |result, elapsed| {
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock().unwrap();
            let serials = match result {
                Ok(serials) => {
                    inner.score_up(&mut state, &uri, elapsed, 1);
                    serials
                }
                Err(e) => {
                    log::info!("[SIGMA] {uri} used serials failed: {e}");
                    inner.score_down(&mut state, &uri, 10);
                    Vec::new()
                }
            };
            state.used_serials_query.resolve(serials);
        }));
    }

    if state.coin_groups_query.take().is_some() {
        let weak = Arc::downgrade(inner);
        let uri = uri.to_string();
        return Some(messages::fetch_latest_coin_ids(move |result, elapsed| {
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock().unwrap();
            let groups: Vec<CoinGroup> = match result {
                Ok(groups) => {
                    inner.score_up(&mut state, &uri, elapsed, 1);
                    groups
                }
                Err(e) => {
                    log::info!("[SIGMA] {uri} latest coin ids failed: {e}");
                    inner.score_down(&mut state, &uri, 10);
                    Vec::new()
                }
            };
            state.coin_groups_query.resolve(groups);
        }));
    }

    None
}
