//! Cache mutation handlers: every piece of data a server sends lands
//! here, updates the caches, and re-derives whatever depends on it.

use std::collections::HashSet;

use crate::stratum::messages::{HistoryRow, UtxoRow};
use crate::tx::TxDecoder;

use super::state::EngineState;
use super::types::{now_ms, AddressInfo, EngineCallbacks, HeaderInfo, TxHeight, Utxo};

/// A header arrived. Notifies every known transaction in that block.
pub fn handle_header_fetch(
    state: &mut EngineState,
    callbacks: &EngineCallbacks,
    height: i64,
    timestamp: u64,
) {
    if !state.header_cache.contains_key(&height) {
        state.header_cache.insert(height, HeaderInfo { timestamp });
        let affected: Vec<String> = state
            .tx_heights
            .iter()
            .filter(|(_, h)| h.height == height)
            .map(|(txid, _)| txid.clone())
            .collect();
        for txid in affected {
            if state.parsed_txs.contains_key(&txid) {
                (callbacks.on_tx_fetched)(&txid);
            }
        }
        state.header_cache_dirty = true;
    }
    state.missing_headers.remove(&height);
}

/// Raw transaction data arrived.
pub fn handle_tx_fetch(
    state: &mut EngineState,
    callbacks: &EngineCallbacks,
    decoder: &dyn TxDecoder,
    txid: &str,
    raw_tx: &str,
) {
    let parsed = match decoder.decode(raw_tx) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("[ENGINE] undecodable transaction {txid}: {e:#}");
            state.missing_txs.remove(txid);
            return;
        }
    };
    state.tx_cache.insert(txid.to_string(), raw_tx.to_string());
    state.parsed_txs.insert(txid.to_string(), parsed);
    state.missing_txs.remove(txid);

    for script_hash in find_affected_addresses_for_inputs(state, txid) {
        refresh_address_info(state, callbacks, &script_hash);
    }
    state.tx_cache_dirty = true;
    (callbacks.on_tx_fetched)(txid);

    // Funding an address can complete transactions that were waiting on
    // this one as an input; re-announce those too.
    for script_hash in find_affected_addresses_for_outputs(state, txid) {
        refresh_address_info(state, callbacks, &script_hash);
        let Some(info) = state.address_infos.get(&script_hash) else {
            continue;
        };
        let children: Vec<String> = info
            .txids
            .iter()
            .filter(|child| {
                state.parsed_txs.get(*child).is_some_and(|tx| {
                    tx.inputs.iter().any(|input| input.prev.txid == txid)
                })
            })
            .cloned()
            .collect();
        for child in children {
            (callbacks.on_tx_fetched)(&child);
        }
    }
}

/// A server mentioned a txid at some height.
pub fn handle_txid_fetch(
    state: &mut EngineState,
    callbacks: &EngineCallbacks,
    txid: &str,
    height: i64,
) {
    let height = if height == 0 { -1 } else { height };
    match state.tx_heights.get_mut(txid) {
        Some(entry) => {
            let prev_height = entry.height;
            entry.height = height;
            if state.parsed_txs.contains_key(txid) && prev_height <= 0 && height != -1 {
                (callbacks.on_tx_fetched)(txid);
            }
        }
        None => {
            state.tx_heights.insert(
                txid.to_string(),
                TxHeight {
                    height,
                    first_seen: now_ms(),
                },
            );
        }
    }

    if height > 0 && !state.header_cache.contains_key(&height) {
        state.missing_headers.insert(height);
    }
    handle_new_txid(state, txid, false);
}

/// A potentially new txid; queue a fetch unless we already hold it.
pub fn handle_new_txid(state: &mut EngineState, txid: &str, verbose: bool) {
    if verbose {
        state.missing_txs_verbose.insert(txid.to_string());
        return;
    }
    if !state.tx_cache.contains_key(txid) {
        state.missing_txs.insert(txid.to_string());
    }
}

/// A utxo listing arrived for an address.
pub fn handle_utxo_fetch(
    state: &mut EngineState,
    callbacks: &EngineCallbacks,
    script_hash: &str,
    status_hash: &str,
    utxos: Vec<UtxoRow>,
) {
    let mut utxo_list = Vec::with_capacity(utxos.len());
    for row in utxos {
        utxo_list.push(Utxo {
            txid: row.tx_hash.clone(),
            index: row.tx_pos,
            value: row.value,
        });
        handle_txid_fetch(state, callbacks, &row.tx_hash, row.height);
    }
    if let Some(record) = state.address_cache.get_mut(script_hash) {
        record.utxos = utxo_list;
        record.utxo_status_hash = status_hash.to_string();
    }
    refresh_address_info(state, callbacks, script_hash);
    state.address_cache_dirty = true;
}

/// A history listing arrived for an address on `uri`.
pub fn handle_history_fetch(
    state: &mut EngineState,
    callbacks: &EngineCallbacks,
    uri: &str,
    script_hash: &str,
    status_hash: &str,
    history: Vec<HistoryRow>,
) {
    let mut txid_list = Vec::with_capacity(history.len());
    for row in history {
        txid_list.push(row.tx_hash.clone());
        handle_txid_fetch(state, callbacks, &row.tx_hash, row.height);
    }

    if let Some(sub) = state
        .server_states
        .get_mut(uri)
        .and_then(|s| s.addresses.get_mut(script_hash))
    {
        sub.synced = true;
    }
    if let Some(record) = state.address_cache.get_mut(script_hash) {
        record.txids = txid_list;
        record.txid_status_hash = status_hash.to_string();
    }
    refresh_address_info(state, callbacks, script_hash);
    state.address_cache_dirty = true;
}

/// Monotone chain tip.
pub fn update_height(state: &mut EngineState, callbacks: &EngineCallbacks, height: i64) {
    if state.tip_height < height {
        log::info!("[ENGINE] chain tip {height}");
        state.tip_height = height;
        state.header_cache_dirty = true;
        (callbacks.on_height_updated)(height);
    }
}

/// Recomputes the derived view of one address from the caches, firing
/// balance/used callbacks on change.
pub fn refresh_address_info(
    state: &mut EngineState,
    callbacks: &EngineCallbacks,
    script_hash: &str,
) {
    let Some(record) = state.address_cache.get(script_hash) else {
        return;
    };

    let used = state.used_addresses.contains(script_hash)
        || !record.txids.is_empty()
        || !record.utxos.is_empty();

    // Only keep entries whose transactions we actually hold.
    let txids: Vec<String> = record
        .txids
        .iter()
        .filter(|txid| state.tx_cache.contains_key(*txid))
        .cloned()
        .collect();
    let mut utxos: Vec<Utxo> = record
        .utxos
        .iter()
        .filter(|utxo| state.tx_cache.contains_key(&utxo.txid))
        .cloned()
        .collect();

    // Unconfirmed transactions do not show up in the server's utxo
    // list, so fold our own mempool outputs in and drop outpoints our
    // mempool spends consume.
    let pending_txids: Vec<String> = txids
        .iter()
        .filter(|txid| {
            state.tx_heights.get(*txid).is_none_or(|h| h.height <= 0)
                && !utxos.iter().any(|u| &u.txid == *txid)
        })
        .cloned()
        .collect();

    for txid in &pending_txids {
        let Some(tx) = state.parsed_txs.get(txid) else {
            continue;
        };
        for (i, output) in tx.outputs.iter().enumerate() {
            if output.script_hash == script_hash {
                utxos.push(Utxo {
                    txid: txid.clone(),
                    index: i as u32,
                    value: output.value,
                });
            }
        }
    }

    let mut spends: HashSet<(String, u32)> = HashSet::new();
    for txid in &pending_txids {
        let Some(tx) = state.parsed_txs.get(txid) else {
            continue;
        };
        for input in &tx.inputs {
            spends.insert((input.prev.txid.clone(), input.prev.index));
        }
    }
    utxos.retain(|u| !spends.contains(&(u.txid.clone(), u.index)));

    let balance: u64 = utxos.iter().map(|u| u.value).sum();
    let (prev_balance, prev_used) = state
        .address_infos
        .get(script_hash)
        .map(|info| (info.balance, info.used))
        .unwrap_or((0, false));

    state.address_infos.insert(
        script_hash.to_string(),
        AddressInfo {
            txids,
            utxos,
            used,
            balance,
            display_address: record.display_address.clone(),
            path: record.path.clone(),
        },
    );

    if prev_balance != balance {
        (callbacks.on_balance_changed)();
    }
    if prev_used != used {
        (callbacks.on_address_used)();
    }
}

pub fn find_affected_addresses_for_inputs(state: &EngineState, txid: &str) -> Vec<String> {
    let Some(tx) = state.parsed_txs.get(txid) else {
        return Vec::new();
    };
    tx.inputs
        .iter()
        .filter_map(|input| {
            let prev_tx = state.parsed_txs.get(&input.prev.txid)?;
            let prev_out = prev_tx.outputs.get(input.prev.index as usize)?;
            Some(prev_out.script_hash.clone())
        })
        .collect()
}

pub fn find_affected_addresses_for_outputs(state: &EngineState, txid: &str) -> Vec<String> {
    let Some(tx) = state.parsed_txs.get(txid) else {
        return Vec::new();
    };
    tx.outputs
        .iter()
        .filter(|output| state.address_cache.contains_key(&output.script_hash))
        .map(|output| output.script_hash.clone())
        .collect()
}

pub fn find_affected_addresses(state: &EngineState, txid: &str) -> Vec<String> {
    let mut all = find_affected_addresses_for_inputs(state, txid);
    all.extend(find_affected_addresses_for_outputs(state, txid));
    all
}

/// Recomputes the sync progress ratio. Returns `Some(ratio)` when the
/// change is big enough (or sync just finished) that the caches should
/// be flushed before reporting it.
pub fn update_progress(state: &mut EngineState, throttle: f64) -> Option<f64> {
    if state.progress_ratio == 1.0 {
        return None;
    }
    let fetched_txs = state.tx_cache.len();
    let missing_txs = state.missing_txs.len();
    let total_txs = (fetched_txs + missing_txs).saturating_sub(state.tx_cache_init_size);

    let total_addresses = state.address_cache.len();
    let synced_addresses = state
        .address_cache
        .keys()
        .filter(|script_hash| {
            state.server_states.values().any(|server| {
                server
                    .addresses
                    .get(*script_hash)
                    .is_some_and(|sub| sub.synced)
            })
        })
        .count();
    let missing_addresses = total_addresses - synced_addresses;

    let all_tasks = total_addresses + total_txs;
    if all_tasks == 0 {
        return None;
    }
    let missing_tasks = missing_txs + missing_addresses;
    let ratio = (all_tasks - missing_tasks) as f64 / all_tasks as f64;

    if ratio != state.progress_ratio && ((ratio - state.progress_ratio).abs() > throttle || ratio == 1.0)
    {
        state.progress_ratio = ratio;
        return Some(ratio);
    }
    None
}
