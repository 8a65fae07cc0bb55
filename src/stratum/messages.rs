//! Typed task constructors for every stratum method the engine uses.
//!
//! Each constructor wraps the raw JSON-RPC round trip in a [`Task`]
//! whose continuation decodes the reply and hands the caller a typed
//! result plus the round-trip time (zero on failure).

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use super::task::{Task, TaskError, TaskOutcome};
use crate::sigma::types::{AnonymitySet, CoinGroup, MintMetadata, MintQuery};

// =====================================================================
// Reply row types
// =====================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRow {
    pub tx_hash: String,
    pub height: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UtxoRow {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub value: u64,
    pub height: i64,
}

// =====================================================================
// Decode plumbing
// =====================================================================

fn decode<T, F>(outcome: TaskOutcome, parse: F) -> (Result<T, TaskError>, Duration)
where
    F: FnOnce(Value) -> Result<T>,
{
    match outcome {
        TaskOutcome::Done { result, elapsed } => match parse(result) {
            Ok(value) => (Ok(value), elapsed),
            Err(e) => (Err(TaskError::BadReply(e.to_string())), elapsed),
        },
        TaskOutcome::Failed(e) => (Err(e), Duration::ZERO),
    }
}

fn typed_task<T, F>(
    method: &str,
    params: Value,
    parse: impl FnOnce(Value) -> Result<T> + Send + 'static,
    on_done: F,
) -> Task
where
    T: 'static,
    F: FnOnce(Result<T, TaskError>, Duration) + Send + 'static,
{
    Task::new(method, params, move |outcome| {
        let (result, elapsed) = decode(outcome, parse);
        on_done(result, elapsed);
    })
}

// =====================================================================
// Chain queries
// =====================================================================

pub fn fetch_estimate_fee<F>(block_target: u32, on_done: F) -> Task
where
    F: FnOnce(Result<f64, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.estimatefee",
        json!([block_target]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

pub fn subscribe_height<F>(on_done: F) -> Task
where
    F: FnOnce(Result<i64, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.headers.subscribe",
        json!([]),
        |v| {
            v.get("height")
                .or_else(|| v.get("block_height"))
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("subscribe reply missing height: {v}"))
        },
        on_done,
    )
}

/// Block header fetch. Protocol 1.4 returns raw header hex
/// (`blockchain.block.header`); older servers return a decoded object
/// (`blockchain.block.get_header`). Either way we only keep the
/// timestamp.
pub fn fetch_header<F>(height: i64, protocol_version: &str, on_done: F) -> Task
where
    F: FnOnce(Result<u64, TaskError>, Duration) + Send + 'static,
{
    if protocol_version >= "1.4" {
        typed_task(
            "blockchain.block.header",
            json!([height]),
            |v| {
                let raw = v
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("header reply not a hex string"))?;
                header_timestamp(raw)
            },
            on_done,
        )
    } else {
        typed_task(
            "blockchain.block.get_header",
            json!([height]),
            |v| {
                v.get("timestamp")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow::anyhow!("header reply missing timestamp: {v}"))
            },
            on_done,
        )
    }
}

/// Reads the little-endian timestamp out of an 80-byte serialized
/// block header (bytes 68..72).
pub fn header_timestamp(raw_hex: &str) -> Result<u64> {
    let bytes = hex::decode(raw_hex)?;
    let slice: [u8; 4] = bytes
        .get(68..72)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("header too short: {} bytes", bytes.len()))?;
    Ok(u32::from_le_bytes(slice) as u64)
}

// =====================================================================
// Transactions
// =====================================================================

pub fn fetch_transaction<F>(txid: &str, on_done: F) -> Task
where
    F: FnOnce(Result<String, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.transaction.get",
        json!([txid]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTx {
    pub hex: String,
    #[serde(default = "default_height")]
    pub height: i64,
    #[serde(default)]
    pub confirmations: i64,
}

fn default_height() -> i64 {
    -1
}

pub fn fetch_transaction_verbose<F>(txid: &str, on_done: F) -> Task
where
    F: FnOnce(Result<VerboseTx, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.transaction.get",
        json!([txid, true]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

pub fn broadcast_tx<F>(raw_hex: &str, on_done: F) -> Task
where
    F: FnOnce(Result<String, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.transaction.broadcast",
        json!([raw_hex]),
        |v| {
            let txid: String = serde_json::from_value(v)?;
            // Some servers report failure as a success-shaped reply
            // carrying an error message instead of a 64-char txid.
            if txid.len() != 64 || hex::decode(&txid).is_err() {
                anyhow::bail!("broadcast rejected: {txid}");
            }
            Ok(txid)
        },
        on_done,
    )
}

// =====================================================================
// Script hashes
// =====================================================================

pub fn subscribe_script_hash<F>(script_hash: &str, on_done: F) -> Task
where
    F: FnOnce(Result<Option<String>, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.scripthash.subscribe",
        json!([script_hash]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

pub fn fetch_script_hash_history<F>(script_hash: &str, on_done: F) -> Task
where
    F: FnOnce(Result<Vec<HistoryRow>, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.scripthash.get_history",
        json!([script_hash]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

pub fn fetch_script_hash_utxos<F>(script_hash: &str, on_done: F) -> Task
where
    F: FnOnce(Result<Vec<UtxoRow>, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "blockchain.scripthash.listunspent",
        json!([script_hash]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

// =====================================================================
// Sigma queries
// =====================================================================

/// Metadata rows come back aligned with the query order, each shaped
/// `{"<height>": groupId}`; zip them back onto the queried pubcoins.
pub fn fetch_mint_metadata<F>(mints: Vec<MintQuery>, on_done: F) -> Task
where
    F: FnOnce(Result<Vec<MintMetadata>, TaskError>, Duration) + Send + 'static,
{
    let params = json!([{ "mints": &mints }]);
    typed_task(
        "sigma.getmintmetadata",
        params,
        move |v| {
            let rows = v.get("mints").cloned().unwrap_or(v);
            let rows = rows
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("mint metadata reply not an array"))?;
            let mut out = Vec::with_capacity(mints.len());
            for (query, row) in mints.iter().zip(rows) {
                let (height, group_id) = row
                    .as_object()
                    .and_then(|obj| obj.iter().next())
                    .map(|(height, group_id)| {
                        (
                            height.parse::<i64>().unwrap_or(-1),
                            group_id.as_i64().unwrap_or(-1),
                        )
                    })
                    .unwrap_or((-1, -1));
                out.push(MintMetadata {
                    pubcoin: query.pubcoin.clone(),
                    group_id,
                    height,
                });
            }
            Ok(out)
        },
        on_done,
    )
}

pub fn fetch_anonymity_set<F>(denom: u64, group_id: i64, on_done: F) -> Task
where
    F: FnOnce(Result<AnonymitySet, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "sigma.getanonymityset",
        json!([denom.to_string(), group_id.to_string()]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}

pub fn fetch_used_coin_serials<F>(on_done: F) -> Task
where
    F: FnOnce(Result<Vec<String>, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "sigma.getusedcoinserials",
        json!([]),
        |v| {
            let rows = v.get("serials").cloned().unwrap_or(v);
            Ok(serde_json::from_value(rows)?)
        },
        on_done,
    )
}

pub fn fetch_latest_coin_ids<F>(on_done: F) -> Task
where
    F: FnOnce(Result<Vec<CoinGroup>, TaskError>, Duration) + Send + 'static,
{
    typed_task(
        "sigma.getlatestcoinids",
        json!([]),
        |v| Ok(serde_json::from_value(v)?),
        on_done,
    )
}
