//! Wire-level encode/decode for the line-delimited JSON-RPC framing.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};

/// A server-initiated handshake rejection. The coordinator treats this
/// as a hard penalty rather than a transient failure.
#[derive(Debug, thiserror::Error)]
#[error("unsupported protocol version: {0}")]
pub struct BadVersionError(pub String);

/// One decoded inbound line.
#[derive(Debug)]
pub enum Incoming {
    /// Reply to a request we sent.
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    },
    /// `blockchain.headers.subscribe` push.
    HeightChanged { height: i64 },
    /// `blockchain.scripthash.subscribe` push.
    ScriptHashChanged {
        script_hash: String,
        status_hash: Option<String>,
    },
    /// A notification method we don't handle; logged and dropped.
    UnknownNotification { method: String },
}

pub fn request_json(id: u64, method: &str, params: &Value) -> Result<String> {
    let line = serde_json::to_string(&json!({
        "id": id,
        "method": method,
        "params": params,
    }))?;
    Ok(line)
}

pub fn parse_line(line: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| anyhow!("invalid json: {e}: {line:.128}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("expected json object: {line:.128}"))?;

    if let Some(id) = obj.get("id").filter(|id| !id.is_null()) {
        let id = id
            .as_u64()
            .ok_or_else(|| anyhow!("non-numeric response id: {id}"))?;
        return Ok(Incoming::Response {
            id,
            result: obj.get("result").cloned(),
            error: obj.get("error").filter(|e| !e.is_null()).cloned(),
        });
    }

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("message has neither id nor method: {line:.128}"))?;
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "blockchain.headers.subscribe" => {
            // Param shapes vary by protocol version: either a bare
            // header object or a one-element array wrapping it, with the
            // height under "height" or "block_height".
            let header = match &params {
                Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            let height = header
                .get("height")
                .or_else(|| header.get("block_height"))
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow!("headers notification missing height: {params}"))?;
            Ok(Incoming::HeightChanged { height })
        }
        "blockchain.scripthash.subscribe" => {
            let items = params
                .as_array()
                .ok_or_else(|| anyhow!("scripthash notification params not an array"))?;
            let script_hash = items
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("scripthash notification missing hash"))?
                .to_string();
            let status_hash = items.get(1).and_then(Value::as_str).map(str::to_string);
            Ok(Incoming::ScriptHashChanged {
                script_hash,
                status_hash,
            })
        }
        other => Ok(Incoming::UnknownNotification {
            method: other.to_string(),
        }),
    }
}

/// Extracts the negotiated protocol version from a `server.version`
/// reply: either `["software", "1.4"]` or a bare `"1.4"` string.
pub fn parse_version_reply(result: &Value, supported: &[&str]) -> Result<String> {
    let version = match result {
        Value::Array(items) => items.get(1).and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
    .ok_or_else(|| anyhow!("unparseable server.version reply: {result}"))?;

    if !supported.contains(&version) {
        bail!(BadVersionError(version.to_string()));
    }
    Ok(version.to_string())
}
