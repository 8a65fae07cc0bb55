//! Persistence adapters.
//!
//! Every cache is stored as an opaque JSON blob in a named-text store
//! supplied by the embedding application. Two stores are in play: a plain
//! one for the address/transaction/header/server caches and an encrypted
//! one for the private-coin list; encryption is the caller's concern.
//!
//! A malformed blob on load is never fatal: the affected cache resets to
//! empty and a warning is logged.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::types::{AddressRecord, HeaderInfo, TxHeight};
use crate::server_cache::ServerScore;

/// Blob-file names used by the engine.
pub const ADDRESS_CACHE_FILE: &str = "addresses.json";
pub const TX_CACHE_FILE: &str = "txs.json";
pub const HEADER_CACHE_FILE: &str = "headers.json";
pub const SERVER_CACHE_FILE: &str = "serverCache.json";

/// Scoped named-text storage, the only persistence interface the engine
/// consumes.
pub trait TextStore: Send + Sync {
    fn get_text(&self, name: &str) -> Result<String>;
    fn set_text(&self, name: &str, text: &str) -> Result<()>;
}

/// In-memory store, used by tests and as a null store.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TextStore for MemoryStore {
    fn get_text(&self, name: &str) -> Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {name}"))
    }

    fn set_text(&self, name: &str, text: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), text.to_string());
        Ok(())
    }
}

// =====================================================================
// Cache file formats
// =====================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AddressCacheFile {
    pub addresses: HashMap<String, AddressRecord>,
    pub heights: HashMap<String, TxHeight>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TxCacheFile {
    pub txs: HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HeaderCacheFile {
    pub height: i64,
    pub headers: HashMap<i64, HeaderInfo>,
}

/// The server cache is a flat url -> score map.
pub type ServerCacheFile = HashMap<String, ServerScore>;

/// Loads a JSON cache blob, falling back to the default value when the
/// blob is absent or corrupt.
pub fn load_or_default<T: DeserializeOwned + Default>(store: &dyn TextStore, name: &str) -> T {
    let text = match store.get_text(name) {
        Ok(text) => text,
        Err(_) => return T::default(),
    };
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("[STORE] resetting corrupt cache {name}: {e}");
            T::default()
        }
    }
}

/// Serializes and writes a JSON cache blob.
pub fn save_json<T: Serialize>(store: &dyn TextStore, name: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    store.set_text(name, &text)
}
