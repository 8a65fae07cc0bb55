//! Parsed-transaction model.
//!
//! Binary transaction (de)serialization belongs to the transaction-builder
//! collaborator; the engine only needs outpoint references and
//! script-hash-annotated outputs for cache indexing.

use anyhow::Result;

/// Reference to the output a transaction input consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: String,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev: OutPoint,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    /// Value in the smallest on-chain unit.
    pub value: u64,
    /// Script hash of the receiving script, used as the cache key.
    pub script_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTx {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// Decodes raw transaction hex into the parsed form the caches index by.
pub trait TxDecoder: Send + Sync {
    fn decode(&self, raw_hex: &str) -> Result<ParsedTx>;
}
