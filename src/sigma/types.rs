use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Satoshis per whole coin.
pub const SIGMA_COIN: u64 = 100_000_000;

/// Mintable denominations in satoshis, ascending: 0.05, 0.1, 0.5, 1,
/// 10, 25 and 100 coins.
pub const DENOMINATIONS: &[u64] = &[
    5_000_000,
    10_000_000,
    50_000_000,
    100_000_000,
    1_000_000_000,
    2_500_000_000,
    10_000_000_000,
];

/// Flat fee reserved when minting, equal to the smallest denomination.
pub const MINT_FEE_QUANTUM: u64 = 5_000_000;

/// A mint we control, persisted to the coin file.
///
/// `group_id` semantics: 0 = freshly created, never confirmed on chain;
/// -1 = seen on chain but not yet deep enough to spend; positive = the
/// anonymity set group it can be spent from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateCoin {
    pub value: u64,
    pub index: u32,
    pub commitment: String,
    #[serde(default)]
    pub serial_number: String,
    pub group_id: i64,
    pub is_spend: bool,
    #[serde(default)]
    pub spend_tx_id: String,
}

/// A coin prepared for a spend proof: the mint plus the anonymity set
/// it hides in.
#[derive(Debug, Clone)]
pub struct SpendCoin {
    pub value: u64,
    pub index: u32,
    pub group_id: i64,
    pub anonymity_set: Vec<String>,
    pub block_hash: String,
}

/// `sigma.getanonymityset` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnonymitySet {
    #[serde(rename = "blockHash", default)]
    pub block_hash: String,
    #[serde(rename = "serializedCoins", default)]
    pub serialized_coins: Vec<String>,
}

/// One row of `sigma.getlatestcoinids`: the highest live group id for a
/// denomination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinGroup {
    pub denom: u64,
    pub id: i64,
}

/// Query row for `sigma.getmintmetadata`.
#[derive(Debug, Clone, Serialize)]
pub struct MintQuery {
    pub denom: u64,
    pub pubcoin: String,
}

/// Reply row for `sigma.getmintmetadata`, keyed back to the coin by
/// `pubcoin`.
#[derive(Debug, Clone, Deserialize)]
pub struct MintMetadata {
    pub pubcoin: String,
    #[serde(rename = "groupId", default)]
    pub group_id: i64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Debug, Clone)]
pub struct DerivedCoin {
    pub commitment: String,
    pub serial_number: String,
}

/// Deterministic coin derivation from the wallet key. The sigma math
/// itself lives behind this seam.
pub trait CoinDeriver: Send + Sync {
    fn derive(&self, value: u64, index: u32) -> Result<DerivedCoin>;
}
