//! The persisted coin file and the mutations applied to it.
//!
//! Every mutation rewrites the file in a single `set_text`, so a crash
//! can lose the latest change but never tear the file.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::types::{MintMetadata, PrivateCoin};
use crate::persistence::{load_or_default, save_json, TextStore};

pub const SIGMA_COIN_FILE: &str = "sigma_coins.json";
pub const RESTORE_FLAG_FILE: &str = "restore.json";

/// A mint only becomes spendable once it is this deep in the chain.
const MIN_MINT_DEPTH: i64 = 5;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RestoreFlag {
    restored: bool,
}

#[derive(Clone)]
pub struct CoinStore {
    store: Arc<dyn TextStore>,
}

impl CoinStore {
    pub fn new(store: Arc<dyn TextStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Vec<PrivateCoin> {
        load_or_default(self.store.as_ref(), SIGMA_COIN_FILE)
    }

    pub fn save(&self, coins: &[PrivateCoin]) -> Result<()> {
        save_json(self.store.as_ref(), SIGMA_COIN_FILE, &coins)
    }

    pub fn is_restored(&self) -> bool {
        load_or_default::<RestoreFlag>(self.store.as_ref(), RESTORE_FLAG_FILE).restored
    }

    pub fn mark_restored(&self) -> Result<()> {
        save_json(
            self.store.as_ref(),
            RESTORE_FLAG_FILE,
            &RestoreFlag { restored: true },
        )
    }

    /// Sum of spendable mints.
    pub fn minted_balance(&self) -> u64 {
        self.load()
            .iter()
            .filter(|c| c.group_id > 0 && !c.is_spend)
            .map(|c| c.value)
            .sum()
    }

    pub fn max_index(&self) -> u32 {
        self.load().iter().map(|c| c.index).max().unwrap_or(0)
    }

    /// Transactions that spent our coins; used to re-resolve spend
    /// history after a restore.
    pub fn spend_txids(&self) -> Vec<String> {
        self.load()
            .iter()
            .filter(|c| !c.spend_tx_id.is_empty())
            .map(|c| c.spend_tx_id.clone())
            .collect()
    }

    pub fn append(&self, new_coins: &[PrivateCoin]) -> Result<()> {
        let mut coins = self.load();
        coins.extend_from_slice(new_coins);
        self.save(&coins)
    }

    /// Marks the coins consumed by a broadcast spend, in one write.
    pub fn record_spend(&self, spent_indices: &[u32], txid: &str) -> Result<()> {
        let mut coins = self.load();
        for coin in &mut coins {
            if spent_indices.contains(&coin.index) {
                coin.is_spend = true;
                coin.spend_tx_id = txid.to_string();
            }
        }
        self.save(&coins)
    }

    /// Folds fresh chain metadata into the coin file. A coin joins its
    /// group only once it is at least [`MIN_MINT_DEPTH`] blocks deep;
    /// shallower coins stay parked at -1.
    pub fn apply_metadata(&self, rows: &[MintMetadata], tip_height: i64) -> Result<()> {
        let mut coins = self.load();
        for coin in &mut coins {
            let Some(row) = rows.iter().find(|r| r.pubcoin == coin.commitment) else {
                continue;
            };
            coin.group_id = if row.height > 0 && tip_height - row.height >= MIN_MINT_DEPTH {
                row.group_id
            } else {
                -1
            };
        }
        self.save(&coins)
    }

    /// Query rows for `sigma.getmintmetadata` covering every coin with
    /// a commitment.
    pub fn metadata_queries(&self) -> Vec<super::types::MintQuery> {
        self.load()
            .iter()
            .filter(|c| !c.commitment.is_empty())
            .map(|c| super::types::MintQuery {
                denom: c.value,
                pubcoin: c.commitment.clone(),
            })
            .collect()
    }
}
