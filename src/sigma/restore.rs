//! Wallet restore: rediscovering our coins from chain-wide sigma data.
//!
//! The chain cannot tell us which commitments are ours, so we re-derive
//! coins at increasing indices and look each one up in the full set of
//! on-chain commitments. A run of consecutive misses ends the scan,
//! bounding it past the wallet's highest used index.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use super::types::{CoinDeriver, PrivateCoin, SIGMA_COIN};

/// Everything fetched from the chain that restore needs.
#[derive(Debug, Default)]
pub struct RestoreContext {
    pub used_serials: HashSet<String>,
    pub groups: Vec<RestoreGroup>,
}

/// All commitments ever minted at one denomination, across every group.
#[derive(Debug)]
pub struct RestoreGroup {
    pub denom: u64,
    pub commitments: Vec<String>,
}

/// Rebuilds the coin file contents from chain data.
///
/// Derivation always uses the whole-coin value; the denomination comes
/// from whichever group the commitment is found in. Recovered coins get
/// `group_id` -1 so the next metadata pass assigns the real group.
pub fn reconstruct_coins(
    ctx: &RestoreContext,
    deriver: &dyn CoinDeriver,
    miss_limit: u32,
) -> Result<Vec<PrivateCoin>> {
    let mut commitment_denom: HashMap<&str, u64> = HashMap::new();
    for group in &ctx.groups {
        for commitment in &group.commitments {
            commitment_denom.entry(commitment).or_insert(group.denom);
        }
    }
    let total = commitment_denom.len() as u32;

    let mut coins = Vec::new();
    let mut misses = 0;
    let mut index = 0;
    while misses < miss_limit && index <= total {
        misses += 1;
        let derived = deriver.derive(SIGMA_COIN, index)?;
        if let Some(&denom) = commitment_denom.get(derived.commitment.as_str()) {
            let is_spend = ctx.used_serials.contains(&derived.serial_number);
            coins.push(PrivateCoin {
                value: denom,
                index,
                commitment: derived.commitment,
                serial_number: derived.serial_number,
                group_id: -1,
                is_spend,
                spend_tx_id: String::new(),
            });
            misses = 0;
        }
        index += 1;
    }
    log::info!(
        "[SIGMA] restore scanned {index} indices, recovered {} coins",
        coins.len()
    );
    Ok(coins)
}
