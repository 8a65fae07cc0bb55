//! Coin selection for sigma spends.
//!
//! Minimizes the number of coins touched by a spend: the coins consumed
//! plus the mints needed to re-mint the change. A 0/1 knapsack over
//! multiples of the smallest denomination finds the cheapest reachable
//! total at or above the requested amount.

use anyhow::anyhow;

use super::types::{PrivateCoin, DENOMINATIONS};
use crate::error::EngineError;

const UNREACHABLE: u32 = 1_000_000_000;

/// Coins eligible for spending: confirmed into a group and not yet
/// spent.
pub fn approved_mints(coins: &[PrivateCoin]) -> Vec<PrivateCoin> {
    coins
        .iter()
        .filter(|c| c.group_id > 0 && !c.is_spend)
        .cloned()
        .collect()
}

/// How many mints a greedy decomposition of `value` takes.
pub fn required_mint_count(value: u64) -> u32 {
    let mut value = value;
    let mut result = 0;
    for &denom in DENOMINATIONS.iter().rev() {
        while value >= denom {
            value -= denom;
            result += 1;
        }
    }
    result
}

/// Picks the coins to consume for a spend of `spend_value` satoshis.
///
/// Returns the chosen coins, or [`EngineError::InsufficientFunds`] when
/// no combination reaches the amount.
pub fn select_mints_to_spend(
    mut coins: Vec<PrivateCoin>,
    spend_value: u64,
) -> Result<Vec<PrivateCoin>, EngineError> {
    let min_denom = DENOMINATIONS[0];
    let max_denom = *DENOMINATIONS.last().unwrap_or(&min_denom);
    let required = (spend_value.div_ceil(min_denom)) as usize;
    let max_check = required + (max_denom / min_denom) as usize;

    // Largest first; ties broken toward younger coins.
    coins.sort_by(|a, b| b.value.cmp(&a.value).then(b.index.cmp(&a.index)));

    let units = |coin: &PrivateCoin| (coin.value / min_denom) as usize;

    let mut prev_row = vec![UNREACHABLE; max_check + 1];
    let mut next_row = vec![UNREACHABLE; max_check + 1];
    let mut coin_for_total: Vec<Option<usize>> = vec![None; max_check + 1];
    prev_row[0] = 0;
    next_row[0] = 0;

    // Seed with the smallest coin, then fold in the rest largest-first.
    if let Some((last, rest)) = coins.split_last() {
        let u = units(last);
        if u <= max_check {
            next_row[u] = 1;
            coin_for_total[u] = Some(coins.len() - 1);
        }
        for (i, coin) in rest.iter().enumerate().rev() {
            std::mem::swap(&mut prev_row, &mut next_row);
            let u = units(coin);
            for j in 1..=max_check {
                next_row[j] = prev_row[j];
                if j >= u && next_row[j] > prev_row[j - u].saturating_add(1) {
                    next_row[j] = prev_row[j - u] + 1;
                    coin_for_total[j] = Some(i);
                }
            }
        }
    }

    // Total cost of overpaying to `j` units is the coins consumed plus
    // the mints needed to re-mint the change.
    let mut best_total = max_check;
    let mut best_cost = UNREACHABLE;
    for j in (required..=max_check).rev() {
        if next_row[j] == UNREACHABLE {
            continue;
        }
        let change = (j - required) as u64 * min_denom;
        let cost = next_row[j] + required_mint_count(change);
        if cost < best_cost {
            best_total = j;
            best_cost = cost;
        }
    }
    if best_cost == UNREACHABLE {
        return Err(EngineError::InsufficientFunds);
    }

    let mut selected = Vec::new();
    let mut remaining = best_total;
    while remaining > 0 {
        let idx = coin_for_total[remaining].ok_or_else(|| {
            EngineError::Other(anyhow!("coin selection trace broken at {remaining} units"))
        })?;
        let coin = coins[idx].clone();
        let u = units(&coin);
        if u == 0 || u > remaining {
            return Err(EngineError::Other(anyhow!(
                "coin selection trace invalid at {remaining} units"
            )));
        }
        remaining -= u;
        selected.push(coin);
    }
    Ok(selected)
}
