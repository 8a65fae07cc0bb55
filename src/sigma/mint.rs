//! Mint planning: turning a public balance into a set of denominated
//! private coins.

use anyhow::Result;

use super::types::{CoinDeriver, PrivateCoin, DENOMINATIONS, MINT_FEE_QUANTUM};

/// Greedy decomposition of `value` into denominated coins, deriving
/// each at the next free index after `current_max_index`.
pub fn mint_commitments_for_value(
    value: u64,
    deriver: &dyn CoinDeriver,
    current_max_index: u32,
) -> Result<Vec<PrivateCoin>> {
    let mut value = value;
    let mut index = current_max_index;
    let mut result = Vec::new();
    for &denom in DENOMINATIONS.iter().rev() {
        while value >= denom {
            value -= denom;
            index += 1;
            let derived = deriver.derive(denom, index)?;
            result.push(PrivateCoin {
                value: denom,
                index,
                commitment: derived.commitment,
                serial_number: derived.serial_number,
                group_id: 0,
                is_spend: false,
                spend_tx_id: String::new(),
            });
        }
    }
    Ok(result)
}

/// How much of `balance` to mint. Returns `None` when the balance
/// cannot cover a mint plus its fee. When the balance divides evenly
/// into denominations one fee quantum is held back, otherwise the
/// remainder pays the fee.
pub fn mintable_amount(balance: u64) -> Option<u64> {
    if balance <= MINT_FEE_QUANTUM {
        return None;
    }
    if balance % MINT_FEE_QUANTUM == 0 {
        Some(balance - MINT_FEE_QUANTUM)
    } else {
        Some(balance)
    }
}

/// Retry step when a mint attempt comes back short on fees: shave one
/// quantum off the amount, or give up below the minimum.
pub fn shrink_amount(amount: u64) -> Option<u64> {
    if amount > MINT_FEE_QUANTUM {
        Some(amount - MINT_FEE_QUANTUM)
    } else {
        None
    }
}
