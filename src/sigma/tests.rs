#![cfg(test)]

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use super::mint;
use super::restore::{reconstruct_coins, RestoreContext, RestoreGroup};
use super::select::{approved_mints, required_mint_count, select_mints_to_spend};
use super::store::CoinStore;
use super::types::{
    CoinDeriver, DerivedCoin, MintMetadata, PrivateCoin, DENOMINATIONS, SIGMA_COIN,
};
use crate::error::EngineError;
use crate::persistence::MemoryStore;

fn coin(value: u64, index: u32) -> PrivateCoin {
    PrivateCoin {
        value,
        index,
        commitment: format!("pub{index}"),
        serial_number: format!("serial{index}"),
        group_id: 1,
        is_spend: false,
        spend_tx_id: String::new(),
    }
}

// =====================================================================
// Selection
// =====================================================================

#[test]
fn required_mint_count_is_greedy() {
    assert_eq!(required_mint_count(0), 0);
    assert_eq!(required_mint_count(5_000_000), 1);
    // 1.75 coins = 1 + 0.5 + 0.1*2 + 0.05
    assert_eq!(required_mint_count(175_000_000), 5);
    assert_eq!(required_mint_count(10_000_000_000), 1);
}

#[test]
fn selection_prefers_fewer_total_coins_over_smaller_overpay() {
    // Spending 7.5 coins: two 5-coin mints overpay by 2.5 (3 change
    // mints, 5 coins total) and beat the single 25-coin mint (1 + 9
    // change mints).
    let coins = vec![
        coin(500_000_000, 0),
        coin(500_000_000, 1),
        coin(2_500_000_000, 2),
    ];
    let picked = select_mints_to_spend(coins, 750_000_000).unwrap();
    let mut values: Vec<u64> = picked.iter().map(|c| c.value).collect();
    values.sort_unstable();
    assert_eq!(values, vec![500_000_000, 500_000_000]);
}

#[test]
fn selection_exact_match_uses_one_coin() {
    let coins = vec![coin(100_000_000, 0), coin(50_000_000, 1)];
    let picked = select_mints_to_spend(coins, 100_000_000).unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].value, 100_000_000);
}

#[test]
fn selection_fails_when_coins_cannot_cover() {
    let coins = vec![coin(5_000_000, 0)];
    let err = select_mints_to_spend(coins, 50_000_000).unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds));

    let err = select_mints_to_spend(Vec::new(), 1).unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds));
}

#[test]
fn approved_mints_excludes_unconfirmed_and_spent() {
    let mut fresh = coin(5_000_000, 0);
    fresh.group_id = 0;
    let mut parked = coin(5_000_000, 1);
    parked.group_id = -1;
    let mut spent = coin(5_000_000, 2);
    spent.is_spend = true;
    let good = coin(5_000_000, 3);

    let approved = approved_mints(&[fresh, parked, spent, good]);
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].index, 3);
}

// =====================================================================
// Minting
// =====================================================================

struct FakeDeriver;

impl CoinDeriver for FakeDeriver {
    fn derive(&self, value: u64, index: u32) -> Result<DerivedCoin> {
        Ok(DerivedCoin {
            commitment: format!("pub-{value}-{index}"),
            serial_number: format!("ser-{index}"),
        })
    }
}

#[test]
fn mint_decomposition_is_greedy_and_indexed() {
    // 25.15 coins = 25 + 0.1 + 0.05
    let coins = mint::mint_commitments_for_value(2_515_000_000, &FakeDeriver, 7).unwrap();
    let values: Vec<u64> = coins.iter().map(|c| c.value).collect();
    assert_eq!(values, vec![2_500_000_000, 10_000_000, 5_000_000]);
    let indices: Vec<u32> = coins.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![8, 9, 10]);
    assert!(coins.iter().all(|c| c.group_id == 0 && !c.is_spend));
}

#[test]
fn mintable_amount_holds_back_fee_when_exact() {
    assert_eq!(mint::mintable_amount(5_000_000), None);
    assert_eq!(mint::mintable_amount(100_000_000), Some(95_000_000));
    assert_eq!(mint::mintable_amount(101_000_000), Some(101_000_000));
}

#[test]
fn shrink_amount_bottoms_out() {
    assert_eq!(mint::shrink_amount(100_000_000), Some(95_000_000));
    assert_eq!(mint::shrink_amount(5_000_000), None);
}

// =====================================================================
// Coin file
// =====================================================================

fn store() -> CoinStore {
    CoinStore::new(Arc::new(MemoryStore::default()))
}

#[test]
fn record_spend_marks_coins_in_one_write() {
    let store = store();
    store.append(&[coin(5_000_000, 0), coin(10_000_000, 1)]).unwrap();
    store.record_spend(&[1], "aa11").unwrap();

    let coins = store.load();
    assert!(!coins[0].is_spend);
    assert!(coins[1].is_spend);
    assert_eq!(coins[1].spend_tx_id, "aa11");
    assert_eq!(store.minted_balance(), 5_000_000);
    assert_eq!(store.spend_txids(), vec!["aa11".to_string()]);
}

#[test]
fn metadata_assigns_group_only_at_depth() {
    let store = store();
    store.append(&[coin(5_000_000, 0), coin(5_000_000, 1)]).unwrap();
    let rows = vec![
        MintMetadata {
            pubcoin: "pub0".into(),
            group_id: 3,
            height: 95,
        },
        MintMetadata {
            pubcoin: "pub1".into(),
            group_id: 3,
            height: 98,
        },
    ];
    store.apply_metadata(&rows, 100).unwrap();

    let coins = store.load();
    assert_eq!(coins[0].group_id, 3); // 5 deep
    assert_eq!(coins[1].group_id, -1); // only 2 deep
}

#[test]
fn restore_flag_round_trip() {
    let store = store();
    assert!(!store.is_restored());
    store.mark_restored().unwrap();
    assert!(store.is_restored());
}

// =====================================================================
// Restore
// =====================================================================

/// Derives commitments the same way the fake chain below mints them.
struct ScriptedDeriver;

impl CoinDeriver for ScriptedDeriver {
    fn derive(&self, value: u64, index: u32) -> Result<DerivedCoin> {
        assert_eq!(value, SIGMA_COIN);
        Ok(DerivedCoin {
            commitment: format!("c{index}"),
            serial_number: format!("s{index}"),
        })
    }
}

#[test]
fn restore_recovers_owned_coins_and_spent_flags() {
    let ctx = RestoreContext {
        used_serials: HashSet::from(["s1".to_string()]),
        groups: vec![
            RestoreGroup {
                denom: DENOMINATIONS[0],
                commitments: vec!["c0".into(), "stranger".into()],
            },
            RestoreGroup {
                denom: DENOMINATIONS[3],
                commitments: vec!["c1".into(), "c4".into()],
            },
        ],
    };

    let coins = reconstruct_coins(&ctx, &ScriptedDeriver, 100).unwrap();
    assert_eq!(coins.len(), 3);

    assert_eq!(coins[0].index, 0);
    assert_eq!(coins[0].value, DENOMINATIONS[0]);
    assert!(!coins[0].is_spend);

    assert_eq!(coins[1].index, 1);
    assert_eq!(coins[1].value, DENOMINATIONS[3]);
    assert!(coins[1].is_spend);

    assert_eq!(coins[2].index, 4);
    assert!(coins.iter().all(|c| c.group_id == -1));
}

#[test]
fn restore_stops_after_consecutive_misses() {
    // Hits at 0 and 2, then nothing: the scan must end after the miss
    // limit, not walk the whole commitment count.
    let ctx = RestoreContext {
        used_serials: HashSet::new(),
        groups: vec![RestoreGroup {
            denom: DENOMINATIONS[0],
            commitments: (0..1000)
                .map(|i| {
                    if i == 0 || i == 2 {
                        format!("c{i}")
                    } else {
                        format!("other{i}")
                    }
                })
                .collect(),
        }],
    };

    let coins = reconstruct_coins(&ctx, &ScriptedDeriver, 10).unwrap();
    assert_eq!(coins.len(), 2);
    assert_eq!(coins[1].index, 2);
}

#[test]
fn restore_is_deterministic() {
    let ctx = RestoreContext {
        used_serials: HashSet::new(),
        groups: vec![RestoreGroup {
            denom: DENOMINATIONS[1],
            commitments: vec!["c0".into(), "c1".into(), "c2".into()],
        }],
    };
    let a = reconstruct_coins(&ctx, &ScriptedDeriver, 100).unwrap();
    let b = reconstruct_coins(&ctx, &ScriptedDeriver, 100).unwrap();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.index, y.index);
        assert_eq!(x.commitment, y.commitment);
    }
}
