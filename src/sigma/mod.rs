//! Sigma private-coin support: denominations, coin selection, mint
//! decomposition, the coin file, and wallet restore from chain data.

pub mod mint;
pub mod restore;
pub mod select;
pub mod store;
pub mod types;

mod tests;

pub use restore::{reconstruct_coins, RestoreContext, RestoreGroup};
pub use select::{approved_mints, required_mint_count, select_mints_to_spend};
pub use store::CoinStore;
pub use types::{
    AnonymitySet, CoinDeriver, CoinGroup, DerivedCoin, MintMetadata, MintQuery, PrivateCoin,
    SpendCoin, DENOMINATIONS, MINT_FEE_QUANTUM, SIGMA_COIN,
};
