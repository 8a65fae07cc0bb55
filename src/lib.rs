//! Wallet synchronization engine for a sigma privacy coin.
//!
//! Keeps a wallet's address, transaction and header caches in sync over
//! a small pool of Electrum-style stratum connections, with server
//! reputation tracking, and layers the sigma private-coin operations
//! (minting, coin selection, restore) on top of the same connections.

pub mod engine;
pub mod error;
pub mod persistence;
pub mod server_cache;
pub mod sigma;
pub mod stratum;
pub mod tx;

pub use engine::{
    BalanceKind, ConnectFactory, EngineCallbacks, EngineConfig, SpendableUtxo, SyncCoordinator,
    TcpConnectFactory,
};
pub use error::EngineError;
pub use persistence::{MemoryStore, TextStore};
pub use tx::{OutPoint, ParsedTx, TxDecoder, TxInput, TxOutput};
