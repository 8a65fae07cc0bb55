//! The synchronization engine: shared caches, derived address info, the
//! task scheduler, and the coordinator that owns the connection pool.

pub mod cache;
pub mod coordinator;
pub mod scheduler;
pub mod state;
pub mod types;

mod tests;

pub use coordinator::{ConnectFactory, SyncCoordinator, TcpConnectFactory};
pub use types::{
    AddressInfo, AddressRecord, BalanceKind, EngineCallbacks, EngineConfig, HeaderInfo,
    SpendableUtxo, TxHeight, Utxo,
};
