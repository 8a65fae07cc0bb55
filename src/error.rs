use thiserror::Error;

/// Errors surfaced to callers of the engine.
///
/// Network-layer failures are absorbed into retries and backoff wherever a
/// redundant path exists; only conditions with no redundant path end up here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The available coins or UTXOs cannot cover the requested amount.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// There are no connected servers to service the request.
    #[error("no available connections")]
    NoConnections,

    /// Every connected server rejected a broadcast.
    #[error("broadcast failed on every server: {0}")]
    BroadcastFailed(String),

    /// The engine shut down while a network query was still pending.
    #[error("engine disconnected")]
    Disconnected,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
