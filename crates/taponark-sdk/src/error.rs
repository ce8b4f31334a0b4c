use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("construction failed: {0}")]
    Construction(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("MuSig2 secret nonce already consumed")]
    NonceConsumed,

    #[error("control block not bound for {0}")]
    ControlBlockUnbound(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("derivation error: {0}")]
    Derivation(String),

    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error("chain query error: {0}")]
    Rpc(String),

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("proof error: {0}")]
    Proof(String),

    /// The asset leg of a boarding was sent but the bitcoin leg was not.
    #[error("btc deposit failed after asset deposit {asset_outpoint} to {address}: {source}")]
    BoardingIncomplete {
        asset_outpoint: bitcoin::OutPoint,
        address: String,
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by [`TaponarkNode`](crate::node::TaponarkNode) operations.
#[derive(Debug)]
pub enum NodeError {
    /// The internal SDK mutex was poisoned by a prior panic.
    MutexPoisoned,
    /// An SDK (construction, signing or chain) operation failed.
    Sdk(Error),
    /// A `spawn_blocking` task failed to join.
    Task(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::MutexPoisoned => write!(f, "internal mutex poisoned by a prior panic"),
            NodeError::Sdk(e) => write!(f, "sdk error: {e}"),
            NodeError::Task(e) => write!(f, "task join error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Sdk(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for NodeError {
    fn from(e: Error) -> Self {
        NodeError::Sdk(e)
    }
}
