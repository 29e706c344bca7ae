//! Error types for the node binary and its transport

use cadence_consensus::{ConsensusError, MempoolError};
use cadence_core::{CoreError, TxHash};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transaction {tx_hash} was not committed within {seconds}s")]
    Timeout { tx_hash: TxHash, seconds: u64 },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Registry error: {0}")]
    Registry(#[from] cadence_registry::RegistryError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl NodeError {
    /// Whether the caller, not the node, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidRequest(_)
                | NodeError::Forbidden(_)
                | NodeError::Core(_)
                | NodeError::Consensus(ConsensusError::Core(_))
                | NodeError::Consensus(ConsensusError::InvalidTransaction(_))
                | NodeError::Consensus(ConsensusError::Mempool(MempoolError::Duplicate(_)))
                | NodeError::Consensus(ConsensusError::AlreadyFinalized { .. })
        )
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;
