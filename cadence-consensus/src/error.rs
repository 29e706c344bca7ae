//! Error types for the consensus application

use cadence_core::{Height, TxHash};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Core error: {0}")]
    Core(#[from] cadence_core::CoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] cadence_registry::RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mempool error: {0}")]
    Mempool(#[from] MempoolError),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid SLA rollup: {0}")]
    InvalidRollup(String),

    #[error("Duplicate validator registration for {0}")]
    DuplicateValidator(String),

    #[error("Block {height} is already being finalized")]
    BlockInProgress { height: i64 },

    #[error("Commit called without a finalized block")]
    NothingToCommit,

    #[error("Consensus engine is still catching up after {attempts} attempts")]
    CatchUpTimeout { attempts: u32 },

    #[error("Consensus engine status unavailable: {0}")]
    EngineStatus(String),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Self registration failed: {0}")]
    SelfRegistration(String),

    #[error("Transaction {tx_hash} was already finalized at height {height}")]
    AlreadyFinalized { tx_hash: TxHash, height: Height },

    #[error("ABCI server error: {0}")]
    Abci(String),
}

impl ConsensusError {
    /// Whether the error proves the input wrong, as opposed to a failure to evaluate it
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ConsensusError::InvalidTransaction(_)
                | ConsensusError::InvalidRollup(_)
                | ConsensusError::DuplicateValidator(_)
        )
    }

    /// Whether the error comes from this node's environment rather than the
    /// transaction, so another node could evaluate the same input differently
    pub fn is_transient(&self) -> bool {
        use cadence_registry::RegistryError;
        matches!(
            self,
            ConsensusError::Store(_)
                | ConsensusError::EngineStatus(_)
                | ConsensusError::Peer(_)
                | ConsensusError::Registry(
                    RegistryError::Rpc(_) | RegistryError::Contract(_) | RegistryError::Configuration(_)
                )
        )
    }
}

/// Admission failures; these never reach consensus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("mempool is full ({capacity} transactions)")]
    Full { capacity: usize },

    #[error("transaction {0} is already pending")]
    Duplicate(TxHash),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Refusing destructive migration: {0}")]
    MigrationRefused(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),
}
