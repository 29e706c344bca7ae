//! Persistence of finalized state
//!
//! Reads through [`Store`] only ever see committed blocks. Writes happen
//! through a [`BlockTx`], one per block, opened in `FinalizeBlock` and
//! committed in `Commit`.

mod memory;
pub mod migrations;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::StoreError;
use async_trait::async_trait;
use cadence_core::{Height, SlaNodeReport, SlaRollup, TrackPlay, TxHash, TxKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Last finalized state root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStateRow {
    pub block_height: Height,
    pub app_hash: Vec<u8>,
}

/// Validator admitted through a registration transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub eth_address: String,
    pub comet_address: String,
    pub pub_key: Vec<u8>,
    pub endpoint: String,
    pub node_type: String,
    pub sp_id: u64,
    pub eth_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailedNode {
    pub comet_address: String,
    pub jailed_until: Height,
}

/// Append-only audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStat {
    pub tx_type: TxKind,
    pub tx_hash: TxHash,
    pub block_height: Height,
    pub created_at: DateTime<Utc>,
}

/// A transaction as included in a finalized block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx_hash: TxHash,
    pub block_height: Height,
    pub tx_index: i32,
    pub tx_bytes: Vec<u8>,
    pub result_code: u32,
    pub created_at: DateTime<Utc>,
}

/// Committed-state reads and block transaction factory
#[async_trait]
pub trait Store: Send + Sync {
    async fn app_state(&self) -> StoreResult<Option<AppStateRow>>;

    async fn registered_nodes(&self) -> StoreResult<Vec<RegisteredNode>>;

    /// Lookup ignores address checksum casing
    async fn node_by_eth_address(&self, eth_address: &str) -> StoreResult<Option<RegisteredNode>>;

    async fn latest_sla_rollup(&self) -> StoreResult<Option<SlaRollup>>;

    /// Blocks proposed per validator since the last rollup, ordered by address
    async fn sla_counters(&self) -> StoreResult<Vec<SlaNodeReport>>;

    async fn transaction(&self, tx_hash: &TxHash) -> StoreResult<Option<StoredTransaction>>;

    async fn jailed_nodes(&self) -> StoreResult<Vec<JailedNode>>;

    /// Open the write transaction for one block
    async fn begin_block(&self) -> StoreResult<Box<dyn BlockTx>>;
}

/// Writes of a single block, applied atomically on [`BlockTx::commit`]
///
/// One savepoint may be open at a time; handlers use it to undo their own
/// writes without aborting the block.
#[async_trait]
pub trait BlockTx: Send {
    async fn savepoint(&mut self) -> StoreResult<()>;

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()>;

    async fn release_savepoint(&mut self) -> StoreResult<()>;

    async fn node_by_eth_address(&mut self, eth_address: &str) -> StoreResult<Option<RegisteredNode>>;

    async fn node_by_comet_address(&mut self, comet_address: &str) -> StoreResult<Option<RegisteredNode>>;

    async fn insert_registered_node(&mut self, node: &RegisteredNode) -> StoreResult<()>;

    /// Extends an existing jail term, never shortens it
    async fn insert_jailed_node(&mut self, node: &JailedNode) -> StoreResult<()>;

    async fn latest_sla_rollup(&mut self) -> StoreResult<Option<SlaRollup>>;

    async fn insert_sla_rollup(&mut self, tx_hash: &TxHash, rollup: &SlaRollup) -> StoreResult<()>;

    async fn clear_sla_counters(&mut self) -> StoreResult<()>;

    async fn increment_blocks_proposed(&mut self, address: &str) -> StoreResult<()>;

    async fn insert_plays(&mut self, tx_hash: &TxHash, height: Height, plays: &[TrackPlay]) -> StoreResult<()>;

    /// A hash already stored is left untouched
    async fn insert_transaction(&mut self, tx: &StoredTransaction) -> StoreResult<()>;

    async fn insert_tx_stat(&mut self, stat: &TxStat) -> StoreResult<()>;

    async fn upsert_app_state(&mut self, state: &AppStateRow) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}
