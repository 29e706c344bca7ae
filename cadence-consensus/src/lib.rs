//! Cadence Consensus - the validator's ABCI application
//!
//! The consensus engine itself is external. This crate implements the
//! deterministic state machine it drives and the ABCI socket it is served
//! on, plus the pieces around it: the pending transaction pool and its peer
//! fan-out, SLA rollup auditing, per-variant transaction handlers, the
//! finalized-state store and the bridge to the Ethereum service registry.

pub mod abci;
pub mod app;
pub mod bridge;
pub mod error;
pub mod handlers;
pub mod mempool;
pub mod peers;
pub mod pubsub;
pub mod server;
pub mod sla;
pub mod store;

pub use abci::Application;
pub use app::{AppConfig, CoreApplication};
pub use bridge::{BridgeConfig, ConsensusStatus, RegistrationStatus, RegistryBridge};
pub use error::{ConsensusError, MempoolError, StoreError};
pub use mempool::{Mempool, MempoolEntry};
pub use peers::{PeerBroadcaster, PeerClient, PeerConnector};
pub use pubsub::{TxCommitted, TxPubsub};
pub use server::serve_abci;
pub use sla::SlaAuditor;
pub use store::{MemoryStore, PgStore, Store};

/// Result type for consensus operations
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;

/// Consensus application version
pub const CONSENSUS_VERSION: &str = "0.1.0";
