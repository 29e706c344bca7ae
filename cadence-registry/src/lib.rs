//! Cadence Registry Integration
//!
//! Validators are admitted to consensus only if they are registered service
//! providers on the Ethereum staking contracts. This crate talks to those
//! contracts and implements the cross-check every node runs before accepting a
//! `ValidatorRegistration` transaction.

pub mod config;
pub mod ethereum;
pub mod static_registry;
pub mod verify;

pub use config::RegistryConfig;
pub use ethereum::EthServiceRegistry;
pub use static_registry::StaticServiceRegistry;
pub use verify::verify_registration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Registry error types
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("Ethereum RPC failed: {0}")]
    Rpc(String),

    #[error("Contract call failed: {0}")]
    Contract(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Endpoint {endpoint} is not registered at eth block {block}")]
    NotRegistered { endpoint: String, block: u64 },

    #[error("Service provider id mismatch: claimed {claimed}, registry has {actual}")]
    SpIdMismatch { claimed: u64, actual: u64 },

    #[error("Delegate wallet mismatch: signer {signer}, registry has {registered}")]
    WalletMismatch { signer: String, registered: String },

    #[error("Eth block mismatch: claimed {claimed}, registry has {actual}")]
    BlockMismatch { claimed: u64, actual: u64 },

    #[error("Endpoint mismatch: claimed {claimed}, registry has {actual}")]
    EndpointMismatch { claimed: String, actual: String },

    #[error("Consensus address {claimed} does not match public key (expected {derived})")]
    ConsensusAddressMismatch { claimed: String, derived: String },

    #[error("Self registration is only allowed in permissive environments")]
    RegistrationNotPermitted,

    #[error("Core error: {0}")]
    Core(#[from] cadence_core::CoreError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Ethereum block to evaluate a contract read at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

/// Registration details of one service provider endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub owner: String,
    pub endpoint: String,
    /// Block in which the endpoint was registered
    pub block_number: u64,
    pub delegate_owner_wallet: String,
}

/// Read (and, on development networks, write) access to the service-provider registry
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Service provider id for `endpoint`, `0` when unknown
    async fn service_provider_id(&self, endpoint: &str, at: BlockTag) -> RegistryResult<u64>;

    /// Registration details for a service provider id
    async fn endpoint_info(&self, sp_id: u64, at: BlockTag) -> RegistryResult<EndpointInfo>;

    /// Stake and register `endpoint` with `delegate_wallet` as its signer
    async fn register_service_provider(
        &self,
        endpoint: &str,
        delegate_wallet: &str,
    ) -> RegistryResult<()>;
}
