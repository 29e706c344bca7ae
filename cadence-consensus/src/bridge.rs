//! Bridge between the Ethereum service registry and the validator set
//!
//! On startup a node waits for its consensus engine to catch up, then makes
//! sure it is registered: either it already is, or it submits a signed
//! `ValidatorRegistration` built from its on-chain entry. Only permissive
//! environments may create that on-chain entry themselves.

use crate::app::CoreApplication;
use crate::error::MempoolError;
use crate::peers::PeerBroadcaster;
use crate::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use cadence_core::crypto::same_eth_address;
use cadence_core::{NodeIdentity, SignedTransaction, Transaction, TxHash, ValidatorRegistration};
use cadence_registry::{BlockTag, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Sync state of the local consensus engine
#[async_trait]
pub trait ConsensusStatus: Send + Sync {
    async fn catching_up(&self) -> ConsensusResult<bool>;
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Public endpoint this node is registered under
    pub endpoint: String,
    pub node_type: String,
    pub power: i64,
    /// Allow on-chain self registration (dev and sandbox networks)
    pub permissive: bool,
    pub catch_up_attempts: u32,
    pub catch_up_delay: Duration,
    /// Attempts for transient registry failures
    pub registry_attempts: u32,
    pub registry_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            node_type: "validator".to_string(),
            power: 10,
            permissive: false,
            catch_up_attempts: 60,
            catch_up_delay: Duration::from_secs(10),
            registry_attempts: 5,
            registry_backoff: Duration::from_secs(2),
        }
    }
}

/// Outcome of [`RegistryBridge::register_self`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    AlreadyRegistered,
    /// Not on the Ethereum registry and not allowed to register there
    Unregistered,
    Submitted(TxHash),
}

pub struct RegistryBridge {
    identity: Arc<NodeIdentity>,
    registry: Arc<dyn ServiceRegistry>,
    app: Arc<CoreApplication>,
    status: Arc<dyn ConsensusStatus>,
    config: BridgeConfig,
}

impl RegistryBridge {
    pub fn new(
        identity: Arc<NodeIdentity>,
        registry: Arc<dyn ServiceRegistry>,
        app: Arc<CoreApplication>,
        status: Arc<dyn ConsensusStatus>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            identity,
            registry,
            app,
            status,
            config,
        }
    }

    /// Poll the engine until it reports being in sync
    pub async fn await_catch_up(&self) -> ConsensusResult<()> {
        for attempt in 1..=self.config.catch_up_attempts {
            match self.status.catching_up().await {
                Ok(false) => {
                    tracing::info!(attempt, "Consensus engine caught up");
                    return Ok(());
                }
                Ok(true) => tracing::info!(attempt, "Consensus engine still catching up"),
                Err(e) => tracing::warn!(attempt, error = %e, "Consensus engine status unavailable"),
            }
            tokio::time::sleep(self.config.catch_up_delay).await;
        }
        Err(ConsensusError::CatchUpTimeout {
            attempts: self.config.catch_up_attempts,
        })
    }

    /// Make sure this node is, or is about to become, a registered validator
    pub async fn register_self(&self) -> ConsensusResult<RegistrationStatus> {
        self.await_catch_up().await?;

        let mut attempt = 0;
        let mut backoff = self.config.registry_backoff;
        loop {
            attempt += 1;
            match self.try_register().await {
                Err(ConsensusError::Registry(e)) if attempt < self.config.registry_attempts => {
                    tracing::warn!(attempt, error = %e, "Registry unavailable, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    async fn try_register(&self) -> ConsensusResult<RegistrationStatus> {
        let eth_address = self.identity.eth_address();
        let endpoint = self.config.endpoint.as_str();

        if self.app.store().node_by_eth_address(eth_address).await?.is_some() {
            tracing::info!(%eth_address, "Node already registered");
            return Ok(RegistrationStatus::AlreadyRegistered);
        }

        let mut sp_id = self.registry.service_provider_id(endpoint, BlockTag::Latest).await?;
        if sp_id == 0 {
            if !self.config.permissive {
                tracing::warn!(%endpoint, "Endpoint not on the Ethereum registry, continuing unregistered");
                return Ok(RegistrationStatus::Unregistered);
            }

            tracing::info!(%endpoint, "Registering endpoint on the Ethereum registry");
            self.registry.register_service_provider(endpoint, eth_address).await?;
            sp_id = self.registry.service_provider_id(endpoint, BlockTag::Latest).await?;
            if sp_id == 0 {
                return Err(ConsensusError::SelfRegistration(format!(
                    "{endpoint} still unknown to the registry after registering"
                )));
            }
        }

        let info = self.registry.endpoint_info(sp_id, BlockTag::Latest).await?;
        if !same_eth_address(&info.delegate_owner_wallet, eth_address) {
            tracing::warn!(
                %endpoint,
                registered = %info.delegate_owner_wallet,
                %eth_address,
                "Registry delegate wallet differs from this node, registration will be rejected"
            );
        }

        let registration = ValidatorRegistration {
            endpoint: endpoint.to_string(),
            comet_address: self.identity.comet_address().to_string(),
            eth_block: info.block_number,
            node_type: self.config.node_type.clone(),
            sp_id,
            pub_key: self.identity.consensus_public_key().to_vec(),
            power: self.config.power,
        };
        let tx = SignedTransaction::sign(
            &self.identity,
            // height scoped so a registration that failed can be sent again
            format!(
                "register-{eth_address}-{}-{}",
                info.block_number,
                self.app.last_block_height()
            ),
            Transaction::ValidatorRegistration(registration),
        )?;
        let tx_hash = tx.hash()?;

        match self.app.submit(tx).await {
            Ok(_)
            | Err(ConsensusError::Mempool(MempoolError::Duplicate(_)))
            | Err(ConsensusError::AlreadyFinalized { .. }) => {}
            Err(e) => return Err(e),
        }
        tracing::info!(%tx_hash, sp_id, eth_block = info.block_number, "Submitted validator registration");
        Ok(RegistrationStatus::Submitted(tx_hash))
    }

    /// Rebuild the peer set from the registered validators
    pub async fn sync_peers(&self, broadcaster: &PeerBroadcaster) -> ConsensusResult<usize> {
        let nodes = self.app.store().registered_nodes().await?;
        broadcaster.add_validators(&nodes, &self.config.endpoint);
        Ok(broadcaster.peer_count())
    }
}
