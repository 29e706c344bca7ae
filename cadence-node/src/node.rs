//! Wiring of a validator node and its background loops

use crate::config::{NodeConfig, RegistrySource};
use crate::driver::{LocalBlockDriver, LocalStatus};
use crate::error::{NodeError, NodeResult};
use crate::http;
use crate::peer_client::{CometRpcStatus, HttpPeerConnector};
use crate::service::TxService;
use cadence_consensus::sla::run_sla_monitor;
use cadence_consensus::{
    serve_abci, BridgeConfig, ConsensusError, ConsensusResult, ConsensusStatus, CoreApplication,
    MemoryStore, Mempool, PeerBroadcaster, PgStore, RegistrationStatus, RegistryBridge, Store,
};
use cadence_core::NodeIdentity;
use cadence_registry::{EthServiceRegistry, ServiceRegistry, StaticServiceRegistry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Load the delegate identity named by the config
pub fn load_identity(config: &NodeConfig) -> NodeResult<NodeIdentity> {
    let key = config
        .node
        .delegate_private_key
        .as_ref()
        .ok_or_else(|| NodeError::Config("delegate private key not configured".to_string()))?;
    Ok(NodeIdentity::from_hex(key.expose_secret())?)
}

/// Open the configured store, applying migrations to Postgres
pub async fn open_store(config: &NodeConfig) -> NodeResult<Arc<dyn Store>> {
    match &config.database.url {
        Some(url) => {
            let store = PgStore::connect(url.expose_secret(), config.database.max_connections)
                .await
                .map_err(ConsensusError::from)?;
            store.migrate(false).await.map_err(ConsensusError::from)?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database configured, state is kept in memory and lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn open_registry(config: &NodeConfig) -> NodeResult<Arc<dyn ServiceRegistry>> {
    match config.node.registry {
        RegistrySource::Memory => Ok(Arc::new(StaticServiceRegistry::new(true))),
        RegistrySource::Ethereum => {
            // only permissive environments may stake and register on chain
            let signer = config
                .node
                .delegate_private_key
                .as_ref()
                .filter(|_| config.environment.is_permissive())
                .map(|key| key.expose_secret().clone());
            Ok(Arc::new(EthServiceRegistry::connect(
                config.ethereum.clone(),
                signer.as_deref(),
            )?))
        }
    }
}

/// Register this node, starting over after `retry` until an attempt settles
///
/// Only an engine that never catches up is fatal. Registry and store failures
/// leave the node serving unregistered while it keeps trying.
pub async fn register_until_settled(
    bridge: &RegistryBridge,
    retry: Duration,
) -> ConsensusResult<RegistrationStatus> {
    let mut round = 0u32;
    loop {
        round += 1;
        match bridge.register_self().await {
            Ok(status) => return Ok(status),
            Err(e @ ConsensusError::CatchUpTimeout { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(round, retry_secs = retry.as_secs(), error = %e, "Self registration failed, will retry");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

pub struct Node {
    config: NodeConfig,
    identity: Arc<NodeIdentity>,
    app: Arc<CoreApplication>,
    broadcaster: Arc<PeerBroadcaster>,
    bridge: Arc<RegistryBridge>,
    service: Arc<TxService>,
}

impl Node {
    pub async fn build(config: NodeConfig) -> NodeResult<Self> {
        let identity = Arc::new(load_identity(&config)?);
        let store = open_store(&config).await?;
        let registry = open_registry(&config)?;

        let peer_timeout = Duration::from_millis(config.services.peer_timeout_ms);
        let broadcaster = Arc::new(PeerBroadcaster::new(
            Arc::new(HttpPeerConnector::new(peer_timeout, &config.node.endpoint)?),
            config.mempool.peer_queue_depth,
        ));
        let mempool = Arc::new(Mempool::new(config.mempool.capacity).with_broadcaster(broadcaster.clone()));

        let app = Arc::new(CoreApplication::new(
            store,
            mempool,
            registry.clone(),
            config.app.clone(),
        ));
        let state = app.load_state().await?;

        let status: Arc<dyn ConsensusStatus> = if config.consensus.local_driver {
            Arc::new(LocalStatus)
        } else {
            Arc::new(CometRpcStatus::new(&config.consensus.rpc_url, peer_timeout)?)
        };
        let bridge = Arc::new(RegistryBridge::new(
            identity.clone(),
            registry,
            app.clone(),
            status,
            BridgeConfig {
                endpoint: config.node.endpoint.clone(),
                node_type: config.node.node_type.clone(),
                permissive: config.environment.is_permissive(),
                catch_up_attempts: config.consensus.catch_up_attempts,
                catch_up_delay: Duration::from_secs(config.consensus.catch_up_delay_secs),
                ..BridgeConfig::default()
            },
        ));

        let service = Arc::new(TxService::new(
            app.clone(),
            broadcaster.clone(),
            identity.eth_address().to_string(),
            identity.comet_address().to_string(),
            config.services.send_timeout(),
        ));

        tracing::info!(
            environment = %config.environment,
            eth_address = %identity.eth_address(),
            comet_address = %identity.comet_address(),
            endpoint = %config.node.endpoint,
            height = state.block_height,
            "Node initialized"
        );

        Ok(Self {
            config,
            identity,
            app,
            broadcaster,
            bridge,
            service,
        })
    }

    pub fn service(&self) -> Arc<TxService> {
        self.service.clone()
    }

    fn spawn_peer_refresh(&self) -> JoinHandle<()> {
        let bridge = self.bridge.clone();
        let broadcaster = self.broadcaster.clone();
        let service = self.service.clone();
        let store = self.app.store();
        let eth_address = self.identity.eth_address().to_string();
        let period = Duration::from_secs(self.config.services.peer_refresh_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match bridge.sync_peers(&broadcaster).await {
                    Ok(peers) => tracing::debug!(peers, "Refreshed peers"),
                    Err(e) => tracing::warn!(error = %e, "Could not refresh peers"),
                }
                match store.node_by_eth_address(&eth_address).await {
                    Ok(found) => service.set_registered(found.is_some()),
                    Err(e) => tracing::warn!(error = %e, "Could not read registration"),
                }
            }
        })
    }

    /// Serve until ctrl-c, or until a component that must not stop does
    pub async fn run(self) -> NodeResult<()> {
        let mut background = vec![
            self.spawn_peer_refresh(),
            tokio::spawn(run_sla_monitor(
                self.app.auditor(),
                Duration::from_secs(self.config.services.sla_monitor_secs.max(1)),
            )),
        ];

        let mut http_task = tokio::spawn(http::serve(self.service.clone(), self.config.node.http_listen));

        let mut driver_task: JoinHandle<Result<(), ConsensusError>> = if self.config.consensus.local_driver {
            let driver = LocalBlockDriver::new(
                self.app.clone(),
                self.identity.comet_address().to_string(),
                Duration::from_millis(self.config.consensus.block_interval_ms.max(1)),
            );
            tokio::spawn(driver.run())
        } else {
            tokio::spawn(serve_abci(self.app.clone(), self.config.consensus.abci_listen))
        };

        let bridge = self.bridge.clone();
        let retry = Duration::from_secs(self.config.consensus.registration_retry_secs.max(1));
        let mut registration = tokio::spawn(async move { register_until_settled(&bridge, retry).await });
        let mut registering = true;

        let outcome = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down");
                    break signal.map_err(NodeError::from);
                }
                joined = &mut registration, if registering => {
                    registering = false;
                    match joined {
                        Ok(Ok(status)) => {
                            if status == RegistrationStatus::AlreadyRegistered {
                                self.service.set_registered(true);
                            }
                            tracing::info!(?status, "Registration check finished");
                        }
                        Ok(Err(e)) => break Err(e.into()),
                        Err(e) => break Err(NodeError::Task(e.to_string())),
                    }
                }
                joined = &mut http_task => {
                    break match joined {
                        Ok(result) => result.and(Err(NodeError::Task("HTTP transport stopped".to_string()))),
                        Err(e) => Err(NodeError::Task(e.to_string())),
                    };
                }
                joined = &mut driver_task => {
                    break match joined {
                        Ok(result) => result
                            .map_err(NodeError::from)
                            .and(Err(NodeError::Task("block driver or ABCI server stopped".to_string()))),
                        Err(e) => Err(NodeError::Task(e.to_string())),
                    };
                }
            }
        };

        registration.abort();
        http_task.abort();
        driver_task.abort();
        for task in background.drain(..) {
            task.abort();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use async_trait::async_trait;
    use cadence_core::{SignedTransaction, Transaction, TrackPlay, TrackPlays};
    use cadence_registry::{BlockTag, EndpointInfo, RegistryError, RegistryResult};
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicU32, Ordering};

    const KEY: &str = "5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

    fn local_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.environment = Environment::Dev;
        config.node.delegate_private_key = Some(SecretString::new(KEY.to_string()));
        config.node.registry = RegistrySource::Memory;
        config.node.endpoint = "http://127.0.0.1:1".to_string();
        config.consensus.local_driver = true;
        config.consensus.catch_up_delay_secs = 0;
        config.services.send_timeout_secs = 5;
        config
    }

    #[tokio::test]
    async fn test_local_node_registers_itself_and_serves() {
        let node = Node::build(local_config()).await.unwrap();
        let service = node.service();
        let app = node.app.clone();
        let bridge = node.bridge.clone();
        let driver = LocalBlockDriver::new(
            app.clone(),
            node.identity.comet_address().to_string(),
            Duration::from_millis(1),
        );

        let status = bridge.register_self().await.unwrap();
        assert!(matches!(status, RegistrationStatus::Submitted(_)));
        let block = driver.produce_block().await.unwrap().unwrap();
        assert_eq!(block.tx_results[0].code, 0);
        assert_eq!(block.validator_updates.len(), 1);
        assert_eq!(
            bridge.register_self().await.unwrap(),
            RegistrationStatus::AlreadyRegistered
        );

        let tx = SignedTransaction::unsigned(
            "plays",
            Transaction::Plays(TrackPlays {
                plays: vec![TrackPlay {
                    user_id: "u".to_string(),
                    track_id: "t".to_string(),
                    timestamp: 1,
                    signature: "s".to_string(),
                    city: String::new(),
                    region: String::new(),
                    country: String::new(),
                }],
            }),
        );
        let sender = {
            let service = service.clone();
            let tx = tx.clone();
            tokio::spawn(async move { service.send(tx).await })
        };
        while app.mempool().is_empty() {
            tokio::task::yield_now().await;
        }
        driver.produce_block().await.unwrap().unwrap();

        let receipt = sender.await.unwrap().unwrap();
        assert_eq!(receipt.height, 2);
        assert_eq!(service.get(receipt.tx_hash.as_str()).await.unwrap().transaction, tx);
    }

    /// Registry whose RPC node is unreachable
    #[derive(Default)]
    struct UnreachableRegistry {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ServiceRegistry for UnreachableRegistry {
        async fn service_provider_id(&self, _endpoint: &str, _at: BlockTag) -> RegistryResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::Rpc("connection refused".to_string()))
        }

        async fn endpoint_info(&self, _sp_id: u64, _at: BlockTag) -> RegistryResult<EndpointInfo> {
            Err(RegistryError::Rpc("connection refused".to_string()))
        }

        async fn register_service_provider(&self, _endpoint: &str, _wallet: &str) -> RegistryResult<()> {
            Err(RegistryError::Rpc("connection refused".to_string()))
        }
    }

    struct NeverSynced;

    #[async_trait]
    impl ConsensusStatus for NeverSynced {
        async fn catching_up(&self) -> ConsensusResult<bool> {
            Ok(true)
        }
    }

    fn bridge(registry: Arc<dyn ServiceRegistry>, status: Arc<dyn ConsensusStatus>) -> RegistryBridge {
        let app = Arc::new(CoreApplication::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Mempool::new(8)),
            registry.clone(),
            Default::default(),
        ));
        RegistryBridge::new(
            Arc::new(NodeIdentity::from_hex(KEY).unwrap()),
            registry,
            app,
            status,
            BridgeConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                catch_up_attempts: 2,
                catch_up_delay: Duration::ZERO,
                registry_attempts: 1,
                registry_backoff: Duration::ZERO,
                ..BridgeConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_unreachable_registry_keeps_registration_retrying() {
        let registry = Arc::new(UnreachableRegistry::default());
        let bridge = bridge(registry.clone(), Arc::new(LocalStatus));

        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            register_until_settled(&bridge, Duration::from_millis(5)),
        )
        .await;
        assert!(outcome.is_err(), "registration loop gave up: {outcome:?}");
        assert!(registry.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_engine_that_never_syncs_is_fatal() {
        let bridge = bridge(Arc::new(UnreachableRegistry::default()), Arc::new(NeverSynced));
        let outcome = register_until_settled(&bridge, Duration::from_millis(5)).await;
        assert!(matches!(outcome, Err(ConsensusError::CatchUpTimeout { attempts: 2 })));
    }

    #[test]
    fn test_identity_requires_key() {
        let mut config = local_config();
        assert!(load_identity(&config).is_ok());
        config.node.delegate_private_key = None;
        assert!(matches!(load_identity(&config), Err(NodeError::Config(_))));
    }
}
