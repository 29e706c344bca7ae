//! Best-effort transaction fan-out to other validators
//!
//! Each peer gets a bounded queue drained by its own worker task. Delivery is
//! at most once: a full queue drops the transaction for that peer and a failed
//! forward is logged and never retried.

use crate::store::RegisteredNode;
use crate::ConsensusResult;
use async_trait::async_trait;
use cadence_core::TxHash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default per-peer queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Outbound connection to one validator
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Deliver canonical transaction bytes for mempool propagation
    async fn forward_transaction(&self, tx_bytes: &[u8]) -> ConsensusResult<()>;
}

/// Builds a [`PeerClient`] for an advertised endpoint
pub trait PeerConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> ConsensusResult<Arc<dyn PeerClient>>;
}

struct PeerWorker {
    sender: mpsc::Sender<Arc<Vec<u8>>>,
}

fn normalize(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Peer map plus one forwarding worker per peer
pub struct PeerBroadcaster {
    connector: Arc<dyn PeerConnector>,
    queue_depth: usize,
    peers: RwLock<HashMap<String, PeerWorker>>,
}

impl PeerBroadcaster {
    pub fn new(connector: Arc<dyn PeerConnector>, queue_depth: usize) -> Self {
        Self {
            connector,
            queue_depth: queue_depth.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Reconcile the peer map with the registered validators
    ///
    /// New validators get a worker, validators no longer registered lose theirs
    /// and this node's own endpoint is skipped. Must run inside a tokio runtime.
    pub fn add_validators(&self, nodes: &[RegisteredNode], self_endpoint: &str) {
        let own = normalize(self_endpoint);
        let wanted: HashMap<String, &RegisteredNode> = nodes
            .iter()
            .map(|node| (normalize(&node.endpoint), node))
            .filter(|(endpoint, _)| *endpoint != own && !endpoint.is_empty())
            .collect();

        let mut peers = self.peers.write();
        peers.retain(|endpoint, _| {
            let keep = wanted.contains_key(endpoint);
            if !keep {
                tracing::info!(peer = %endpoint, "Removed peer");
            }
            keep
        });

        for (endpoint, node) in wanted {
            if peers.contains_key(&endpoint) {
                continue;
            }
            let client = match self.connector.connect(&node.endpoint) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(peer = %node.endpoint, error = %e, "Could not create peer client");
                    continue;
                }
            };

            let (sender, receiver) = mpsc::channel(self.queue_depth);
            tokio::spawn(run_worker(endpoint.clone(), client, receiver));
            tracing::info!(peer = %endpoint, comet_address = %node.comet_address, "Added peer");
            peers.insert(endpoint, PeerWorker { sender });
        }
    }

    /// Queue `tx_bytes` for every peer without waiting
    pub fn broadcast(&self, tx_hash: &TxHash, tx_bytes: Arc<Vec<u8>>) {
        let peers = self.peers.read();
        for (endpoint, worker) in peers.iter() {
            match worker.sender.try_send(tx_bytes.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(peer = %endpoint, %tx_hash, "Peer queue full, dropping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(peer = %endpoint, %tx_hash, "Peer worker stopped, dropping broadcast");
                }
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Normalized endpoints of the current peers
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }
}

async fn run_worker(
    endpoint: String,
    client: Arc<dyn PeerClient>,
    mut receiver: mpsc::Receiver<Arc<Vec<u8>>>,
) {
    while let Some(tx_bytes) = receiver.recv().await {
        if let Err(e) = client.forward_transaction(&tx_bytes).await {
            tracing::warn!(peer = %endpoint, error = %e, "Failed to forward transaction");
        }
    }
    tracing::debug!(peer = %endpoint, "Peer worker exited");
}
