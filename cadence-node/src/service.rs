//! Transaction service behind every transport
//!
//! `send` admits a transaction and waits, bounded by a timeout, until the block
//! containing it commits. `get` serves finalized transactions from the store.
//! `forward` takes bytes from registered validators only.

use crate::error::{NodeError, NodeResult};
use cadence_consensus::{ConsensusError, CoreApplication, MempoolError, PeerBroadcaster, Store};
use cadence_core::{Height, SignedTransaction, TxHash, TxKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of a committed `send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub tx_hash: TxHash,
    pub height: Height,
    /// Execution code, 0 on success
    pub code: u32,
}

/// A finalized transaction as returned by `get`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedTransaction {
    pub tx_hash: TxHash,
    pub height: Height,
    pub code: u32,
    pub transaction: SignedTransaction,
}

/// Point-in-time node status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub height: Height,
    pub app_hash: String,
    pub mempool_size: usize,
    pub peers: Vec<String>,
    pub eth_address: String,
    pub comet_address: String,
    pub registered: bool,
}

fn same_endpoint(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/').eq_ignore_ascii_case(b.trim().trim_end_matches('/'))
}

pub struct TxService {
    app: Arc<CoreApplication>,
    peers: Arc<PeerBroadcaster>,
    eth_address: String,
    comet_address: String,
    send_timeout: Duration,
    registered: AtomicBool,
}

impl TxService {
    pub fn new(
        app: Arc<CoreApplication>,
        peers: Arc<PeerBroadcaster>,
        eth_address: String,
        comet_address: String,
        send_timeout: Duration,
    ) -> Self {
        Self {
            app,
            peers,
            eth_address,
            comet_address,
            send_timeout,
            registered: AtomicBool::new(false),
        }
    }

    pub fn app(&self) -> &Arc<CoreApplication> {
        &self.app
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Relaxed);
    }

    /// Admit `tx` and wait for the block that includes it to commit
    pub async fn send(&self, tx: SignedTransaction) -> NodeResult<SendReceipt> {
        if tx.kind() == TxKind::SlaRollup {
            return Err(NodeError::InvalidRequest(
                "SLA rollups are created by the block proposer".to_string(),
            ));
        }

        let tx_hash = tx.hash()?;
        let pubsub = self.app.pubsub();
        // subscribe first so a fast commit cannot be missed
        let waiter = pubsub.subscribe(&tx_hash);
        match self.app.submit(tx).await {
            // already pending from an earlier send, wait for the same commit
            Ok(_) | Err(ConsensusError::Mempool(MempoolError::Duplicate(_))) => {}
            Err(ConsensusError::AlreadyFinalized { .. }) => {
                drop(waiter);
                pubsub.forget(&tx_hash);
                return self.receipt(tx_hash).await;
            }
            Err(e) => {
                drop(waiter);
                pubsub.forget(&tx_hash);
                return Err(e.into());
            }
        }
        tracing::debug!(%tx_hash, "Transaction admitted, awaiting commit");

        match tokio::time::timeout(self.send_timeout, waiter).await {
            Ok(Ok(event)) => Ok(SendReceipt {
                tx_hash,
                height: event.height,
                code: event.code,
            }),
            Ok(Err(_)) => Err(NodeError::NotFound(format!(
                "subscription for {tx_hash} closed before commit"
            ))),
            Err(_) => {
                pubsub.forget(&tx_hash);
                tracing::warn!(%tx_hash, "Timed out waiting for commit");
                Err(NodeError::Timeout {
                    tx_hash,
                    seconds: self.send_timeout.as_secs(),
                })
            }
        }
    }

    /// Receipt of a transaction finalized by an earlier block
    async fn receipt(&self, tx_hash: TxHash) -> NodeResult<SendReceipt> {
        let stored = self
            .app
            .store()
            .transaction(&tx_hash)
            .await
            .map_err(ConsensusError::from)?
            .ok_or_else(|| NodeError::NotFound(format!("transaction {tx_hash}")))?;
        tracing::debug!(%tx_hash, height = stored.block_height, "Transaction already finalized");
        Ok(SendReceipt {
            tx_hash,
            height: stored.block_height,
            code: stored.result_code,
        })
    }

    /// Admit canonical bytes forwarded by a registered validator without re-broadcasting
    ///
    /// `peer` is the endpoint the caller names itself by.
    pub async fn forward(&self, tx_bytes: Vec<u8>, peer: Option<&str>) -> NodeResult<TxHash> {
        let peer = peer
            .map(str::trim)
            .filter(|peer| !peer.is_empty())
            .ok_or_else(|| NodeError::Forbidden("forwarding peer not named".to_string()))?;
        let registered = self
            .app
            .store()
            .registered_nodes()
            .await
            .map_err(ConsensusError::from)?
            .iter()
            .any(|node| same_endpoint(&node.endpoint, peer));
        if !registered {
            tracing::debug!(%peer, "Refusing forward from unregistered peer");
            return Err(NodeError::Forbidden(format!("{peer} is not a registered validator")));
        }
        Ok(self.app.submit_forwarded(tx_bytes).await?)
    }

    pub async fn get(&self, hash: &str) -> NodeResult<FinalizedTransaction> {
        let tx_hash = TxHash::parse(hash)
            .ok_or_else(|| NodeError::InvalidRequest(format!("invalid transaction hash {hash:?}")))?;
        let stored = self
            .app
            .store()
            .transaction(&tx_hash)
            .await
            .map_err(ConsensusError::from)?
            .ok_or_else(|| NodeError::NotFound(format!("transaction {tx_hash}")))?;
        Ok(FinalizedTransaction {
            tx_hash,
            height: stored.block_height,
            code: stored.result_code,
            transaction: SignedTransaction::from_bytes(&stored.tx_bytes)?,
        })
    }

    pub fn ping(&self) -> &'static str {
        "pong"
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            height: self.app.last_block_height(),
            app_hash: hex::encode_upper(self.app.last_app_hash()),
            mempool_size: self.app.mempool().len(),
            peers: self.peers.peers(),
            eth_address: self.eth_address.clone(),
            comet_address: self.comet_address.clone(),
            registered: self.registered.load(Ordering::Relaxed),
        }
    }
}
