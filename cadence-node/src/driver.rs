//! Single-proposer block driver for local networks
//!
//! Sequences the ABCI calls an engine would make, with this node proposing
//! every block. There is no voting: a proposal the node rejects itself is
//! dropped and retried at the same height on the next tick.

use async_trait::async_trait;
use cadence_consensus::abci::*;
use cadence_consensus::{ConsensusResult, ConsensusStatus, CoreApplication};
use cadence_core::Height;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct LocalBlockDriver {
    app: Arc<CoreApplication>,
    proposer_address: String,
    interval: Duration,
}

impl LocalBlockDriver {
    pub fn new(app: Arc<CoreApplication>, proposer_address: String, interval: Duration) -> Self {
        Self {
            app,
            proposer_address,
            interval,
        }
    }

    /// Run one Prepare/Process/Finalize/Commit round; `None` if the proposal was rejected
    pub async fn produce_block(&self) -> ConsensusResult<Option<ResponseFinalizeBlock>> {
        let height: Height = self.app.last_block_height() + 1;
        let time = Utc::now();

        let proposal = self
            .app
            .prepare_proposal(RequestPrepareProposal {
                max_tx_bytes: 0,
                txs: vec![],
                misbehavior: vec![],
                height,
                time,
                proposer_address: self.proposer_address.clone(),
            })
            .await?;

        let verdict = self
            .app
            .process_proposal(RequestProcessProposal {
                txs: proposal.txs.clone(),
                misbehavior: vec![],
                hash: vec![],
                height,
                time,
                proposer_address: self.proposer_address.clone(),
            })
            .await?;
        if verdict.status != ProposalStatus::Accept {
            tracing::warn!(height, status = ?verdict.status, "Local proposal not accepted");
            return Ok(None);
        }

        let response = self
            .app
            .finalize_block(RequestFinalizeBlock {
                txs: proposal.txs,
                misbehavior: vec![],
                hash: vec![],
                height,
                time,
                proposer_address: self.proposer_address.clone(),
            })
            .await?;
        self.app.commit().await?;
        Ok(Some(response))
    }

    /// Produce a block every interval until a commit fails
    pub async fn run(self) -> ConsensusResult<()> {
        let state = self.app.load_state().await?;
        tracing::info!(
            height = state.block_height,
            interval_ms = self.interval.as_millis() as u64,
            "Local block driver started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.produce_block().await {
                tracing::error!(error = %e, "Local block driver stopped");
                return Err(e);
            }
        }
    }
}

/// The local driver is never behind
pub struct LocalStatus;

#[async_trait]
impl ConsensusStatus for LocalStatus {
    async fn catching_up(&self) -> ConsensusResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_consensus::{AppConfig, MemoryStore, Mempool, Store};
    use cadence_core::{SignedTransaction, Transaction, TrackPlay, TrackPlays};
    use cadence_registry::StaticServiceRegistry;

    fn app(rollup_interval: Height) -> (Arc<CoreApplication>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let app = Arc::new(CoreApplication::new(
            store.clone(),
            Arc::new(Mempool::new(16)),
            Arc::new(StaticServiceRegistry::default()),
            AppConfig {
                rollup_interval,
                ..AppConfig::default()
            },
        ));
        (app, store)
    }

    #[tokio::test]
    async fn test_blocks_include_pending_transactions() {
        let (app, store) = app(100);
        let driver = LocalBlockDriver::new(app.clone(), "SELF".to_string(), Duration::from_millis(1));
        let hash = app
            .submit(SignedTransaction::unsigned(
                "p",
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
            ))
            .await
            .unwrap();

        let block = driver.produce_block().await.unwrap().unwrap();
        assert_eq!(block.tx_results.len(), 1);
        assert_eq!(app.last_block_height(), 1);
        assert!(store.transaction(&hash).await.unwrap().is_some());

        let empty = driver.produce_block().await.unwrap().unwrap();
        assert!(empty.tx_results.is_empty());
        assert_eq!(app.last_block_height(), 2);
    }

    #[tokio::test]
    async fn test_rollups_follow_the_interval() {
        let (app, store) = app(3);
        let driver = LocalBlockDriver::new(app, "SELF".to_string(), Duration::from_millis(1));
        for _ in 0..7 {
            driver.produce_block().await.unwrap().unwrap();
        }
        // proposed at heights 3, 5 and 7, each covering up to the previous block
        let rollups = store.sla_rollups();
        let ranges: Vec<_> = rollups.iter().map(|r| (r.block_start, r.block_end)).collect();
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 6)]);
        assert_eq!(rollups[1].reports[0].address, "SELF");
        assert_eq!(rollups[1].reports[0].num_blocks_proposed, 2);
    }

    #[tokio::test]
    async fn test_local_status_is_caught_up() {
        assert!(!LocalStatus.catching_up().await.unwrap());
    }
}
