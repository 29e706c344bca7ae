//! The ABCI state machine
//!
//! `finalize_block` applies a block inside one store transaction and parks the
//! result in a [`PendingBlock`]; `commit` takes it back by value, commits the
//! transaction and only then touches the mempool and subscribers. A block is
//! therefore either fully visible or not at all.

use crate::abci::*;
use crate::handlers::{BlockScope, HandlerRegistry, RegistryRetry, TxContext, ValidatorUpdates};
use crate::mempool::{Mempool, MempoolEntry};
use crate::pubsub::{TxCommitted, TxPubsub};
use crate::sla::{SlaAuditor, DEFAULT_ROLLUP_INTERVAL};
use crate::store::{AppStateRow, BlockTx, JailedNode, Store, StoredTransaction, TxStat};
use crate::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use cadence_core::{Height, SignedTransaction, Transaction, TxHash, TxKind};
use cadence_registry::ServiceRegistry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Application tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Most transactions a proposal takes from the mempool
    pub max_block_txs: usize,
    /// Blocks a pending transaction may wait for inclusion
    pub tx_ttl_blocks: Height,
    /// Blocks a validator stays jailed after duplicate-vote evidence
    pub jail_blocks: Height,
    /// Run the mempool expiry sweep every this many blocks
    pub expiry_sweep_interval: Height,
    pub rollup_interval: Height,
    /// Registry reads per registration before the block is abandoned
    pub registry_attempts: u32,
    pub registry_backoff_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_block_txs: 1000,
            tx_ttl_blocks: 100,
            jail_blocks: 10_000,
            expiry_sweep_interval: 100,
            rollup_interval: DEFAULT_ROLLUP_INTERVAL,
            registry_attempts: 3,
            registry_backoff_ms: 250,
        }
    }
}

/// `SHA-256(previous ‖ tx_1 ‖ … ‖ tx_n)` over the raw bytes of every transaction in the block
pub fn next_app_hash(previous: &[u8], txs: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    for tx in txs {
        hasher.update(tx);
    }
    hasher.finalize().to_vec()
}

/// Deterministic request id of the rollup proposed at `height`
pub fn rollup_request_id(height: Height) -> String {
    format!("sla-rollup-{height}")
}

/// Effects of a finalized, not yet committed block
struct PendingBlock {
    height: Height,
    tx: Box<dyn BlockTx>,
    finalized: Vec<(TxHash, u32)>,
    app_hash: Vec<u8>,
}

pub struct CoreApplication {
    store: Arc<dyn Store>,
    mempool: Arc<Mempool>,
    pubsub: Arc<TxPubsub>,
    auditor: Arc<SlaAuditor>,
    handlers: HandlerRegistry,
    config: AppConfig,
    committed: RwLock<AppStateRow>,
    pending: Mutex<Option<PendingBlock>>,
}

impl CoreApplication {
    pub fn new(
        store: Arc<dyn Store>,
        mempool: Arc<Mempool>,
        registry: Arc<dyn ServiceRegistry>,
        config: AppConfig,
    ) -> Self {
        let auditor = Arc::new(SlaAuditor::new(store.clone(), config.rollup_interval));
        Self {
            handlers: HandlerRegistry::new(
                registry,
                auditor.clone(),
                RegistryRetry {
                    attempts: config.registry_attempts,
                    backoff: Duration::from_millis(config.registry_backoff_ms),
                },
            ),
            store,
            mempool,
            pubsub: Arc::new(TxPubsub::new()),
            auditor,
            config,
            committed: RwLock::new(AppStateRow {
                block_height: 0,
                app_hash: Vec::new(),
            }),
            pending: Mutex::new(None),
        }
    }

    /// Reload the last committed state from the store
    pub async fn load_state(&self) -> ConsensusResult<AppStateRow> {
        let state = self.store.app_state().await?.unwrap_or(AppStateRow {
            block_height: 0,
            app_hash: Vec::new(),
        });
        *self.committed.write() = state.clone();
        Ok(state)
    }

    pub fn last_block_height(&self) -> Height {
        self.committed.read().block_height
    }

    pub fn last_app_hash(&self) -> Vec<u8> {
        self.committed.read().app_hash.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn mempool(&self) -> Arc<Mempool> {
        self.mempool.clone()
    }

    pub fn pubsub(&self) -> Arc<TxPubsub> {
        self.pubsub.clone()
    }

    pub fn auditor(&self) -> Arc<SlaAuditor> {
        self.auditor.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn deadline(&self) -> Height {
        self.last_block_height() + self.config.tx_ttl_blocks
    }

    async fn ensure_not_finalized(&self, tx_hash: &TxHash) -> ConsensusResult<()> {
        match self.store.transaction(tx_hash).await? {
            Some(stored) => Err(ConsensusError::AlreadyFinalized {
                tx_hash: tx_hash.clone(),
                height: stored.block_height,
            }),
            None => Ok(()),
        }
    }

    /// Admit a locally submitted transaction and broadcast it to peers
    pub async fn submit(&self, tx: SignedTransaction) -> ConsensusResult<TxHash> {
        let entry = MempoolEntry::new(tx, self.deadline())?;
        let key = entry.hash();
        self.ensure_not_finalized(&key).await?;
        self.mempool.add_transaction(key.clone(), entry)?;
        Ok(key)
    }

    /// Admit canonical bytes forwarded by a peer
    pub async fn submit_forwarded(&self, tx_bytes: Vec<u8>) -> ConsensusResult<TxHash> {
        let entry = MempoolEntry::from_bytes(tx_bytes, self.deadline())?;
        let key = entry.hash();
        self.ensure_not_finalized(&key).await?;
        self.mempool.add_forwarded(key.clone(), entry)?;
        Ok(key)
    }

    async fn proposed_rollup(&self, height: Height, timestamp: i64) -> ConsensusResult<Option<Vec<u8>>> {
        if !self.auditor.should_propose_new_rollup(height).await? {
            return Ok(None);
        }
        let rollup = self.auditor.create_rollup(timestamp, height).await?;
        if rollup.block_end < rollup.block_start {
            return Ok(None);
        }
        let tx = SignedTransaction::unsigned(rollup_request_id(height), Transaction::SlaRollup(rollup));
        Ok(Some(tx.to_bytes()?))
    }

    async fn apply_misbehavior(
        &self,
        tx: &mut Box<dyn BlockTx>,
        height: Height,
        misbehavior: &[Misbehavior],
        updates: &mut ValidatorUpdates,
    ) -> ConsensusResult<()> {
        for evidence in misbehavior {
            match evidence.kind {
                MisbehaviorKind::DuplicateVote => {
                    let address = &evidence.validator_address;
                    tx.insert_jailed_node(&JailedNode {
                        comet_address: address.clone(),
                        jailed_until: height + self.config.jail_blocks,
                    })
                    .await?;

                    match tx.node_by_comet_address(address).await? {
                        Some(node) => {
                            updates.set(
                                address.clone(),
                                ValidatorUpdate {
                                    pub_key: node.pub_key,
                                    power: 0,
                                },
                            );
                            tracing::warn!(height, comet_address = %address, "Jailed validator for duplicate vote");
                        }
                        None => tracing::warn!(
                            height,
                            comet_address = %address,
                            "Duplicate vote from unregistered validator, jailed without power update"
                        ),
                    }
                }
                kind => tracing::warn!(
                    height,
                    comet_address = %evidence.validator_address,
                    ?kind,
                    "Ignoring misbehavior evidence"
                ),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Application for CoreApplication {
    async fn info(&self, request: RequestInfo) -> ConsensusResult<ResponseInfo> {
        let state = self.load_state().await?;
        tracing::info!(
            engine_version = %request.version,
            height = state.block_height,
            app_hash = %hex::encode_upper(&state.app_hash),
            "Info"
        );
        Ok(ResponseInfo {
            data: "cadence".to_string(),
            version: crate::CONSENSUS_VERSION.to_string(),
            app_version: 1,
            last_block_height: state.block_height,
            last_block_app_hash: state.app_hash,
        })
    }

    async fn init_chain(&self, request: RequestInitChain) -> ConsensusResult<ResponseInitChain> {
        tracing::info!(
            chain_id = %request.chain_id,
            initial_height = request.initial_height,
            validators = request.validators.len(),
            "Init chain"
        );
        Ok(ResponseInitChain::default())
    }

    async fn query(&self, request: RequestQuery) -> ConsensusResult<ResponseQuery> {
        let height = self.last_block_height();
        let not_found = |log: String| ResponseQuery {
            code: 1,
            log,
            height,
            ..ResponseQuery::default()
        };

        if let Some(hash) = request.path.strip_prefix("/tx/") {
            let Some(tx_hash) = TxHash::parse(hash) else {
                return Ok(not_found(format!("invalid transaction hash {hash}")));
            };
            return Ok(match self.store.transaction(&tx_hash).await? {
                Some(stored) => ResponseQuery {
                    code: stored.result_code,
                    log: String::new(),
                    key: tx_hash.as_str().as_bytes().to_vec(),
                    value: stored.tx_bytes,
                    height: stored.block_height,
                },
                None => not_found(format!("transaction {tx_hash} not found")),
            });
        }

        if request.path == "/status" {
            let status = serde_json::json!({
                "height": height,
                "app_hash": hex::encode_upper(self.last_app_hash()),
                "mempool": self.mempool.len(),
            });
            return Ok(ResponseQuery {
                value: status.to_string().into_bytes(),
                height,
                ..ResponseQuery::default()
            });
        }

        Ok(not_found(format!("unknown query path {}", request.path)))
    }

    async fn check_tx(&self, request: RequestCheckTx) -> ConsensusResult<ResponseCheckTx> {
        Ok(match SignedTransaction::from_bytes(&request.tx) {
            Ok(_) => ResponseCheckTx::default(),
            Err(e) => ResponseCheckTx {
                code: CODE_DECODE_FAILED,
                log: e.to_string(),
            },
        })
    }

    async fn prepare_proposal(
        &self,
        request: RequestPrepareProposal,
    ) -> ConsensusResult<ResponsePrepareProposal> {
        let height = request.height;
        let mut bytes_left = if request.max_tx_bytes > 0 {
            request.max_tx_bytes
        } else {
            i64::MAX
        };
        let mut budget = self.config.max_block_txs;
        let mut txs = Vec::new();

        match self.proposed_rollup(height, request.time.timestamp()).await {
            Ok(Some(bytes)) => {
                bytes_left -= i64::try_from(bytes.len()).unwrap_or(i64::MAX);
                budget = budget.saturating_sub(1);
                tracing::info!(height, tx_hash = %TxHash::of_bytes(&bytes), "Proposing SLA rollup");
                txs.push(bytes);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(height, error = %e, "Could not build SLA rollup"),
        }

        let mut stale = Vec::new();
        for entry in self.mempool.get_batch(budget, height) {
            // Only the proposer may add a rollup, or two could land in one block
            if entry.tx.kind() == TxKind::SlaRollup {
                continue;
            }
            let tx_hash = entry.hash();
            match self.store.transaction(&tx_hash).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    stale.push(tx_hash);
                    continue;
                }
                Err(e) => {
                    tracing::error!(height, %tx_hash, error = %e, "Could not check transaction");
                    continue;
                }
            }
            let size = i64::try_from(entry.tx_bytes.len()).unwrap_or(i64::MAX);
            if size > bytes_left {
                continue;
            }
            bytes_left -= size;
            txs.push(entry.tx_bytes.clone());
        }

        if !stale.is_empty() {
            let removed = self.mempool.remove_batch(stale.iter());
            tracing::debug!(height, removed, "Dropped already finalized transactions from mempool");
        }
        tracing::debug!(height, txs = txs.len(), "Prepared proposal");
        Ok(ResponsePrepareProposal { txs })
    }

    async fn process_proposal(
        &self,
        request: RequestProcessProposal,
    ) -> ConsensusResult<ResponseProcessProposal> {
        let height = request.height;
        let mut rollups = 0;
        let mut seen = HashSet::with_capacity(request.txs.len());
        let reject = ResponseProcessProposal {
            status: ProposalStatus::Reject,
        };

        for raw in &request.txs {
            let tx_hash = TxHash::of_bytes(raw);
            if !seen.insert(tx_hash.clone()) {
                tracing::warn!(height, proposer = %request.proposer_address, %tx_hash, "Rejecting block with a repeated transaction");
                return Ok(reject);
            }
            match self.store.transaction(&tx_hash).await {
                Ok(None) => {}
                Ok(Some(stored)) => {
                    tracing::warn!(
                        height,
                        proposer = %request.proposer_address,
                        %tx_hash,
                        finalized_at = stored.block_height,
                        "Rejecting block with an already finalized transaction"
                    );
                    return Ok(reject);
                }
                Err(e) => {
                    tracing::error!(height, error = %e, "Could not validate proposal");
                    return Ok(ResponseProcessProposal {
                        status: ProposalStatus::Unknown,
                    });
                }
            }

            let Ok(envelope) = SignedTransaction::from_bytes(raw) else {
                tracing::debug!(height, "Skipping undecodable transaction in proposal");
                continue;
            };

            if envelope.kind() == TxKind::SlaRollup {
                rollups += 1;
                if rollups > 1 {
                    tracing::warn!(height, proposer = %request.proposer_address, "Rejecting block with two SLA rollups");
                    return Ok(reject);
                }
            }

            let ctx = TxContext {
                envelope: &envelope,
                height,
                time: request.time,
            };
            match self.handlers.check_proposal(&ctx, &envelope.transaction).await {
                Ok(()) => {}
                Err(e) if e.is_rejection() => {
                    tracing::warn!(height, proposer = %request.proposer_address, error = %e, "Rejecting proposal");
                    return Ok(reject);
                }
                Err(e) => {
                    tracing::error!(height, error = %e, "Could not validate proposal");
                    return Ok(ResponseProcessProposal {
                        status: ProposalStatus::Unknown,
                    });
                }
            }
        }

        Ok(ResponseProcessProposal {
            status: ProposalStatus::Accept,
        })
    }

    async fn finalize_block(
        &self,
        request: RequestFinalizeBlock,
    ) -> ConsensusResult<ResponseFinalizeBlock> {
        let mut pending = self.pending.lock().await;
        if let Some(block) = pending.as_ref() {
            return Err(ConsensusError::BlockInProgress {
                height: block.height,
            });
        }

        let height = request.height;
        let previous = self
            .store
            .app_state()
            .await?
            .map(|state| state.app_hash)
            .unwrap_or_default();

        let mut tx = self.store.begin_block().await?;
        let mut updates = ValidatorUpdates::default();
        let mut tx_results = Vec::with_capacity(request.txs.len());
        let mut finalized = Vec::with_capacity(request.txs.len());
        let mut seen = HashSet::with_capacity(request.txs.len());

        for (index, raw) in request.txs.iter().enumerate() {
            let tx_hash = TxHash::of_bytes(raw);
            // the first occurrence keeps its receipt, repeats change nothing
            if !seen.insert(tx_hash.clone()) {
                tracing::warn!(height, %tx_hash, "Repeated transaction in block");
                tx_results.push(ExecTxResult::failed(CODE_ALREADY_FINALIZED, "repeated in block"));
                continue;
            }
            if let Some(stored) = self.store.transaction(&tx_hash).await? {
                tracing::warn!(height, %tx_hash, finalized_at = stored.block_height, "Transaction already finalized");
                tx_results.push(ExecTxResult::failed(
                    CODE_ALREADY_FINALIZED,
                    format!("finalized at height {}", stored.block_height),
                ));
                continue;
            }

            let envelope = match SignedTransaction::from_bytes(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(height, %tx_hash, error = %e, "Undecodable transaction in block");
                    tx_results.push(ExecTxResult::failed(CODE_DECODE_FAILED, e.to_string()));
                    continue;
                }
            };

            tx.savepoint().await?;
            let mut block_updates = updates.clone();
            let outcome = {
                let mut scope = BlockScope {
                    tx: &mut tx,
                    height,
                    time: request.time,
                    tx_hash: &tx_hash,
                    envelope: &envelope,
                    validator_updates: &mut block_updates,
                };
                self.handlers.finalize(&mut scope, &envelope.transaction).await
            };

            let result = match outcome {
                Ok(()) => {
                    tx.release_savepoint().await?;
                    updates = block_updates;
                    ExecTxResult::ok()
                }
                Err(e) if e.is_transient() => {
                    // never recorded as a result, the block is retried instead
                    tracing::error!(height, %tx_hash, kind = %envelope.kind(), error = %e, "Abandoning block");
                    if let Err(rollback) = tx.rollback().await {
                        tracing::error!(height, error = %rollback, "Failed to roll back block");
                    }
                    return Err(e);
                }
                Err(e) => {
                    tx.rollback_to_savepoint().await?;
                    tx.release_savepoint().await?;
                    tracing::warn!(height, %tx_hash, kind = %envelope.kind(), error = %e, "Transaction failed");
                    ExecTxResult::failed(CODE_FINALIZE_FAILED, e.to_string())
                }
            };

            let tx_index = i32::try_from(index)
                .map_err(|_| ConsensusError::InvalidTransaction("block too large".to_string()))?;
            tx.insert_transaction(&StoredTransaction {
                tx_hash: tx_hash.clone(),
                block_height: height,
                tx_index,
                tx_bytes: raw.clone(),
                result_code: result.code,
                created_at: request.time,
            })
            .await?;
            tx.insert_tx_stat(&TxStat {
                tx_type: envelope.kind(),
                tx_hash: tx_hash.clone(),
                block_height: height,
                created_at: request.time,
            })
            .await?;

            finalized.push((tx_hash, result.code));
            tx_results.push(result);
        }

        self.apply_misbehavior(&mut tx, height, &request.misbehavior, &mut updates)
            .await?;

        if !request.proposer_address.is_empty() {
            tx.increment_blocks_proposed(&request.proposer_address).await?;
        }

        let app_hash = next_app_hash(&previous, &request.txs);
        tx.upsert_app_state(&AppStateRow {
            block_height: height,
            app_hash: app_hash.clone(),
        })
        .await?;

        let validator_updates = updates.into_vec();
        tracing::info!(
            height,
            txs = request.txs.len(),
            validator_updates = validator_updates.len(),
            app_hash = %hex::encode_upper(&app_hash),
            "Finalized block"
        );

        *pending = Some(PendingBlock {
            height,
            tx,
            finalized,
            app_hash: app_hash.clone(),
        });

        Ok(ResponseFinalizeBlock {
            tx_results,
            validator_updates,
            app_hash,
        })
    }

    async fn commit(&self) -> ConsensusResult<ResponseCommit> {
        let PendingBlock {
            height,
            mut tx,
            finalized,
            app_hash,
        } = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(ConsensusError::NothingToCommit)?;

        if let Err(e) = tx.commit().await {
            tracing::error!(height, error = %e, "Failed to commit block");
            return Err(e.into());
        }

        *self.committed.write() = AppStateRow {
            block_height: height,
            app_hash,
        };

        let removed = self.mempool.remove_batch(finalized.iter().map(|(hash, _)| hash));
        for (tx_hash, code) in &finalized {
            self.pubsub.publish(tx_hash, TxCommitted { height, code: *code });
        }
        tracing::debug!(height, finalized = finalized.len(), removed, "Committed block");

        if self.config.expiry_sweep_interval > 0 && height % self.config.expiry_sweep_interval == 0 {
            let mempool = self.mempool.clone();
            tokio::spawn(async move {
                mempool.remove_expired_transactions(height);
            });
        }

        Ok(ResponseCommit::default())
    }
}
