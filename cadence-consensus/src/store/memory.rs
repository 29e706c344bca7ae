//! In-memory store for local networks and tests
//!
//! A block transaction records its writes in a journal and reads through it
//! onto the shared state. Commit replays the journal under the write lock, so
//! reads through the store never observe a half-applied block and opening a
//! block or a savepoint copies nothing.

use super::{
    AppStateRow, BlockTx, JailedNode, RegisteredNode, Store, StoreResult, StoredTransaction, TxStat,
};
use crate::error::StoreError;
use async_trait::async_trait;
use cadence_core::{Height, SlaNodeReport, SlaRollup, TrackPlay, TxHash};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    app_state: Option<AppStateRow>,
    /// Keyed by lower-case eth address
    validators: BTreeMap<String, RegisteredNode>,
    jailed: BTreeMap<String, JailedNode>,
    rollups: Vec<(TxHash, SlaRollup)>,
    counters: BTreeMap<String, i32>,
    plays: Vec<(TxHash, Height, TrackPlay)>,
    transactions: HashMap<TxHash, StoredTransaction>,
    tx_stats: Vec<TxStat>,
}

impl State {
    fn node_by_eth_address(&self, eth_address: &str) -> Option<RegisteredNode> {
        self.validators.get(&eth_address.to_ascii_lowercase()).cloned()
    }

    fn node_by_comet_address(&self, comet_address: &str) -> Option<RegisteredNode> {
        self.validators
            .values()
            .find(|node| node.comet_address == comet_address)
            .cloned()
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::Node(node) => {
                self.validators.insert(node.eth_address.to_ascii_lowercase(), node);
            }
            Write::Jail(node) => {
                let entry = self
                    .jailed
                    .entry(node.comet_address.clone())
                    .or_insert_with(|| node.clone());
                entry.jailed_until = entry.jailed_until.max(node.jailed_until);
            }
            Write::Rollup(tx_hash, rollup) => self.rollups.push((tx_hash, rollup)),
            Write::ClearCounters => self.counters.clear(),
            Write::Proposed(address) => *self.counters.entry(address).or_insert(0) += 1,
            Write::Plays(tx_hash, height, plays) => self
                .plays
                .extend(plays.into_iter().map(|play| (tx_hash.clone(), height, play))),
            Write::Transaction(tx) => {
                self.transactions.entry(tx.tx_hash.clone()).or_insert(tx);
            }
            Write::Stat(stat) => self.tx_stats.push(stat),
            Write::AppState(state) => self.app_state = Some(state),
        }
    }

    fn sla_counters(&self) -> Vec<SlaNodeReport> {
        self.counters
            .iter()
            .map(|(address, count)| SlaNodeReport {
                address: address.clone(),
                num_blocks_proposed: *count,
            })
            .collect()
    }
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    fail_commits: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent block commit fail
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Committed plays, in insertion order
    pub fn plays(&self) -> Vec<TrackPlay> {
        self.state.read().plays.iter().map(|(_, _, play)| play.clone()).collect()
    }

    pub fn tx_stats(&self) -> Vec<TxStat> {
        self.state.read().tx_stats.clone()
    }

    /// All committed rollups, oldest first
    pub fn sla_rollups(&self) -> Vec<SlaRollup> {
        self.state.read().rollups.iter().map(|(_, rollup)| rollup.clone()).collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn app_state(&self) -> StoreResult<Option<AppStateRow>> {
        Ok(self.state.read().app_state.clone())
    }

    async fn registered_nodes(&self) -> StoreResult<Vec<RegisteredNode>> {
        Ok(self.state.read().validators.values().cloned().collect())
    }

    async fn node_by_eth_address(&self, eth_address: &str) -> StoreResult<Option<RegisteredNode>> {
        Ok(self.state.read().node_by_eth_address(eth_address))
    }

    async fn latest_sla_rollup(&self) -> StoreResult<Option<SlaRollup>> {
        Ok(self.state.read().rollups.last().map(|(_, rollup)| rollup.clone()))
    }

    async fn sla_counters(&self) -> StoreResult<Vec<SlaNodeReport>> {
        Ok(self.state.read().sla_counters())
    }

    async fn transaction(&self, tx_hash: &TxHash) -> StoreResult<Option<StoredTransaction>> {
        Ok(self.state.read().transactions.get(tx_hash).cloned())
    }

    async fn jailed_nodes(&self) -> StoreResult<Vec<JailedNode>> {
        Ok(self.state.read().jailed.values().cloned().collect())
    }

    async fn begin_block(&self) -> StoreResult<Box<dyn BlockTx>> {
        Ok(Box::new(MemoryBlockTx {
            shared: self.state.clone(),
            fail_commits: self.fail_commits.clone(),
            journal: Vec::new(),
            savepoint: None,
            finished: false,
        }))
    }
}

/// One buffered block write
#[derive(Debug, Clone)]
enum Write {
    Node(RegisteredNode),
    Jail(JailedNode),
    Rollup(TxHash, SlaRollup),
    ClearCounters,
    Proposed(String),
    Plays(TxHash, Height, Vec<TrackPlay>),
    Transaction(StoredTransaction),
    Stat(TxStat),
    AppState(AppStateRow),
}

struct MemoryBlockTx {
    shared: Arc<RwLock<State>>,
    fail_commits: Arc<AtomicBool>,
    journal: Vec<Write>,
    /// Journal length when the savepoint was taken
    savepoint: Option<usize>,
    finished: bool,
}

impl MemoryBlockTx {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::Corrupt("block transaction already closed".to_string()));
        }
        Ok(())
    }

    fn record(&mut self, write: Write) -> StoreResult<()> {
        self.ensure_open()?;
        self.journal.push(write);
        Ok(())
    }

    /// Latest journaled node matching `pred`
    fn journaled_node(&self, pred: impl Fn(&RegisteredNode) -> bool) -> Option<RegisteredNode> {
        self.journal.iter().rev().find_map(|write| match write {
            Write::Node(node) if pred(node) => Some(node.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl BlockTx for MemoryBlockTx {
    async fn savepoint(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.savepoint = Some(self.journal.len());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        let mark = self
            .savepoint
            .take()
            .ok_or_else(|| StoreError::Corrupt("no savepoint to roll back to".to_string()))?;
        self.journal.truncate(mark);
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.savepoint = None;
        Ok(())
    }

    async fn node_by_eth_address(&mut self, eth_address: &str) -> StoreResult<Option<RegisteredNode>> {
        if let Some(node) = self.journaled_node(|node| node.eth_address.eq_ignore_ascii_case(eth_address)) {
            return Ok(Some(node));
        }
        Ok(self.shared.read().node_by_eth_address(eth_address))
    }

    async fn node_by_comet_address(&mut self, comet_address: &str) -> StoreResult<Option<RegisteredNode>> {
        if let Some(node) = self.journaled_node(|node| node.comet_address == comet_address) {
            return Ok(Some(node));
        }
        Ok(self.shared.read().node_by_comet_address(comet_address))
    }

    async fn insert_registered_node(&mut self, node: &RegisteredNode) -> StoreResult<()> {
        self.ensure_open()?;
        if self.node_by_eth_address(&node.eth_address).await?.is_some() {
            return Err(StoreError::Conflict(format!("validator {} exists", node.eth_address)));
        }
        if self.node_by_comet_address(&node.comet_address).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "consensus address {} exists",
                node.comet_address
            )));
        }
        self.record(Write::Node(node.clone()))
    }

    async fn insert_jailed_node(&mut self, node: &JailedNode) -> StoreResult<()> {
        self.record(Write::Jail(node.clone()))
    }

    async fn latest_sla_rollup(&mut self) -> StoreResult<Option<SlaRollup>> {
        let journaled = self.journal.iter().rev().find_map(|write| match write {
            Write::Rollup(_, rollup) => Some(rollup.clone()),
            _ => None,
        });
        if journaled.is_some() {
            return Ok(journaled);
        }
        Ok(self.shared.read().rollups.last().map(|(_, rollup)| rollup.clone()))
    }

    async fn insert_sla_rollup(&mut self, tx_hash: &TxHash, rollup: &SlaRollup) -> StoreResult<()> {
        self.ensure_open()?;
        let journaled = self
            .journal
            .iter()
            .any(|write| matches!(write, Write::Rollup(hash, _) if hash == tx_hash));
        if journaled || self.shared.read().rollups.iter().any(|(hash, _)| hash == tx_hash) {
            return Err(StoreError::Conflict(format!("rollup {tx_hash} exists")));
        }
        self.record(Write::Rollup(tx_hash.clone(), rollup.clone()))
    }

    async fn clear_sla_counters(&mut self) -> StoreResult<()> {
        self.record(Write::ClearCounters)
    }

    async fn increment_blocks_proposed(&mut self, address: &str) -> StoreResult<()> {
        self.record(Write::Proposed(address.to_string()))
    }

    async fn insert_plays(&mut self, tx_hash: &TxHash, height: Height, plays: &[TrackPlay]) -> StoreResult<()> {
        self.record(Write::Plays(tx_hash.clone(), height, plays.to_vec()))
    }

    async fn insert_transaction(&mut self, tx: &StoredTransaction) -> StoreResult<()> {
        self.record(Write::Transaction(tx.clone()))
    }

    async fn insert_tx_stat(&mut self, stat: &TxStat) -> StoreResult<()> {
        self.record(Write::Stat(stat.clone()))
    }

    async fn upsert_app_state(&mut self, state: &AppStateRow) -> StoreResult<()> {
        self.record(Write::AppState(state.clone()))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.finished = true;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("commit failure injected".to_string()));
        }
        let mut state = self.shared.write();
        for write in self.journal.drain(..) {
            state.apply(write);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.finished = true;
        self.savepoint = None;
        self.journal.clear();
        Ok(())
    }
}
