//! SLA rollup auditor
//!
//! A rollup summarizes how many blocks each validator proposed since the
//! previous rollup. The proposer builds one when the interval has elapsed and
//! every other validator rebuilds it from its own committed counters; a block
//! is only accepted when both are identical.

use crate::store::Store;
use crate::ConsensusResult;
use cadence_core::{Height, SlaNodeReport, SlaRollup};
use std::sync::Arc;
use std::time::Duration;

/// Default number of blocks between rollups
pub const DEFAULT_ROLLUP_INTERVAL: Height = 2048;

/// Build a rollup from committed state
///
/// `last_end` is the `block_end` of the previous rollup, or 0 before the first.
/// Reports are sorted by address so every node serializes the same bytes.
pub fn build_rollup(
    last_end: Height,
    mut counters: Vec<SlaNodeReport>,
    timestamp: i64,
    height: Height,
) -> SlaRollup {
    counters.sort_by(|a, b| a.address.cmp(&b.address));
    SlaRollup {
        block_start: last_end + 1,
        block_end: height - 1,
        timestamp,
        reports: counters,
    }
}

/// Snapshot used by the periodic monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaStatus {
    pub height: Height,
    pub last_rollup_end: Height,
    pub blocks_since_rollup: Height,
    pub counters: Vec<SlaNodeReport>,
}

pub struct SlaAuditor {
    store: Arc<dyn Store>,
    interval: Height,
}

impl SlaAuditor {
    pub fn new(store: Arc<dyn Store>, interval: Height) -> Self {
        Self {
            store,
            interval: interval.max(1),
        }
    }

    pub fn interval(&self) -> Height {
        self.interval
    }

    async fn last_rollup_end(&self) -> ConsensusResult<Height> {
        Ok(self
            .store
            .latest_sla_rollup()
            .await?
            .map_or(0, |rollup| rollup.block_end))
    }

    pub async fn should_propose_new_rollup(&self, height: Height) -> ConsensusResult<bool> {
        Ok(height - self.last_rollup_end().await? >= self.interval)
    }

    pub async fn create_rollup(&self, timestamp: i64, height: Height) -> ConsensusResult<SlaRollup> {
        let last_end = self.last_rollup_end().await?;
        let counters = self.store.sla_counters().await?;
        Ok(build_rollup(last_end, counters, timestamp, height))
    }

    /// A rollup is due at `height` and equals the locally built one, report order included
    pub async fn is_valid_rollup(
        &self,
        timestamp: i64,
        height: Height,
        candidate: &SlaRollup,
    ) -> ConsensusResult<bool> {
        if candidate.block_end < candidate.block_start {
            tracing::warn!(
                height,
                block_start = candidate.block_start,
                block_end = candidate.block_end,
                "SLA rollup covers no blocks"
            );
            return Ok(false);
        }
        if !self.should_propose_new_rollup(height).await? {
            tracing::warn!(height, interval = self.interval, "SLA rollup proposed before the interval elapsed");
            return Ok(false);
        }

        let expected = self.create_rollup(timestamp, height).await?;
        if &expected != candidate {
            tracing::warn!(
                height,
                expected_start = expected.block_start,
                expected_end = expected.block_end,
                candidate_start = candidate.block_start,
                candidate_end = candidate.block_end,
                expected_reports = expected.reports.len(),
                candidate_reports = candidate.reports.len(),
                "SLA rollup does not match local tally"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn status(&self) -> ConsensusResult<SlaStatus> {
        let height = self
            .store
            .app_state()
            .await?
            .map_or(0, |state| state.block_height);
        let last_rollup_end = self.last_rollup_end().await?;
        Ok(SlaStatus {
            height,
            last_rollup_end,
            blocks_since_rollup: height - last_rollup_end,
            counters: self.store.sla_counters().await?,
        })
    }
}

/// Log the running tally every `period`; read only
pub async fn run_sla_monitor(auditor: Arc<SlaAuditor>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        match auditor.status().await {
            Ok(status) => tracing::info!(
                height = status.height,
                last_rollup_end = status.last_rollup_end,
                blocks_since_rollup = status.blocks_since_rollup,
                interval = auditor.interval(),
                validators = status.counters.len(),
                proposed = status.counters.iter().map(|c| i64::from(c.num_blocks_proposed)).sum::<i64>(),
                "SLA tally"
            ),
            Err(e) => tracing::warn!(error = %e, "Could not read SLA tally"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BlockTx, MemoryStore};
    use cadence_core::TxHash;
    use proptest::prelude::*;

    fn report(address: &str, n: i32) -> SlaNodeReport {
        SlaNodeReport {
            address: address.to_string(),
            num_blocks_proposed: n,
        }
    }

    async fn store_with(counters: &[(&str, i32)], last_end: Option<Height>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin_block().await.unwrap();
        if let Some(end) = last_end {
            let rollup = build_rollup(0, vec![], 1, end + 1);
            tx.insert_sla_rollup(&TxHash::of_bytes(b"r"), &rollup).await.unwrap();
        }
        for (address, n) in counters {
            for _ in 0..*n {
                tx.increment_blocks_proposed(address).await.unwrap();
            }
        }
        tx.commit().await.unwrap();
        store
    }

    #[test]
    fn test_build_rollup_range_and_order() {
        let rollup = build_rollup(10, vec![report("BB", 2), report("AA", 3)], 99, 23);
        assert_eq!(rollup.block_start, 11);
        assert_eq!(rollup.block_end, 22);
        assert_eq!(rollup.timestamp, 99);
        assert_eq!(rollup.reports, vec![report("AA", 3), report("BB", 2)]);
    }

    #[tokio::test]
    async fn test_should_propose_after_interval() {
        let auditor = SlaAuditor::new(store_with(&[], None).await, 12);
        assert!(!auditor.should_propose_new_rollup(11).await.unwrap());
        assert!(auditor.should_propose_new_rollup(12).await.unwrap());

        let auditor = SlaAuditor::new(store_with(&[], Some(11)).await, 12);
        assert!(!auditor.should_propose_new_rollup(22).await.unwrap());
        assert!(auditor.should_propose_new_rollup(23).await.unwrap());
    }

    #[tokio::test]
    async fn test_created_rollup_is_valid_and_mutations_are_not() {
        let store = store_with(&[("AA", 4), ("BB", 7)], Some(11)).await;
        let auditor = SlaAuditor::new(store, 12);
        let rollup = auditor.create_rollup(1_700_000_000, 24).await.unwrap();
        assert_eq!(rollup.block_start, 12);
        assert_eq!(rollup.block_end, 23);
        assert!(auditor.is_valid_rollup(1_700_000_000, 24, &rollup).await.unwrap());

        let mut later = rollup.clone();
        later.timestamp += 1;
        assert!(!auditor.is_valid_rollup(1_700_000_000, 24, &later).await.unwrap());

        let mut shifted = rollup.clone();
        shifted.block_start -= 1;
        assert!(!auditor.is_valid_rollup(1_700_000_000, 24, &shifted).await.unwrap());

        let mut inflated = rollup.clone();
        inflated.reports[1].num_blocks_proposed += 1;
        assert!(!auditor.is_valid_rollup(1_700_000_000, 24, &inflated).await.unwrap());

        let mut reordered = rollup;
        reordered.reports.reverse();
        assert!(!auditor.is_valid_rollup(1_700_000_000, 24, &reordered).await.unwrap());
    }

    #[tokio::test]
    async fn test_rollup_before_interval_is_invalid() {
        let auditor = SlaAuditor::new(store_with(&[("AA", 2)], None).await, 12);
        // a faithful tally of blocks 1..=2, but only three blocks into a twelve block interval
        let early = build_rollup(0, vec![report("AA", 2)], 7, 3);
        assert_eq!(auditor.create_rollup(7, 3).await.unwrap(), early);
        assert!(!auditor.is_valid_rollup(7, 3, &early).await.unwrap());

        let due = auditor.create_rollup(7, 12).await.unwrap();
        assert!(auditor.is_valid_rollup(7, 12, &due).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_range_rollup_is_invalid() {
        let auditor = SlaAuditor::new(store_with(&[], Some(5)).await, 1);
        // at last_end + 1 the rebuilt range is 6..=5
        let inverted = auditor.create_rollup(7, 6).await.unwrap();
        assert!(inverted.block_end < inverted.block_start);
        assert!(!auditor.is_valid_rollup(7, 6, &inverted).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reports_tally() {
        let auditor = SlaAuditor::new(store_with(&[("AA", 2)], Some(5)).await, 12);
        let status = auditor.status().await.unwrap();
        assert_eq!(status.last_rollup_end, 5);
        assert_eq!(status.counters, vec![report("AA", 2)]);
    }

    proptest! {
        #[test]
        fn prop_rollup_is_independent_of_counter_order(
            counts in proptest::collection::btree_map("[A-F0-9]{4}", 1i32..100, 0..12),
            last_end in 0i64..1000,
            gap in 1i64..500,
            timestamp in 0i64..2_000_000_000,
        ) {
            let reports: Vec<_> = counts
                .into_iter()
                .map(|(address, n)| report(&address, n))
                .collect();
            let mut reversed = reports.clone();
            reversed.reverse();

            let height = last_end + gap;
            let a = build_rollup(last_end, reports, timestamp, height);
            let b = build_rollup(last_end, reversed, timestamp, height);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.block_start, last_end + 1);
            prop_assert_eq!(a.block_end, height - 1);
        }
    }
}
