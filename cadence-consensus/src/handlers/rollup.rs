use super::{BlockScope, TxContext, TxHandler};
use crate::sla::SlaAuditor;
use crate::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use cadence_core::SlaRollup;
use std::sync::Arc;

/// Commits SLA rollups and resets the per-validator tallies
pub struct RollupHandler {
    auditor: Arc<SlaAuditor>,
}

impl RollupHandler {
    pub fn new(auditor: Arc<SlaAuditor>) -> Self {
        Self { auditor }
    }
}

#[async_trait]
impl TxHandler for RollupHandler {
    type Payload = SlaRollup;

    async fn validate(&self, ctx: &TxContext<'_>, payload: &SlaRollup) -> ConsensusResult<()> {
        if !self
            .auditor
            .is_valid_rollup(ctx.time.timestamp(), ctx.height, payload)
            .await?
        {
            return Err(ConsensusError::InvalidRollup(format!(
                "rollup {}..={} does not match the local tally at height {}",
                payload.block_start, payload.block_end, ctx.height
            )));
        }
        Ok(())
    }

    async fn finalize(&self, scope: &mut BlockScope<'_>, payload: &SlaRollup) -> ConsensusResult<()> {
        self.validate(&scope.context(), payload).await?;

        // The block may already have committed a rollup of its own
        let last_end = scope
            .tx
            .latest_sla_rollup()
            .await?
            .map_or(0, |rollup| rollup.block_end);
        if payload.block_start != last_end + 1 {
            return Err(ConsensusError::InvalidRollup(format!(
                "rollup starts at {} but the previous one ended at {last_end}",
                payload.block_start
            )));
        }

        scope.tx.insert_sla_rollup(scope.tx_hash, payload).await?;
        scope.tx.clear_sla_counters().await?;
        tracing::info!(
            height = scope.height,
            block_start = payload.block_start,
            block_end = payload.block_end,
            validators = payload.reports.len(),
            "Committed SLA rollup"
        );
        Ok(())
    }
}
