use super::{BlockScope, TxContext, TxHandler};
use crate::ConsensusResult;
use async_trait::async_trait;
use cadence_core::TrackPlays;

/// Records play events
///
/// Plays carry per-play client signatures that are stored but not verified,
/// and there is no replay protection beyond the transaction hash.
pub struct PlaysHandler;

#[async_trait]
impl TxHandler for PlaysHandler {
    type Payload = TrackPlays;

    async fn validate(&self, _ctx: &TxContext<'_>, _payload: &TrackPlays) -> ConsensusResult<()> {
        Ok(())
    }

    async fn finalize(&self, scope: &mut BlockScope<'_>, payload: &TrackPlays) -> ConsensusResult<()> {
        scope
            .tx
            .insert_plays(scope.tx_hash, scope.height, &payload.plays)
            .await?;
        tracing::debug!(tx_hash = %scope.tx_hash, plays = payload.plays.len(), "Recorded plays");
        Ok(())
    }
}
