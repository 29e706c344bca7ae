use super::{BlockScope, TxContext, TxHandler};
use crate::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use cadence_core::ManageEntityLegacy;

/// Legacy entity manager mutations
///
/// Only the presence of the routing fields is checked; the payload itself is
/// interpreted by downstream indexers reading finalized transactions.
pub struct ManageEntityHandler;

#[async_trait]
impl TxHandler for ManageEntityHandler {
    type Payload = ManageEntityLegacy;

    async fn validate(&self, _ctx: &TxContext<'_>, payload: &ManageEntityLegacy) -> ConsensusResult<()> {
        for (field, value) in [
            ("entity_type", &payload.entity_type),
            ("action", &payload.action),
            ("signer", &payload.signer),
        ] {
            if value.trim().is_empty() {
                return Err(ConsensusError::InvalidTransaction(format!(
                    "manage entity: {field} is empty"
                )));
            }
        }
        Ok(())
    }

    async fn finalize(&self, scope: &mut BlockScope<'_>, payload: &ManageEntityLegacy) -> ConsensusResult<()> {
        self.validate(&scope.context(), payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{SignedTransaction, Transaction};

    fn payload() -> ManageEntityLegacy {
        ManageEntityLegacy {
            user_id: 1,
            entity_type: "Playlist".to_string(),
            entity_id: 9,
            action: "Update".to_string(),
            metadata: "{}".to_string(),
            signature: "0x00".to_string(),
            signer: "0xabc".to_string(),
            nonce: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_requires_routing_fields() {
        let envelope = SignedTransaction::unsigned("r", Transaction::ManageEntity(payload()));
        let ctx = TxContext {
            envelope: &envelope,
            height: 1,
            time: chrono::Utc::now(),
        };
        ManageEntityHandler.validate(&ctx, &payload()).await.unwrap();

        let mut missing = payload();
        missing.action = "  ".to_string();
        let err = ManageEntityHandler.validate(&ctx, &missing).await.unwrap_err();
        assert!(err.to_string().contains("action"));
    }
}
