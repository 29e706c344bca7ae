use super::{BlockScope, TxContext, TxHandler};
use crate::abci::ValidatorUpdate;
use crate::store::RegisteredNode;
use crate::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use cadence_core::ValidatorRegistration;
use cadence_registry::{verify_registration, RegistryError, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;

/// How often a registry read is retried before the block is abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RegistryRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Admits validators whose registration matches the Ethereum registry
///
/// Registry verdicts are deterministic once the registry answers. A registry
/// that cannot be reached is retried and then surfaces as a transient error,
/// which halts the block instead of recording a failure other validators
/// would not see.
pub struct RegistrationHandler {
    registry: Arc<dyn ServiceRegistry>,
    retry: RegistryRetry,
}

impl RegistrationHandler {
    pub fn new(registry: Arc<dyn ServiceRegistry>, retry: RegistryRetry) -> Self {
        Self { registry, retry }
    }

    async fn verify(&self, payload: &ValidatorRegistration, signer: &str) -> ConsensusResult<()> {
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.backoff;
        for attempt in 1..=attempts {
            match verify_registration(self.registry.as_ref(), payload, signer).await {
                Ok(()) => return Ok(()),
                Err(e @ (RegistryError::Rpc(_) | RegistryError::Contract(_))) if attempt < attempts => {
                    tracing::warn!(attempt, attempts, error = %e, "Registry unavailable, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ConsensusError::Registry(RegistryError::Rpc(
            "registry retries exhausted".to_string(),
        )))
    }
}

#[async_trait]
impl TxHandler for RegistrationHandler {
    type Payload = ValidatorRegistration;

    async fn validate(&self, ctx: &TxContext<'_>, payload: &ValidatorRegistration) -> ConsensusResult<()> {
        if payload.power <= 0 {
            return Err(ConsensusError::InvalidTransaction(format!(
                "registration power must be positive, got {}",
                payload.power
            )));
        }
        let signer = ctx.envelope.signer().map_err(|e| {
            ConsensusError::InvalidTransaction(format!("registration signature: {e}"))
        })?;
        self.verify(payload, &signer).await
    }

    async fn finalize(&self, scope: &mut BlockScope<'_>, payload: &ValidatorRegistration) -> ConsensusResult<()> {
        self.validate(&scope.context(), payload).await?;

        let signer = scope.envelope.signer()?;
        if scope.tx.node_by_eth_address(&signer).await?.is_some() {
            return Err(ConsensusError::DuplicateValidator(signer));
        }

        let node = RegisteredNode {
            eth_address: signer,
            comet_address: payload.comet_address.clone(),
            pub_key: payload.pub_key.clone(),
            endpoint: payload.endpoint.clone(),
            node_type: payload.node_type.clone(),
            sp_id: payload.sp_id,
            eth_block: payload.eth_block,
        };
        scope.tx.insert_registered_node(&node).await?;

        scope.validator_updates.set(
            node.comet_address.clone(),
            ValidatorUpdate {
                pub_key: node.pub_key.clone(),
                power: payload.power,
            },
        );
        tracing::info!(
            height = scope.height,
            eth_address = %node.eth_address,
            comet_address = %node.comet_address,
            endpoint = %node.endpoint,
            "Registered validator"
        );
        Ok(())
    }
}
