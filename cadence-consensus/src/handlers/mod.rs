//! Per-variant transaction handlers
//!
//! [`HandlerRegistry`] owns one handler per [`Transaction`] variant and
//! dispatches with an exhaustive match, so a new variant fails to compile
//! until it has a handler.

mod entity;
mod plays;
mod registration;
mod rollup;

pub use entity::ManageEntityHandler;
pub use plays::PlaysHandler;
pub use registration::{RegistrationHandler, RegistryRetry};
pub use rollup::RollupHandler;

use crate::abci::ValidatorUpdate;
use crate::sla::SlaAuditor;
use crate::store::BlockTx;
use crate::ConsensusResult;
use async_trait::async_trait;
use cadence_core::{Height, SignedTransaction, Transaction, TxHash};
use cadence_registry::ServiceRegistry;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Block facts available to validation
#[derive(Debug, Clone, Copy)]
pub struct TxContext<'a> {
    pub envelope: &'a SignedTransaction,
    pub height: Height,
    pub time: DateTime<Utc>,
}

/// Validator power changes of one block, last write per consensus address wins
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidatorUpdates(BTreeMap<String, ValidatorUpdate>);

impl ValidatorUpdates {
    pub fn set(&mut self, comet_address: impl Into<String>, update: ValidatorUpdate) {
        self.0.insert(comet_address.into(), update);
    }

    pub fn get(&self, comet_address: &str) -> Option<&ValidatorUpdate> {
        self.0.get(comet_address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Updates ordered by consensus address
    pub fn into_vec(self) -> Vec<ValidatorUpdate> {
        self.0.into_values().collect()
    }
}

/// Everything a handler may touch while finalizing one transaction
pub struct BlockScope<'a> {
    pub tx: &'a mut Box<dyn BlockTx>,
    pub height: Height,
    pub time: DateTime<Utc>,
    pub tx_hash: &'a TxHash,
    pub envelope: &'a SignedTransaction,
    pub validator_updates: &'a mut ValidatorUpdates,
}

impl BlockScope<'_> {
    pub fn context(&self) -> TxContext<'_> {
        TxContext {
            envelope: self.envelope,
            height: self.height,
            time: self.time,
        }
    }
}

#[async_trait]
pub trait TxHandler: Send + Sync {
    type Payload: Send + Sync;

    /// Reject a payload that can never be applied
    async fn validate(&self, ctx: &TxContext<'_>, payload: &Self::Payload) -> ConsensusResult<()>;

    /// Apply the payload inside the open block transaction
    async fn finalize(&self, scope: &mut BlockScope<'_>, payload: &Self::Payload) -> ConsensusResult<()>;
}

pub struct HandlerRegistry {
    plays: PlaysHandler,
    entity: ManageEntityHandler,
    registration: RegistrationHandler,
    rollup: RollupHandler,
}

impl HandlerRegistry {
    pub fn new(registry: Arc<dyn ServiceRegistry>, auditor: Arc<SlaAuditor>, retry: RegistryRetry) -> Self {
        Self {
            plays: PlaysHandler,
            entity: ManageEntityHandler,
            registration: RegistrationHandler::new(registry, retry),
            rollup: RollupHandler::new(auditor),
        }
    }

    pub async fn validate(&self, ctx: &TxContext<'_>, tx: &Transaction) -> ConsensusResult<()> {
        match tx {
            Transaction::Plays(payload) => self.plays.validate(ctx, payload).await,
            Transaction::ManageEntity(payload) => self.entity.validate(ctx, payload).await,
            Transaction::ValidatorRegistration(payload) => self.registration.validate(ctx, payload).await,
            Transaction::SlaRollup(payload) => self.rollup.validate(ctx, payload).await,
        }
    }

    /// Checks run by every validator on a proposed block
    ///
    /// Registrations are left to finalization because their check reads the
    /// Ethereum registry.
    pub async fn check_proposal(&self, ctx: &TxContext<'_>, tx: &Transaction) -> ConsensusResult<()> {
        match tx {
            Transaction::ValidatorRegistration(_) => Ok(()),
            other => self.validate(ctx, other).await,
        }
    }

    pub async fn finalize(&self, scope: &mut BlockScope<'_>, tx: &Transaction) -> ConsensusResult<()> {
        match tx {
            Transaction::Plays(payload) => self.plays.finalize(scope, payload).await,
            Transaction::ManageEntity(payload) => self.entity.finalize(scope, payload).await,
            Transaction::ValidatorRegistration(payload) => self.registration.finalize(scope, payload).await,
            Transaction::SlaRollup(payload) => self.rollup.finalize(scope, payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use cadence_core::{TrackPlays, ValidatorRegistration};
    use cadence_registry::StaticServiceRegistry;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(
            Arc::new(StaticServiceRegistry::default()),
            Arc::new(SlaAuditor::new(Arc::new(MemoryStore::new()), 10)),
            RegistryRetry::default(),
        )
    }

    fn update(power: i64) -> ValidatorUpdate {
        ValidatorUpdate {
            pub_key: vec![1; 32],
            power,
        }
    }

    #[test]
    fn test_last_update_per_address_wins() {
        let mut updates = ValidatorUpdates::default();
        updates.set("B", update(10));
        updates.set("A", update(10));
        updates.set("B", update(0));

        assert_eq!(updates.len(), 2);
        assert_eq!(updates.get("B"), Some(&update(0)));
        assert_eq!(updates.into_vec().iter().map(|u| u.power).collect::<Vec<_>>(), vec![10, 0]);
    }

    #[tokio::test]
    async fn test_proposal_check_defers_registrations() {
        let handlers = registry();
        // unsigned, unregistered and zero power: only finalization would catch it
        let registration = Transaction::ValidatorRegistration(ValidatorRegistration {
            endpoint: "https://nowhere.example".to_string(),
            comet_address: "ABC".to_string(),
            eth_block: 1,
            node_type: "validator".to_string(),
            sp_id: 1,
            pub_key: vec![0; 32],
            power: 0,
        });
        let envelope = SignedTransaction::unsigned("r", registration.clone());
        let ctx = TxContext {
            envelope: &envelope,
            height: 3,
            time: Utc::now(),
        };

        handlers.check_proposal(&ctx, &registration).await.unwrap();
        assert!(handlers.validate(&ctx, &registration).await.is_err());

        let plays = Transaction::Plays(TrackPlays { plays: vec![] });
        handlers.check_proposal(&ctx, &plays).await.unwrap();
    }
}
