//! In-memory registry for local networks and tests

use crate::{BlockTag, EndpointInfo, RegistryError, RegistryResult, ServiceRegistry};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Entries {
    next_id: u64,
    next_block: u64,
    by_id: BTreeMap<u64, EndpointInfo>,
}

/// Registry held in memory
///
/// Entries are only visible to reads pinned at or after their registration
/// block, which mirrors how an archive node answers historical calls.
#[derive(Debug)]
pub struct StaticServiceRegistry {
    entries: RwLock<Entries>,
    allow_registration: bool,
}

impl Default for StaticServiceRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StaticServiceRegistry {
    /// Create an empty registry; `allow_registration` gates [`ServiceRegistry::register_service_provider`]
    pub fn new(allow_registration: bool) -> Self {
        Self {
            entries: RwLock::new(Entries {
                next_id: 1,
                next_block: 100,
                by_id: BTreeMap::new(),
            }),
            allow_registration,
        }
    }

    /// Insert a registration directly, returning its sp id
    pub fn insert(&self, info: EndpointInfo) -> u64 {
        let mut entries = self.entries.write();
        let id = entries.next_id;
        entries.next_id += 1;
        entries.next_block = entries.next_block.max(info.block_number + 1);
        entries.by_id.insert(id, info);
        id
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.entries.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn visible(info: &EndpointInfo, at: BlockTag) -> bool {
        match at {
            BlockTag::Latest => true,
            BlockTag::Number(number) => info.block_number <= number,
        }
    }
}

#[async_trait]
impl ServiceRegistry for StaticServiceRegistry {
    async fn service_provider_id(&self, endpoint: &str, at: BlockTag) -> RegistryResult<u64> {
        let entries = self.entries.read();
        Ok(entries
            .by_id
            .iter()
            .find(|(_, info)| info.endpoint == endpoint && Self::visible(info, at))
            .map_or(0, |(id, _)| *id))
    }

    async fn endpoint_info(&self, sp_id: u64, at: BlockTag) -> RegistryResult<EndpointInfo> {
        let entries = self.entries.read();
        entries
            .by_id
            .get(&sp_id)
            .filter(|info| Self::visible(info, at))
            .cloned()
            .ok_or_else(|| RegistryError::Contract(format!("no service provider with id {sp_id}")))
    }

    async fn register_service_provider(
        &self,
        endpoint: &str,
        delegate_wallet: &str,
    ) -> RegistryResult<()> {
        if !self.allow_registration {
            return Err(RegistryError::RegistrationNotPermitted);
        }

        let block_number = self.entries.read().next_block;
        self.insert(EndpointInfo {
            owner: delegate_wallet.to_string(),
            endpoint: endpoint.to_string(),
            block_number,
            delegate_owner_wallet: delegate_wallet.to_string(),
        });
        tracing::info!(%endpoint, block_number, "Registered endpoint in static registry");
        Ok(())
    }
}
