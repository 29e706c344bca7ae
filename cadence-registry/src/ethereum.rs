//! Ethereum implementation of the service-provider registry
//!
//! Contract addresses are resolved through the `Registry` contract at the same
//! block as the read they serve, so a pinned read never mixes state from two
//! different blocks.

use crate::{BlockTag, EndpointInfo, RegistryConfig, RegistryError, RegistryResult, ServiceRegistry};
use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockId, BlockNumber, U256, U64};
use ethers::utils::{format_bytes32_string, to_checksum};
use std::str::FromStr;
use std::sync::Arc;

abigen!(
    RegistryContract,
    r#"[
        function getContract(bytes32 _name) external view returns (address)
    ]"#
);

abigen!(
    ServiceProviderFactory,
    r#"[
        function getServiceProviderIdFromEndpoint(string _endpoint) external view returns (uint256)
        function getServiceEndpointInfo(bytes32 _serviceType, uint256 _serviceId) external view returns (address owner, string endpoint, uint256 blockNumber, address delegateOwnerWallet)
        function register(bytes32 _serviceType, string _endpoint, uint256 _stakeAmount, address _delegateOwnerWallet) external returns (uint256)
    ]"#
);

abigen!(
    StakingToken,
    r#"[
        function approve(address spender, uint256 value) external returns (bool)
    ]"#
);

const SERVICE_PROVIDER_FACTORY: &str = "ServiceProviderFactory";
const STAKING_PROXY: &str = "StakingProxy";
const TOKEN: &str = "Token";

type SigningClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Registry client backed by an Ethereum JSON-RPC endpoint
pub struct EthServiceRegistry {
    config: RegistryConfig,
    registry_address: Address,
    service_type: [u8; 32],
    provider: Arc<Provider<Http>>,
    signer: Option<Arc<SigningClient>>,
}

impl EthServiceRegistry {
    /// Connect to the configured RPC endpoint
    ///
    /// `signer_key` is only needed for development self-registration.
    pub fn connect(config: RegistryConfig, signer_key: Option<&str>) -> RegistryResult<Self> {
        config.validate()?;

        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| RegistryError::Configuration(format!("Invalid rpc_url: {e}")))?;
        let registry_address = parse_address(&config.registry_address)?;
        let service_type = format_bytes32_string(&config.service_type)
            .map_err(|e| RegistryError::Configuration(e.to_string()))?;

        let signer = match signer_key {
            Some(key) => {
                let wallet = LocalWallet::from_str(key.trim_start_matches("0x"))
                    .map_err(|e| RegistryError::Configuration(format!("Invalid signer key: {e}")))?
                    .with_chain_id(config.chain_id);
                Some(Arc::new(SignerMiddleware::new(provider.clone(), wallet)))
            }
            None => None,
        };

        tracing::info!(
            rpc_url = %config.rpc_url,
            registry = %config.registry_address,
            "Initialized Ethereum registry client"
        );

        Ok(Self {
            config,
            registry_address,
            service_type,
            provider: Arc::new(provider),
            signer,
        })
    }

    /// Latest Ethereum block number
    pub async fn latest_block(&self) -> RegistryResult<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| RegistryError::Rpc(e.to_string()))?;
        Ok(number.as_u64())
    }

    async fn resolve<M: Middleware + 'static>(
        &self,
        client: Arc<M>,
        name: &str,
        at: BlockTag,
    ) -> RegistryResult<Address> {
        let registry = RegistryContract::new(self.registry_address, client);
        let key = format_bytes32_string(name).map_err(|e| RegistryError::Configuration(e.to_string()))?;
        let address = registry
            .get_contract(key)
            .block(block_id(at))
            .call()
            .await
            .map_err(|e| RegistryError::Contract(format!("getContract({name}): {e}")))?;

        if address == Address::zero() {
            return Err(RegistryError::Contract(format!("{name} is not registered")));
        }
        Ok(address)
    }
}

#[async_trait]
impl ServiceRegistry for EthServiceRegistry {
    async fn service_provider_id(&self, endpoint: &str, at: BlockTag) -> RegistryResult<u64> {
        let factory_address = self
            .resolve(self.provider.clone(), SERVICE_PROVIDER_FACTORY, at)
            .await?;
        let factory = ServiceProviderFactory::new(factory_address, self.provider.clone());

        let sp_id = factory
            .get_service_provider_id_from_endpoint(endpoint.to_string())
            .block(block_id(at))
            .call()
            .await
            .map_err(|e| RegistryError::Contract(format!("getServiceProviderIdFromEndpoint: {e}")))?;

        u256_to_u64(sp_id)
    }

    async fn endpoint_info(&self, sp_id: u64, at: BlockTag) -> RegistryResult<EndpointInfo> {
        let factory_address = self
            .resolve(self.provider.clone(), SERVICE_PROVIDER_FACTORY, at)
            .await?;
        let factory = ServiceProviderFactory::new(factory_address, self.provider.clone());

        let (owner, endpoint, block_number, delegate_owner_wallet) = factory
            .get_service_endpoint_info(self.service_type, U256::from(sp_id))
            .block(block_id(at))
            .call()
            .await
            .map_err(|e| RegistryError::Contract(format!("getServiceEndpointInfo: {e}")))?;

        Ok(EndpointInfo {
            owner: to_checksum(&owner, None),
            endpoint,
            block_number: u256_to_u64(block_number)?,
            delegate_owner_wallet: to_checksum(&delegate_owner_wallet, None),
        })
    }

    async fn register_service_provider(
        &self,
        endpoint: &str,
        delegate_wallet: &str,
    ) -> RegistryResult<()> {
        let client = self.signer.clone().ok_or_else(|| {
            RegistryError::Configuration("self registration requires a signer key".to_string())
        })?;

        let stake = U256::from_dec_str(&self.config.stake_amount)
            .map_err(|e| RegistryError::Configuration(format!("Invalid stake_amount: {e}")))?;
        let delegate = parse_address(delegate_wallet)?;

        let token_address = self.resolve(client.clone(), TOKEN, BlockTag::Latest).await?;
        let staking_address = self.resolve(client.clone(), STAKING_PROXY, BlockTag::Latest).await?;
        let factory_address = self
            .resolve(client.clone(), SERVICE_PROVIDER_FACTORY, BlockTag::Latest)
            .await?;

        tracing::info!(%endpoint, %delegate_wallet, "Approving stake for self registration");
        let token = StakingToken::new(token_address, client.clone());
        let approve = token.approve(staking_address, stake);
        let pending = approve
            .send()
            .await
            .map_err(|e| RegistryError::Contract(format!("approve: {e}")))?;
        pending.await.map_err(|e| RegistryError::Rpc(e.to_string()))?;

        tracing::info!(%endpoint, "Registering service provider");
        let factory = ServiceProviderFactory::new(factory_address, client);
        let register = factory.register(self.service_type, endpoint.to_string(), stake, delegate);
        let pending = register
            .send()
            .await
            .map_err(|e| RegistryError::Contract(format!("register: {e}")))?;
        let receipt = pending.await.map_err(|e| RegistryError::Rpc(e.to_string()))?;

        match receipt {
            Some(receipt) if receipt.status == Some(U64::from(1)) => {
                tracing::info!(tx = ?receipt.transaction_hash, "Service provider registered");
                Ok(())
            }
            Some(receipt) => Err(RegistryError::Contract(format!(
                "register reverted in tx {:?}",
                receipt.transaction_hash
            ))),
            None => Err(RegistryError::Rpc("register transaction dropped".to_string())),
        }
    }
}

fn block_id(at: BlockTag) -> BlockId {
    match at {
        BlockTag::Latest => BlockId::Number(BlockNumber::Latest),
        BlockTag::Number(number) => BlockId::Number(BlockNumber::Number(U64::from(number))),
    }
}

fn parse_address(address: &str) -> RegistryResult<Address> {
    Address::from_str(address)
        .map_err(|e| RegistryError::Configuration(format!("Invalid address {address}: {e}")))
}

fn u256_to_u64(value: U256) -> RegistryResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(RegistryError::Contract(format!("value {value} does not fit in u64")));
    }
    Ok(value.as_u64())
}
