//! Configuration for the Ethereum registry client

use crate::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON-RPC endpoint of the Ethereum node
    pub rpc_url: String,
    /// Address of the `Registry` contract
    pub registry_address: String,
    /// Chain id used when signing registration transactions
    pub chain_id: u64,
    /// Service type the validators register under
    pub service_type: String,
    /// Stake in token wei (decimal string) used for development self-registration
    pub stake_amount: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            registry_address: "0xABbfF712977dB51f9f212B85e8A4904c818C2b63".to_string(),
            chain_id: 31337,
            service_type: "validator".to_string(),
            stake_amount: "200000000000000000000000".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Validate configuration
    pub fn validate(&self) -> RegistryResult<()> {
        if self.rpc_url.is_empty() {
            return Err(RegistryError::Configuration("rpc_url must be set".to_string()));
        }

        if !is_valid_ethereum_address(&self.registry_address) {
            return Err(RegistryError::Configuration(format!(
                "Invalid registry address: {}",
                self.registry_address
            )));
        }

        if self.service_type.is_empty() || self.service_type.len() > 32 {
            return Err(RegistryError::Configuration(
                "service_type must be 1 to 32 bytes".to_string(),
            ));
        }

        if self.stake_amount.is_empty() || !self.stake_amount.chars().all(|c| c.is_ascii_digit()) {
            return Err(RegistryError::Configuration(format!(
                "stake_amount must be a decimal integer, got {:?}",
                self.stake_amount
            )));
        }

        Ok(())
    }
}

/// Validate Ethereum address format
pub fn is_valid_ethereum_address(address: &str) -> bool {
    if !address.starts_with("0x") {
        return false;
    }

    if address.len() != 42 {
        return false;
    }

    address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ethereum_address_validation() {
        assert!(is_valid_ethereum_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_valid_ethereum_address("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_valid_ethereum_address("0x1234"));
        assert!(!is_valid_ethereum_address("0xzz9Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RegistryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_long_service_type_rejected() {
        let config = RegistryConfig {
            service_type: "x".repeat(33),
            ..RegistryConfig::default()
        };
        assert!(matches!(config.validate(), Err(RegistryError::Configuration(_))));
    }
}
