//! Cross-check of a validator registration against the Ethereum registry
//!
//! Every validator evaluates the same registration independently, so each
//! contract read is pinned to the Ethereum block named in the transaction
//! instead of whatever the local RPC node considers latest.

use crate::{BlockTag, RegistryError, RegistryResult, ServiceRegistry};
use cadence_core::crypto::{consensus_address_from_slice, same_eth_address};
use cadence_core::ValidatorRegistration;

/// Accept `registration` only if it matches the registry exactly
///
/// `signer` is the wallet address recovered from the transaction signature.
pub async fn verify_registration(
    registry: &dyn ServiceRegistry,
    registration: &ValidatorRegistration,
    signer: &str,
) -> RegistryResult<()> {
    let derived = consensus_address_from_slice(&registration.pub_key)?;
    if derived != registration.comet_address {
        return Err(RegistryError::ConsensusAddressMismatch {
            claimed: registration.comet_address.clone(),
            derived,
        });
    }

    let at = BlockTag::Number(registration.eth_block);
    let sp_id = registry.service_provider_id(&registration.endpoint, at).await?;
    if sp_id == 0 {
        return Err(RegistryError::NotRegistered {
            endpoint: registration.endpoint.clone(),
            block: registration.eth_block,
        });
    }
    if sp_id != registration.sp_id {
        return Err(RegistryError::SpIdMismatch {
            claimed: registration.sp_id,
            actual: sp_id,
        });
    }

    let info = registry.endpoint_info(sp_id, at).await?;

    if !same_eth_address(&info.delegate_owner_wallet, signer) {
        return Err(RegistryError::WalletMismatch {
            signer: signer.to_string(),
            registered: info.delegate_owner_wallet,
        });
    }

    if info.block_number != registration.eth_block {
        return Err(RegistryError::BlockMismatch {
            claimed: registration.eth_block,
            actual: info.block_number,
        });
    }

    if info.endpoint != registration.endpoint {
        return Err(RegistryError::EndpointMismatch {
            claimed: registration.endpoint.clone(),
            actual: info.endpoint,
        });
    }

    Ok(())
}
