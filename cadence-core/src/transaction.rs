//! Transaction envelope, payload variants and the canonical codec
//!
//! Every node must derive the same bytes, and therefore the same [`TxHash`],
//! for a given transaction. The codec is fixed here and used for both the
//! wire format and hashing.

use crate::crypto::{recover_signer, sha256, NodeIdentity};
use crate::{Height, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on a single encoded transaction
pub const MAX_TX_BYTES: u64 = 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_TX_BYTES)
        .reject_trailing_bytes()
}

/// Hash of a transaction's canonical bytes, upper-case hex SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Hash raw transaction bytes the way the consensus engine does
    pub fn of_bytes(tx_bytes: &[u8]) -> Self {
        TxHash(hex::encode_upper(sha256(tx_bytes)))
    }

    /// Parse a user supplied hash, normalising case and prefix
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim().trim_start_matches("0x");
        if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(TxHash(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single play event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPlay {
    pub user_id: String,
    pub track_id: String,
    /// Unix seconds
    pub timestamp: i64,
    pub signature: String,
    pub city: String,
    pub region: String,
    pub country: String,
}

/// Batch of play events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPlays {
    pub plays: Vec<TrackPlay>,
}

/// Entity manager mutation carried over from the legacy indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageEntityLegacy {
    pub user_id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub action: String,
    pub metadata: String,
    pub signature: String,
    pub signer: String,
    pub nonce: String,
}

/// Request to join the validator set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistration {
    pub endpoint: String,
    pub comet_address: String,
    /// Ethereum block at which the service provider was registered
    pub eth_block: u64,
    pub node_type: String,
    pub sp_id: u64,
    /// ed25519 consensus public key
    pub pub_key: Vec<u8>,
    pub power: i64,
}

/// Block production count for one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaNodeReport {
    pub address: String,
    pub num_blocks_proposed: i32,
}

/// Summary of block production over `block_start..=block_end`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaRollup {
    pub block_start: Height,
    pub block_end: Height,
    /// Unix seconds of the block that carries the rollup
    pub timestamp: i64,
    pub reports: Vec<SlaNodeReport>,
}

/// Payload variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Plays(TrackPlays),
    ManageEntity(ManageEntityLegacy),
    ValidatorRegistration(ValidatorRegistration),
    SlaRollup(SlaRollup),
}

/// Discriminant of [`Transaction`], used for dispatch and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxKind {
    Plays,
    ManageEntity,
    ValidatorRegistration,
    SlaRollup,
}

impl TxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Plays => "plays",
            TxKind::ManageEntity => "manage_entity",
            TxKind::ValidatorRegistration => "validator_registration",
            TxKind::SlaRollup => "sla_rollup",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Transaction {
    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::Plays(_) => TxKind::Plays,
            Transaction::ManageEntity(_) => TxKind::ManageEntity,
            Transaction::ValidatorRegistration(_) => TxKind::ValidatorRegistration,
            Transaction::SlaRollup(_) => TxKind::SlaRollup,
        }
    }

    /// Bytes covered by the envelope signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }
}

/// Signed envelope submitted by clients and carried in blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// `0x` hex recoverable signature over [`Transaction::signing_bytes`], empty for system transactions
    pub signature: String,
    /// Client chosen idempotency key
    pub request_id: String,
    pub transaction: Transaction,
}

impl SignedTransaction {
    /// Wrap a transaction without a signature (used for proposer generated rollups)
    pub fn unsigned(request_id: impl Into<String>, transaction: Transaction) -> Self {
        Self {
            signature: String::new(),
            request_id: request_id.into(),
            transaction,
        }
    }

    /// Sign `transaction` with the node identity
    pub fn sign(
        identity: &NodeIdentity,
        request_id: impl Into<String>,
        transaction: Transaction,
    ) -> Result<Self> {
        let signature = identity.sign(&transaction.signing_bytes()?)?;
        Ok(Self {
            signature,
            request_id: request_id.into(),
            transaction,
        })
    }

    /// Recover the wallet address of the signer
    pub fn signer(&self) -> Result<String> {
        recover_signer(&self.transaction.signing_bytes()?, &self.signature)
    }

    /// Canonical bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(codec().serialize(self)?)
    }

    /// Decode canonical bytes; any malformed input is an error
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(codec().deserialize(bytes)?)
    }

    /// Hash of the canonical bytes
    pub fn hash(&self) -> Result<TxHash> {
        Ok(TxHash::of_bytes(&self.to_bytes()?))
    }

    pub fn kind(&self) -> TxKind {
        self.transaction.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plays(n: usize) -> SignedTransaction {
        let plays = (0..n)
            .map(|i| TrackPlay {
                user_id: format!("user-{i}"),
                track_id: format!("track-{i}"),
                timestamp: 1_700_000_000 + i as i64,
                signature: "sig".to_string(),
                city: "Berlin".to_string(),
                region: "BE".to_string(),
                country: "DE".to_string(),
            })
            .collect();
        SignedTransaction::unsigned("req-1", Transaction::Plays(TrackPlays { plays }))
    }

    #[test]
    fn test_hash_is_function_of_bytes() {
        let tx = plays(3);
        let bytes = tx.to_bytes().unwrap();
        assert_eq!(tx.hash().unwrap(), TxHash::of_bytes(&bytes));
        assert_eq!(plays(3).hash().unwrap(), tx.hash().unwrap());
        assert_ne!(plays(2).hash().unwrap(), tx.hash().unwrap());
    }

    #[test]
    fn test_decode_restores_envelope() {
        let tx = plays(3);
        let decoded = SignedTransaction::from_bytes(&tx.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.kind(), TxKind::Plays);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SignedTransaction::from_bytes(b"definitely not a transaction").is_err());
        assert!(SignedTransaction::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = plays(1).to_bytes().unwrap();
        bytes.push(0);
        assert!(SignedTransaction::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_tx_hash_parse() {
        let hash = plays(1).hash().unwrap();
        let lower = hash.as_str().to_ascii_lowercase();
        assert_eq!(TxHash::parse(&lower), Some(hash.clone()));
        assert_eq!(TxHash::parse(&format!("0x{lower}")), Some(hash));
        assert_eq!(TxHash::parse("xyz"), None);
    }

    #[test]
    fn test_signed_envelope_recovers_signer() {
        let identity = NodeIdentity::from_hex(
            "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        )
        .unwrap();
        let tx = SignedTransaction::sign(&identity, "req", plays(1).transaction).unwrap();
        assert_eq!(tx.signer().unwrap(), identity.eth_address());
    }
}
