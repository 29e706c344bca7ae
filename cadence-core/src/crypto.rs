//! Node identity and signature primitives
//!
//! A node is identified by an Ethereum-style secp256k1 key (the delegate
//! wallet registered on the service-provider registry). Its consensus key is
//! an ed25519 key derived deterministically from the same 32 secret bytes, so
//! the consensus address can never be chosen independently of the wallet.

use crate::{CoreError, Result};
use ed25519_dalek::SigningKey;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::fmt;
use zeroize::Zeroizing;

/// Length of a recoverable signature: r ‖ s ‖ v
pub const SIGNATURE_LEN: usize = 65;

/// Length in bytes of a consensus address
pub const CONSENSUS_ADDRESS_LEN: usize = 20;

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Node signing identity
pub struct NodeIdentity {
    eth_key: SecretKey,
    consensus_key: SigningKey,
    eth_address: String,
    comet_address: String,
}

impl NodeIdentity {
    /// Load an identity from a hex encoded secp256k1 private key (with or without `0x`)
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim().trim_start_matches("0x");
        let bytes = Zeroizing::new(hex::decode(trimmed)?);
        if bytes.len() != 32 {
            return Err(CoreError::InvalidKey(format!(
                "expected 32 private key bytes, got {}",
                bytes.len()
            )));
        }

        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&bytes);
        Self::from_secret_bytes(&seed)
    }

    /// Build an identity from raw secret bytes
    pub fn from_secret_bytes(seed: &[u8; 32]) -> Result<Self> {
        let eth_key = SecretKey::from_slice(seed)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let consensus_key = SigningKey::from_bytes(seed);

        let secp = Secp256k1::new();
        let eth_address = eth_address_from_public_key(&PublicKey::from_secret_key(&secp, &eth_key));
        let comet_address = consensus_address(consensus_key.verifying_key().as_bytes());

        Ok(Self {
            eth_key,
            consensus_key,
            eth_address,
            comet_address,
        })
    }

    /// EIP-55 checksummed wallet address
    pub fn eth_address(&self) -> &str {
        &self.eth_address
    }

    /// Consensus (CometBFT style) address
    pub fn comet_address(&self) -> &str {
        &self.comet_address
    }

    /// ed25519 consensus public key
    pub fn consensus_public_key(&self) -> [u8; 32] {
        self.consensus_key.verifying_key().to_bytes()
    }

    /// Sign `data` with the wallet key, returning a `0x` prefixed 65 byte signature
    pub fn sign(&self, data: &[u8]) -> Result<String> {
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(&keccak256(data))?;
        let signature = secp.sign_ecdsa_recoverable(&message, &self.eth_key);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut out = Vec::with_capacity(SIGNATURE_LEN);
        out.extend_from_slice(&compact);
        // recovery ids are 0..=3, always fits
        out.push(recovery_id.to_i32() as u8);
        Ok(format!("0x{}", hex::encode(out)))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("eth_address", &self.eth_address)
            .field("comet_address", &self.comet_address)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Recover the wallet address that produced `signature` over `data`
pub fn recover_signer(data: &[u8], signature: &str) -> Result<String> {
    let raw = hex::decode(signature.trim().trim_start_matches("0x"))?;
    if raw.len() != SIGNATURE_LEN {
        return Err(CoreError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            raw.len()
        )));
    }

    // accept both 0/1 and 27/28 style recovery bytes
    let v = raw[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_i32(i32::from(v))
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
    let signature = RecoverableSignature::from_compact(&raw[..64], recovery_id)
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(&keccak256(data))?;
    let public_key = secp
        .recover_ecdsa(&message, &signature)
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;

    Ok(eth_address_from_public_key(&public_key))
}

/// Derive the EIP-55 checksummed address for a secp256k1 public key
pub fn eth_address_from_public_key(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    to_checksum_address(&hash[12..])
}

fn to_checksum_address(address: &[u8]) -> String {
    let lower = hex::encode(address);
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 { hash[i / 2] >> 4 } else { hash[i / 2] & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Consensus address of an ed25519 public key: first 20 bytes of its SHA-256, upper hex
pub fn consensus_address(public_key: &[u8; 32]) -> String {
    hex::encode_upper(&sha256(public_key)[..CONSENSUS_ADDRESS_LEN])
}

/// Consensus address from an untrusted public key slice
pub fn consensus_address_from_slice(public_key: &[u8]) -> Result<String> {
    let key: [u8; 32] = public_key.try_into().map_err(|_| {
        CoreError::InvalidKey(format!("expected 32 byte ed25519 key, got {}", public_key.len()))
    })?;
    ed25519_dalek::VerifyingKey::from_bytes(&key)
        .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
    Ok(consensus_address(&key))
}

/// Compare two wallet addresses ignoring checksum casing
pub fn same_eth_address(a: &str, b: &str) -> bool {
    a.trim_start_matches("0x").eq_ignore_ascii_case(b.trim_start_matches("0x"))
}
