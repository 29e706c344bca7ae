//! Cadence Core - transaction model and node identity
//!
//! This crate holds the pieces every other Cadence crate agrees on: the
//! signed transaction envelope and its canonical encoding, transaction
//! hashing, and the secp256k1/ed25519 identity a validator signs with.

pub mod crypto;
pub mod error;
pub mod transaction;

pub use crypto::NodeIdentity;
pub use error::CoreError;
pub use transaction::{
    ManageEntityLegacy, SignedTransaction, SlaNodeReport, SlaRollup, TrackPlay, TrackPlays,
    Transaction, TxHash, TxKind, ValidatorRegistration,
};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Block height as reported by the consensus engine
pub type Height = i64;

/// Core protocol version
pub const CORE_VERSION: &str = "0.1.0";
