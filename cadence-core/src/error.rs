//! Error types for core operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Encoding error: {0}")]
    EncodingError(#[from] bincode::Error),

    #[error("Hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),
}

impl From<secp256k1::Error> for CoreError {
    fn from(err: secp256k1::Error) -> Self {
        CoreError::CryptoError(err.to_string())
    }
}
