//! Error types for OrderChain

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid block timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Invalid block difficulty: expected {expected}, got {actual}")]
    InvalidDifficulty { expected: u32, actual: u32 },
    #[error("Invalid block depth: expected {expected}, got {actual}")]
    InvalidDepth { expected: u64, actual: u64 },
    #[error("Invalid block linkage")]
    InvalidBlockLinkage,
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Invalid Merkle root")]
    InvalidMerkleRoot,
    #[error("Unknown {kind} {hash}: not present in the pool")]
    UnknownOperation { kind: &'static str, hash: String },
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Invalid trade: {0}")]
    InvalidTrade(String),
    #[error("Offer not found: {0}")]
    OfferNotFound(String),
    #[error("Operation too large: {size} bytes (max: {max})")]
    OperationTooLarge { size: usize, max: usize },
    #[error("Block slot already filled")]
    SlotFilled,
    #[error("Cancelled")]
    Cancelled,
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Bincode error: {0}")]
    BincodeError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
