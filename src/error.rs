//! Error types for the HNSW block store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Index error: {0}")]
    Index(String),
}

impl StorageError {
    /// Fatal errors abort the enclosing database operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StorageError::InvalidArgument(_) | StorageError::Config(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            // Stream adapters report broken chains and checksum failures as io errors
            bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::InvalidData
                || io.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                StorageError::Corruption(io.to_string())
            }
            other => StorageError::Serialization(other.to_string()),
        }
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(io) => io,
            StorageError::Corruption(msg) => std::io::Error::new(std::io::ErrorKind::InvalidData, msg),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
