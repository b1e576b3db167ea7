//! Durable document storage.
//!
//! ```text
//! ┌───────────────────┐  PersistJob   ┌────────────────────┐
//! │ persistence worker│ ────────────► │ RocksDocumentStore │
//! └───────────────────┘               └─────────┬──────────┘
//!                                               │ column families
//!                     ┌─────────────────────────┴───────────────────┐
//!                     │ CF "documents": LZ4(bincode(content, type)) │
//!                     │ CF "metadata":  bincode(DocumentMetadata)   │
//!                     └─────────────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, RocksDocumentStore, StoreConfig};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
