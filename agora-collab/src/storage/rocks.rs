//! RocksDB-backed document collaborator.
//!
//! Column families:
//! - `documents`: resource snapshots (bincode, LZ4 compressed)
//! - `metadata` : per-resource metadata (bincode: version, sizes, timestamps)
//!
//! A snapshot and its metadata are written in one batch. Snapshots older than
//! the stored version are ignored so a late auto-save cannot roll a resource
//! back.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::StoreError;
use crate::collaborators::{DocumentCollaborator, DocumentSnapshot};
use crate::model::{DocumentContent, ResourceId};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("agora_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub resource_id: ResourceId,
    pub version: u64,
    pub content_type: String,
    /// Encoded snapshot size before compression
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
    /// Number of accepted persists
    pub persist_count: u64,
}

impl DocumentMetadata {
    fn new(resource_id: &str, content_type: &str) -> Self {
        let now = unix_secs();
        Self {
            resource_id: resource_id.to_string(),
            version: 0,
            content_type: content_type.to_string(),
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            persist_count: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode(bytes)
    }
}

/// Value stored in the `documents` column family.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    content: DocumentContent,
    version: u64,
    content_type: String,
}

pub struct RocksDocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksDocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Document store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed; SST compression is for keys and metadata.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a snapshot and its metadata atomically.
    ///
    /// Returns the stored metadata. A snapshot older than the stored
    /// version leaves the store untouched and returns the existing metadata.
    pub fn save_snapshot(
        &self,
        resource_id: &str,
        snapshot: &DocumentSnapshot,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let existing = self.load_metadata(resource_id)?;
        if let Some(meta) = &existing {
            if meta.version > snapshot.version {
                log::debug!(
                    "Skipping stale snapshot v{} for {resource_id} (stored v{})",
                    snapshot.version,
                    meta.version
                );
                return Ok(meta.clone());
            }
        }

        let encoded = encode(&StoredDocument {
            content: snapshot.content.clone(),
            version: snapshot.version,
            content_type: snapshot.content_type.clone(),
        })?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = existing
            .unwrap_or_else(|| DocumentMetadata::new(resource_id, &snapshot.content_type));
        meta.version = snapshot.version;
        meta.content_type = snapshot.content_type.clone();
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();
        meta.persist_count += 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, resource_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, resource_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, resource_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(&cf, resource_id.as_bytes())? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let stored: StoredDocument = decode(&raw)?;
        Ok(Some(DocumentSnapshot {
            content: stored.content,
            version: stored.version,
            content_type: stored.content_type,
        }))
    }

    pub fn load_metadata(&self, resource_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, resource_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, resource_id: &str) -> Result<bool, StoreError> {
        Ok(self.load_metadata(resource_id)?.is_some())
    }

    /// Every stored resource id, in key order.
    pub fn list_documents(&self) -> Result<Vec<ResourceId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    pub fn delete_document(&self, resource_id: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, resource_id.as_bytes());
        batch.delete_cf(&cf_meta, resource_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentCollaborator for RocksDocumentStore {
    async fn get_snapshot(&self, resource_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        self.load_snapshot(resource_id)
    }

    async fn persist(&self, resource_id: &str, snapshot: DocumentSnapshot) -> Result<(), StoreError> {
        let meta = self.save_snapshot(resource_id, &snapshot)?;
        log::debug!(
            "Stored {resource_id} v{} ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
