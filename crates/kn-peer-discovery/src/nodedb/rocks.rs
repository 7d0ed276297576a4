//! # RocksDB Backend
//!
//! Persistent key-value backend for the node database. Enabled with the
//! `rocksdb` feature.

use std::path::Path;

use parking_lot::RwLock;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};

use crate::ports::outbound::{BatchOperation, KVStoreError, KeyValueStore};

/// RocksDB-backed key-value store.
pub struct RocksDbStore {
    db: RwLock<Option<DB>>,
}

impl RocksDbStore {
    /// Open or create a database directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KVStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);

        let db = DB::open(&opts, path.as_ref()).map_err(|e| KVStoreError::IOError {
            message: format!("Failed to open RocksDB: {}", e),
        })?;
        Ok(Self {
            db: RwLock::new(Some(db)),
        })
    }

    fn closed() -> KVStoreError {
        KVStoreError::IOError {
            message: "RocksDB is closed".to_string(),
        }
    }
}

impl KeyValueStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(Self::closed)?;
        db.get(key).map_err(|e| KVStoreError::IOError {
            message: format!("RocksDB get failed: {}", e),
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(Self::closed)?;
        db.put(key, value).map_err(|e| KVStoreError::IOError {
            message: format!("RocksDB put failed: {}", e),
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), KVStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(Self::closed)?;
        db.delete(key).map_err(|e| KVStoreError::IOError {
            message: format!("RocksDB delete failed: {}", e),
        })
    }

    fn atomic_batch_write(&self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(Self::closed)?;
        let mut batch = WriteBatch::default();
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => batch.put(&key, &value),
                BatchOperation::Delete { key } => batch.delete(&key),
            }
        }
        db.write(batch).map_err(|e| KVStoreError::IOError {
            message: format!("RocksDB batch write failed: {}", e),
        })
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(Self::closed)?;
        let mut results = Vec::new();
        for item in db.iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward)) {
            let (key, value) = item.map_err(|e| KVStoreError::IOError {
                message: format!("RocksDB scan failed: {}", e),
            })?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn close(&self) {
        // Dropping the handle flushes memtables and releases the lock file.
        self.db.write().take();
    }
}
