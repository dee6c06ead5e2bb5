//! In-memory storage module.
//!
//! Provides a thread-safe key-value store with:
//! - Insert/overwrite, read and remove-and-return operations
//! - A fixed sentinel entry for misses on read and delete
//! - Lifetime operation counters

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, trace};

/// Key reported in place of the requested key when a lookup misses.
pub const KEY_NOT_FOUND: &str = "KeyNotFound";

/// Value paired with [`KEY_NOT_FOUND`] in the miss entry.
pub const INVALID_OPERATION: &str = "InvalidOperation";

/// Result of a storage operation
#[derive(Debug, Clone, PartialEq)]
pub enum StorageResult {
    /// The key holds (or, for delete, held) this value
    Found { key: String, value: Value },
    /// The key was not present
    NotFound,
}

impl StorageResult {
    /// Convert into the one-entry `(key, value)` pair reported to clients.
    ///
    /// A miss does not echo the requested key. It is always reported as
    /// `"KeyNotFound": "InvalidOperation"`, and clients match on that exact
    /// shape, so the requested key name is dropped here on purpose.
    pub fn into_entry(self) -> (String, Value) {
        match self {
            StorageResult::Found { key, value } => (key, value),
            StorageResult::NotFound => (
                KEY_NOT_FOUND.to_string(),
                Value::String(INVALID_OPERATION.to_string()),
            ),
        }
    }
}

/// Thread-safe in-memory key-value storage.
///
/// Every operation takes the single map lock for its whole duration, so
/// set, get and delete are mutually exclusive.
pub struct Storage {
    data: Mutex<HashMap<String, Value>>,
    sets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
}

impl Storage {
    /// Create a new, empty storage instance
    pub fn new() -> Arc<Self> {
        info!("Initializing storage");
        Arc::new(Self {
            data: Mutex::new(HashMap::new()),
            sets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // The map holds no cross-entry invariants, so a panic mid-operation
        // cannot leave it inconsistent.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a key. Always succeeds.
    pub fn set(&self, key: &str, value: Value) -> StorageResult {
        let mut data = self.lock();
        data.insert(key.to_string(), value.clone());
        self.sets.fetch_add(1, Ordering::Relaxed);
        trace!(key, items = data.len(), "Item stored");
        StorageResult::Found {
            key: key.to_string(),
            value,
        }
    }

    /// Read a key without modifying the store
    pub fn get(&self, key: &str) -> StorageResult {
        let data = self.lock();
        match data.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                StorageResult::Found {
                    key: key.to_string(),
                    value: value.clone(),
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key, "Item not found");
                StorageResult::NotFound
            }
        }
    }

    /// Remove a key, returning the value it held
    pub fn delete(&self, key: &str) -> StorageResult {
        let mut data = self.lock();
        match data.remove(key) {
            Some(value) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                trace!(key, "Item deleted");
                StorageResult::Found {
                    key: key.to_string(),
                    value,
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                StorageResult::NotFound
            }
        }
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Get statistics about the storage
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            item_count: self.len(),
            sets: self.sets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub item_count: usize,
    pub sets: u64,
    pub hits: u64,
    pub misses: u64,
    pub deletes: u64,
}
