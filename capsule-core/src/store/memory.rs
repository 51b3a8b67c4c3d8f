/*!
In-process store adapter.
*/

use super::{KeyValueStore, StoredValue};
use crate::{CapsuleError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Memory-based key-value store
///
/// Entries live in a `HashMap` for the lifetime of the process. An optional
/// quota bounds the total size of keys plus values, so quota-exceeded
/// behaviour can be exercised without filling a disk.
///
/// # Example
/// ```rust
/// use capsule_core::store::{KeyValueStore, MemoryStore};
///
/// # tokio_test_block_on(async {
/// let store = MemoryStore::with_quota(1024);
/// store.set_item("k", "v".into()).await?;
/// assert_eq!(store.keys().await?, vec!["k".to_string()]);
/// # Ok::<(), capsule_core::CapsuleError>(())
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, StoredValue>>>,
    quota_bytes: Option<u64>,
}

impl MemoryStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses writes once `quota_bytes` would be exceeded
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Arc::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Bytes currently used by keys and values
    pub fn used_bytes(&self) -> u64 {
        Self::usage(&self.lock())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredValue>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn usage(entries: &HashMap<String, StoredValue>) -> u64 {
        entries
            .iter()
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: StoredValue) -> Result<()> {
        let mut entries = self.lock();

        if let Some(quota) = self.quota_bytes {
            let replaced = entries
                .get(key)
                .map(|old| (key.len() + old.len()) as u64)
                .unwrap_or(0);
            let used = Self::usage(&entries) - replaced;
            let requested = (key.len() + value.len()) as u64;
            if used + requested > quota {
                return Err(CapsuleError::QuotaExceeded {
                    requested,
                    available: quota.saturating_sub(used),
                });
            }
        }

        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }
}
