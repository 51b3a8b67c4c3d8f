/*!
Key-value store adapters for backup persistence.

This module defines the store abstraction (port) the backup manager talks to
and the concrete adapters behind it. The manager never assumes anything about
where entries live beyond this contract.
*/

pub mod directory;
pub mod memory;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Value held under a store key
///
/// Session documents and markers are text; map grids and reflection data are
/// raw byte buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Text(String),
    Binary(Bytes),
}

impl StoredValue {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            StoredValue::Text(text) => text.len(),
            StoredValue::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(text) => Some(text),
            StoredValue::Binary(_) => None,
        }
    }

    /// Raw bytes of the value, whichever variant it is.
    pub fn into_bytes(self) -> Bytes {
        match self {
            StoredValue::Text(text) => Bytes::from(text),
            StoredValue::Binary(data) => data,
        }
    }
}

impl From<String> for StoredValue {
    fn from(value: String) -> Self {
        StoredValue::Text(value)
    }
}

impl From<&str> for StoredValue {
    fn from(value: &str) -> Self {
        StoredValue::Text(value.to_string())
    }
}

impl From<Bytes> for StoredValue {
    fn from(value: Bytes) -> Self {
        StoredValue::Binary(value)
    }
}

impl From<Vec<u8>> for StoredValue {
    fn from(value: Vec<u8>) -> Self {
        StoredValue::Binary(Bytes::from(value))
    }
}

/// Asynchronous persistent key-value store with finite capacity
///
/// Keys are the canonical JSON strings produced by [`crate::StoreKey`]; the
/// store treats them as opaque.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` when absent
    async fn get_item(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Store `value` under `key`, replacing any previous value
    async fn set_item(&self, key: &str, value: StoredValue) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// Remove every entry
    async fn clear(&self) -> Result<()>;

    /// List every key currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    async fn get_item(&self, key: &str) -> Result<Option<StoredValue>> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, value: StoredValue) -> Result<()> {
        (**self).set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        (**self).keys().await
    }
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get_item(&self, key: &str) -> Result<Option<StoredValue>> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, value: StoredValue) -> Result<()> {
        (**self).set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        (**self).remove_item(key).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        (**self).keys().await
    }
}

/// Build a store from configuration
///
/// # Example
/// ```rust
/// use capsule_core::{create_store_from_config, StoreConfig};
///
/// let store = create_store_from_config(&StoreConfig::default_memory())?;
/// # Ok::<(), capsule_core::CapsuleError>(())
/// ```
pub fn create_store_from_config(config: &crate::config::StoreConfig) -> Result<Box<dyn KeyValueStore>> {
    use crate::compression::{GzipCompressor, NoCompression};
    use crate::config::StoreBackend;

    config.validate()?;

    match config.backend {
        StoreBackend::Memory => {
            let store = match config.quota_bytes {
                Some(quota) => MemoryStore::with_quota(quota),
                None => MemoryStore::new(),
            };
            Ok(Box::new(store))
        }
        StoreBackend::Directory => {
            let dir = config.directory.clone().ok_or_else(|| {
                crate::CapsuleError::validation("Directory backend requires a directory")
            })?;
            if config.compress {
                Ok(Box::new(DirectoryStore::new(dir, GzipCompressor::new())))
            } else {
                Ok(Box::new(DirectoryStore::new(dir, NoCompression::new())))
            }
        }
    }
}
