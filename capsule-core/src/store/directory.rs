/*!
On-disk store adapter.
*/

use super::{KeyValueStore, StoredValue};
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::{CapsuleError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use capsule_retry::{classify, with_backoff, RetryError};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const ENTRY_EXTENSION: &str = "entry";
const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;
const HEADER_LEN: usize = 5;
const MAX_KEY_LEN: usize = 64 * 1024;

/// Directory-backed key-value store
///
/// Each entry is one file named after the SHA-256 of its key, so arbitrary
/// JSON keys map to safe file names. The file starts with an uncompressed
/// header holding the value kind and the original key, followed by the payload
/// passed through the configured compressor. Listing keys reads headers only.
/// Writes go to a temporary file and are renamed into place; transient I/O
/// errors are retried.
///
/// # Example
/// ```rust,no_run
/// use capsule_core::{DirectoryStore, GzipCompressor};
///
/// let store = DirectoryStore::new("/var/lib/capsule", GzipCompressor::new());
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryStore<C: CompressionAdapter = GzipCompressor> {
    base_dir: PathBuf,
    compressor: Arc<C>,
}

impl<C: CompressionAdapter> DirectoryStore<C> {
    /// Create a store rooted at `base_dir`; the directory is created on first write
    pub fn new<P: AsRef<Path>>(base_dir: P, compressor: C) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            compressor: Arc::new(compressor),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{ENTRY_EXTENSION}", hash_key(key)))
    }

    async fn read_entry(&self, path: PathBuf) -> Result<Option<(String, StoredValue)>> {
        let Some(raw) = read_with_retry(path).await? else {
            return Ok(None);
        };
        let (kind, key, compressed) = split_entry(&raw)?;
        let payload = self.compressor.decompress(compressed)?;
        Ok(Some((key, decode_value(kind, payload)?)))
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CapsuleError::storage(format!(
                    "Failed to list {}: {e}",
                    self.base_dir.display()
                )))
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl<C: CompressionAdapter + 'static> KeyValueStore for DirectoryStore<C> {
    async fn get_item(&self, key: &str) -> Result<Option<StoredValue>> {
        match self.read_entry(self.entry_path(key)).await? {
            Some((stored_key, value)) if stored_key == key => Ok(Some(value)),
            Some((stored_key, _)) => {
                warn!(key, stored_key = %stored_key, "entry file holds a different key");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_item(&self, key: &str, value: StoredValue) -> Result<()> {
        let (kind, payload): (u8, &[u8]) = match &value {
            StoredValue::Text(text) => (KIND_TEXT, text.as_bytes()),
            StoredValue::Binary(data) => (KIND_BINARY, data.as_ref()),
        };
        let mut encoded = encode_header(kind, key);
        encoded.extend_from_slice(&self.compressor.compress(payload)?);
        let compressed = Bytes::from(encoded);
        let path = self.entry_path(key);
        let base_dir = self.base_dir.clone();

        debug!(key, bytes = compressed.len(), "writing store entry");

        with_backoff("store_write", move |_attempt| {
            let path = path.clone();
            let base_dir = base_dir.clone();
            let data = compressed.clone();
            Box::pin(async move {
                tokio::fs::create_dir_all(&base_dir)
                    .await
                    .map_err(|e| classify("store_write", e))?;
                let tmp = path.with_extension("tmp");
                tokio::fs::write(&tmp, &data)
                    .await
                    .map_err(|e| classify("store_write", e))?;
                tokio::fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| classify("store_write", e))
            })
        })
        .await
        .map_err(retry_to_storage)
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::storage(format!("Failed to remove entry: {e}"))),
        }
    }

    async fn clear(&self) -> Result<()> {
        for path in self.entry_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CapsuleError::storage(format!(
                        "Failed to remove {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for path in self.entry_files().await? {
            match read_key_with_retry(path.clone()).await {
                Ok(Some(key)) => keys.push(key),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable entry"),
            }
        }
        Ok(keys)
    }
}

/// Hex SHA-256 of a store key, used as its file stem.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn encode_header(kind: u8, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + key.len());
    out.push(kind);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

/// Kind byte and key length from the fixed-size header prefix.
fn parse_header(header: [u8; HEADER_LEN]) -> Result<(u8, usize)> {
    let kind = header[0];
    if kind != KIND_TEXT && kind != KIND_BINARY {
        return Err(CapsuleError::storage(format!(
            "Unknown store entry kind {kind}"
        )));
    }
    let key_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if key_len > MAX_KEY_LEN {
        return Err(CapsuleError::storage(format!(
            "Store entry key length {key_len} is out of range"
        )));
    }
    Ok((kind, key_len))
}

fn decode_key(key: Vec<u8>) -> Result<String> {
    String::from_utf8(key)
        .map_err(|e| CapsuleError::storage(format!("Store entry key is not UTF-8: {e}")))
}

/// Split a raw entry into kind, key and the still-compressed payload.
fn split_entry(data: &[u8]) -> Result<(u8, String, &[u8])> {
    let Some((header, rest)) = data.split_first_chunk::<HEADER_LEN>() else {
        return Err(CapsuleError::storage("Truncated store entry"));
    };
    let (kind, key_len) = parse_header(*header)?;
    if rest.len() < key_len {
        return Err(CapsuleError::storage("Store entry key overruns the entry"));
    }
    let (key, payload) = rest.split_at(key_len);
    Ok((kind, decode_key(key.to_vec())?, payload))
}

fn decode_value(kind: u8, payload: Vec<u8>) -> Result<StoredValue> {
    match kind {
        KIND_TEXT => Ok(StoredValue::Text(String::from_utf8(payload).map_err(|e| {
            CapsuleError::storage(format!("Text entry is not UTF-8: {e}"))
        })?)),
        _ => Ok(StoredValue::Binary(Bytes::from(payload))),
    }
}

/// Read the header of an entry file, leaving the payload on disk.
async fn read_key(path: &Path) -> std::io::Result<Option<Result<String>>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Ok(Some(Err(CapsuleError::storage("Truncated store entry"))))
        }
        Err(e) => return Err(e),
    }
    let key_len = match parse_header(header) {
        Ok((_, key_len)) => key_len,
        Err(e) => return Ok(Some(Err(e))),
    };

    let mut key = vec![0u8; key_len];
    match file.read_exact(&mut key).await {
        Ok(_) => Ok(Some(decode_key(key))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(Some(Err(CapsuleError::storage(
            "Store entry key overruns the entry",
        )))),
        Err(e) => Err(e),
    }
}

async fn read_key_with_retry(path: PathBuf) -> Result<Option<String>> {
    let header = with_backoff("store_read_key", move |_attempt| {
        let path = path.clone();
        Box::pin(async move {
            read_key(&path)
                .await
                .map_err(|e| classify("store_read_key", e))
        })
    })
    .await
    .map_err(retry_to_storage)?;
    header.transpose()
}

async fn read_with_retry(path: PathBuf) -> Result<Option<Vec<u8>>> {
    with_backoff("store_read", move |_attempt| {
        let path = path.clone();
        Box::pin(async move {
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(classify("store_read", e)),
            }
        })
    })
    .await
    .map_err(retry_to_storage)
}

fn retry_to_storage(err: RetryError) -> CapsuleError {
    CapsuleError::storage(err.to_string())
}
