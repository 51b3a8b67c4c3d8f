/*!
Error types for the capsule core engine.
*/

use thiserror::Error;

/// Result type used throughout the capsule core.
pub type Result<T> = std::result::Result<T, CapsuleError>;

/// Errors that can occur while backing up or restoring a session.
#[derive(Error, Debug)]
pub enum CapsuleError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Key-value store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The store has no room left for a write
    #[error("Storage quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// A compute engine command failed or answered with an unexpected shape
    #[error("Engine command '{command}' failed: {message}")]
    Engine { command: String, message: String },

    /// A referenced payload or backup is missing from the store
    #[error("{kind} '{name}' not found in store")]
    NotFound { kind: String, name: String },

    /// Snapshot document is structurally invalid
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl CapsuleError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new engine error for the named command
    pub fn engine<C: Into<String>, M: Into<String>>(command: C, message: M) -> Self {
        Self::Engine {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<K: Into<String>, N: Into<String>>(kind: K, name: N) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a new invalid session error
    pub fn invalid_session<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSession(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures that originate in the key-value store.
    ///
    /// These never reach the interactive user: backup paths log them and
    /// carry on as if the backup had been skipped.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Compression(_) | Self::Storage(_) | Self::QuotaExceeded { .. }
        )
    }
}
