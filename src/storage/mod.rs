//! Persistent storage
//!
//! Model files on disk and the runtime settings file.

use std::path::PathBuf;
use thiserror::Error;

pub mod models;
pub mod settings;

pub use models::{DownloadProgress, ModelInfo, ModelSource, ModelStore};
pub use settings::{load_settings, save_settings, RuntimeSettings};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Invalid model filename: {0:?}")]
    InvalidFilename(String),
    #[error("Failed to download model: {0}")]
    Download(String),
    #[error("Model checksum mismatch. Expected: {expected}, got: {actual}")]
    Integrity { expected: String, actual: String },
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\OfflineLLM\OfflineLLM\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.OfflineLLM.OfflineLLM`
/// - Linux: `/home/{user}/.local/share/offlinellm`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "OfflineLLM", "OfflineLLM")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Creates `dir` (and parents) if needed
pub fn init_storage(dir: &std::path::Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(dir)?;
    tracing::info!("Initialized storage at: {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_storage_creates_nested_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let nested = temp.path().join("a").join("models");
        init_storage(&nested).unwrap();
        assert!(nested.is_dir());
        // Second call is a no-op
        init_storage(&nested).unwrap();
    }

    #[test]
    fn test_integrity_error_message() {
        let err = StorageError::Integrity {
            expected: "ab".to_string(),
            actual: "cd".to_string(),
        };
        assert_eq!(err.to_string(), "Model checksum mismatch. Expected: ab, got: cd");
    }
}
