//! Model file store
//!
//! Resolves remote model files to local paths, downloading on first use, and
//! keeps track of what is already on disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::storage::{init_storage, StorageError};

const PARTIAL_SUFFIX: &str = ".part";
/// Progress cadence when the server does not announce a length
const UNKNOWN_LENGTH_STEP: u64 = 1024 * 1024;

/// A model file present in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ModelInfo {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            filename,
            path,
            size_bytes: metadata.len(),
        })
    }
}

/// Where to fetch a model from
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
    pub url: String,
    pub filename: String,
    /// Expected SHA256 of the file, hex encoded
    pub sha256: Option<String>,
}

/// Download progress for one file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub filename: String,
    /// Whole percent, 0..=100
    pub progress: u8,
    pub downloaded: u64,
    /// 0 when the server did not send a length
    pub total: u64,
}

/// Turns byte counts into progress events, one per whole percent.
struct ProgressTracker<'a> {
    filename: &'a str,
    total: u64,
    downloaded: u64,
    last_mark: Option<u64>,
}

impl<'a> ProgressTracker<'a> {
    fn new(filename: &'a str, total: u64) -> Self {
        Self {
            filename,
            total,
            downloaded: 0,
            last_mark: None,
        }
    }

    fn percent(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            (self.downloaded.saturating_mul(100) / self.total).min(100)
        }
    }

    fn event(&self, progress: u64, total: u64) -> DownloadProgress {
        DownloadProgress {
            filename: self.filename.to_string(),
            progress: progress as u8,
            downloaded: self.downloaded,
            total,
        }
    }

    fn advance(&mut self, bytes: u64) -> Option<DownloadProgress> {
        self.downloaded += bytes;
        let mark = if self.total > 0 {
            self.percent()
        } else {
            self.downloaded / UNKNOWN_LENGTH_STEP
        };
        if self.last_mark == Some(mark) {
            return None;
        }
        self.last_mark = Some(mark);
        Some(self.event(self.percent(), self.total))
    }

    /// Final 100% event, unless one was already sent.
    fn finish(&mut self) -> Option<DownloadProgress> {
        if self.total > 0 && self.last_mark == Some(100) {
            return None;
        }
        self.last_mark = Some(100);
        Some(self.event(100, self.downloaded))
    }
}

/// Directory of GGUF files plus the HTTP client that fills it
pub struct ModelStore {
    root: PathBuf,
    client: reqwest::Client,
    /// One lock per filename being resolved; a `.part` file has one writer
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_client(root, reqwest::Client::new())
    }

    pub fn with_client(root: impl Into<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            root: root.into(),
            client,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Path a file of that name would have in the store.
    pub fn model_path(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let plain = Path::new(filename)
            .file_name()
            .map(|name| name == filename)
            .unwrap_or(false);
        if filename.is_empty() || !plain || filename.contains(['/', '\\']) || filename.ends_with(PARTIAL_SUFFIX) {
            return Err(StorageError::InvalidFilename(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }

    /// Returns the local path of `source`, downloading it first if missing.
    ///
    /// An existing file is returned as-is. A fresh download is streamed to a
    /// `.part` file and only moved into place once the checksum matched.
    /// Concurrent calls for the same filename run one after the other, so the
    /// later ones find the finished file.
    pub async fn resolve<F>(&self, source: &ModelSource, on_progress: F) -> Result<PathBuf, StorageError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let dest = self.model_path(&source.filename)?;
        let slot = self
            .in_flight
            .lock()
            .await
            .entry(source.filename.clone())
            .or_default()
            .clone();

        let result = {
            let _guard = slot.lock().await;
            self.resolve_locked(source, dest, on_progress).await
        };

        let mut in_flight = self.in_flight.lock().await;
        // Map entry plus ours: nobody else is waiting on this filename
        if Arc::strong_count(&slot) == 2 {
            in_flight.remove(&source.filename);
        }
        result
    }

    async fn resolve_locked<F>(&self, source: &ModelSource, dest: PathBuf, mut on_progress: F) -> Result<PathBuf, StorageError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        if dest.is_file() {
            tracing::info!("Model already present: {}", dest.display());
            return Ok(dest);
        }
        init_storage(&self.root)?;

        let partial = self.root.join(format!("{}{}", source.filename, PARTIAL_SUFFIX));
        let result = self.download(source, &partial, &mut on_progress).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            tracing::warn!("Download of {} failed: {}", source.filename, e);
            return Err(e);
        }

        tokio::fs::rename(&partial, &dest).await?;
        tracing::info!("Model downloaded: {}", dest.display());
        Ok(dest)
    }

    async fn download<F>(&self, source: &ModelSource, partial: &Path, on_progress: &mut F) -> Result<(), StorageError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        tracing::info!("Downloading model from: {}", source.url);
        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Download(format!(
                "HTTP {}: {}",
                response.status(),
                source.url
            )));
        }

        let mut tracker = ProgressTracker::new(&source.filename, response.content_length().unwrap_or(0));
        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        if let Some(p) = tracker.advance(0) {
            on_progress(p);
        }
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            if let Some(p) = tracker.advance(chunk.len() as u64) {
                on_progress(p);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        if let Some(p) = tracker.finish() {
            on_progress(p);
        }

        if let Some(expected) = &source.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(StorageError::Integrity {
                    expected: expected.clone(),
                    actual,
                });
            }
            tracing::debug!("Checksum verified: {}", actual);
        }
        Ok(())
    }

    /// GGUF files in the store, sorted by filename
    pub fn list(&self) -> Result<Vec<ModelInfo>, StorageError> {
        if !self.root.is_dir() {
            tracing::debug!("Models directory does not exist: {}", self.root.display());
            return Ok(vec![]);
        }

        let mut models = vec![];
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_gguf = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false);
            if !path.is_file() || !is_gguf {
                continue;
            }
            match ModelInfo::from_path(path.clone()) {
                Ok(info) => models.push(info),
                Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
            }
        }

        models.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(models)
    }

    /// Removes a model file from the store
    pub fn delete(&self, filename: &str) -> Result<(), StorageError> {
        let path = self.model_path(filename)?;
        if !path.is_file() {
            return Err(StorageError::ModelNotFound(filename.to_string()));
        }
        fs::remove_file(&path)?;
        tracing::info!("Model deleted: {}", filename);
        Ok(())
    }
}
