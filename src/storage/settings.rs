//! Settings storage
//!
//! Defaults applied when a bridge call omits a parameter, persisted as JSON
//! next to the models directory.

use crate::inference::{GenerationRequest, LoadParams};
use crate::session::SessionConfig;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Context window size used when `loadModel` omits one
    pub context_size: u32,
    /// Worker threads used when `loadModel` omits a count
    pub thread_count: u32,
    /// Offload layers to the GPU when the backend supports it
    pub gpu_offload: bool,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    pub repeat_penalty: f32,
    /// Tokens buffered ahead of a slow consumer
    pub stream_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            context_size: 2048,
            thread_count: 4,
            gpu_offload: false,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            stream_capacity: 64,
        }
    }
}

impl RuntimeSettings {
    /// Validate settings values
    ///
    /// Clamps sampling parameters and replaces zeros and NaNs with defaults
    pub fn validate(&mut self) {
        if self.temperature.is_nan() {
            self.temperature = 0.7;
        }
        if self.top_p.is_nan() {
            self.top_p = 0.9;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.context_size == 0 {
            self.context_size = 2048;
        }
        if self.thread_count == 0 {
            self.thread_count = 4;
        }
        if self.max_tokens == 0 {
            self.max_tokens = 512;
        }
        if self.repeat_penalty.is_nan() || self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.1;
        }
        if self.stream_capacity == 0 {
            self.stream_capacity = 64;
        }
    }

    /// Load parameters used when `loadModel` omits them
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            context_size: self.context_size,
            thread_count: self.thread_count,
            gpu_offload: self.gpu_offload,
        }
    }

    /// A request for `prompt` carrying these sampling defaults
    pub fn generation_request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            stream_capacity: self.stream_capacity,
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted. A
/// missing file is created with the defaults so they can be edited.
pub fn load_settings() -> RuntimeSettings {
    let path = match get_settings_path() {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            return RuntimeSettings::default();
        }
    };

    if !path.exists() {
        let settings = RuntimeSettings::default();
        if let Err(e) = save_settings(&settings) {
            tracing::warn!("Failed to write default settings: {}", e);
        }
        return settings;
    }

    match load_settings_from(&path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            RuntimeSettings::default()
        }
    }
}

/// Loads and validates the settings file at `path`
pub fn load_settings_from(path: &Path) -> Result<RuntimeSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(RuntimeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: RuntimeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &RuntimeSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &RuntimeSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.thread_count, 4);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.9);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_tokens, 512);
        assert!(!settings.gpu_offload);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = RuntimeSettings::default();

        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        settings.top_p = 2.0;
        settings.context_size = 0;
        settings.thread_count = 0;
        settings.repeat_penalty = f32::NAN;
        settings.stream_capacity = 0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.thread_count, 4);
        assert_eq!(settings.repeat_penalty, 1.1);
        assert_eq!(settings.stream_capacity, 64);
    }

    #[test]
    fn test_nan_sampling_values_fall_back_to_defaults() {
        let mut settings = RuntimeSettings {
            temperature: f32::NAN,
            top_p: f32::NAN,
            ..RuntimeSettings::default()
        };
        settings.validate();
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.9);
        assert!(settings.generation_request("hi").validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"contextSize": 4096, "gpuOffload": true}"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.context_size, 4096);
        assert!(settings.gpu_offload);
        assert_eq!(settings.thread_count, 4);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = RuntimeSettings {
            max_tokens: 99,
            models_directory: dir.path().join("models"),
            ..RuntimeSettings::default()
        };

        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, RuntimeSettings::default());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(StorageError::JsonError(_))));
    }

    #[test]
    fn test_derived_params() {
        let settings = RuntimeSettings {
            context_size: 1024,
            temperature: 0.2,
            ..RuntimeSettings::default()
        };
        let params = settings.load_params();
        assert_eq!(params.context_size, 1024);
        assert_eq!(params.thread_count, 4);
        assert!(!params.gpu_offload);
        let request = settings.generation_request("hi");
        assert_eq!(request.prompt, "hi");
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.max_tokens, 512);
    }
}
