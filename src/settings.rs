//! Application settings storage
//!
//! Stores configuration like API keys and pipeline tuning in a JSON file in
//! the data directory. Environment variables take precedence over the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pipeline::Granularity;
use crate::retry::RetryPolicy;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the per-partition artifact directories (None = platform data dir)
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub ollama_url: Option<String>,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub generation_backend: GenerationBackend,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    /// Texts per embedding request
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    /// 1 = an embedding failure aborts the task immediately
    #[serde(default = "default_one")]
    pub embedding_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub embedding_base_delay_ms: u64,
    #[serde(default = "default_topic_attempts")]
    pub topic_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub topic_base_delay_ms: u64,
    #[serde(default = "default_cluster_eps")]
    pub cluster_eps: f32,
    /// Manual override for DBSCAN min_samples (None = max(2, n / 10))
    #[serde(default)]
    pub cluster_min_samples: Option<usize>,
    #[serde(default = "default_projection_seed")]
    pub projection_seed: u64,
    #[serde(default = "default_edit_gap_secs")]
    pub edit_gap_secs: f64,
    #[serde(default)]
    pub granularity: Granularity,
    /// Also write a cumulative map per calendar month under `states/`
    #[serde(default)]
    pub monthly_history: bool,
    /// Finished task statuses kept for lookup
    #[serde(default = "default_status_retention")]
    pub status_retention: usize,
    /// Periodic refresh of the snapshot partitions (None = only on demand)
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_batch_size() -> usize {
    100
}

fn default_one() -> u32 {
    1
}

fn default_topic_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_cluster_eps() -> f32 {
    crate::clustering::DEFAULT_EPS
}

fn default_projection_seed() -> u64 {
    crate::projection::DEFAULT_SEED
}

fn default_edit_gap_secs() -> f64 {
    crate::branches::EDIT_GAP_SECS
}

fn default_status_retention() -> usize {
    256
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            openai_api_key: None,
            anthropic_api_key: None,
            ollama_url: None,
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: default_embedding_model(),
            generation_backend: GenerationBackend::default(),
            generation_model: default_generation_model(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_max_attempts: 1,
            embedding_base_delay_ms: default_base_delay_ms(),
            topic_max_attempts: default_topic_attempts(),
            topic_base_delay_ms: default_base_delay_ms(),
            cluster_eps: default_cluster_eps(),
            cluster_min_samples: None,
            projection_seed: default_projection_seed(),
            edit_gap_secs: default_edit_gap_secs(),
            granularity: Granularity::default(),
            monthly_history: false,
            status_retention: default_status_retention(),
            refresh_interval_secs: None,
        }
    }
}

impl Settings {
    /// Load settings from disk or create default. A corrupt file falls back
    /// to defaults with a warning.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Settings::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Invalid settings file, using defaults: {}", e);
                Settings::default()
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read settings, using defaults: {}", e);
                Settings::default()
            }
        }
    }

    /// Load `settings.json` from the resolved data directory
    pub fn load_default() -> Self {
        let dir = resolve_data_dir(None);
        let mut settings = Self::load(&dir.join(SETTINGS_FILE));
        if settings.data_dir.is_none() {
            settings.data_dir = Some(dir.to_string_lossy().into_owned());
        }
        settings
    }

    /// Save settings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        fs::write(path, content).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    /// `BASE_DATA_DIR` env var, then the configured dir, then the platform
    /// data dir
    pub fn data_dir(&self) -> PathBuf {
        resolve_data_dir(self.data_dir.as_deref())
    }

    /// Environment variable takes precedence over the stored key
    pub fn openai_api_key(&self) -> Option<String> {
        env_or("OPENAI_API_KEY", self.openai_api_key.as_deref())
    }

    pub fn anthropic_api_key(&self) -> Option<String> {
        env_or("ANTHROPIC_API_KEY", self.anthropic_api_key.as_deref())
    }

    pub fn ollama_url(&self) -> String {
        env_or("OLLAMA_URL", self.ollama_url.as_deref())
            .unwrap_or_else(|| "http://localhost:11434".to_string())
    }

    pub fn embedding_model(&self) -> String {
        env_or("EMBEDDING_MODEL", Some(&self.embedding_model)).unwrap_or_else(default_embedding_model)
    }

    pub fn generation_model(&self) -> String {
        env_or("OPENAI_MODEL", Some(&self.generation_model)).unwrap_or_else(default_generation_model)
    }

    pub fn embedding_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.embedding_max_attempts, Duration::from_millis(self.embedding_base_delay_ms))
    }

    pub fn topic_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.topic_max_attempts, Duration::from_millis(self.topic_base_delay_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_batch_size == 0 {
            return Err(Error::Config("embedding_batch_size must be > 0".to_string()));
        }
        if !(self.cluster_eps > 0.0 && self.cluster_eps <= 2.0) {
            return Err(Error::Config(format!(
                "cluster_eps must be in (0, 2], got {}",
                self.cluster_eps
            )));
        }
        if self.edit_gap_secs < 0.0 {
            return Err(Error::Config("edit_gap_secs must be >= 0".to_string()));
        }
        Ok(())
    }
}

fn env_or(var: &str, fallback: Option<&str>) -> Option<String> {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    fallback.filter(|v| !v.is_empty()).map(str::to_string)
}

fn resolve_data_dir(configured: Option<&str>) -> PathBuf {
    if let Some(dir) = env_or("BASE_DATA_DIR", configured) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|p| p.join("tangent"))
        .unwrap_or_else(|| PathBuf::from("data"))
}
