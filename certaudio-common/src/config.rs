//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a TOML file; everything else is passed
//! explicitly as configuration objects built from it. Resolution order for any
//! value is command line → environment → TOML → built-in default.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "CERTAUDIO_ROOT_FOLDER";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database and the local object store
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External service endpoints
    #[serde(default)]
    pub services: ServiceEndpoints,

    /// Pipeline tuning overrides (all optional, defaults live with the pipeline)
    #[serde(default)]
    pub pipeline: PipelineOverrides,

    /// API key for the narration (language generation) service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration_api_key: Option<String>,

    /// API key for the speech synthesis service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_api_key: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or full filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Base URLs of the external collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    /// Educational-path catalog service
    pub catalog_url: Option<String>,
    /// Exam skill outline service
    pub skills_url: Option<String>,
    /// Documentation search service
    pub search_url: Option<String>,
    /// OpenAI-compatible chat completions endpoint
    pub narration_url: Option<String>,
    /// Model (or deployment) name for narration
    pub narration_model: Option<String>,
    /// Text-to-speech REST endpoint
    pub speech_url: Option<String>,
    /// Public base URL of the object store; `file://` URLs when unset
    pub objects_base_url: Option<String>,
}

/// Optional pipeline knobs read from the `[pipeline]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineOverrides {
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub topics_per_episode: Option<usize>,
    pub deprioritize_low_priority: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub call_timeout_secs: Option<u64>,
    pub requests_per_second: Option<u32>,
    pub fetch_concurrency: Option<usize>,
    pub title_match_threshold: Option<f64>,
    pub description_match_threshold: Option<f64>,
    pub search_top: Option<usize>,
    pub instructional_voice: Option<String>,
    pub podcast_host_voice: Option<String>,
    pub podcast_expert_voice: Option<String>,
    pub output_format: Option<String>,
    pub max_segment_chars: Option<usize>,
}

/// Root folder resolution priority:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("certaudio"))
        .unwrap_or_else(|| PathBuf::from("./certaudio_data"))
}

/// Default TOML config path for a module (e.g. `~/.config/certaudio/certaudio-gen.toml`)
pub fn default_config_path(module_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("certaudio").join(format!("{}.toml", module_name)))
}

/// Load TOML config; a missing file yields the defaults
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No TOML config file, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))
}

/// Write TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Ensures the root folder exists and hands out paths inside it
pub struct RootFolder {
    path: PathBuf,
}

impl RootFolder {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Create the root folder if missing
    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SQLite metadata store location
    pub fn database_path(&self) -> PathBuf {
        self.path.join("certaudio.db")
    }

    /// Local object store root
    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }
}
