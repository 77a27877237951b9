//! Application configuration for the lakehouse pipeline.
//!
//! User config lives at `~/.lakehouse/lakehouse.toml`.
//! CLI flags override config file values, which override defaults.
//! A [`PipelineConfig`] is derived once at run start and never changes
//! for the duration of that run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{LakehouseError, Result};
use crate::types::Stage;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "lakehouse.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".lakehouse";

// ---------------------------------------------------------------------------
// Config structs (matching lakehouse.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub quality: QualityThresholds,

    #[serde(default)]
    pub fingerprint: FingerprintRules,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub index: IndexSection,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Records with fewer characters than this are rejected when cleaning.
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,

    /// Upper bound for any single storage or index call.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Storage labels for each stage.
    #[serde(default)]
    pub stage_names: StageNames,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            min_content_length: default_min_content_length(),
            io_timeout_ms: default_io_timeout_ms(),
            stage_names: StageNames::default(),
        }
    }
}

fn default_min_content_length() -> usize {
    50
}
fn default_io_timeout_ms() -> u64 {
    30_000
}

/// Labels under which each stage's batches are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNames {
    #[serde(default = "default_raw_name")]
    pub raw: String,
    #[serde(default = "default_cleaned_name")]
    pub cleaned: String,
    #[serde(default = "default_curated_name")]
    pub curated: String,
}

impl StageNames {
    /// Storage label for `stage`.
    pub fn label(&self, stage: Stage) -> &str {
        match stage {
            Stage::Raw => &self.raw,
            Stage::Cleaned => &self.cleaned,
            Stage::Curated => &self.curated,
        }
    }

    /// Labels must be non-empty and distinct.
    pub fn validate(&self) -> Result<()> {
        let labels = [&self.raw, &self.cleaned, &self.curated];
        if labels.iter().any(|l| l.trim().is_empty()) {
            return Err(LakehouseError::config("stage names must not be empty"));
        }
        if self.raw == self.cleaned || self.raw == self.curated || self.cleaned == self.curated {
            return Err(LakehouseError::config("stage names must be distinct"));
        }
        Ok(())
    }
}

impl Default for StageNames {
    fn default() -> Self {
        Self {
            raw: default_raw_name(),
            cleaned: default_cleaned_name(),
            curated: default_curated_name(),
        }
    }
}

fn default_raw_name() -> String {
    "raw".into()
}
fn default_cleaned_name() -> String {
    "cleaned".into()
}
fn default_curated_name() -> String {
    "curated".into()
}

/// `[quality]` section.
///
/// Rates are inclusive: a batch whose rate equals the threshold passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    #[serde(default = "default_max_rejection_rate")]
    pub max_rejection_rate: f64,

    #[serde(default = "default_max_duplicate_rate")]
    pub max_duplicate_rate: f64,

    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_rejection_rate: default_max_rejection_rate(),
            max_duplicate_rate: default_max_duplicate_rate(),
            min_batch_size: default_min_batch_size(),
        }
    }
}

impl QualityThresholds {
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("max_rejection_rate", self.max_rejection_rate),
            ("max_duplicate_rate", self.max_duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(LakehouseError::config(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        Ok(())
    }
}

fn default_max_rejection_rate() -> f64 {
    0.2
}
fn default_max_duplicate_rate() -> f64 {
    0.5
}
fn default_min_batch_size() -> usize {
    1
}

/// `[fingerprint]` section: content normalization applied before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRules {
    /// When false, content is lowercased before hashing.
    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    /// When true, runs of whitespace count as a single space and ends are trimmed.
    #[serde(default = "default_true")]
    pub collapse_whitespace: bool,
}

impl Default for FingerprintRules {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            collapse_whitespace: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// libSQL database file holding every stage, lineage and sync state.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "var/lakehouse.db".into()
}

/// `[index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSection {
    /// Base URL of the vector index service. Sync is disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the env var holding the index API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout.
    #[serde(default = "default_index_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            timeout_ms: default_index_timeout_ms(),
        }
    }
}

impl IndexSection {
    /// Parsed endpoint, if configured.
    pub fn endpoint_url(&self) -> Result<Option<Url>> {
        self.endpoint
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    LakehouseError::config(format!("invalid index endpoint '{raw}': {e}"))
                })
            })
            .transpose()
    }

    /// API key read from the configured env var, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
    }
}

fn default_api_key_env() -> String {
    "LAKEHOUSE_INDEX_API_KEY".into()
}
fn default_index_timeout_ms() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub thresholds: QualityThresholds,
    pub min_content_length: usize,
    pub fingerprint: FingerprintRules,
    pub io_timeout: Duration,
    pub stage_names: StageNames,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        self.stage_names.validate()?;
        if self.io_timeout.is_zero() {
            return Err(LakehouseError::config("io_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            thresholds: config.quality,
            min_content_length: config.pipeline.min_content_length,
            fingerprint: config.fingerprint,
            io_timeout: Duration::from_millis(config.pipeline.io_timeout_ms),
            stage_names: config.pipeline.stage_names.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.lakehouse/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LakehouseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.lakehouse/lakehouse.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LakehouseError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LakehouseError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LakehouseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LakehouseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LakehouseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_rejection_rate"));
        assert!(toml_str.contains("LAKEHOUSE_INDEX_API_KEY"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[quality]
max_rejection_rate = 0.1

[pipeline.stage_names]
raw = "bronze"

[index]
endpoint = "http://localhost:8900/v1"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.quality.max_rejection_rate, 0.1);
        assert_eq!(config.quality.min_batch_size, 1);
        assert_eq!(config.pipeline.min_content_length, 50);
        assert_eq!(config.pipeline.stage_names.label(Stage::Raw), "bronze");
        assert_eq!(config.pipeline.stage_names.label(Stage::Curated), "curated");
        assert!(config.index.endpoint_url().unwrap().is_some());
    }

    #[test]
    fn pipeline_config_from_app_config() {
        let app = AppConfig::default();
        let pipeline = PipelineConfig::from(&app);
        assert_eq!(pipeline.min_content_length, 50);
        assert_eq!(pipeline.io_timeout, Duration::from_secs(30));
        assert!(pipeline.fingerprint.case_sensitive);
        pipeline.validate().expect("defaults are valid");
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let mut config = PipelineConfig::default();
        config.thresholds.max_rejection_rate = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_rejection_rate"));
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let mut config = PipelineConfig::default();
        config.stage_names.cleaned = "raw".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let section = IndexSection {
            endpoint: Some("not a url".into()),
            ..IndexSection::default()
        };
        assert!(section.endpoint_url().is_err());
    }
}
