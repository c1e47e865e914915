//! Process-wide configuration, loaded from a TOML file whose path can be
//! overridden with an environment variable. Missing or unparseable config
//! falls back to defaults, following `cognitod`'s `Config::load` pattern.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::error::CoreError;

const DEFAULT_CONFIG_PATH: &str = "/etc/taskscoped/taskscoped.toml";
const ENV_CONFIG_PATH: &str = "TASKSCOPED_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `TASKSCOPED_CONFIG` environment variable. A missing or unparseable
    /// file yields defaults rather than failing startup.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Validate the recognized options; `InputValidation` failures abort
    /// startup before any pool is spawned.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pipeline.read_workers == 0 {
            return Err(CoreError::input_validation("read_workers must be > 0"));
        }
        if self.pipeline.process_workers == 0 {
            return Err(CoreError::input_validation("process_workers must be > 0"));
        }
        if self.pipeline.batch_size == 0 {
            return Err(CoreError::input_validation("batch_size must be > 0"));
        }
        if self.pipeline.batch_flush_interval_ms == 0 {
            return Err(CoreError::input_validation(
                "batch_flush_interval must be > 0",
            ));
        }
        StorageFormat::parse(&self.storage.format).map_err(|_| {
            CoreError::input_validation(format!(
                "unknown storage_format: {}",
                self.storage.format
            ))
        })?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_read_workers")]
    pub read_workers: usize,
    #[serde(default = "default_process_workers")]
    pub process_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_flush_interval_ms")]
    pub batch_flush_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_silent")]
    pub silent: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_workers: default_read_workers(),
            process_workers: default_process_workers(),
            batch_size: default_batch_size(),
            batch_flush_interval_ms: default_batch_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
            silent: default_silent(),
        }
    }
}

fn default_read_workers() -> usize {
    3
}
fn default_process_workers() -> usize {
    5
}
fn default_batch_size() -> usize {
    1_000
}
fn default_batch_flush_interval_ms() -> u64 {
    100
}
fn default_queue_capacity() -> usize {
    1 << 20
}
fn default_silent() -> bool {
    false
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_format")]
    pub format: String,
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            format: default_storage_format(),
            dir: default_storage_dir(),
        }
    }
}

fn default_storage_format() -> String {
    "binary".to_string()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/taskscoped/sessions")
}

/// Recognized `storage_format` names, mapping to the two encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Framed,
    Textual,
}

impl StorageFormat {
    pub fn parse(name: &str) -> Result<Self, ()> {
        match name {
            "binary" | "framed" | "protobuf" | "pb" | "proto" => Ok(StorageFormat::Framed),
            "jsonl" | "json" | "lines" => Ok(StorageFormat::Textual),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_enabled")]
    pub enabled: bool,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: default_web_enabled(),
            port: default_web_port(),
        }
    }
}

fn default_web_enabled() -> bool {
    true
}
fn default_web_port() -> u16 {
    7777
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SamplingConfig {
    /// (kind-name, fraction in [0, 1]) pairs, written to the kernel
    /// sampling map as integer percent rounded to nearest.
    #[serde(default)]
    pub rates: Vec<(String, f64)>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_cadence_ms")]
    pub cadence_ms: u64,
    #[serde(default)]
    pub file_suffix: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cadence_ms: default_metrics_cadence_ms(),
            file_suffix: None,
        }
    }
}

fn default_metrics_cadence_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_read_workers_is_rejected() {
        let mut cfg = Config::default();
        cfg.pipeline.read_workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_storage_format_is_rejected() {
        let mut cfg = Config::default();
        cfg.storage.format = "xml".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load_from(&PathBuf::from("/nonexistent/path/taskscoped.toml"));
        assert_eq!(cfg.pipeline.read_workers, default_read_workers());
    }

    #[test]
    fn storage_format_recognizes_all_aliases() {
        for name in ["binary", "framed", "protobuf", "pb", "proto"] {
            assert_eq!(StorageFormat::parse(name), Ok(StorageFormat::Framed));
        }
        for name in ["jsonl", "json", "lines"] {
            assert_eq!(StorageFormat::parse(name), Ok(StorageFormat::Textual));
        }
        assert!(StorageFormat::parse("yaml").is_err());
    }
}
