//! Capture configuration.
//!
//! Loaded from TOML (usually `.spyglass/config.toml`) or built in code.
//! Every field has a default, so an empty file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The spyglass data directory name.
pub const SPYGLASS_DIR: &str = ".spyglass";
/// The config file name within the spyglass directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Master switch. When false, wrapping returns the original client.
    pub enabled: bool,
    /// Probability that a new trace is recorded, in [0, 1].
    pub sample_rate: f64,
    /// Whether message contents are included in records.
    pub capture_content: bool,
    /// Stream branching settings.
    pub stream: StreamConfig,
    /// Emission queue settings.
    pub emitter: EmitterConfig,
    /// Redaction hook behavior.
    pub redaction: RedactionConfig,
    /// JSONL output settings.
    pub writer: WriterSettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            capture_content: true,
            stream: StreamConfig::default(),
            emitter: EmitterConfig::default(),
            redaction: RedactionConfig::default(),
            writer: WriterSettings::default(),
        }
    }
}

/// Stream branching configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Upper bound on background consumption of a branched stream.
    pub max_wait_secs: u64,
    /// Count a stream that produced tool calls but no text as a response
    /// rather than `empty_response`.
    pub accept_tool_only: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 300,
            accept_tool_only: true,
        }
    }
}

impl StreamConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Emitter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Records buffered before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// What to record when the redaction hook fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionFallback {
    /// Drop the payload.
    #[default]
    Omit,
    /// Record the payload as-is.
    Unredacted,
}

/// Redaction configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub on_failure: RedactionFallback,
}

/// JSONL collector configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WriterSettings {
    /// Record file (session mode) or directory (daily rotation).
    pub path: Option<PathBuf>,
    /// Write every record to one file instead of dated files.
    pub session_mode: bool,
}

impl WriterSettings {
    /// Resolve the path relative to the .spyglass directory.
    pub fn resolve_path(&self, spyglass_dir: Option<&Path>) -> PathBuf {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("records"));
        if path.is_absolute() {
            path
        } else if let Some(dir) = spyglass_dir {
            dir.join(path)
        } else {
            PathBuf::from(SPYGLASS_DIR).join(path)
        }
    }
}

impl CaptureConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.spyglass/config.toml` in the directory and its parents.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let spyglass_dir = dir.join(SPYGLASS_DIR);
            let config_path = spyglass_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, spyglass_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if !(0.0..=1.0).contains(&self.sample_rate) {
            errors.push(ConfigValidationError {
                field: "sample_rate".to_string(),
                message: format!("Sample rate {} is outside [0, 1].", self.sample_rate),
            });
        }

        if self.stream.max_wait_secs == 0 {
            errors.push(ConfigValidationError {
                field: "stream.max_wait_secs".to_string(),
                message: "Stream wait bound must be positive.".to_string(),
            });
        }

        if self.emitter.queue_capacity == 0 {
            errors.push(ConfigValidationError {
                field: "emitter.queue_capacity".to_string(),
                message: "Emitter queue capacity must be positive.".to_string(),
            });
        }

        errors
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert!(config.enabled);
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.stream.max_wait(), Duration::from_secs(300));
        assert!(config.stream.accept_tool_only);
        assert_eq!(config.emitter.queue_capacity, 1024);
        assert_eq!(config.redaction.on_failure, RedactionFallback::Omit);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = CaptureConfig::from_toml_str(
            r#"
sample_rate = 0.25

[stream]
max_wait_secs = 30
accept_tool_only = false

[redaction]
on_failure = "unredacted"
"#,
        )
        .unwrap();

        assert_eq!(config.sample_rate, 0.25);
        assert_eq!(config.stream.max_wait_secs, 30);
        assert!(!config.stream.accept_tool_only);
        assert_eq!(config.redaction.on_failure, RedactionFallback::Unredacted);
        // Untouched sections keep their defaults
        assert_eq!(config.emitter.queue_capacity, 1024);
        assert!(config.capture_content);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CaptureConfig::default();
        config.sample_rate = 1.5;
        config.emitter.queue_capacity = 0;

        let errors = config.validate();
        assert!(errors.iter().any(|e| e.field == "sample_rate"));
        assert!(errors.iter().any(|e| e.field == "emitter.queue_capacity"));
    }

    #[test]
    fn test_find_and_load_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let spyglass_dir = dir.path().join(SPYGLASS_DIR);
        std::fs::create_dir_all(&spyglass_dir).unwrap();
        std::fs::write(spyglass_dir.join(CONFIG_FILE), "capture_content = false\n").unwrap();

        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let (config, found) = CaptureConfig::find_and_load_from(&nested).unwrap().unwrap();
        assert!(!config.capture_content);
        assert_eq!(found, spyglass_dir);
    }

    #[test]
    fn test_resolve_writer_path() {
        let settings = WriterSettings::default();
        assert_eq!(
            settings.resolve_path(Some(Path::new("/project/.spyglass"))),
            PathBuf::from("/project/.spyglass/records")
        );
        assert_eq!(settings.resolve_path(None), PathBuf::from(".spyglass/records"));
    }
}
