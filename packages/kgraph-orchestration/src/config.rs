//! Pipeline configuration
//!
//! Loaded from YAML. `version: 1` is mandatory; every section and every
//! field has a default, so a file only lists what it overrides.
//!
//! ```yaml
//! version: 1
//! triage:
//!   confidence_threshold: 0.7
//! embedding:
//!   max_batch_size: 500
//!   business_hours_start: 8
//! store:
//!   path: /var/lib/kgraph/items.db
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::graph::NodeLabel;

pub const SUPPORTED_VERSIONS: [u32; 1] = [1];

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "KGRAPH_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

/// Rights triage thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriageConfig {
    /// Items below this rights confidence are quarantined
    pub confidence_threshold: f64,
    /// Failed share above which the batch fails triage
    pub failed_ratio: f64,
    /// Quarantined share above which the batch waits for review
    pub needs_review_ratio: f64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            failed_ratio: 0.5,
            needs_review_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Labels whose nodes survive orphan removal
    pub isolated_labels: Vec<NodeLabel>,
    /// Entity count from which a graph without domain edges is flagged
    pub min_nodes_for_density: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            isolated_labels: vec![NodeLabel::Term],
            min_nodes_for_density: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Requests per submitted job
    pub max_batch_size: usize,
    pub validating_delay_secs: u64,
    pub business_hours_interval_secs: u64,
    pub off_hours_interval_secs: u64,
    /// UTC hour, inclusive
    pub business_hours_start: u32,
    /// UTC hour, exclusive
    pub business_hours_end: u32,
    /// Consecutive failed status polls tolerated per job
    pub max_status_retries: u32,
    pub retry_base_delay_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            validating_delay_secs: 30,
            business_hours_interval_secs: 60,
            off_hours_interval_secs: 300,
            business_hours_start: 9,
            business_hours_end: 18,
            max_status_retries: 5,
            retry_base_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Batches run concurrently
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("kgraph.db"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PipelineConfig
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            triage: TriageConfig::default(),
            graph: GraphConfig::default(),
            embedding: EmbeddingConfig::default(),
            runtime: RuntimeConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)?;

        if !SUPPORTED_VERSIONS.contains(&config.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: config.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Explicit path, else `KGRAPH_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::from_yaml(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(env_path) => Self::from_yaml(PathBuf::from(env_path)),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self).map_err(ConfigError::Yaml)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let ratios = [
            ("triage.confidence_threshold", self.triage.confidence_threshold),
            ("triage.failed_ratio", self.triage.failed_ratio),
            ("triage.needs_review_ratio", self.triage.needs_review_ratio),
        ];
        for (field, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::range_with_hint(
                    field,
                    value,
                    0.0,
                    1.0,
                    "Ratios and confidences are fractions",
                ));
            }
        }

        let e = &self.embedding;
        if e.max_batch_size == 0 || e.max_batch_size > 50_000 {
            return Err(ConfigError::range_with_hint(
                "embedding.max_batch_size",
                e.max_batch_size,
                1,
                50_000,
                "Providers cap batch jobs at 50000 requests",
            ));
        }
        for (field, value) in [
            ("embedding.business_hours_start", e.business_hours_start),
            ("embedding.business_hours_end", e.business_hours_end),
        ] {
            if value > 24 {
                return Err(ConfigError::range_with_hint(
                    field,
                    value,
                    0,
                    24,
                    "Hours are UTC hours of the day",
                ));
            }
        }
        if e.business_hours_start > e.business_hours_end {
            return Err(ConfigError::range_with_hint(
                "embedding.business_hours_start",
                e.business_hours_start,
                0,
                e.business_hours_end,
                "Start must not be after business_hours_end",
            ));
        }
        if e.max_status_retries > 20 {
            return Err(ConfigError::range_with_hint(
                "embedding.max_status_retries",
                e.max_status_retries,
                0,
                20,
                "Backoff doubles per retry",
            ));
        }

        if self.runtime.workers == 0 || self.runtime.workers > 1024 {
            return Err(ConfigError::range_with_hint(
                "runtime.workers",
                self.runtime.workers,
                1,
                1024,
                "Set to the number of batches that may run at once",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.triage.confidence_threshold, 0.7);
        assert_eq!(config.triage.failed_ratio, 0.5);
        assert_eq!(config.triage.needs_review_ratio, 0.8);
        assert_eq!(config.graph.isolated_labels, vec![NodeLabel::Term]);
        assert_eq!(config.graph.min_nodes_for_density, 5);
        assert_eq!(config.embedding.validating_delay_secs, 30);
        assert_eq!(config.embedding.business_hours_interval_secs, 60);
        assert_eq!(config.embedding.off_hours_interval_secs, 300);
        assert!(config.runtime.workers > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_loading_partial_sections() {
        let file = write_yaml(
            r#"
version: 1
triage:
  confidence_threshold: 0.6
graph:
  isolated_labels: [Term, Person]
embedding:
  max_batch_size: 50
  business_hours_start: 8
  business_hours_end: 20
store:
  path: /tmp/items.db
"#,
        );

        let config = PipelineConfig::from_yaml(file.path()).unwrap();
        assert_eq!(config.triage.confidence_threshold, 0.6);
        assert_eq!(config.triage.failed_ratio, 0.5);
        assert_eq!(
            config.graph.isolated_labels,
            vec![NodeLabel::Term, NodeLabel::Person]
        );
        assert_eq!(config.embedding.max_batch_size, 50);
        assert_eq!(config.embedding.off_hours_interval_secs, 300);
        assert_eq!(config.store.path, PathBuf::from("/tmp/items.db"));
    }

    #[test]
    fn test_yaml_missing_version() {
        let file = write_yaml("triage:\n  failed_ratio: 0.4\n");
        assert!(matches!(
            PipelineConfig::from_yaml(file.path()),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let file = write_yaml("version: 2\n");
        let result = PipelineConfig::from_yaml(file.path());
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::UnsupportedVersion { found: 2, .. }
        ));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let file = write_yaml("version: 1\ntriage:\n  confidence: 0.7\n");
        assert!(PipelineConfig::from_yaml(file.path()).is_err());
    }

    #[test]
    fn test_range_validation() {
        let result = PipelineConfig::from_yaml_str("version: 1\ntriage:\n  failed_ratio: 1.5\n");
        assert!(matches!(result, Err(ConfigError::Range { .. })));

        let result = PipelineConfig::from_yaml_str(
            "version: 1\nembedding:\n  business_hours_start: 19\n  business_hours_end: 9\n",
        );
        assert!(matches!(result, Err(ConfigError::Range { .. })));

        let result = PipelineConfig::from_yaml_str("version: 1\nruntime:\n  workers: 0\n");
        assert!(matches!(result, Err(ConfigError::Range { .. })));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = PipelineConfig::default();
        config.embedding.max_batch_size = 250;
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("max_batch_size: 250"));

        let back = PipelineConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load_explicit_path_wins() {
        let file = write_yaml("version: 1\nruntime:\n  workers: 3\n");
        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.runtime.workers, 3);
    }
}
