//! Configuration for pipelines and the demo runner.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline shape and policies
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Input and stop conditions for the demo run
    #[serde(default)]
    pub run: RunConfig,

    /// Tokio runtime tuning
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// What a transform stage does when its mapping function fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the error and cancel the whole pipeline.
    #[default]
    AbortPipeline,
    /// Drop the item, count it, and keep going.
    SkipItem,
}

/// Options recognized by [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items each conduit can hold. 0 makes every hand-off a rendezvous.
    #[serde(default)]
    pub buffer_capacity: usize,

    /// Parallel replicas per transform stage
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,

    /// Transform failure policy
    #[serde(default)]
    pub on_error: ErrorPolicy,

    /// Enable periodic progress reporting
    #[serde(default)]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the pipeline finishes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 0,
            replica_count: default_replica_count(),
            on_error: ErrorPolicy::AbortPipeline,
            enable_metrics: false,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl PipelineConfig {
    /// Check the options a pipeline cannot run without.
    pub fn validate(&self) -> Result<(), String> {
        if self.replica_count == 0 {
            return Err("replica_count must be > 0".to_string());
        }
        if self.enable_metrics && self.metrics_interval_secs == 0 {
            return Err("metrics_interval_secs must be > 0 when metrics are enabled".to_string());
        }
        Ok(())
    }
}

/// Seed sequence and stop conditions for the squares demo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// First seed value
    #[serde(default = "default_start")]
    pub start: i64,

    /// Number of seeds. Absent means the sequence never ends.
    #[serde(default)]
    pub count: Option<u64>,

    /// Cancel the pipeline after reading this many results
    #[serde(default)]
    pub take: Option<u64>,

    /// Make the transform fail for multiples of this value
    #[serde(default)]
    pub fail_multiples_of: Option<i64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            start: default_start(),
            count: Some(5),
            take: None,
            fail_multiples_of: None,
        }
    }
}

/// Tokio runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of Tokio worker threads (None = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline.validate().map_err(anyhow::Error::msg)?;

        if self.run.count.is_none() && self.run.take.is_none() {
            anyhow::bail!("An endless run (no count) needs `take` to stop it");
        }
        if self.run.fail_multiples_of == Some(0) {
            anyhow::bail!("fail_multiples_of must be non-zero");
        }
        if self.runtime.worker_threads == Some(0) {
            anyhow::bail!("worker_threads must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_replica_count() -> usize { 2 }
fn default_metrics_interval() -> u64 { 10 }
fn default_start() -> i64 { 1 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.buffer_capacity, 0);
        assert_eq!(config.replica_count, 2);
        assert_eq!(config.on_error, ErrorPolicy::AbortPipeline);
        assert!(!config.enable_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_replicas_rejected() {
        let config = PipelineConfig {
            replica_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_defaults_fill_in() {
        let config = Config::from_yaml(
            r#"
pipeline:
  buffer_capacity: 4
  on_error: skip_item
run:
  count: 10
"#,
        )
        .unwrap();

        assert_eq!(config.pipeline.buffer_capacity, 4);
        assert_eq!(config.pipeline.replica_count, 2);
        assert_eq!(config.pipeline.on_error, ErrorPolicy::SkipItem);
        assert_eq!(config.run.start, 1);
        assert_eq!(config.run.count, Some(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let config = Config::from_json(
            r#"{"pipeline": {"replica_count": 4, "on_error": "abort_pipeline"}, "run": {"start": 3, "take": 2}}"#,
        )
        .unwrap();

        assert_eq!(config.pipeline.replica_count, 4);
        assert_eq!(config.run.start, 3);
        // A run block without count means an endless seed sequence
        assert_eq!(config.run.count, None);
        assert_eq!(config.run.take, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endless_run_without_take_is_invalid() {
        let config = Config::from_yaml("run:\n  start: 1\n").unwrap();
        assert!(config.run.count.is_none());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_keeps_policy() {
        let mut config = Config::default();
        config.pipeline.on_error = ErrorPolicy::SkipItem;

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("skip_item"));

        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.pipeline.on_error, ErrorPolicy::SkipItem);
    }

    #[test]
    fn test_from_file_detects_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"run": {"count": 3}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.run.count, Some(3));
    }
}
