use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::StudyError;
use crate::target::Variant;

/// One parameterized study configuration replaces the forked
/// orchestration-script revisions the original study accumulated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    #[serde(default)]
    pub study: StudySection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub targets: BTreeMap<Variant, TargetSection>,
    #[serde(default)]
    pub sweeps: SweepSection,
    #[serde(default)]
    pub queue: QueueSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudySection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub results_dir: PathBuf,
    #[serde(default = "default_chart_path")]
    pub chart_path: PathBuf,
    #[serde(default)]
    pub repetitions: u32,
}

impl Default for StudySection {
    fn default() -> Self {
        StudySection {
            name: String::new(),
            results_dir: PathBuf::new(),
            chart_path: default_chart_path(),
            repetitions: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSection {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub data_file: PathBuf,
    /// Fixed path every target writes its clustering artifact to. The
    /// runner renames it away after each successful configuration.
    #[serde(default)]
    pub cluster_output_file: PathBuf,
}

impl Default for ContextSection {
    fn default() -> Self {
        ContextSection {
            base_dir: default_base_dir(),
            data_file: PathBuf::new(),
            cluster_output_file: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSection {
    pub executable: PathBuf,
    /// Process-launcher prefix for the distributed family. Defaults to
    /// `mpirun` when unset.
    #[serde(default)]
    pub launcher: Option<String>,
}

/// Declared parameter ranges: explicit ordered sets, never generated
/// ranges, so irregular sweeps (powers of two plus boundary values)
/// stay expressible.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSection {
    #[serde(default)]
    pub thread_counts: Vec<u32>,
    #[serde(default)]
    pub processes_per_node: Vec<u32>,
    #[serde(default)]
    pub node_counts: Vec<u32>,
    #[serde(default)]
    pub block_sizes: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub account: String,
    #[serde(default = "default_time_limit")]
    pub time_limit: String,
    /// Queue user the adapter polls and cancels under. Defaults to the
    /// `USER` environment variable at runtime.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_submit_command")]
    pub submit_command: String,
    #[serde(default = "default_query_command")]
    pub query_command: String,
    #[serde(default = "default_cancel_command")]
    pub cancel_command: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        QueueSection {
            enabled: false,
            partition: String::new(),
            account: String::new(),
            time_limit: default_time_limit(),
            user: None,
            poll_interval_seconds: default_poll_interval(),
            submit_command: default_submit_command(),
            query_command: default_query_command(),
            cancel_command: default_cancel_command(),
        }
    }
}

fn default_chart_path() -> PathBuf {
    PathBuf::from("study_results.svg")
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_time_limit() -> String {
    "00:30:00".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_submit_command() -> String {
    "sbatch".to_string()
}

fn default_query_command() -> String {
    "squeue".to_string()
}

fn default_cancel_command() -> String {
    "scancel".to_string()
}

impl StudyConfig {
    pub fn load(path: &Path) -> Result<StudyConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read study config {}", path.display()))?;
        let config: StudyConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse study config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reports every missing required field at once rather than failing
    /// on the first one.
    pub fn validate(&self) -> Result<(), StudyError> {
        let mut missing = Vec::new();
        if self.study.name.is_empty() {
            missing.push("study.name");
        }
        if self.study.results_dir.as_os_str().is_empty() {
            missing.push("study.results_dir");
        }
        if self.study.repetitions == 0 {
            missing.push("study.repetitions (must be > 0)");
        }
        if self.context.data_file.as_os_str().is_empty() {
            missing.push("context.data_file");
        }
        if self.context.cluster_output_file.as_os_str().is_empty() {
            missing.push("context.cluster_output_file");
        }
        if self.targets.is_empty() {
            missing.push("targets (at least one variant)");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StudyError::Config(format!(
                "study config missing required fields:\n{}",
                missing
                    .iter()
                    .map(|f| format!("  - {}", f))
                    .collect::<Vec<_>>()
                    .join("\n")
            )))
        }
    }

    /// Configured variants in registry order.
    pub fn configured_variants(&self) -> Vec<Variant> {
        Variant::ALL
            .iter()
            .copied()
            .filter(|v| self.targets.contains_key(v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
study:
  name: scaling
  results_dir: data/out
  repetitions: 3
context:
  data_file: data/spotify.csv
  cluster_output_file: data/spotify_clusters.csv
targets:
  serial:
    executable: ./build/genre_reveal_party
  omp:
    executable: ./build/genre_reveal_party_omp
sweeps:
  thread_counts: [1, 4, 16]
"#
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let config: StudyConfig = serde_yaml::from_str(minimal_yaml()).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.study.repetitions, 3);
        assert_eq!(config.sweeps.thread_counts, vec![1, 4, 16]);
        assert_eq!(
            config.configured_variants(),
            vec![Variant::Serial, Variant::Omp]
        );
        assert_eq!(config.study.chart_path, PathBuf::from("study_results.svg"));
        assert!(!config.queue.enabled);
        assert_eq!(config.queue.submit_command, "sbatch");
    }

    #[test]
    fn validation_reports_all_missing_fields_at_once() {
        let config = StudyConfig::default();
        let err = config.validate().expect_err("empty config must fail");
        let msg = err.to_string();
        for field in [
            "study.name",
            "study.results_dir",
            "study.repetitions",
            "context.data_file",
            "context.cluster_output_file",
            "targets",
        ] {
            assert!(msg.contains(field), "missing `{}` in: {}", field, msg);
        }
    }

    #[test]
    fn validation_reports_only_absent_fields() {
        let config: StudyConfig = serde_yaml::from_str(minimal_yaml()).expect("parse");
        let mut config = config;
        config.study.repetitions = 0;
        let err = config.validate().expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("study.repetitions"), "got: {}", msg);
        assert!(!msg.contains("study.name"), "got: {}", msg);
    }

    #[test]
    fn queue_section_overrides_parse() {
        let yaml = r#"
queue:
  enabled: true
  partition: notchpeak
  account: cs6030
  time_limit: "01:00:00"
  poll_interval_seconds: 5
"#;
        let config: StudyConfig = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.queue.enabled);
        assert_eq!(config.queue.partition, "notchpeak");
        assert_eq!(config.queue.time_limit, "01:00:00");
        assert_eq!(config.queue.poll_interval_seconds, 5);
        assert_eq!(config.queue.cancel_command, "scancel");
    }
}
