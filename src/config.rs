//! Pipeline configuration.
//!
//! This module loads, validates and normalizes the run configuration so every
//! stage derives the same branch list, group list and artifact root.
use crate::model::{combos, safe_component, BranchKey, Combo};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Environment fallback for the transform command template.
pub const TRANSFORM_COMMAND_ENV: &str = "RECAST_TRANSFORM_COMMAND";

const DEFAULT_SOURCES: [&str; 4] = [
    "deepa2-aaac01-thinking",
    "deepa2-aaac02-thinking",
    "deepa2-aaac03-thinking",
    "deepa2-folly-thinking",
];
const DEFAULT_TREATMENTS: [&str; 2] = ["a", "b"];
const DEFAULT_ENGINES: [&str; 2] = ["kit.gpt-oss-120b", "kit.qwen3-vl-235b-a22b-instruct"];
const DEFAULT_SEED: u64 = 42;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_DEBUG_SAMPLE_SIZE: usize = 5;
const DEFAULT_MAX_REPAIR_LOOPS: u32 = 3;

/// A named partition with its target sample size.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    pub name: String,
    pub size: usize,
}

impl PartitionSpec {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

impl FromStr for PartitionSpec {
    type Err = String;

    /// Parse `NAME=SIZE`, e.g. `train=10000`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, size) = value
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=SIZE, got {value:?}"))?;
        let size = size
            .trim()
            .parse::<usize>()
            .map_err(|err| format!("invalid size in {value:?}: {err}"))?;
        Ok(PartitionSpec::new(name.trim(), size))
    }
}

/// Where sampled records come from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SamplerConfig {
    /// Local corpus laid out as `<corpus>/<source>/<partition>.jsonl`.
    Directory { corpus: PathBuf },
    /// External command printing a JSON array of records.
    Command { command: String },
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig::Directory {
            corpus: PathBuf::from("corpus"),
        }
    }
}

/// Bounded retry with exponential backoff for group invocations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Full run configuration. Missing fields fall back to [`default_config`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    pub sources: Vec<String>,
    pub partitions: Vec<PartitionSpec>,
    pub treatments: Vec<String>,
    pub engines: Vec<String>,
    pub seed: u64,
    pub debug: bool,
    pub debug_sample_size: usize,
    pub data_root: PathBuf,
    pub max_workers: usize,
    /// Rounds of per-record resubmission for broken outputs; zero disables.
    pub max_repair_loops: u32,
    /// Records per transformer invocation; unset sends each group whole.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Transform command template; falls back to `RECAST_TRANSFORM_COMMAND`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    pub sampler: SamplerConfig,
    pub retry: RetryConfig,
    pub required_metadata_keys: Vec<String>,
    pub messages_field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        default_config()
    }
}

/// Build the default config.
///
/// Defaults reproduce the production layout: four sources, three partitions,
/// two treatments and two engines.
pub fn default_config() -> PipelineConfig {
    PipelineConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        sources: DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
        partitions: vec![
            PartitionSpec::new("train", 10_000),
            PartitionSpec::new("validation", 600),
            PartitionSpec::new("test", 600),
        ],
        treatments: DEFAULT_TREATMENTS.iter().map(|s| s.to_string()).collect(),
        engines: DEFAULT_ENGINES.iter().map(|s| s.to_string()).collect(),
        seed: DEFAULT_SEED,
        debug: false,
        debug_sample_size: DEFAULT_DEBUG_SAMPLE_SIZE,
        data_root: PathBuf::from("data"),
        max_workers: DEFAULT_MAX_WORKERS,
        max_repair_loops: DEFAULT_MAX_REPAIR_LOOPS,
        batch_size: None,
        transform: None,
        sampler: SamplerConfig::default(),
        retry: RetryConfig::default(),
        required_metadata_keys: Vec::new(),
        messages_field: "messages".to_string(),
        timeout_secs: None,
    }
}

/// Render a pretty JSON config stub.
pub fn config_stub() -> Result<String> {
    serde_json::to_string_pretty(&default_config()).context("serialize config stub")
}

/// Load a config file; fields it omits keep their defaults.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: PipelineConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

/// Command-line overrides layered on top of a loaded config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub sources: Vec<String>,
    pub partitions: Vec<PartitionSpec>,
    pub treatments: Vec<String>,
    pub engines: Vec<String>,
    pub seed: Option<u64>,
    pub debug: bool,
    pub data_root: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub max_repair_loops: Option<u32>,
    pub batch_size: Option<usize>,
    pub transform: Option<String>,
    pub corpus: Option<PathBuf>,
    pub sampler_command: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl PipelineConfig {
    /// Apply overrides; empty lists leave the configured values untouched.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if !overrides.sources.is_empty() {
            self.sources = overrides.sources;
        }
        if !overrides.partitions.is_empty() {
            self.partitions = overrides.partitions;
        }
        if !overrides.treatments.is_empty() {
            self.treatments = overrides.treatments;
        }
        if !overrides.engines.is_empty() {
            self.engines = overrides.engines;
        }
        if let Some(seed) = overrides.seed {
            self.seed = seed;
        }
        self.debug |= overrides.debug;
        if let Some(root) = overrides.data_root {
            self.data_root = root;
        }
        if let Some(workers) = overrides.max_workers {
            self.max_workers = workers;
        }
        if let Some(loops) = overrides.max_repair_loops {
            self.max_repair_loops = loops;
        }
        if overrides.batch_size.is_some() {
            self.batch_size = overrides.batch_size;
        }
        if overrides.transform.is_some() {
            self.transform = overrides.transform;
        }
        if let Some(command) = overrides.sampler_command {
            self.sampler = SamplerConfig::Command { command };
        } else if let Some(corpus) = overrides.corpus {
            self.sampler = SamplerConfig::Directory { corpus };
        }
        if overrides.timeout_secs.is_some() {
            self.timeout_secs = overrides.timeout_secs;
        }
    }

    /// Fill the transform command from the environment when unset.
    pub fn apply_env(&mut self) {
        if self.transform.is_none() {
            self.transform = std::env::var(TRANSFORM_COMMAND_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty());
        }
    }

    /// Artifact root; debug runs are isolated under `<data_root>_debug`.
    pub fn artifact_root(&self) -> PathBuf {
        if !self.debug {
            return self.data_root.clone();
        }
        let name = self
            .data_root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string());
        self.data_root.with_file_name(format!("{name}_debug"))
    }

    /// Partitions to process with their effective target sizes.
    ///
    /// Debug runs keep only the first partition and shrink its size.
    pub fn effective_partitions(&self) -> Vec<PartitionSpec> {
        if !self.debug {
            return self.partitions.clone();
        }
        self.partitions
            .iter()
            .take(1)
            .map(|spec| PartitionSpec::new(spec.name.clone(), spec.size.min(self.debug_sample_size)))
            .collect()
    }

    /// Cross product of sources and effective partitions, sources outer.
    pub fn branches(&self) -> Vec<(BranchKey, usize)> {
        let partitions = self.effective_partitions();
        self.sources
            .iter()
            .flat_map(|source| {
                partitions
                    .iter()
                    .map(move |spec| (BranchKey::new(source.clone(), spec.name.clone()), spec.size))
            })
            .collect()
    }

    pub fn combos(&self) -> Vec<Combo> {
        combos(&self.treatments, &self.engines)
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]*$").expect("valid name regex"))
}

fn engine_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9./\-]*$").expect("valid engine regex"))
}

/// Validate the config before any stage runs.
///
/// Names must be filesystem-safe and free of `_`, which separates the
/// components of composite artifact names.
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    validate_names("sources", &config.sources, name_pattern())?;
    let partition_names: Vec<String> = config.partitions.iter().map(|p| p.name.clone()).collect();
    validate_names("partitions", &partition_names, name_pattern())?;
    validate_names("treatments", &config.treatments, name_pattern())?;
    validate_names("engines", &config.engines, engine_pattern())?;

    let sanitized: BTreeSet<String> = config.engines.iter().map(|e| safe_component(e)).collect();
    if sanitized.len() != config.engines.len() {
        return Err(anyhow!("engine names collide once '/' is replaced by '-'"));
    }
    if let Some(spec) = config.partitions.iter().find(|spec| spec.size == 0) {
        return Err(anyhow!("partition {:?} has a zero target size", spec.name));
    }
    if config.debug && config.debug_sample_size == 0 {
        return Err(anyhow!("debug_sample_size must be positive"));
    }
    if config.max_workers == 0 {
        return Err(anyhow!("max_workers must be positive"));
    }
    if config.batch_size == Some(0) {
        return Err(anyhow!("batch_size must be positive"));
    }
    if config.retry.max_attempts == 0 {
        return Err(anyhow!("retry.max_attempts must be positive"));
    }
    if config.messages_field.trim().is_empty() {
        return Err(anyhow!("messages_field must be non-empty"));
    }
    if let SamplerConfig::Command { command } = &config.sampler {
        if command.trim().is_empty() {
            return Err(anyhow!("sampler command must be non-empty"));
        }
    }
    Ok(())
}

fn validate_names(field: &str, names: &[String], pattern: &Regex) -> Result<()> {
    if names.is_empty() {
        return Err(anyhow!("{field} must list at least one entry"));
    }
    let mut seen = BTreeSet::new();
    for name in names {
        if !pattern.is_match(name) {
            return Err(anyhow!(
                "{field} entry {name:?} must match {}",
                pattern.as_str()
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(anyhow!("{field} lists {name:?} more than once"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
