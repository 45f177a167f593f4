//! Sampler adapters.
//!
//! A sampler yields a bounded, reproducible subset of one source partition.
//! The driver only depends on the [`Sampler`] trait; the two adapters here
//! read either a local corpus directory or the stdout of an external command.
use crate::assign::{derive_seed, DeterministicRng};
use crate::config::{PipelineConfig, SamplerConfig};
use crate::invoke::CommandTemplate;
use crate::model::{BranchKey, Message, Record};
use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Keeps the sample order independent from the assignment shuffle, which is
/// seeded from the same branch key.
const SAMPLE_SEED_SALT: u64 = 0x7361_6d70_6c65_0001;

/// Produces a deterministic subset of a source partition.
pub trait Sampler: Send + Sync {
    /// Return at most `n` records; fewer when the partition is smaller.
    fn sample(&self, source: &str, partition: &str, n: usize, seed: u64) -> Result<Vec<Record>>;
}

/// Build the sampler the config asks for.
pub fn sampler_from_config(config: &PipelineConfig) -> Result<Box<dyn Sampler>> {
    match &config.sampler {
        SamplerConfig::Directory { corpus } => Ok(Box::new(DirectorySampler::new(
            corpus.clone(),
            config.messages_field.clone(),
        ))),
        SamplerConfig::Command { command } => {
            Ok(Box::new(CommandSampler::new(CommandTemplate::parse(command)?)))
        }
    }
}

/// Reads `<corpus>/<source>/<partition>.jsonl` (or `.json`).
///
/// The first `n` rows are taken in file order and then shuffled with the
/// seed; each row's original position becomes the record index.
#[derive(Debug, Clone)]
pub struct DirectorySampler {
    corpus: PathBuf,
    messages_field: String,
}

impl DirectorySampler {
    pub fn new(corpus: PathBuf, messages_field: String) -> Self {
        Self {
            corpus,
            messages_field,
        }
    }

    fn partition_file(&self, source: &str, partition: &str) -> Result<PathBuf> {
        let dir = self.corpus.join(source);
        for ext in ["jsonl", "json"] {
            let candidate = dir.join(format!("{partition}.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(anyhow!(
            "no {partition}.jsonl or {partition}.json under {}",
            dir.display()
        ))
    }

    fn read_rows(&self, path: &Path, n: usize) -> Result<Vec<Map<String, Value>>> {
        let is_array = path.extension().is_some_and(|ext| ext == "json");
        if is_array {
            let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
            let rows: Vec<Map<String, Value>> = serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parse {}", path.display()))?;
            return Ok(rows.into_iter().take(n).collect());
        }
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut rows = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            if rows.len() >= n {
                break;
            }
            let line = line.with_context(|| format!("read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Map<String, Value> = serde_json::from_str(&line)
                .with_context(|| format!("parse {} line {}", path.display(), line_no + 1))?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn row_to_record(&self, source: &str, index: u64, mut row: Map<String, Value>) -> Result<Record> {
        let messages = row
            .remove(&self.messages_field)
            .ok_or_else(|| anyhow!("row {index} has no {:?} field", self.messages_field))?;
        let messages: Vec<Message> = serde_json::from_value(messages)
            .with_context(|| format!("parse messages of row {index}"))?;
        Ok(Record {
            source: source.to_string(),
            index,
            messages,
            metadata: row,
        })
    }
}

impl Sampler for DirectorySampler {
    fn sample(&self, source: &str, partition: &str, n: usize, seed: u64) -> Result<Vec<Record>> {
        let path = self.partition_file(source, partition)?;
        let rows = self.read_rows(&path, n)?;
        let mut records = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| self.row_to_record(source, index as u64, row))
            .collect::<Result<Vec<_>>>()?;
        let branch = BranchKey::new(source, partition);
        let mut rng = DeterministicRng::new(derive_seed(&branch, seed) ^ SAMPLE_SEED_SALT);
        records.shuffle(&mut rng);
        Ok(records)
    }
}

/// Runs an external corpus accessor.
///
/// The template may use `{source}`, `{partition}`, `{n}` and `{seed}`; the
/// command must print a JSON array of records.
#[derive(Debug, Clone)]
pub struct CommandSampler {
    template: CommandTemplate,
}

impl CommandSampler {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }
}

impl Sampler for CommandSampler {
    fn sample(&self, source: &str, partition: &str, n: usize, seed: u64) -> Result<Vec<Record>> {
        let n_text = n.to_string();
        let seed_text = seed.to_string();
        let stdout = self.template.run(
            &[
                ("source", source),
                ("partition", partition),
                ("n", n_text.as_str()),
                ("seed", seed_text.as_str()),
            ],
            &[],
            None,
        )?;
        let records: Vec<Record> =
            serde_json::from_slice(&stdout).context("parse sampler output as records")?;
        if records.len() > n {
            return Err(anyhow!(
                "sampler returned {} records, more than the requested {n}",
                records.len()
            ));
        }
        Ok(records)
    }
}
