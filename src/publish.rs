//! Publisher adapters.
//!
//! Publishing hands the cleaned records of every validated branch to an
//! external destination. Only the cleaned artifact is ever read.
use crate::config::PipelineConfig;
use crate::invoke::CommandTemplate;
use crate::model::{BranchKey, Record};
use crate::staging::{write_bytes_atomic, write_json_atomic};
use crate::store::{load_records, ArtifactPaths};
use crate::workflow::status_summary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Facts about the published split, written next to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublishMetadata {
    pub source: String,
    pub partition: String,
    pub records: usize,
    pub seed: u64,
    pub treatments: Vec<String>,
    pub engines: Vec<String>,
}

/// Accepts finished, validated splits.
pub trait Publisher {
    fn publish(&self, branch: &BranchKey, records: &[Record], meta: &PublishMetadata)
        -> Result<()>;
}

/// Writes `<dir>/<source>/<partition>.jsonl` plus a `.meta.json` sidecar.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    dir: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn split_path(&self, branch: &BranchKey) -> PathBuf {
        self.dir
            .join(&branch.source)
            .join(format!("{}.jsonl", branch.partition))
    }

    pub fn meta_path(&self, branch: &BranchKey) -> PathBuf {
        self.dir
            .join(&branch.source)
            .join(format!("{}.meta.json", branch.partition))
    }
}

impl Publisher for DirectoryPublisher {
    fn publish(
        &self,
        branch: &BranchKey,
        records: &[Record],
        meta: &PublishMetadata,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        for record in records {
            serde_json::to_writer(&mut bytes, record)
                .with_context(|| format!("serialize {}", record.id()))?;
            bytes.push(b'\n');
        }
        write_bytes_atomic(&self.split_path(branch), &bytes)?;
        write_json_atomic(&self.meta_path(branch), meta)
    }
}

/// Pipes the cleaned records to an upload command.
///
/// The template may use `{source}` and `{partition}`; the JSON array of
/// records arrives on stdin.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    template: CommandTemplate,
}

impl CommandPublisher {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    pub fn from_command(command: &str) -> Result<Self> {
        let template = CommandTemplate::parse(command)?;
        template.resolve_program()?;
        Ok(Self::new(template))
    }
}

impl Publisher for CommandPublisher {
    fn publish(
        &self,
        branch: &BranchKey,
        records: &[Record],
        meta: &PublishMetadata,
    ) -> Result<()> {
        let input = serde_json::to_vec(records).context("serialize publish input")?;
        let records_text = meta.records.to_string();
        self.template.run(
            &[
                ("source", branch.source.as_str()),
                ("partition", branch.partition.as_str()),
            ],
            &[("RECAST_RECORDS", records_text.as_str())],
            Some(input.as_slice()),
        )?;
        Ok(())
    }
}

/// What happened during a publish pass.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl PublishSummary {
    pub fn all_published(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Publish every validated branch of `config`; skip the rest with a warning.
pub fn publish_validated(config: &PipelineConfig, publisher: &dyn Publisher) -> PublishSummary {
    let paths = ArtifactPaths::new(config.artifact_root());
    let mut summary = PublishSummary::default();
    for status in status_summary(config) {
        let branch = status.key();
        if !status.is_validated() {
            warn!(%branch, state = %status.state, "branch not validated; skipping publish");
            summary.skipped.push(branch.to_string());
            continue;
        }
        match publish_branch(config, &paths, &branch, publisher) {
            Ok(records) => {
                info!(%branch, records, "branch published");
                summary.published.push(branch.to_string());
            }
            Err(err) => {
                warn!(%branch, error = %format!("{err:#}"), "publish failed");
                summary.failed.push(format!("{branch}: {err:#}"));
            }
        }
    }
    summary
}

fn publish_branch(
    config: &PipelineConfig,
    paths: &ArtifactPaths,
    branch: &BranchKey,
    publisher: &dyn Publisher,
) -> Result<usize> {
    let records = load_records(&paths.cleaned_path(branch))?;
    let meta = PublishMetadata {
        source: branch.source.clone(),
        partition: branch.partition.clone(),
        records: records.len(),
        seed: config.seed,
        treatments: config.treatments.clone(),
        engines: config.engines.clone(),
    };
    publisher.publish(branch, &records, &meta)?;
    Ok(records.len())
}
