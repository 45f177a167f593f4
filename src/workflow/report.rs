//! Run summary, report snapshot and history persistence.
//!
//! `report.json` is replaced on every run; `history.jsonl` is append-only so
//! earlier runs stay auditable.
use crate::errors::BranchError;
use crate::model::BranchKey;
use crate::staging::write_json_atomic;
use crate::store::ArtifactPaths;
use crate::validate::Rejection;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Where one branch ended up after a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    Validated,
    Incomplete,
    Failed,
}

/// One recorded error, flattened for JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
}

impl From<&BranchError> for ErrorEntry {
    fn from(err: &BranchError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Per-(source, partition) counts and errors.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BranchSummary {
    pub source: String,
    pub partition: String,
    pub outcome: BranchOutcome,
    pub target: usize,
    pub sampled: usize,
    pub assigned: usize,
    pub groups: usize,
    pub groups_done: usize,
    pub transformed: usize,
    pub merged: usize,
    pub cleaned: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<Rejection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
}

impl BranchSummary {
    pub fn new(branch: &BranchKey, target: usize) -> Self {
        Self {
            source: branch.source.clone(),
            partition: branch.partition.clone(),
            outcome: BranchOutcome::Incomplete,
            target,
            sampled: 0,
            assigned: 0,
            groups: 0,
            groups_done: 0,
            transformed: 0,
            merged: 0,
            cleaned: 0,
            rejected: 0,
            rejections: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn key(&self) -> BranchKey {
        BranchKey::new(self.source.clone(), self.partition.clone())
    }

    /// Record a fatal error; the branch is failed from here on.
    pub fn fail(&mut self, err: &BranchError) {
        self.outcome = BranchOutcome::Failed;
        self.errors.push(err.into());
    }
}

/// Outcome of one pipeline run.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub started_at_epoch_ms: u64,
    pub elapsed_ms: u64,
    pub artifact_root: PathBuf,
    pub seed: u64,
    pub debug: bool,
    pub cancelled: bool,
    pub branches: Vec<BranchSummary>,
}

impl RunSummary {
    pub fn all_validated(&self) -> bool {
        self.branches
            .iter()
            .all(|branch| branch.outcome == BranchOutcome::Validated)
    }

    pub fn count(&self, outcome: BranchOutcome) -> usize {
        self.branches
            .iter()
            .filter(|branch| branch.outcome == outcome)
            .count()
    }
}

/// Compact history line for one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub started_at_epoch_ms: u64,
    pub elapsed_ms: u64,
    pub seed: u64,
    pub debug: bool,
    pub cancelled: bool,
    pub validated: usize,
    pub incomplete: usize,
    pub failed: usize,
    pub cleaned: usize,
    pub rejected: usize,
}

impl From<&RunSummary> for HistoryEntry {
    fn from(summary: &RunSummary) -> Self {
        Self {
            started_at_epoch_ms: summary.started_at_epoch_ms,
            elapsed_ms: summary.elapsed_ms,
            seed: summary.seed,
            debug: summary.debug,
            cancelled: summary.cancelled,
            validated: summary.count(BranchOutcome::Validated),
            incomplete: summary.count(BranchOutcome::Incomplete),
            failed: summary.count(BranchOutcome::Failed),
            cleaned: summary.branches.iter().map(|b| b.cleaned).sum(),
            rejected: summary.branches.iter().map(|b| b.rejected).sum(),
        }
    }
}

/// Write the latest run summary snapshot.
pub fn write_report(paths: &ArtifactPaths, summary: &RunSummary) -> Result<()> {
    write_json_atomic(&paths.report_path(), summary)
}

/// Append a history entry as JSONL.
pub fn append_history(paths: &ArtifactPaths, entry: &HistoryEntry) -> Result<()> {
    let path = paths.history_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let line = serde_json::to_string(entry).context("serialize history entry")?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Human-readable summary table, one line per branch.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    for branch in &summary.branches {
        out.push_str(&format!(
            "{}/{}: {:?} sampled={} assigned={} groups={}/{} transformed={} merged={} cleaned={} rejected={}\n",
            branch.source,
            branch.partition,
            branch.outcome,
            branch.sampled,
            branch.assigned,
            branch.groups_done,
            branch.groups,
            branch.transformed,
            branch.merged,
            branch.cleaned,
            branch.rejected,
        ));
        for error in &branch.errors {
            out.push_str(&format!("  {}: {}\n", error.kind, error.message));
        }
    }
    if summary.cancelled {
        out.push_str("run cancelled before every group was dispatched\n");
    }
    out
}
