//! Pipeline driver.
//!
//! Sequences sampling, assignment, transformation and merge-validation over
//! every configured (source, partition) branch. Each stage first checks its
//! output artifact and is a no-op when it is already well-formed, so the
//! driver holds no state between runs and can be restarted at any point.
mod report;
mod status;

pub use report::{
    append_history, render_summary, write_report, BranchOutcome, BranchSummary, ErrorEntry,
    HistoryEntry, RunSummary,
};
pub use status::{branch_state, render_status, status_summary, BranchState, BranchStatus};

use crate::assign::{ensure_assigned, plan_assignment, AssignmentPlan};
use crate::config::{validate_config, PipelineConfig};
use crate::errors::{error_chain_message, BranchError};
use crate::model::{BranchKey, GroupKey, Record, RecordId};
use crate::runner::{CancelToken, GroupOutcome, RepairPolicy, RetryPolicy, TransformRunner};
use crate::sampler::Sampler;
use crate::store::{create_layout, inspect_records, write_records, ArtifactPaths, ArtifactState};
use crate::transform::Transformer;
use crate::validate::merge_branch;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// A branch that made it through sampling and assignment.
struct PreparedBranch {
    raw: Vec<Record>,
    plan: AssignmentPlan,
}

/// Run the whole pipeline once.
///
/// Returns `Err` only for catastrophic problems (invalid config, an
/// unwritable artifact root); branch-local failures are collected in the
/// summary instead.
pub fn run_pipeline(
    config: &PipelineConfig,
    sampler: &dyn Sampler,
    transformer: &dyn Transformer,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    validate_config(config)?;
    let started = Instant::now();
    let started_at_epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    let paths = ArtifactPaths::new(config.artifact_root());
    create_layout(&paths)?;
    let combos = config.combos();
    info!(
        root = %paths.root().display(),
        branches = config.branches().len(),
        combos = combos.len(),
        seed = config.seed,
        debug = config.debug,
        "pipeline starting"
    );

    let mut summaries = Vec::new();
    let mut prepared: BTreeMap<BranchKey, PreparedBranch> = BTreeMap::new();
    for (branch, target) in config.branches() {
        let mut summary = BranchSummary::new(&branch, target);
        match prepare_branch(&paths, config, &branch, target, sampler) {
            Ok(ready) => {
                summary.sampled = ready.raw.len();
                summary.assigned = ready.plan.assigned_count();
                summary.groups = ready.plan.non_empty().count();
                prepared.insert(branch, ready);
            }
            Err(err) => {
                warn!(%branch, kind = err.kind(), error = %err, "branch failed");
                summary.fail(&err);
            }
        }
        summaries.push(summary);
    }

    let pending: Vec<GroupKey> = prepared
        .values()
        .flat_map(|ready| ready.plan.non_empty().map(|group| group.key.clone()))
        .collect();
    let reports = TransformRunner::new(&paths, transformer)
        .with_retry(RetryPolicy::from(&config.retry))
        .with_repair(RepairPolicy::from(config))
        .with_max_workers(config.max_workers)
        .with_cancel(cancel.clone())
        .run(&pending);

    let mut cancelled = false;
    for report in &reports {
        let Some(summary) = summaries
            .iter_mut()
            .find(|summary| summary.key() == report.key.branch)
        else {
            continue;
        };
        match &report.outcome {
            GroupOutcome::Skipped { records } | GroupOutcome::Transformed { records, .. } => {
                summary.groups_done += 1;
                summary.transformed += records;
            }
            GroupOutcome::Failed(err) => summary.errors.push(err.into()),
            GroupOutcome::Cancelled => cancelled = true,
        }
    }

    for summary in summaries.iter_mut() {
        let Some(ready) = prepared.get(&summary.key()) else {
            continue;
        };
        match merge_branch(
            &paths,
            &ready.plan,
            &ready.raw,
            &config.required_metadata_keys,
        ) {
            Ok(merge) => {
                summary.merged = merge.merged;
                summary.cleaned = merge.cleaned;
                summary.rejected = merge.rejected();
                summary.rejections = merge.rejections.clone();
                summary.outcome = if merge.is_complete() {
                    BranchOutcome::Validated
                } else {
                    BranchOutcome::Incomplete
                };
            }
            Err(err) => {
                let err = branch_error(err, |reason| BranchError::Integrity {
                    key: summary.key().to_string(),
                    details: reason,
                });
                warn!(branch = %summary.key(), kind = err.kind(), error = %err, "branch failed");
                summary.fail(&err);
            }
        }
    }

    let run = RunSummary {
        started_at_epoch_ms,
        elapsed_ms: started.elapsed().as_millis() as u64,
        artifact_root: paths.root().to_path_buf(),
        seed: config.seed,
        debug: config.debug,
        cancelled,
        branches: summaries,
    };
    write_report(&paths, &run)?;
    append_history(&paths, &HistoryEntry::from(&run))?;
    info!(
        validated = run.count(BranchOutcome::Validated),
        incomplete = run.count(BranchOutcome::Incomplete),
        failed = run.count(BranchOutcome::Failed),
        elapsed_ms = run.elapsed_ms,
        "pipeline finished"
    );
    Ok(run)
}

/// Sample and assign one branch.
fn prepare_branch(
    paths: &ArtifactPaths,
    config: &PipelineConfig,
    branch: &BranchKey,
    target: usize,
    sampler: &dyn Sampler,
) -> Result<PreparedBranch, BranchError> {
    let raw = ensure_sampled(paths, config, branch, target, sampler)?;
    let plan = plan_assignment(branch, &raw, &config.combos(), config.seed)?;
    ensure_assigned(paths, &plan).map_err(|err| {
        branch_error(err, |reason| BranchError::Assignment {
            key: branch.to_string(),
            details: reason,
        })
    })?;
    Ok(PreparedBranch { raw, plan })
}

/// Reuse the raw artifact when present and well-formed, otherwise sample.
fn ensure_sampled(
    paths: &ArtifactPaths,
    config: &PipelineConfig,
    branch: &BranchKey,
    target: usize,
    sampler: &dyn Sampler,
) -> Result<Vec<Record>, BranchError> {
    let path = paths.raw_path(branch);
    let sampling_error = |reason: String| BranchError::Sampling {
        key: branch.to_string(),
        reason,
    };
    match inspect_records(&path) {
        ArtifactState::Ready(raw) if !raw.is_empty() => {
            check_sample(branch, &raw).map_err(sampling_error)?;
            return Ok(raw);
        }
        ArtifactState::Malformed(reason) => {
            warn!(%branch, %reason, "raw artifact malformed; resampling");
        }
        _ => {}
    }

    let start = Instant::now();
    let raw = sampler
        .sample(&branch.source, &branch.partition, target, config.seed)
        .map_err(|err| sampling_error(error_chain_message(&err)))?;
    check_sample(branch, &raw).map_err(sampling_error)?;
    if raw.len() < target {
        warn!(%branch, records = raw.len(), target, "partition smaller than target");
    }
    write_records(&path, &raw).map_err(|err| sampling_error(error_chain_message(&err)))?;
    info!(
        %branch,
        records = raw.len(),
        elapsed_ms = start.elapsed().as_millis(),
        "branch sampled"
    );
    Ok(raw)
}

fn check_sample(branch: &BranchKey, raw: &[Record]) -> Result<(), String> {
    if raw.is_empty() {
        return Err("sampler returned no records".to_string());
    }
    if let Some(foreign) = raw.iter().find(|record| record.source != branch.source) {
        return Err(format!("record {} belongs to another source", foreign.id()));
    }
    let mut seen = BTreeSet::new();
    if let Some(dup) = raw
        .iter()
        .map(Record::id)
        .find(|id: &RecordId| !seen.insert(id.clone()))
    {
        return Err(format!("record {dup} sampled twice"));
    }
    Ok(())
}

/// Recover a [`BranchError`] from an anyhow error, wrapping anything else
/// (I/O while writing artifacts) with `wrap`.
fn branch_error(err: anyhow::Error, wrap: impl FnOnce(String) -> BranchError) -> BranchError {
    match err.downcast::<BranchError>() {
        Ok(branch) => branch,
        Err(other) => wrap(error_chain_message(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Role};

    fn record(source: &str, index: u64) -> Record {
        Record {
            source: source.to_string(),
            index,
            messages: vec![Message::new(Role::User, "q")],
            metadata: Default::default(),
        }
    }

    #[test]
    fn sample_checks_reject_foreign_and_duplicate_records() {
        let branch = BranchKey::new("s", "train");
        assert!(check_sample(&branch, &[record("s", 0), record("s", 1)]).is_ok());
        assert!(check_sample(&branch, &[]).is_err());
        assert!(check_sample(&branch, &[record("other", 0)])
            .unwrap_err()
            .contains("another source"));
        assert!(check_sample(&branch, &[record("s", 3), record("s", 3)])
            .unwrap_err()
            .contains("sampled twice"));
    }

    #[test]
    fn branch_errors_survive_anyhow_round_trip() {
        let original = BranchError::Integrity {
            key: "s/train".to_string(),
            details: "lost s#1".to_string(),
        };
        let recovered = branch_error(original.clone().into(), |_| unreachable!());
        assert_eq!(recovered, original);

        let wrapped = branch_error(anyhow::anyhow!("disk full"), |reason| {
            BranchError::Assignment {
                key: "s/train".to_string(),
                details: reason,
            }
        });
        assert_eq!(wrapped.kind(), "assignment");
    }
}
