//! Read-only branch status.
//!
//! Every state is derived from the artifacts on disk; computing it never
//! writes anything.
use crate::assign::plan_assignment;
use crate::config::PipelineConfig;
use crate::model::{BranchKey, Combo};
use crate::runner::completed_output;
use crate::store::{inspect_records, ArtifactPaths, ArtifactState};
use crate::validate::{merged_is_complete, validate_records};
use serde::Serialize;
use std::fmt;

/// Position of one branch in `Unsampled -> ... -> Validated`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchState {
    Unsampled,
    Sampled { records: usize },
    Assigned { groups: usize },
    GroupsPending { done: usize, total: usize },
    Merged { merged: usize },
    Validated { cleaned: usize, rejected: usize },
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchState::Unsampled => f.write_str("unsampled"),
            BranchState::Sampled { records } => write!(f, "sampled ({records} records)"),
            BranchState::Assigned { groups } => write!(f, "assigned ({groups} groups)"),
            BranchState::GroupsPending { done, total } => {
                write!(f, "groups pending ({done}/{total} done)")
            }
            BranchState::Merged { merged } => write!(f, "merged ({merged} records)"),
            BranchState::Validated { cleaned, rejected } => {
                write!(f, "validated ({cleaned} cleaned, {rejected} rejected)")
            }
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BranchStatus {
    pub source: String,
    pub partition: String,
    #[serde(flatten)]
    pub state: BranchState,
}

impl BranchStatus {
    pub fn key(&self) -> BranchKey {
        BranchKey::new(self.source.clone(), self.partition.clone())
    }

    pub fn is_validated(&self) -> bool {
        matches!(self.state, BranchState::Validated { .. })
    }
}

/// Derive the state of every configured branch.
pub fn status_summary(config: &PipelineConfig) -> Vec<BranchStatus> {
    let paths = ArtifactPaths::new(config.artifact_root());
    let combos = config.combos();
    config
        .branches()
        .into_iter()
        .map(|(branch, _)| BranchStatus {
            source: branch.source.clone(),
            partition: branch.partition.clone(),
            state: branch_state(
                &paths,
                &branch,
                &combos,
                config.seed,
                &config.required_metadata_keys,
            ),
        })
        .collect()
}

/// Derive one branch's state from its artifacts.
///
/// A branch counts as validated only when its cleaned artifact is exactly
/// what validating the merged artifact under `required_metadata_keys` yields
/// now; a stale or foreign cleaned file leaves it at `Merged`.
pub fn branch_state(
    paths: &ArtifactPaths,
    branch: &BranchKey,
    combos: &[Combo],
    seed: u64,
    required_metadata_keys: &[String],
) -> BranchState {
    let raw = match inspect_records(&paths.raw_path(branch)) {
        ArtifactState::Ready(raw) if !raw.is_empty() => raw,
        _ => return BranchState::Unsampled,
    };

    if let ArtifactState::Ready(merged) = inspect_records(&paths.merged_path(branch)) {
        if merged_is_complete(&raw, &merged) {
            let (expected, rejections) = validate_records(&raw, &merged, required_metadata_keys);
            return match inspect_records(&paths.cleaned_path(branch)) {
                ArtifactState::Ready(cleaned) if cleaned == expected => BranchState::Validated {
                    cleaned: cleaned.len(),
                    rejected: rejections.len(),
                },
                _ => BranchState::Merged {
                    merged: merged.len(),
                },
            };
        }
    }

    let Ok(plan) = plan_assignment(branch, &raw, combos, seed) else {
        return BranchState::Sampled { records: raw.len() };
    };
    let groups: Vec<_> = plan.non_empty().map(|group| &group.key).collect();
    let assigned = groups
        .iter()
        .filter(|key| matches!(inspect_records(&paths.assigned_path(key)), ArtifactState::Ready(_)))
        .count();
    if assigned < groups.len() {
        return BranchState::Sampled { records: raw.len() };
    }
    let done = groups
        .iter()
        .filter(|key| completed_output(paths, key).is_some())
        .count();
    if done == 0 {
        return BranchState::Assigned {
            groups: groups.len(),
        };
    }
    BranchState::GroupsPending {
        done,
        total: groups.len(),
    }
}

/// Text rendering, one line per branch.
pub fn render_status(statuses: &[BranchStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("{}/{}: {}\n", status.source, status.partition, status.state))
        .collect()
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
