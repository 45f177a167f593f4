//! Merge and structural validation.
//!
//! Merging concatenates the completed group outputs of one branch after
//! checking that no identity was lost, invented or duplicated. Validation
//! then compares every merged record against its sampled original and keeps
//! only the structurally intact ones in the cleaned artifact. The same
//! per-record comparison tells the runner which records to resubmit.
use crate::assign::AssignmentPlan;
use crate::errors::BranchError;
use crate::model::{is_route_key, GroupKey, Record, RecordId, Role};
use crate::runner::completed_output;
use crate::store::{inspect_records, write_records, ArtifactPaths, ArtifactState};
use crate::util::preview_list;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Message fields that must survive a transformation untouched.
const PRESERVED_MESSAGE_FIELDS: &[&str] = &["tool_calls", "tools"];

const PREVIEW_LIMIT: usize = 5;

/// A merged record excluded from the cleaned artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub id: String,
    pub reasons: Vec<String>,
}

/// Result of merging and validating one branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    pub cleaned: usize,
    pub rejections: Vec<Rejection>,
    /// Non-empty groups whose transformed artifact is not there yet.
    pub missing_groups: Vec<GroupKey>,
    /// Whether the merged and cleaned artifacts were already on disk.
    pub reused: bool,
}

impl MergeReport {
    pub fn rejected(&self) -> usize {
        self.rejections.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_groups.is_empty()
    }
}

/// List every way `transformed` deviates structurally from `original`.
///
/// Message content is free to change; counts, roles, key sets, names,
/// tool-call descriptors and the presence of required metadata keys are not.
pub fn structural_differences(
    original: &Record,
    transformed: &Record,
    required_metadata_keys: &[String],
) -> Vec<String> {
    let mut reasons = Vec::new();
    if original.messages.len() != transformed.messages.len() {
        reasons.push(format!(
            "message count changed from {} to {}",
            original.messages.len(),
            transformed.messages.len()
        ));
    }
    for (position, (before, after)) in original
        .messages
        .iter()
        .zip(&transformed.messages)
        .enumerate()
    {
        if before.role != after.role {
            reasons.push(format!(
                "message {position}: role changed from {} to {}",
                before.role, after.role
            ));
        }
        let before_keys = before.key_set();
        let after_keys = after.key_set();
        if before_keys != after_keys {
            reasons.push(format!(
                "message {position}: keys changed from [{}] to [{}]",
                before_keys.join(", "),
                after_keys.join(", ")
            ));
        }
        if before.name != after.name {
            reasons.push(format!("message {position}: name changed"));
        }
        for field in PRESERVED_MESSAGE_FIELDS {
            if before.extra.get(*field) != after.extra.get(*field) {
                reasons.push(format!("message {position}: {field} changed"));
            }
        }
    }
    for key in required_metadata_keys.iter().filter(|key| !is_route_key(key)) {
        let had = original.metadata.contains_key(key);
        let has = transformed.metadata.contains_key(key);
        if had != has {
            reasons.push(format!(
                "metadata key {key:?} {}",
                if had { "was dropped" } else { "was added" }
            ));
        }
    }
    reasons
}

/// Inputs with no output of the same identity, or whose first such output is
/// structurally broken, in input order.
pub fn pending_inputs<'a>(
    inputs: &'a [Record],
    outputs: &[Record],
    required_metadata_keys: &[String],
) -> Vec<&'a Record> {
    let mut by_id: BTreeMap<RecordId, &Record> = BTreeMap::new();
    for output in outputs {
        by_id.entry(output.id()).or_insert(output);
    }
    inputs
        .iter()
        .filter(|input| match by_id.get(&input.id()) {
            Some(output) => !structural_differences(input, output, required_metadata_keys).is_empty(),
            None => true,
        })
        .collect()
}

/// Fold `repaired` into `output`. A repair is accepted only when its identity
/// was submitted in `batch` and it is structurally valid against that input;
/// it replaces the existing output of the same identity or is appended.
/// Returns how many repairs were accepted.
pub fn accept_repairs(
    batch: &[Record],
    output: &mut Vec<Record>,
    repaired: Vec<Record>,
    required_metadata_keys: &[String],
) -> usize {
    let submitted: BTreeMap<RecordId, &Record> =
        batch.iter().map(|record| (record.id(), record)).collect();
    let mut accepted = BTreeSet::new();
    for record in repaired {
        let id = record.id();
        let Some(original) = submitted.get(&id) else {
            continue;
        };
        if accepted.contains(&id)
            || !structural_differences(original, &record, required_metadata_keys).is_empty()
        {
            continue;
        }
        match output.iter_mut().find(|existing| existing.id() == id) {
            Some(slot) => *slot = record,
            None => output.push(record),
        }
        accepted.insert(id);
    }
    accepted.len()
}

fn is_json_payload(content: &Value) -> bool {
    match content {
        Value::String(text) => serde_json::from_str::<Value>(text).is_ok(),
        _ => true,
    }
}

/// Put back tool results a transformer turned into unparseable text.
///
/// A transformed tool message whose string content no longer parses as JSON
/// gets the sampled content and name back, provided the sampled content
/// parses. Returns how many messages were restored.
pub fn restore_tool_messages(original: &Record, transformed: &mut Record) -> usize {
    if original.messages.len() != transformed.messages.len() {
        return 0;
    }
    let mut restored = 0;
    for (before, after) in original.messages.iter().zip(transformed.messages.iter_mut()) {
        if before.role != Role::Tool || after.role != Role::Tool {
            continue;
        }
        if is_json_payload(&after.content) || !is_json_payload(&before.content) {
            continue;
        }
        after.content = before.content.clone();
        after.name = before.name.clone();
        restored += 1;
    }
    restored
}

/// Split `merged` into structurally valid records and rejections.
///
/// Every merged identity must exist in `raw`; callers check identities first.
pub fn validate_records(
    raw: &[Record],
    merged: &[Record],
    required_metadata_keys: &[String],
) -> (Vec<Record>, Vec<Rejection>) {
    let originals: BTreeMap<RecordId, &Record> =
        raw.iter().map(|record| (record.id(), record)).collect();
    let mut cleaned = Vec::with_capacity(merged.len());
    let mut rejections = Vec::new();
    for record in merged {
        let id = record.id();
        let reasons = match originals.get(&id) {
            Some(original) => structural_differences(original, record, required_metadata_keys),
            None => vec!["no sampled original".to_string()],
        };
        if reasons.is_empty() {
            cleaned.push(record.clone());
        } else {
            rejections.push(Rejection {
                id: id.to_string(),
                reasons,
            });
        }
    }
    (cleaned, rejections)
}

/// Check that `merged` holds exactly the `expected` identities, once each.
pub fn check_identities(
    key: &str,
    expected: &BTreeSet<RecordId>,
    merged: &[Record],
) -> Result<(), BranchError> {
    let mut seen = BTreeSet::new();
    let mut duplicates = Vec::new();
    let mut unexpected = Vec::new();
    for record in merged {
        let id = record.id();
        if !expected.contains(&id) {
            unexpected.push(id.clone());
        }
        if !seen.insert(id.clone()) {
            duplicates.push(id);
        }
    }
    let missing: Vec<&RecordId> = expected.difference(&seen).collect();

    let mut problems = Vec::new();
    if !duplicates.is_empty() {
        problems.push(format!(
            "duplicated {}",
            preview_list(&duplicates, PREVIEW_LIMIT)
        ));
    }
    if !unexpected.is_empty() {
        problems.push(format!(
            "unexpected {}",
            preview_list(&unexpected, PREVIEW_LIMIT)
        ));
    }
    if !missing.is_empty() {
        problems.push(format!("lost {}", preview_list(&missing, PREVIEW_LIMIT)));
    }
    if problems.is_empty() {
        return Ok(());
    }
    Err(BranchError::Integrity {
        key: key.to_string(),
        details: problems.join("; "),
    })
}

/// Whether an existing merged artifact covers the whole sample.
pub fn merged_is_complete(raw: &[Record], merged: &[Record]) -> bool {
    if merged.len() != raw.len() {
        return false;
    }
    let expected: BTreeSet<RecordId> = raw.iter().map(Record::id).collect();
    let found: BTreeSet<RecordId> = merged.iter().map(Record::id).collect();
    found.len() == merged.len() && found == expected
}

/// Merge the completed groups of `plan` and write the merged and cleaned
/// artifacts.
///
/// Group outputs are tagged with their route and have garbled tool results
/// restored before validation. Groups without a transformed artifact are
/// reported as missing and the merge proceeds with the rest. When the merged
/// artifact on disk already equals the merge of the current outputs it is
/// reused, and the cleaned artifact is rewritten only if it is missing or
/// stale. An identity mismatch aborts the branch with
/// [`BranchError::Integrity`] before anything is written.
pub fn merge_branch(
    paths: &ArtifactPaths,
    plan: &AssignmentPlan,
    raw: &[Record],
    required_metadata_keys: &[String],
) -> Result<MergeReport> {
    let branch = &plan.branch;
    let merged_path = paths.merged_path(branch);
    let cleaned_path = paths.cleaned_path(branch);

    let mut expected = BTreeSet::new();
    let mut merged = Vec::new();
    let mut missing_groups = Vec::new();
    for group in plan.non_empty() {
        match completed_output(paths, &group.key) {
            Some(output) => {
                expected.extend(group.records.iter().map(Record::id));
                merged.extend(output.into_iter().map(|mut record| {
                    record.tag_route(&group.key.combo);
                    record
                }));
            }
            None => missing_groups.push(group.key.clone()),
        }
    }
    check_identities(&branch.to_string(), &expected, &merged)?;

    let originals: BTreeMap<RecordId, &Record> =
        raw.iter().map(|record| (record.id(), record)).collect();
    let mut restored = 0;
    for record in &mut merged {
        if let Some(original) = originals.get(&record.id()) {
            restored += restore_tool_messages(original, record);
        }
    }

    if missing_groups.is_empty() {
        if let ArtifactState::Ready(existing) = inspect_records(&merged_path) {
            if existing == merged && merged_is_complete(raw, &merged) {
                let (cleaned, rejections) =
                    validate_records(raw, &merged, required_metadata_keys);
                let cleaned_ready = matches!(
                    inspect_records(&cleaned_path),
                    ArtifactState::Ready(existing) if existing == cleaned
                );
                if !cleaned_ready {
                    write_records(&cleaned_path, &cleaned)?;
                }
                debug!(%branch, cleaned_rewritten = !cleaned_ready, "merged artifact present");
                return Ok(MergeReport {
                    merged: merged.len(),
                    cleaned: cleaned.len(),
                    rejections,
                    missing_groups,
                    reused: cleaned_ready,
                });
            }
        }
    }

    if !missing_groups.is_empty() {
        warn!(
            %branch,
            missing = missing_groups.len(),
            groups = %preview_list(&missing_groups, PREVIEW_LIMIT),
            "merging without every group"
        );
    }
    if merged.is_empty() {
        return Ok(MergeReport {
            missing_groups,
            ..MergeReport::default()
        });
    }
    if restored > 0 {
        info!(%branch, restored, "tool results restored from the sample");
    }

    let (cleaned, rejections) = validate_records(raw, &merged, required_metadata_keys);
    for rejection in &rejections {
        warn!(
            %branch,
            id = %rejection.id,
            reasons = %rejection.reasons.join("; "),
            "record rejected"
        );
    }
    write_records(&merged_path, &merged)?;
    write_records(&cleaned_path, &cleaned)?;
    info!(
        %branch,
        merged = merged.len(),
        cleaned = cleaned.len(),
        rejected = rejections.len(),
        "branch merged"
    );
    Ok(MergeReport {
        merged: merged.len(),
        cleaned: cleaned.len(),
        rejections,
        missing_groups,
        reused: false,
    })
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
