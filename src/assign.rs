//! Assignment engine.
//!
//! Splits a branch's sampled records into one group per (treatment, engine)
//! combination with a seeded shuffle followed by a round-robin deal. The
//! shuffle is keyed by source, partition and seed only, so a resumed run
//! reproduces identical groups regardless of which branches ran before it.
use crate::errors::BranchError;
use crate::model::{BranchKey, Combo, GroupKey, Record, RecordId};
use crate::store::{inspect_records, write_records, ArtifactPaths, ArtifactState};
use anyhow::Result;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Small deterministic RNG (splitmix64) so group membership does not depend
/// on the RNG choices of a particular `rand` release.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64_internal().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Derive the shuffle seed for one branch from the run seed.
pub fn derive_seed(branch: &BranchKey, seed: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(branch.source.as_bytes());
    hasher.update([0u8]);
    hasher.update(branch.partition.as_bytes());
    hasher.update([0u8]);
    hasher.update(seed.to_le_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// One group of the plan. Empty groups are kept in the plan but never written.
#[derive(Debug, Clone)]
pub struct PlannedGroup {
    pub key: GroupKey,
    pub records: Vec<Record>,
}

/// Deterministic partition of a branch's sample into groups.
#[derive(Debug, Clone)]
pub struct AssignmentPlan {
    pub branch: BranchKey,
    pub groups: Vec<PlannedGroup>,
}

impl AssignmentPlan {
    pub fn assigned_count(&self) -> usize {
        self.groups.iter().map(|group| group.records.len()).sum()
    }

    pub fn non_empty(&self) -> impl Iterator<Item = &PlannedGroup> {
        self.groups.iter().filter(|group| !group.records.is_empty())
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.groups.iter().map(|group| group.records.len()).collect()
    }
}

/// Shuffle record positions with the branch seed, then deal them round-robin
/// across `combos` in order. Earlier combinations receive the remainder.
pub fn plan_assignment(
    branch: &BranchKey,
    records: &[Record],
    combos: &[Combo],
    seed: u64,
) -> Result<AssignmentPlan, BranchError> {
    if combos.is_empty() {
        return Err(BranchError::Assignment {
            key: branch.to_string(),
            details: "no (treatment, engine) combinations configured".to_string(),
        });
    }
    let mut order: Vec<usize> = (0..records.len()).collect();
    let mut rng = DeterministicRng::new(derive_seed(branch, seed));
    order.shuffle(&mut rng);

    let mut groups: Vec<PlannedGroup> = combos
        .iter()
        .map(|combo| PlannedGroup {
            key: GroupKey::new(branch.clone(), combo.clone()),
            records: Vec::new(),
        })
        .collect();
    for (slot, position) in order.into_iter().enumerate() {
        let group = &mut groups[slot % combos.len()];
        let mut record = records[position].clone();
        record.tag_route(&group.key.combo);
        group.records.push(record);
    }

    let plan = AssignmentPlan {
        branch: branch.clone(),
        groups,
    };
    check_partition(records, &plan).map_err(|details| BranchError::Assignment {
        key: branch.to_string(),
        details,
    })?;
    Ok(plan)
}

/// Verify the plan is a disjoint, covering, balanced partition of `records`.
pub fn check_partition(records: &[Record], plan: &AssignmentPlan) -> Result<(), String> {
    let expected: BTreeSet<RecordId> = records.iter().map(Record::id).collect();
    if expected.len() != records.len() {
        return Err("sampled subset contains duplicate identities".to_string());
    }
    let assigned = plan.assigned_count();
    if assigned != records.len() {
        return Err(format!(
            "groups hold {assigned} records but the subset has {}",
            records.len()
        ));
    }
    let mut seen = BTreeSet::new();
    for group in &plan.groups {
        for record in &group.records {
            let id = record.id();
            if !expected.contains(&id) {
                return Err(format!("{} assigned {id} which was never sampled", group.key));
            }
            if !seen.insert(id.clone()) {
                return Err(format!("{id} assigned to more than one group"));
            }
        }
    }
    let sizes = plan.sizes();
    let max = sizes.iter().copied().max().unwrap_or(0);
    let min = sizes.iter().copied().min().unwrap_or(0);
    if max - min > 1 {
        return Err(format!("group sizes {sizes:?} are unbalanced"));
    }
    Ok(())
}

/// Outcome of making sure a branch's group artifacts exist.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssignOutcome {
    pub written: usize,
    pub reused: usize,
}

/// Write every non-empty group artifact that is missing or malformed.
///
/// Present group artifacts must hold exactly the planned identities; a
/// mismatch means the seed or sample changed underneath an existing
/// assignment and is reported instead of silently overwritten.
pub fn ensure_assigned(paths: &ArtifactPaths, plan: &AssignmentPlan) -> Result<AssignOutcome> {
    let mut outcome = AssignOutcome::default();
    for group in plan.non_empty() {
        let path = paths.assigned_path(&group.key);
        match inspect_records(&path) {
            ArtifactState::Ready(existing) => {
                let on_disk: BTreeSet<RecordId> = existing.iter().map(Record::id).collect();
                let planned: BTreeSet<RecordId> = group.records.iter().map(Record::id).collect();
                if on_disk != planned {
                    return Err(BranchError::Assignment {
                        key: group.key.to_string(),
                        details: format!(
                            "existing {} disagrees with the seeded plan; delete it to reassign",
                            path.display()
                        ),
                    }
                    .into());
                }
                outcome.reused += 1;
            }
            ArtifactState::Malformed(reason) => {
                debug!(group = %group.key, %reason, "rewriting malformed group artifact");
                write_records(&path, &group.records)?;
                outcome.written += 1;
            }
            ArtifactState::Missing => {
                write_records(&path, &group.records)?;
                outcome.written += 1;
            }
        }
    }
    info!(
        branch = %plan.branch,
        groups = plan.groups.len(),
        written = outcome.written,
        reused = outcome.reused,
        sizes = ?plan.sizes(),
        "assignment ready"
    );
    Ok(outcome)
}
