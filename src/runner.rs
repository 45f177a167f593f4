//! Transform runner.
//!
//! Invokes the transformer for each pending group on a bounded worker pool.
//! A group's artifact is written only once all of its batches succeeded.
//! Records whose output came back missing or structurally broken are then
//! re-submitted in bounded repair rounds within the same pass. A group whose
//! transformed artifact already exists and is well-formed is skipped without
//! invoking anything, so re-running after an unrelated failure is cheap and
//! side-effect free.
use crate::config::{PipelineConfig, RetryConfig};
use crate::errors::{error_chain_message, BranchError};
use crate::model::{GroupKey, Record};
use crate::store::{inspect_records, load_records, write_records, ArtifactPaths, ArtifactState};
use crate::transform::Transformer;
use crate::validate::{accept_repairs, pending_inputs};
use anyhow::anyhow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Run-level cancellation: an operator flag plus an optional deadline.
///
/// Cancellation stops new dispatches, batches and retries; in-flight
/// invocations are left to finish. A group interrupted between batches
/// writes nothing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Cancel on an operator interrupt. Returns false when the token was
    /// already cancelled, so a second interrupt can abort outright.
    pub fn interrupt(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleep for `duration` unless cancelled first. Returns false when woken
    /// by cancellation.
    fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep(CANCEL_POLL.min(until - now));
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Batching and per-record repair for group invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPolicy {
    /// Upper bound on repair rounds after a group is first transformed.
    /// Zero disables repair.
    pub max_loops: u32,
    /// Records per transformer invocation; `usize::MAX` sends whole groups.
    pub batch_size: usize,
    pub required_metadata_keys: Vec<String>,
}

impl RepairPolicy {
    /// One invocation per group, no repair rounds.
    pub fn disabled() -> Self {
        Self {
            max_loops: 0,
            batch_size: usize::MAX,
            required_metadata_keys: Vec::new(),
        }
    }
}

impl From<&PipelineConfig> for RepairPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_loops: config.max_repair_loops,
            batch_size: config.batch_size.unwrap_or(usize::MAX).max(1),
            required_metadata_keys: config.required_metadata_keys.clone(),
        }
    }
}

/// What happened to one group during a runner pass.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    /// Output artifact already present; nothing invoked.
    Skipped { records: usize },
    /// The artifact was written or repaired. `attempts` counts every
    /// invocation made for the group; `pending` counts inputs still lacking a
    /// structurally valid output.
    Transformed {
        records: usize,
        attempts: u32,
        pending: usize,
    },
    /// Every attempt failed; no artifact was written.
    Failed(BranchError),
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub key: GroupKey,
    pub outcome: GroupOutcome,
}

/// Return the transformed records when the group's output artifact is
/// present and well-formed. Group inputs are never empty, so an empty output
/// does not count as complete.
pub fn completed_output(paths: &ArtifactPaths, key: &GroupKey) -> Option<Vec<Record>> {
    match inspect_records(&paths.transformed_path(key)) {
        ArtifactState::Ready(records) if !records.is_empty() => Some(records),
        _ => None,
    }
}

/// Executes group invocations with a bounded worker pool.
pub struct TransformRunner<'a> {
    paths: &'a ArtifactPaths,
    transformer: &'a dyn Transformer,
    retry: RetryPolicy,
    repair: RepairPolicy,
    max_workers: usize,
    cancel: CancelToken,
}

impl<'a> TransformRunner<'a> {
    pub fn new(paths: &'a ArtifactPaths, transformer: &'a dyn Transformer) -> Self {
        Self {
            paths,
            transformer,
            retry: RetryPolicy::no_retry(),
            repair: RepairPolicy::disabled(),
            max_workers: 1,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_repair(mut self, repair: RepairPolicy) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process every group, returning one report per group in input order.
    pub fn run(&self, groups: &[GroupKey]) -> Vec<GroupReport> {
        if groups.is_empty() {
            return Vec::new();
        }
        let workers = self.max_workers.min(groups.len());
        let next = AtomicUsize::new(0);
        let finished: Mutex<Vec<Option<GroupOutcome>>> = Mutex::new(vec![None; groups.len()]);
        info!(groups = groups.len(), workers, "transform runner starting");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let slot = next.fetch_add(1, Ordering::SeqCst);
                    let Some(key) = groups.get(slot) else {
                        break;
                    };
                    let outcome = self.run_group_guarded(key);
                    if let Ok(mut finished) = finished.lock() {
                        finished[slot] = Some(outcome);
                    }
                });
            }
        });

        let finished = finished
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        groups
            .iter()
            .zip(finished)
            .map(|(key, outcome)| GroupReport {
                key: key.clone(),
                outcome: outcome.unwrap_or(GroupOutcome::Cancelled),
            })
            .collect()
    }

    fn run_group_guarded(&self, key: &GroupKey) -> GroupOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_group(key))) {
            Ok(outcome) => outcome,
            Err(_) => GroupOutcome::Failed(transform_error(key, "transformer panicked")),
        }
    }

    fn run_group(&self, key: &GroupKey) -> GroupOutcome {
        if let Some(existing) = completed_output(self.paths, key) {
            debug!(group = %key, records = existing.len(), "transformed artifact present; skipping");
            return GroupOutcome::Skipped {
                records: existing.len(),
            };
        }

        let input = match load_records(&self.paths.assigned_path(key)) {
            Ok(input) => input,
            Err(err) => {
                return GroupOutcome::Failed(transform_error(key, &error_chain_message(&err)));
            }
        };
        let mut attempts = 0;
        let mut output = match self.transform_all(key, &input, &mut attempts) {
            Ok(Some(output)) => output,
            Ok(None) => return GroupOutcome::Cancelled,
            Err(err) => return GroupOutcome::Failed(err),
        };
        let pending = self.repair_pending(key, &input, &mut output, &mut attempts);
        GroupOutcome::Transformed {
            records: output.len(),
            attempts,
            pending,
        }
    }

    /// Transform every input a batch at a time and write the artifact once
    /// all batches succeeded. `Ok(None)` means cancellation interrupted the
    /// pass before anything was written.
    fn transform_all(
        &self,
        key: &GroupKey,
        input: &[Record],
        attempts: &mut u32,
    ) -> Result<Option<Vec<Record>>, BranchError> {
        let start = Instant::now();
        let mut output = Vec::with_capacity(input.len());
        for batch in input.chunks(self.repair.batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                debug!(group = %key, "cancelled between batches; nothing written");
                return Ok(None);
            }
            output.extend(self.invoke(key, batch, attempts)?);
        }
        write_records(&self.paths.transformed_path(key), &output)
            .map_err(|err| transform_error(key, &error_chain_message(&err)))?;
        info!(
            group = %key,
            records = output.len(),
            attempts = *attempts,
            elapsed_ms = start.elapsed().as_millis(),
            "group transformed"
        );
        Ok(Some(output))
    }

    /// Re-submit inputs whose output is missing or structurally broken and
    /// fold back the repairs that now validate, rewriting the artifact after
    /// each accepted batch. Returns how many inputs are still pending.
    fn repair_pending(
        &self,
        key: &GroupKey,
        input: &[Record],
        output: &mut Vec<Record>,
        attempts: &mut u32,
    ) -> usize {
        let keys = &self.repair.required_metadata_keys;
        for round in 1..=self.repair.max_loops {
            let pending: Vec<Record> = pending_inputs(input, output, keys)
                .into_iter()
                .cloned()
                .collect();
            if pending.is_empty() {
                return 0;
            }
            info!(group = %key, round, pending = pending.len(), "repairing records");
            for batch in pending.chunks(self.repair.batch_size.max(1)) {
                if self.cancel.is_cancelled() {
                    return pending_inputs(input, output, keys).len();
                }
                let repaired = match self.invoke(key, batch, attempts) {
                    Ok(repaired) => repaired,
                    Err(err) => {
                        warn!(group = %key, round, error = %err, "repair batch failed");
                        continue;
                    }
                };
                let accepted = accept_repairs(batch, output, repaired, keys);
                if accepted == 0 {
                    continue;
                }
                if let Err(err) = write_records(&self.paths.transformed_path(key), output) {
                    warn!(group = %key, error = %error_chain_message(&err), "could not save repairs");
                    return pending_inputs(input, output, keys).len();
                }
                debug!(group = %key, round, accepted, "repairs saved");
            }
        }
        let left = pending_inputs(input, output, keys).len();
        if left > 0 {
            warn!(
                group = %key,
                pending = left,
                rounds = self.repair.max_loops,
                "records still unrepaired"
            );
        }
        left
    }

    /// One batch invocation under the retry policy.
    fn invoke(
        &self,
        key: &GroupKey,
        batch: &[Record],
        attempts: &mut u32,
    ) -> Result<Vec<Record>, BranchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            *attempts += 1;
            let result = self.transformer.transform(batch, key).and_then(|output| {
                if output.is_empty() && !batch.is_empty() {
                    Err(anyhow!("transformer returned no records"))
                } else {
                    Ok(output)
                }
            });
            match result {
                Ok(output) => return Ok(output),
                Err(err) => {
                    let reason = error_chain_message(&err);
                    warn!(
                        group = %key,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %reason,
                        "transform attempt failed"
                    );
                    if attempt >= self.retry.max_attempts
                        || !self.cancel.sleep(self.retry.backoff(attempt))
                    {
                        return Err(transform_error(
                            key,
                            &format!("{reason} (after {attempt} attempt(s))"),
                        ));
                    }
                }
            }
        }
    }
}

fn transform_error(key: &GroupKey, reason: &str) -> BranchError {
    BranchError::Transform {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
