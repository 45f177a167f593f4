//! Typed paths into the artifact layout.
//!
//! Identical keys must map to identical file locations across runs; every
//! stage derives its inputs and outputs from here.
use crate::model::{BranchKey, GroupKey};
use std::path::{Path, PathBuf};

pub const RAW_DIR: &str = "raw";
pub const ASSIGNED_DIR: &str = "assigned";
pub const TRANSFORMED_DIR: &str = "transformed";
pub const MERGED_DIR: &str = "merged";
pub const CLEANED_DIR: &str = "cleaned";

/// Convenience wrapper for locating stage artifacts under one root.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    root: PathBuf,
}

impl ArtifactPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every stage directory, in pipeline order.
    pub fn stage_dirs(&self) -> Vec<PathBuf> {
        [RAW_DIR, ASSIGNED_DIR, TRANSFORMED_DIR, MERGED_DIR, CLEANED_DIR]
            .iter()
            .map(|dir| self.root.join(dir))
            .collect()
    }

    /// Return the `raw/{source}_{partition}.json` path.
    pub fn raw_path(&self, branch: &BranchKey) -> PathBuf {
        self.root.join(RAW_DIR).join(json_name(&branch.stem()))
    }

    /// Return the `assigned/{source}_{partition}_{treatment}_{engine}.json` path.
    pub fn assigned_path(&self, group: &GroupKey) -> PathBuf {
        self.root.join(ASSIGNED_DIR).join(json_name(&group.stem()))
    }

    /// Return the `transformed/{source}_{partition}_{treatment}_{engine}.json` path.
    pub fn transformed_path(&self, group: &GroupKey) -> PathBuf {
        self.root.join(TRANSFORMED_DIR).join(json_name(&group.stem()))
    }

    /// Return the `merged/{source}_{partition}.json` path.
    pub fn merged_path(&self, branch: &BranchKey) -> PathBuf {
        self.root.join(MERGED_DIR).join(json_name(&branch.stem()))
    }

    /// Return the `cleaned/{source}_{partition}.json` path.
    pub fn cleaned_path(&self, branch: &BranchKey) -> PathBuf {
        self.root.join(CLEANED_DIR).join(json_name(&branch.stem()))
    }

    /// Return the `report.json` path holding the latest run summary.
    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.json")
    }

    /// Return the `history.jsonl` path.
    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }
}

fn json_name(stem: &str) -> String {
    format!("{stem}.json")
}
