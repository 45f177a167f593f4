//! Durable record store.
//!
//! Artifacts are JSON arrays of records. Existence plus well-formedness of an
//! artifact is the only resumability signal; there is no side database.
mod paths;

pub use paths::{
    ArtifactPaths, ASSIGNED_DIR, CLEANED_DIR, MERGED_DIR, RAW_DIR, TRANSFORMED_DIR,
};

use crate::model::Record;
use crate::staging::write_json_atomic;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// What a resumability check found at an artifact location.
#[derive(Debug)]
pub enum ArtifactState {
    Missing,
    Malformed(String),
    Ready(Vec<Record>),
}

impl ArtifactState {
    pub fn into_ready(self) -> Option<Vec<Record>> {
        match self {
            ArtifactState::Ready(records) => Some(records),
            _ => None,
        }
    }
}

/// Read and parse a record artifact.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let records: Vec<Record> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse records in {}", path.display()))?;
    Ok(records)
}

/// Check an artifact without failing: missing, unreadable or parsed.
pub fn inspect_records(path: &Path) -> ArtifactState {
    if !path.is_file() {
        return ArtifactState::Missing;
    }
    match load_records(path) {
        Ok(records) => ArtifactState::Ready(records),
        Err(err) => ArtifactState::Malformed(format!("{err:#}")),
    }
}

/// Persist a record artifact atomically.
pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    write_json_atomic(path, records)
}

/// Create every stage directory under the artifact root.
pub fn create_layout(paths: &ArtifactPaths) -> Result<()> {
    for dir in paths.stage_dirs() {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Role};

    fn record(index: u64) -> Record {
        Record {
            source: "s".to_string(),
            index,
            messages: vec![Message::new(Role::User, "hello")],
            metadata: Default::default(),
        }
    }

    #[test]
    fn inspection_distinguishes_missing_malformed_and_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw").join("s_train.json");
        assert!(matches!(inspect_records(&path), ArtifactState::Missing));

        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"[{\"source\": ").expect("write partial");
        assert!(matches!(inspect_records(&path), ArtifactState::Malformed(_)));

        write_records(&path, &[record(0), record(1)]).expect("write records");
        let records = inspect_records(&path).into_ready().expect("ready");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn rewriting_same_records_is_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        write_records(&path, &[record(4)]).expect("first write");
        let first = fs::read(&path).expect("read first");
        let reloaded = load_records(&path).expect("reload");
        write_records(&path, &reloaded).expect("second write");
        assert_eq!(first, fs::read(&path).expect("read second"));
    }
}
