//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use recast::config::{default_config, PartitionSpec, PipelineConfig, SamplerConfig};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A scratch directory holding a corpus and an artifact root.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn corpus(&self) -> PathBuf {
        self.path().join("corpus")
    }

    pub fn data_root(&self) -> PathBuf {
        self.path().join("data")
    }

    /// Write `<corpus>/<source>/<partition>.jsonl` with `rows` conversations.
    pub fn write_corpus(&self, source: &str, partition: &str, rows: usize) {
        let dir = self.corpus().join(source);
        fs::create_dir_all(&dir).expect("create corpus dir");
        let lines: Vec<String> = (0..rows).map(|i| conversation_row(i).to_string()).collect();
        fs::write(dir.join(format!("{partition}.jsonl")), lines.join("\n") + "\n")
            .expect("write corpus");
    }

    /// Small config over this workspace's corpus with no retry delay.
    pub fn config(&self, sources: &[&str], partition: &str, size: usize) -> PipelineConfig {
        let mut config = default_config();
        config.sources = sources.iter().map(|s| s.to_string()).collect();
        config.partitions = vec![PartitionSpec::new(partition, size)];
        config.treatments = vec!["a".to_string(), "b".to_string()];
        config.engines = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        config.data_root = self.data_root();
        config.sampler = SamplerConfig::Directory {
            corpus: self.corpus(),
        };
        config.max_workers = 3;
        config.retry.max_attempts = 1;
        config.retry.initial_backoff_ms = 0;
        config
    }

    /// Write `config` as JSON and return its path.
    pub fn write_config(&self, config: &PipelineConfig) -> PathBuf {
        let path = self.path().join("recast.json");
        fs::write(&path, serde_json::to_vec_pretty(config).expect("serialize config"))
            .expect("write config");
        path
    }

    /// The compiled binary, prepared to run inside the workspace.
    pub fn recast_command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_recast"));
        command
            .args(args)
            .current_dir(self.path())
            .env_remove("RECAST_TRANSFORM_COMMAND")
            .env("RUST_LOG", "warn");
        command
    }

    /// Run the compiled binary inside the workspace.
    pub fn recast(&self, args: &[&str]) -> Output {
        self.recast_command(args).output().expect("spawn recast")
    }
}

/// One corpus row with a system, user and assistant turn.
pub fn conversation_row(i: usize) -> serde_json::Value {
    json!({
        "id": format!("row-{i}"),
        "topic": "logic",
        "messages": [
            {"role": "system", "content": "reason step by step"},
            {"role": "user", "content": format!("question {i}")},
            {"role": "assistant", "content": format!("answer {i}")}
        ]
    })
}

/// Whether `program` resolves on PATH; tests that shell out skip otherwise.
pub fn have(program: &str) -> bool {
    let found = which::which(program).is_ok();
    if !found {
        eprintln!("Skipping: {program} not available");
    }
    found
}
