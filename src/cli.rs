//! CLI argument parsing for the recast pipeline.
//!
//! The CLI only resolves configuration and dispatches; every stage lives in
//! the library so tests can drive it without a process boundary.
use crate::config::{ConfigOverrides, PartitionSpec};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "recast",
    version,
    about = "Resumable batch pipeline: sample, assign, transform, merge and validate conversational records",
    after_help = "Commands:\n  init     Write a config stub\n  run      Run (or resume) the pipeline\n  status   Show per-branch state derived from artifacts\n  publish  Hand validated splits to a publisher\n\nExamples:\n  recast init --out recast.json\n  recast run --config recast.json --transform 'enrich --mode {treatment} --engine {engine}'\n  recast run --debug --corpus ./corpus --source demo --partition train=20 --transform cat\n  recast status --config recast.json --json\n  recast publish --config recast.json --to-dir ./published",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Emit debug-level logs (RUST_LOG still wins when set)
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Run(RunArgs),
    Status(StatusArgs),
    Publish(PublishArgs),
}

/// Config and selection flags shared by every pipeline command.
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// JSON config file; omitted fields keep their defaults
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Source to process (repeatable; replaces the configured list)
    #[arg(long = "source", value_name = "NAME")]
    pub sources: Vec<String>,

    /// Partition with target size (repeatable)
    #[arg(long = "partition", value_name = "NAME=SIZE")]
    pub partitions: Vec<PartitionSpec>,

    /// Treatment name (repeatable)
    #[arg(long = "treatment", value_name = "NAME")]
    pub treatments: Vec<String>,

    /// Engine name (repeatable)
    #[arg(long = "engine", value_name = "NAME")]
    pub engines: Vec<String>,

    /// Seed for sampling and assignment
    #[arg(long)]
    pub seed: Option<u64>,

    /// Small-scale run isolated under `<data-root>_debug`
    #[arg(long)]
    pub debug: bool,

    /// Artifact root directory
    #[arg(long, value_name = "DIR")]
    pub data_root: Option<PathBuf>,

    /// Read samples from `<DIR>/<source>/<partition>.jsonl`
    #[arg(long, value_name = "DIR", conflicts_with = "sampler_command")]
    pub corpus: Option<PathBuf>,

    /// Sampler command template ({source}, {partition}, {n}, {seed})
    #[arg(long, value_name = "CMD")]
    pub sampler_command: Option<String>,
}

impl SelectionArgs {
    /// Overrides without run-only settings.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            sources: self.sources.clone(),
            partitions: self.partitions.clone(),
            treatments: self.treatments.clone(),
            engines: self.engines.clone(),
            seed: self.seed,
            debug: self.debug,
            data_root: self.data_root.clone(),
            corpus: self.corpus.clone(),
            sampler_command: self.sampler_command.clone(),
            ..ConfigOverrides::default()
        }
    }
}

/// Init command inputs.
#[derive(Parser, Debug)]
#[command(about = "Write a config stub with the default settings")]
pub struct InitArgs {
    /// Output path for the config stub
    #[arg(long, value_name = "FILE", default_value = "recast.json")]
    pub out: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Run command inputs.
#[derive(Parser, Debug)]
#[command(about = "Run or resume the pipeline")]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Transform command template ({treatment}, {engine}, {source}, {partition})
    #[arg(long, value_name = "CMD")]
    pub transform: Option<String>,

    /// Concurrent transformer invocations
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Rounds of resubmission for records whose output is broken (0 disables)
    #[arg(long, value_name = "N")]
    pub max_repair_loops: Option<u32>,

    /// Records per transformer invocation
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Stop dispatching new groups after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Emit the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            transform: self.transform.clone(),
            max_workers: self.max_workers,
            max_repair_loops: self.max_repair_loops,
            batch_size: self.batch_size,
            timeout_secs: self.timeout_secs,
            ..self.selection.overrides()
        }
    }
}

/// Status command inputs.
#[derive(Parser, Debug)]
#[command(about = "Summarize per-branch state without writing anything")]
pub struct StatusArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

/// Publish command inputs.
#[derive(Parser, Debug)]
#[command(about = "Publish the cleaned split of every validated branch")]
pub struct PublishArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Write `<DIR>/<source>/<partition>.jsonl` with a metadata sidecar
    #[arg(long, value_name = "DIR", required_unless_present = "command", conflicts_with = "command")]
    pub to_dir: Option<PathBuf>,

    /// Publish command template ({source}, {partition}); records on stdin
    #[arg(long, value_name = "CMD")]
    pub command: Option<String>,

    /// Emit the publish summary as JSON
    #[arg(long)]
    pub json: bool,
}
