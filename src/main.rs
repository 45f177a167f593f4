use anyhow::{anyhow, Context, Result};
use clap::Parser;
use recast::cli::{Command, InitArgs, PublishArgs, RootArgs, RunArgs, SelectionArgs, StatusArgs};
use recast::config::{
    config_stub, default_config, load_config, validate_config, ConfigOverrides, PipelineConfig,
};
use recast::publish::{publish_validated, CommandPublisher, DirectoryPublisher, Publisher};
use recast::runner::CancelToken;
use recast::sampler::sampler_from_config;
use recast::staging::write_bytes_atomic;
use recast::transform::transformer_from_config;
use recast::workflow::{
    render_status, render_summary, run_pipeline, status_summary, BranchOutcome, RunSummary,
};
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const EXIT_INCOMPLETE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: i32 = 130;

fn main() -> ExitCode {
    let args = RootArgs::parse();
    init_logging(args.verbose);

    let result = match &args.command {
        Command::Init(init) => cmd_init(init),
        Command::Run(run) => cmd_run(run),
        Command::Status(status) => cmd_status(status),
        Command::Publish(publish) => cmd_publish(publish),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Log to stderr; `RUST_LOG` overrides the level chosen by `--verbose`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Defaults, then the config file, then flags, then the environment.
fn resolve_config(selection: &SelectionArgs, overrides: ConfigOverrides) -> Result<PipelineConfig> {
    let mut config = match &selection.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    config.apply_overrides(overrides);
    config.apply_env();
    validate_config(&config)?;
    Ok(config)
}

fn cmd_init(args: &InitArgs) -> Result<ExitCode> {
    if args.out.exists() && !args.force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            args.out.display()
        ));
    }
    let mut text = config_stub()?;
    text.push('\n');
    write_bytes_atomic(&args.out, text.as_bytes())?;
    println!("{}", args.out.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_run(args: &RunArgs) -> Result<ExitCode> {
    let config = resolve_config(&args.selection, args.overrides())?;
    let sampler = sampler_from_config(&config)?;
    let transformer = transformer_from_config(&config)?;
    let cancel = match config.timeout_secs {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    install_interrupt_handler(&cancel)?;

    let summary = run_pipeline(&config, sampler.as_ref(), &transformer, &cancel)?;
    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize run summary")?;
        println!("{text}");
    } else {
        print!("{}", render_summary(&summary));
    }
    report_failures(&summary);
    if summary.all_validated() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    }
}

/// First Ctrl-C stops dispatch and lets in-flight groups finish; a second
/// one exits immediately.
fn install_interrupt_handler(cancel: &CancelToken) -> Result<()> {
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        if token.interrupt() {
            warn!("interrupted; finishing in-flight groups (interrupt again to abort)");
        } else {
            std::process::exit(EXIT_INTERRUPTED);
        }
    })
    .context("install interrupt handler")
}

/// Per-key detail for every branch that did not validate.
fn report_failures(summary: &RunSummary) {
    for branch in &summary.branches {
        if branch.outcome == BranchOutcome::Validated {
            continue;
        }
        eprintln!(
            "{}/{}: {:?}",
            branch.source, branch.partition, branch.outcome
        );
        for error in &branch.errors {
            eprintln!("  {}: {}", error.kind, error.message);
        }
    }
}

fn cmd_status(args: &StatusArgs) -> Result<ExitCode> {
    let config = resolve_config(&args.selection, args.selection.overrides())?;
    let statuses = status_summary(&config);
    if args.json {
        let text = serde_json::to_string_pretty(&statuses).context("serialize status")?;
        println!("{text}");
    } else {
        print!("{}", render_status(&statuses));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_publish(args: &PublishArgs) -> Result<ExitCode> {
    let config = resolve_config(&args.selection, args.selection.overrides())?;
    let publisher: Box<dyn Publisher> = match (&args.to_dir, &args.command) {
        (Some(dir), _) => Box::new(DirectoryPublisher::new(dir.clone())),
        (None, Some(command)) => Box::new(CommandPublisher::from_command(command)?),
        (None, None) => return Err(anyhow!("publish needs --to-dir or --command")),
    };
    let summary = publish_validated(&config, publisher.as_ref());
    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize publish summary")?;
        println!("{text}");
    } else {
        for key in &summary.published {
            println!("published {key}");
        }
    }
    for key in &summary.skipped {
        eprintln!("{key}: not validated");
    }
    for failure in &summary.failed {
        eprintln!("{failure}");
    }
    if summary.all_published() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    }
}
