//! External command invocation shared by the sampler, transformer and
//! publisher adapters.
//!
//! Commands are configured as shell-words templates. `{name}` placeholders in
//! any argument are substituted before spawning; payloads travel as JSON on
//! stdin and stdout.
use crate::util::truncate_bytes;
use anyhow::{anyhow, Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Instant;

const STDERR_SNIPPET_BYTES: usize = 2_000;

/// A parsed command template.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    raw: String,
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let argv = shell_words::split(raw).with_context(|| format!("parse command: {raw}"))?;
        if argv.is_empty() {
            return Err(anyhow!("command is empty"));
        }
        Ok(Self {
            raw: raw.to_string(),
            argv,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Resolve the program on `PATH` (or as a path) so a missing executable
    /// is reported before any work starts.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        which::which(self.program())
            .with_context(|| format!("locate executable {:?}", self.program()))
    }

    /// Substitute `{key}` placeholders in every argument.
    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }

    /// Run the rendered command, feeding `stdin` and returning stdout.
    pub fn run(
        &self,
        vars: &[(&str, &str)],
        envs: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let args = self.render(vars);
        let start = Instant::now();
        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .envs(envs.iter().copied())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn command: {}", args[0]))?;

        // Feed stdin from its own thread so a child that streams output
        // before draining its input cannot deadlock on a full pipe.
        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                let bytes = bytes.to_vec();
                Some(thread::spawn(move || pipe.write_all(&bytes)))
            }
            _ => None,
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for {}", args[0]))?;
        let elapsed_ms = start.elapsed().as_millis();
        let write_result = writer.map(|handle| {
            handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")))
        });

        tracing::debug!(
            program = %args[0],
            elapsed_ms,
            stdin_bytes = stdin.map(<[u8]>::len).unwrap_or(0),
            stdout_bytes = output.stdout.len(),
            "command complete"
        );

        if !output.status.success() {
            return Err(anyhow!(
                "command {:?} failed with status {}: {}",
                self.raw,
                output.status,
                truncate_bytes(&output.stderr, STDERR_SNIPPET_BYTES).trim()
            ));
        }
        match write_result {
            // The command succeeded without reading all of its input.
            Some(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(program = %args[0], "stdin closed early by command");
            }
            Some(result) => result.with_context(|| format!("write stdin of {}", args[0]))?,
            None => {}
        }
        Ok(output.stdout)
    }
}
