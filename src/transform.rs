//! Transformer adapter.
//!
//! A transformer is a black-box batch function. The contract it is expected to
//! honor (identical identities, message count, role sequence and non-target
//! fields) is checked later by the merge validator, not here.
use crate::config::{PipelineConfig, TRANSFORM_COMMAND_ENV};
use crate::invoke::CommandTemplate;
use crate::model::{GroupKey, Record};
use anyhow::{anyhow, Context, Result};

/// Batch transformation of one group's records.
pub trait Transformer: Send + Sync {
    /// Transform the whole batch or fail with no partial output.
    fn transform(&self, records: &[Record], group: &GroupKey) -> Result<Vec<Record>>;
}

/// Runs an external enrichment command once per batch.
///
/// The JSON array of input records is written to stdin and a JSON array of
/// records is read back from stdout. The template may reference
/// `{treatment}`, `{engine}`, `{source}` and `{partition}`; the treatment and
/// engine are also exported as `RECAST_TREATMENT` and `RECAST_ENGINE`.
#[derive(Debug, Clone)]
pub struct CommandTransformer {
    template: CommandTemplate,
}

impl CommandTransformer {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    pub fn from_command(command: &str) -> Result<Self> {
        Ok(Self::new(CommandTemplate::parse(command)?))
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }
}

/// Build the configured command transformer and make sure its program
/// resolves on `PATH`. Either failure is a configuration error.
pub fn transformer_from_config(config: &PipelineConfig) -> Result<CommandTransformer> {
    let command = config.transform.as_deref().ok_or_else(|| {
        anyhow!("no transform command configured (set `transform` or {TRANSFORM_COMMAND_ENV})")
    })?;
    let transformer = CommandTransformer::from_command(command)?;
    transformer.template().resolve_program()?;
    Ok(transformer)
}

impl Transformer for CommandTransformer {
    fn transform(&self, records: &[Record], group: &GroupKey) -> Result<Vec<Record>> {
        let input = serde_json::to_vec(records).context("serialize transformer input")?;
        let stdout = self.template.run(
            &[
                ("treatment", group.treatment()),
                ("engine", group.engine()),
                ("source", group.branch.source.as_str()),
                ("partition", group.branch.partition.as_str()),
            ],
            &[
                ("RECAST_TREATMENT", group.treatment()),
                ("RECAST_ENGINE", group.engine()),
            ],
            Some(input.as_slice()),
        )?;
        let output: Vec<Record> = serde_json::from_slice(&stdout)
            .with_context(|| format!("parse transformer output for {group}"))?;
        if output.is_empty() && !records.is_empty() {
            return Err(anyhow!(
                "transformer returned no records for {} inputs",
                records.len()
            ));
        }
        Ok(output)
    }
}
