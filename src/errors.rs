use thiserror::Error;

/// Failures that end (or mark incomplete) a single branch without touching
/// its siblings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BranchError {
    #[error("sampling failed for {key}: {reason}")]
    Sampling { key: String, reason: String },
    #[error("assignment invariant violated for {key}: {details}")]
    Assignment { key: String, details: String },
    #[error("transform failed for {key}: {reason}")]
    Transform { key: String, reason: String },
    #[error("integrity check failed for {key}: {details}")]
    Integrity { key: String, details: String },
}

impl BranchError {
    pub fn kind(&self) -> &'static str {
        match self {
            BranchError::Sampling { .. } => "sampling",
            BranchError::Assignment { .. } => "assignment",
            BranchError::Transform { .. } => "transform",
            BranchError::Integrity { .. } => "integrity",
        }
    }
}

/// Render an anyhow error with its full context chain on one line.
pub fn error_chain_message(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
