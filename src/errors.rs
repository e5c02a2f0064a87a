use thiserror::Error;

/// Failure modes of a pipeline run, classified so callers can decide
/// fatality per kind.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("secret '{name}' could not be resolved: {reason}")]
    SecretResolution { name: String, reason: String },

    #[error("failed to launch '{command}': {source}")]
    ToolInvocation {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {exit_code}")]
    ToolExecution { command: String, exit_code: i32 },

    #[error("stage '{stage}' exceeded its {timeout_secs}s timeout")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("quality gate '{gate}' rejected the run: {reason}")]
    GateFailure { gate: String, reason: String },

    #[error("publish of '{reference}' failed: {reason}")]
    Publish { reference: String, reason: String },

    /// Carrier for best-effort removal failures. Collected and logged by the
    /// cleanup handler, never propagated as a run failure.
    #[error("failed to remove local tag '{tag}': {reason}")]
    Cleanup { tag: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
