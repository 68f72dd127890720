use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Terminal failure of a pipeline run.
///
/// A fault is cloned into every mailbox it reaches, so it carries
/// only owned, cheap-to-clone data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A stage's transform, effect or hand-off failed
    #[error("stage `{stage}` failed: {message}")]
    Stage { stage: String, message: String },

    /// The pipeline was cancelled from outside
    #[error("pipeline cancelled")]
    Cancelled,
}

impl Fault {
    /// Build a stage fault from any error
    pub fn stage(stage: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: error.to_string(),
        }
    }
}

/// Errors that can occur during pipeline execution
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Mailbox was completed; no more items are accepted
    #[error("Mailbox is closed")]
    Closed,

    /// Pipeline run failed
    #[error("Pipeline faulted: {0}")]
    Faulted(#[from] Fault),

    /// External batch source failure
    #[error("Batch source error: {0}")]
    Adapter(String),

    /// Stage execution error
    #[error("Stage execution failed: {0}")]
    Stage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stage task join error
    #[error("Stage task join error: {0}")]
    Join(String),
}

impl PipelineError {
    /// Turn this error into the fault a stage named `stage` reports.
    ///
    /// Faults received from a neighbouring mailbox are passed on as-is so that
    /// the whole pipeline agrees on the first fault.
    pub fn into_fault(self, stage: &str) -> Fault {
        match self {
            PipelineError::Faulted(fault) => fault,
            other => Fault::stage(stage, other),
        }
    }
}
