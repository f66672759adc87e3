use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DripResult<T> = Result<T, DripError>;

/// Coarse classification of a [`DripError`], reported to callers alongside
/// the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Feed,
    Store,
    Config,
}

/// Failure reported by the message-dispatch service for a single send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch timed out after {0}ms")]
    Timeout(u64),

    #[error("dispatch rejected: {0}")]
    Rejected(String),

    #[error("dispatch service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DripError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Template {0} has no steps")]
    EmptyTemplate(String),

    #[error("Start step {start_step} is out of range for a template with {total_steps} steps")]
    InvalidStartStep { start_step: u32, total_steps: u32 },

    #[error("Invalid step definition: {0}")]
    InvalidStepDefinition(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid state transition from {current} to {requested}")]
    InvalidStateTransition { current: String, requested: String },

    #[error("Template {0} not found")]
    TemplateNotFound(String),

    #[error("Sequence run {0} not found")]
    RunNotFound(String),

    #[error("Step {index} not found in template {template_id}")]
    StepNotFound { template_id: String, index: u32 },

    #[error("Recipient {recipient} already has a non-terminal run {run_id} for template {template_id}")]
    DuplicateActiveRun {
        template_id: String,
        recipient: String,
        run_id: String,
    },

    #[error("Sequence run {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Sequence run {0} is locked by an in-flight operation")]
    RunLocked(String),

    #[error("Activity feed error: {0}")]
    ActivityFeed(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl DripError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DripError::Config(_) => ErrorKind::Config,
            DripError::EmptyTemplate(_)
            | DripError::InvalidStartStep { .. }
            | DripError::InvalidStepDefinition(_)
            | DripError::InvalidRecipient(_)
            | DripError::InvalidStateTransition { .. } => ErrorKind::Validation,
            DripError::TemplateNotFound(_)
            | DripError::RunNotFound(_)
            | DripError::StepNotFound { .. } => ErrorKind::NotFound,
            DripError::DuplicateActiveRun { .. }
            | DripError::ConcurrentModification(_)
            | DripError::RunLocked(_) => ErrorKind::Conflict,
            DripError::ActivityFeed(_) => ErrorKind::Feed,
            DripError::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether the caller may retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Feed | ErrorKind::Store
        )
    }

    pub fn store(msg: impl Into<String>) -> Self {
        DripError::Store(msg.into())
    }

    pub fn feed(msg: impl Into<String>) -> Self {
        DripError::ActivityFeed(msg.into())
    }
}
