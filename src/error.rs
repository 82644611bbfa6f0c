use std::fmt;

use thiserror::Error;

use crate::manager::ThreadManagerMode;
use crate::stage::StageKind;
use crate::wrapper::WorkerType;

/// Result type for stage pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type returned by stage implementations
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Pipeline end an item-transfer call operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// The entry queue, fed by `emplace`/`push`
    Input,
    /// The exit queue, drained by `pop`
    Output,
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            End::Input => f.write_str("input"),
            End::Output => f.write_str("output"),
        }
    }
}

/// Misuse of the pipeline API, reported at the call site
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// `start`/`exec`/`configure` while the pipeline is running
    #[error("Pipeline is already running")]
    AlreadyRunning,

    /// `start`/`exec` before any stages were configured
    #[error("Pipeline has not been configured")]
    NotConfigured,

    /// The pipeline has stopped and must be reset before reuse
    #[error("Pipeline has stopped; call reset() before configuring it again")]
    Terminated,

    /// A stage is already registered for the role
    #[error("The {0} worker is already registered; clear it before setting a new one")]
    RoleAlreadyBound(WorkerType),

    /// The registered stage kind does not fit the role
    #[error("The {role} worker must be a {expected} stage, got a {found} stage")]
    KindMismatch {
        /// Role the stage was registered for
        role: WorkerType,
        /// Stage kind the role requires
        expected: StageKind,
        /// Stage kind that was supplied
        found: StageKind,
    },

    /// A transfer call on an end that a registered stage drives
    #[error("{operation} cannot be called: the {end} end is driven by a registered worker")]
    EndDrivenByStage {
        /// Name of the rejected call
        operation: &'static str,
        /// End the call targets
        end: End,
    },

    /// A transfer call on an end the mode drives internally
    #[error("{operation} is only valid when the {end} end is externally driven (mode is {mode})")]
    WrongEnd {
        /// Name of the rejected call
        operation: &'static str,
        /// End the call targets
        end: End,
        /// Mode the pipeline was built with
        mode: ThreadManagerMode,
    },

    /// `emplace_and_pop` outside of fully asynchronous mode
    #[error("emplace_and_pop requires both ends to be externally driven (mode is {0})")]
    EmplaceAndPopUnsupported(ThreadManagerMode),

    /// A stage was registered for an end the mode leaves to the caller
    #[error("{mode} mode drives the {end} end externally, but a {kind} stage was registered for it")]
    EndConflict {
        /// Mode the pipeline was built with
        mode: ThreadManagerMode,
        /// Conflicting end
        end: End,
        /// Kind of the conflicting stage
        kind: StageKind,
    },

    /// The mode needs a stage to drive an end, but none was registered
    #[error("{mode} mode needs a {kind} stage to drive the {end} end")]
    MissingEndStage {
        /// Mode the pipeline was built with
        mode: ThreadManagerMode,
        /// End left without a driver
        end: End,
        /// Kind of stage required
        kind: StageKind,
    },

    /// A source not in first position, or a sink not in last position
    #[error("{kind} stage '{name}' cannot be placed at position {index}")]
    Misplaced {
        /// Name of the misplaced stage
        name: String,
        /// Kind of the misplaced stage
        kind: StageKind,
        /// Position in pipeline order
        index: usize,
    },
}

/// Failure raised by a stage while processing
#[derive(Error, Debug)]
#[error("{message}")]
pub struct StageError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StageError {
    /// Create a stage error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a stage error wrapping an underlying cause
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The error message, without the cause
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that can occur while configuring or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The API was used incorrectly
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// No stages in pipeline
    #[error("Cannot start pipeline with no stages")]
    NoStages,

    /// A stage failed; the pipeline was stopped
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        /// Name of the failing stage
        stage: String,
        /// Error reported by the stage
        #[source]
        source: StageError,
    },

    /// A worker thread panicked; the pipeline was stopped
    #[error("Worker thread '{0}' panicked")]
    ThreadPanicked(String),

    /// The OS refused to spawn a worker thread
    #[error("Failed to spawn worker thread '{name}': {source}")]
    Spawn {
        /// Name of the thread that could not be spawned
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// The usage error, if this is one
    pub fn as_usage(&self) -> Option<&UsageError> {
        match self {
            PipelineError::Usage(usage) => Some(usage),
            _ => None,
        }
    }
}
