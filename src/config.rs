use crate::error::{PipelineError, Result};

/// Default capacity of every queue in the pipeline
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default prefix for worker thread names
pub const DEFAULT_THREAD_NAME: &str = "pipeline";

/// Runtime settings shared by every stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Capacity of each queue between threads (and of the entry/exit queues)
    pub queue_capacity: usize,
    /// When false, every stage runs on a single thread
    pub multi_threaded: bool,
    /// Prefix for worker thread names; threads are named `<prefix>-<index>`
    pub thread_name: String,
}

impl PipelineConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            multi_threaded: true,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Set the capacity of every queue
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Enable or disable multi-threading
    pub fn with_multi_threading(mut self, enable: bool) -> Self {
        self.multi_threaded = enable;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Check the configuration before any queue or thread is created
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PipelineError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.thread_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "thread name prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn thread_name_for(&self, index: usize) -> String {
        format!("{}-{}", self.thread_name, index)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}
