//! A staged pipeline runtime for real-time processing chains.
//!
//! Items flow through an ordered chain of stages (a source, any number of
//! transforms, a sink). Each stage either gets its own OS thread or shares the
//! thread of the stage before it; threads are connected by bounded, blocking
//! queues so a slow stage throttles the ones feeding it.
//!
//! Either end of the chain can be driven by a stage or by the caller, selected
//! by [`ThreadManagerMode`]:
//!
//! - `Synchronous`: a source stage feeds the chain and a sink stage drains it
//! - `AsynchronousIn`: the caller feeds items with `emplace`/`push`
//! - `AsynchronousOut`: the caller drains items with `pop`
//! - `Asynchronous`: the caller does both
//!
//! # Features
//!
//! - Role-based stage registration through [`Wrapper`]
//! - Blocking and non-blocking item transfer on the external ends
//! - Broadcast `stop()` that wakes every blocked thread, safe to call concurrently
//! - Stage failures and panics stop the whole pipeline and surface to the caller
//! - Per-stage metrics: throughput, failures, latency percentiles
//!
//! # Example
//!
//! ```ignore
//! use stage_pipeline::{MapStage, ThreadManagerMode, Worker, WorkerType, Wrapper};
//!
//! let mut wrapper = Wrapper::new(ThreadManagerMode::Asynchronous);
//! wrapper.set_worker(
//!     WorkerType::Custom(0),
//!     Worker::transform(MapStage::new("double", |x: u32| Ok(x * 2))),
//!     true,
//! )?;
//!
//! wrapper.start()?;
//! wrapper.emplace(21)?;
//! assert_eq!(wrapper.pop()?, Some(42));
//! wrapper.stop()?;
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod manager;
pub mod metrics;
pub mod queue;
mod runner;
pub mod stage;
pub mod wrapper;

// Re-exports for convenience
pub use config::PipelineConfig;
pub use error::{End, PipelineError, Result, StageError, StageResult, UsageError};
pub use graph::{PipelineGraph, StageEntry};
pub use manager::{PipelineState, ThreadManager, ThreadManagerMode};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use queue::BoundedQueue;
pub use stage::{
    FnSink, IterSource, MapStage, PassthroughStage, Sink, Source, Stage, StageKind, Worker,
};
pub use wrapper::{WorkerType, Wrapper};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
