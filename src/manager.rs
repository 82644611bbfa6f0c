use crate::config::PipelineConfig;
use crate::error::{End, PipelineError, Result, UsageError};
use crate::graph::{PipelineGraph, StageEntry};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::queue::BoundedQueue;
use crate::runner::{run_guarded, StageRunner, StopSignal};
use crate::stage::StageKind;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Which ends of the pipeline the caller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadManagerMode {
    /// A source stage feeds the pipeline and a sink stage drains it
    #[default]
    Synchronous,
    /// The caller feeds the pipeline; a sink stage drains it
    AsynchronousIn,
    /// A source stage feeds the pipeline; the caller drains it
    AsynchronousOut,
    /// The caller feeds and drains the pipeline
    Asynchronous,
}

impl ThreadManagerMode {
    /// Whether items enter through `emplace`/`push`
    pub fn input_is_external(self) -> bool {
        matches!(
            self,
            ThreadManagerMode::AsynchronousIn | ThreadManagerMode::Asynchronous
        )
    }

    /// Whether items leave through `pop`
    pub fn output_is_external(self) -> bool {
        matches!(
            self,
            ThreadManagerMode::AsynchronousOut | ThreadManagerMode::Asynchronous
        )
    }
}

impl fmt::Display for ThreadManagerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Configured,
    Running,
    /// Threads are being joined
    Stopping,
    /// Terminal until `reset`
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything that exists only while threads run
struct Run<T> {
    entry: Option<BoundedQueue<T>>,
    exit: Option<BoundedQueue<T>>,
    stop: StopSignal<T>,
    handles: Vec<JoinHandle<Result<()>>>,
    /// Disconnects once every worker has dropped its sender
    alive: Receiver<()>,
}

struct Inner<T> {
    state: PipelineState,
    graph: Option<PipelineGraph<T>>,
    run: Option<Run<T>>,
    metrics: Vec<(String, StageMetrics)>,
    input_stage: bool,
    output_stage: bool,
    /// The caller's thread is running the last group inside `exec`
    exec_active: bool,
    failure: Option<PipelineError>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            graph: None,
            run: None,
            metrics: Vec::new(),
            input_stage: false,
            output_stage: false,
            exec_active: false,
            failure: None,
        }
    }

    /// Keep the first failure of a run; later ones are only logged
    fn record_failure(&mut self, failure: PipelineError) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        } else {
            error!("additional pipeline failure: {failure}");
        }
    }

    fn ensure_configurable(&self) -> std::result::Result<(), UsageError> {
        match self.state {
            PipelineState::Idle | PipelineState::Configured => Ok(()),
            PipelineState::Running | PipelineState::Stopping => Err(UsageError::AlreadyRunning),
            PipelineState::Stopped => Err(UsageError::Terminated),
        }
    }
}

/// Runs a configured pipeline on OS threads and owns their lifecycle
///
/// The mode is fixed at construction. Items cross the external ends through the
/// transfer calls (`emplace`, `push`, `pop` and their variants), which are only
/// valid on an end the mode leaves to the caller.
pub struct ThreadManager<T: Send + 'static> {
    mode: ThreadManagerMode,
    inner: Mutex<Inner<T>>,
    stopped: Condvar,
}

impl<T: Send + 'static> ThreadManager<T> {
    pub fn new(mode: ThreadManagerMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner::new()),
            stopped: Condvar::new(),
        }
    }

    pub fn mode(&self) -> ThreadManagerMode {
        self.mode
    }

    pub fn state(&self) -> PipelineState {
        self.inner.lock().state
    }

    /// Lay out the stages onto threads; replaces any earlier configuration
    pub fn configure(&self, stages: Vec<StageEntry<T>>, config: &PipelineConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_configurable()?;

        let input_stage = stages
            .first()
            .is_some_and(|entry| entry.worker.kind() == StageKind::Source);
        let output_stage = stages
            .last()
            .is_some_and(|entry| entry.worker.kind() == StageKind::Sink);
        let graph = PipelineGraph::build(stages, self.mode, config)?;

        inner.metrics = graph.metrics().to_vec();
        inner.input_stage = input_stage;
        inner.output_stage = output_stage;
        inner.graph = Some(graph);
        inner.state = PipelineState::Configured;
        Ok(())
    }

    /// Whether a source stage drives the input end
    pub fn input_has_stage(&self) -> bool {
        self.inner.lock().input_stage
    }

    /// Whether a sink stage drives the output end
    pub fn output_has_stage(&self) -> bool {
        self.inner.lock().output_stage
    }

    /// Launch every thread group and return immediately
    pub fn start(&self) -> Result<()> {
        self.launch(false).map(|_| ())
    }

    /// Run the pipeline to completion, using the calling thread for the last group
    ///
    /// Returns once every worker has exited, with the first failure of the run.
    pub fn exec(&self) -> Result<()> {
        let inline = self.launch(true)?;
        if let Some(runner) = inline {
            if let Err(failure) = run_guarded(runner) {
                self.inner.lock().record_failure(failure);
            }
        }
        self.finish();

        let mut inner = self.inner.lock();
        inner.exec_active = false;
        inner.failure.take().map_or(Ok(()), Err)
    }

    fn launch(&self, inline_last: bool) -> Result<Option<StageRunner<T>>> {
        let mut inner = self.inner.lock();
        match inner.state {
            PipelineState::Configured => {}
            PipelineState::Idle => return Err(UsageError::NotConfigured.into()),
            PipelineState::Running | PipelineState::Stopping => {
                return Err(UsageError::AlreadyRunning.into())
            }
            PipelineState::Stopped => return Err(UsageError::Terminated.into()),
        }
        let Some(graph) = inner.graph.take() else {
            return Err(UsageError::NotConfigured.into());
        };

        let PipelineGraph {
            mut runners,
            entry,
            exit,
            stop,
            ..
        } = graph;
        let (alive_tx, alive_rx) = channel::unbounded::<()>();

        let mut inline = if inline_last { runners.pop() } else { None };
        if let Some(runner) = inline.as_mut() {
            runner.attach(alive_tx.clone());
        }

        let mut handles = Vec::with_capacity(runners.len());
        let mut spawn_failure = None;
        for mut runner in runners {
            runner.attach(alive_tx.clone());
            let name = runner.name().to_string();
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_guarded(runner))
            {
                Ok(handle) => {
                    debug!("spawned worker thread {name}");
                    handles.push(handle);
                }
                Err(source) => {
                    spawn_failure = Some(PipelineError::Spawn { name, source });
                    break;
                }
            }
        }
        drop(alive_tx);

        let threads = handles.len() + usize::from(inline.is_some());
        inner.run = Some(Run {
            entry,
            exit,
            stop: stop.clone(),
            handles,
            alive: alive_rx,
        });
        inner.state = PipelineState::Running;

        if let Some(failure) = spawn_failure {
            error!("{failure}; stopping pipeline");
            drop(inline);
            stop.raise();
            drop(inner);
            self.finish();
            return Err(failure);
        }

        inner.exec_active = inline.is_some();
        info!("{} pipeline started on {threads} thread(s)", self.mode);
        Ok(inline)
    }

    /// Join every worker and move to `Stopped`
    ///
    /// The first caller joins; concurrent callers wait until it is done.
    fn finish(&self) {
        let (handles, alive) = {
            let mut inner = self.inner.lock();
            match inner.state {
                PipelineState::Running => {}
                PipelineState::Stopping => {
                    while inner.state == PipelineState::Stopping {
                        self.stopped.wait(&mut inner);
                    }
                    return;
                }
                _ => return,
            }
            let Some(run) = inner.run.as_mut() else {
                inner.state = PipelineState::Stopped;
                self.stopped.notify_all();
                return;
            };
            let handles = std::mem::take(&mut run.handles);
            let alive = run.alive.clone();
            inner.state = PipelineState::Stopping;
            (handles, alive)
        };

        let mut failures = Vec::new();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            match handle.join() {
                Ok(Ok(())) => debug!("joined worker thread {name}"),
                Ok(Err(failure)) => failures.push(failure),
                Err(_) => failures.push(PipelineError::ThreadPanicked(name)),
            }
        }
        // a runner on the exec thread holds a sender too
        while alive.recv().is_ok() {}

        let mut inner = self.inner.lock();
        for failure in failures {
            inner.record_failure(failure);
        }
        inner.state = PipelineState::Stopped;
        info!("pipeline stopped");
        if !inner.metrics.is_empty() {
            info!("{}", summarize(&inner.metrics));
        }
        self.stopped.notify_all();
    }

    /// Stop every thread and wait for them to exit
    ///
    /// Idempotent and safe to call from several threads at once. Returns the
    /// run's failure the first time it is observed, unless `exec` is still
    /// active, in which case `exec` reports it.
    ///
    /// A pipeline that was never started has no threads to stop: the call
    /// returns `Ok` and leaves the state (`Idle` or `Configured`) unchanged, so
    /// the pipeline can still be started afterwards.
    pub fn stop(&self) -> Result<()> {
        {
            let inner = self.inner.lock();
            match &inner.run {
                Some(run) => {
                    debug!("stop requested");
                    run.stop.raise();
                }
                None => return Ok(()),
            }
        }
        self.finish();

        let mut inner = self.inner.lock();
        if inner.exec_active {
            return Ok(());
        }
        inner.failure.take().map_or(Ok(()), Err)
    }

    /// Stop, then forget the configuration so the manager can be configured again
    pub fn reset(&self) -> Result<()> {
        let result = self.stop();
        let mut inner = self.inner.lock();
        if inner.exec_active {
            return Err(UsageError::AlreadyRunning.into());
        }
        *inner = Inner::new();
        debug!("pipeline reset");
        result
    }

    /// Whether the pipeline is running and at least one worker is still alive
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == PipelineState::Running
            && inner
                .run
                .as_ref()
                .is_some_and(|run| !matches!(run.alive.try_recv(), Err(TryRecvError::Disconnected)))
    }

    /// Wait until every worker has exited, or the timeout elapses
    ///
    /// Returns true if no worker is running anymore. This does not join the
    /// threads; call `stop` for that.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let alive = match &self.inner.lock().run {
            Some(run) => run.alive.clone(),
            None => return true,
        };
        let deadline = Instant::now() + timeout;
        loop {
            match alive.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    /// Per-stage metrics, in pipeline order
    pub fn stage_metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.inner
            .lock()
            .metrics
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
            .collect()
    }

    /// Get a summary of all stage metrics
    pub fn metrics_summary(&self) -> String {
        summarize(&self.inner.lock().metrics)
    }

    fn entry(&self, operation: &'static str) -> Result<Option<BoundedQueue<T>>> {
        if !self.mode.input_is_external() {
            return Err(UsageError::WrongEnd {
                operation,
                end: End::Input,
                mode: self.mode,
            }
            .into());
        }
        Ok(self.inner.lock().run.as_ref().and_then(|run| run.entry.clone()))
    }

    fn exit(&self, operation: &'static str) -> Result<Option<BoundedQueue<T>>> {
        if !self.mode.output_is_external() {
            return Err(UsageError::WrongEnd {
                operation,
                end: End::Output,
                mode: self.mode,
            }
            .into());
        }
        Ok(self.inner.lock().run.as_ref().and_then(|run| run.exit.clone()))
    }

    /// Move an item into the pipeline if there is room right now
    ///
    /// Returns false if the entry queue is full or the pipeline is not running;
    /// the item is dropped in that case.
    pub fn try_emplace(&self, item: T) -> Result<bool> {
        Ok(self
            .entry("try_emplace")?
            .is_some_and(|queue| queue.try_push(item).is_ok()))
    }

    /// Move an item into the pipeline, waiting for room
    ///
    /// Returns false if the pipeline is not running or stops before the item
    /// fits; the item is dropped in that case.
    pub fn emplace(&self, item: T) -> Result<bool> {
        Ok(self
            .entry("emplace")?
            .is_some_and(|queue| queue.push(item).is_ok()))
    }

    /// Take an item out of the pipeline if one is ready
    pub fn try_pop(&self) -> Result<Option<T>> {
        Ok(self.exit("try_pop")?.and_then(|queue| queue.try_pop()))
    }

    /// Take an item out of the pipeline, waiting for one
    ///
    /// Returns `None` once the pipeline stops, or once it reached end of stream
    /// and every item has been taken.
    pub fn pop(&self) -> Result<Option<T>> {
        Ok(self.exit("pop")?.and_then(|queue| queue.pop()))
    }

    /// Feed one item and wait for one result
    pub fn emplace_and_pop(&self, item: T) -> Result<Option<T>> {
        if self.mode != ThreadManagerMode::Asynchronous {
            return Err(UsageError::EmplaceAndPopUnsupported(self.mode).into());
        }
        if !self.emplace(item)? {
            return Ok(None);
        }
        self.pop()
    }

    /// Signal that no more items will be fed
    ///
    /// Items already inside the pipeline are still processed and can be popped.
    pub fn close_input(&self) -> Result<()> {
        if let Some(queue) = self.entry("close_input")? {
            debug!("input closed by caller");
            queue.close();
        }
        Ok(())
    }
}

impl<T: Clone + Send + 'static> ThreadManager<T> {
    /// Copy an item into the pipeline if there is room right now
    pub fn try_push(&self, item: &T) -> Result<bool> {
        Ok(self
            .entry("try_push")?
            .is_some_and(|queue| queue.try_push(item.clone()).is_ok()))
    }

    /// Copy an item into the pipeline, waiting for room
    pub fn push(&self, item: &T) -> Result<bool> {
        Ok(self
            .entry("push")?
            .is_some_and(|queue| queue.push(item.clone()).is_ok()))
    }
}

impl<T: Send + 'static> Drop for ThreadManager<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("pipeline failed before teardown: {e}");
        }
    }
}

fn summarize(metrics: &[(String, StageMetrics)]) -> String {
    let mut summary = String::from("Pipeline Metrics:\n");
    for (name, stage) in metrics {
        summary.push_str(&format!("  {}: {}\n", name, stage.snapshot().format()));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StageError, StageResult};
    use crate::stage::{FnSink, IterSource, MapStage, PassthroughStage, Worker};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn passthrough_pipeline(mode: ThreadManagerMode, capacity: usize) -> ThreadManager<u32> {
        let manager = ThreadManager::new(mode);
        let config = PipelineConfig::new().with_queue_capacity(capacity);
        manager
            .configure(
                vec![StageEntry::new(Worker::transform(PassthroughStage), true)],
                &config,
            )
            .unwrap();
        manager
    }

    #[test]
    fn test_mode_ends() {
        assert!(!ThreadManagerMode::Synchronous.input_is_external());
        assert!(!ThreadManagerMode::Synchronous.output_is_external());
        assert!(ThreadManagerMode::AsynchronousIn.input_is_external());
        assert!(!ThreadManagerMode::AsynchronousIn.output_is_external());
        assert!(!ThreadManagerMode::AsynchronousOut.input_is_external());
        assert!(ThreadManagerMode::AsynchronousOut.output_is_external());
        assert_eq!(ThreadManagerMode::Asynchronous.to_string(), "Asynchronous");
    }

    #[test]
    fn test_lifecycle_states() {
        let manager = passthrough_pipeline(ThreadManagerMode::Asynchronous, 4);
        assert_eq!(manager.state(), PipelineState::Configured);
        manager.start().unwrap();
        assert_eq!(manager.state(), PipelineState::Running);
        assert!(manager.is_running());
        manager.stop().unwrap();
        assert_eq!(manager.state(), PipelineState::Stopped);
        assert!(!manager.is_running());
        manager.reset().unwrap();
        assert_eq!(manager.state(), PipelineState::Idle);
    }

    #[test]
    fn test_start_requires_configuration() {
        let manager: ThreadManager<u32> = ThreadManager::new(ThreadManagerMode::Asynchronous);
        let err = manager.start().unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::NotConfigured));
    }

    #[test]
    fn test_stop_before_start_keeps_configuration() {
        let manager = passthrough_pipeline(ThreadManagerMode::Asynchronous, 4);
        manager.stop().unwrap();
        assert_eq!(manager.state(), PipelineState::Configured);
        manager.start().unwrap();
        assert!(manager.emplace(5).unwrap());
        assert_eq!(manager.pop().unwrap(), Some(5));
        manager.stop().unwrap();
        assert_eq!(manager.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_stopped_manager_needs_reset() {
        let manager = passthrough_pipeline(ThreadManagerMode::Asynchronous, 4);
        manager.start().unwrap();
        manager.stop().unwrap();
        let err = manager.start().unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::Terminated));
    }

    #[test]
    fn test_transfer_before_start_is_refused() {
        let manager = passthrough_pipeline(ThreadManagerMode::Asynchronous, 4);
        assert!(!manager.try_emplace(1).unwrap());
        assert_eq!(manager.try_pop().unwrap(), None);
    }

    #[test]
    fn test_wrong_end_is_a_usage_error() {
        let manager = ThreadManager::new(ThreadManagerMode::AsynchronousOut);
        manager
            .configure(
                vec![StageEntry::new(
                    Worker::source(IterSource::new("numbers", 0..3u32)),
                    true,
                )],
                &PipelineConfig::new(),
            )
            .unwrap();
        let err = manager.try_emplace(1).unwrap_err();
        assert!(matches!(
            err.as_usage(),
            Some(UsageError::WrongEnd { end: End::Input, .. })
        ));
    }

    #[test]
    fn test_try_push_keeps_callers_item() {
        let manager: ThreadManager<String> = ThreadManager::new(ThreadManagerMode::Asynchronous);
        manager
            .configure(
                vec![StageEntry::new(Worker::transform(PassthroughStage), true)],
                &PipelineConfig::new(),
            )
            .unwrap();
        manager.start().unwrap();
        let item = "frame".to_string();
        assert!(manager.push(&item).unwrap());
        assert_eq!(manager.pop().unwrap().as_deref(), Some("frame"));
        assert_eq!(item, "frame");
        manager.stop().unwrap();
    }

    #[test]
    fn test_exec_runs_synchronous_pipeline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = ThreadManager::new(ThreadManagerMode::Synchronous);
        manager
            .configure(
                vec![
                    StageEntry::new(Worker::source(IterSource::new("numbers", 0..10u32)), true),
                    StageEntry::new(
                        Worker::transform(MapStage::new("square", |x: u32| -> StageResult<u32> {
                            Ok(x * x)
                        })),
                        true,
                    ),
                    StageEntry::new(
                        Worker::sink(FnSink::new("collect", {
                            let seen = Arc::clone(&seen);
                            move |x: u32| -> StageResult<()> {
                                seen.lock().push(x);
                                Ok(())
                            }
                        })),
                        true,
                    ),
                ],
                &PipelineConfig::new().with_queue_capacity(2),
            )
            .unwrap();

        manager.exec().unwrap();
        assert_eq!(manager.state(), PipelineState::Stopped);
        assert_eq!(*seen.lock(), (0..10u32).map(|x| x * x).collect::<Vec<_>>());

        let metrics = manager.stage_metrics();
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[0].0, "numbers");
        assert_eq!(metrics[2].1.total_processed, 10);
        assert!(manager.metrics_summary().contains("square"));
    }

    #[test]
    fn test_stage_error_reported_once() {
        let manager = ThreadManager::new(ThreadManagerMode::AsynchronousIn);
        manager
            .configure(
                vec![StageEntry::new(
                    Worker::sink(FnSink::new("reject", |_: u32| -> StageResult<()> {
                        Err(StageError::new("unwanted"))
                    })),
                    true,
                )],
                &PipelineConfig::new(),
            )
            .unwrap();
        manager.start().unwrap();
        assert!(manager.emplace(1).unwrap());
        assert!(manager.wait_timeout(Duration::from_secs(5)));

        let err = manager.stop().unwrap_err();
        assert!(matches!(err, PipelineError::Stage { ref stage, .. } if stage == "reject"));
        assert!(manager.stop().is_ok());
    }

    #[test]
    fn test_wait_timeout_while_running() {
        let manager = passthrough_pipeline(ThreadManagerMode::Asynchronous, 4);
        manager.start().unwrap();
        assert!(!manager.wait_timeout(Duration::from_millis(20)));
        manager.close_input().unwrap();
        assert!(manager.wait_timeout(Duration::from_secs(5)));
        manager.stop().unwrap();
    }

    #[test]
    fn test_drop_stops_running_pipeline() {
        let manager = passthrough_pipeline(ThreadManagerMode::Asynchronous, 4);
        manager.start().unwrap();
        drop(manager);
    }
}
