use crate::error::{PipelineError, Result, StageError};
use crate::metrics::StageMetrics;
use crate::queue::BoundedQueue;
use crate::stage::{Sink, Source, Stage, Worker};
use crossbeam::channel::Sender;
use log::{debug, error, info};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Broadcast stop for every queue of one pipeline
pub(crate) struct StopSignal<T> {
    queues: Vec<BoundedQueue<T>>,
    shutdown: Arc<AtomicBool>,
}

impl<T> Clone for StopSignal<T> {
    fn clone(&self) -> Self {
        Self {
            queues: self.queues.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<T> StopSignal<T> {
    pub(crate) fn new(queues: Vec<BoundedQueue<T>>) -> Self {
        Self {
            queues,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the shutdown flag and stop every queue
    pub(crate) fn raise(&self) {
        self.shutdown.store(true, Ordering::Release);
        for queue in &self.queues {
            queue.stop();
        }
    }

    /// Stop `head` and every queue before it in pipeline order
    pub(crate) fn stop_through(&self, head: &BoundedQueue<T>) {
        match self.queues.iter().position(|queue| queue.same_queue(head)) {
            Some(index) => {
                for queue in &self.queues[..=index] {
                    queue.stop();
                }
            }
            None => head.stop(),
        }
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// A stage together with its counters
struct Timed<S> {
    stage: S,
    metrics: StageMetrics,
}

impl<S> Timed<S> {
    fn new(stage: S) -> Self {
        Self {
            stage,
            metrics: StageMetrics::new(),
        }
    }
}

enum Head<T> {
    Source(Timed<Box<dyn Source<T>>>),
    Queue(BoundedQueue<T>),
}

enum Tail<T> {
    Sink(Timed<Box<dyn Sink<T>>>),
    Queue(BoundedQueue<T>),
}

fn stage_failed(stage: &str, source: StageError) -> PipelineError {
    PipelineError::Stage {
        stage: stage.to_string(),
        source,
    }
}

/// The loop one worker thread runs: take an item from upstream (or a source),
/// pass it through the group's stages inline, hand it downstream (or to a sink)
pub(crate) struct StageRunner<T> {
    name: String,
    head: Head<T>,
    transforms: Vec<Timed<Box<dyn Stage<T>>>>,
    tail: Tail<T>,
    stop: StopSignal<T>,
    /// Dropped when the runner finishes; the manager watches for disconnection
    _alive: Option<Sender<()>>,
}

impl<T: Send + 'static> StageRunner<T> {
    /// Assemble a runner for one thread group
    ///
    /// Without an upstream queue the group must open with a source; without a
    /// downstream queue it must close with a sink.
    pub(crate) fn new(
        name: String,
        workers: Vec<Worker<T>>,
        upstream: Option<BoundedQueue<T>>,
        downstream: Option<BoundedQueue<T>>,
        stop: StopSignal<T>,
    ) -> Result<Self> {
        let mut workers: VecDeque<Worker<T>> = workers.into();

        let head = match upstream {
            Some(queue) => Head::Queue(queue),
            None => match workers.pop_front() {
                Some(Worker::Source(stage)) => Head::Source(Timed::new(stage)),
                _ => {
                    return Err(PipelineError::Config(format!(
                        "{name} has neither an upstream queue nor a source"
                    )))
                }
            },
        };

        let tail = match downstream {
            Some(queue) => Tail::Queue(queue),
            None => match workers.pop_back() {
                Some(Worker::Sink(stage)) => Tail::Sink(Timed::new(stage)),
                _ => {
                    return Err(PipelineError::Config(format!(
                        "{name} has neither a downstream queue nor a sink"
                    )))
                }
            },
        };

        let mut transforms = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker {
                Worker::Transform(stage) => transforms.push(Timed::new(stage)),
                other => {
                    return Err(PipelineError::Config(format!(
                        "{} stage '{}' cannot run in the middle of {name}",
                        other.kind(),
                        other.name()
                    )))
                }
            }
        }

        Ok(Self {
            name,
            head,
            transforms,
            tail,
            stop,
            _alive: None,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attach(&mut self, alive: Sender<()>) {
        self._alive = Some(alive);
    }

    /// Names of the stages this runner executes, in order
    pub(crate) fn stage_names(&self) -> Vec<String> {
        self.metrics().into_iter().map(|(name, _)| name).collect()
    }

    /// Counters of the stages this runner executes, in order
    pub(crate) fn metrics(&self) -> Vec<(String, StageMetrics)> {
        let mut metrics = Vec::with_capacity(self.transforms.len() + 2);
        if let Head::Source(source) = &self.head {
            metrics.push((source.stage.name().to_string(), source.metrics.clone()));
        }
        for slot in &self.transforms {
            metrics.push((slot.stage.name().to_string(), slot.metrics.clone()));
        }
        if let Tail::Sink(sink) = &self.tail {
            metrics.push((sink.stage.name().to_string(), sink.metrics.clone()));
        }
        metrics
    }

    /// Run until end of stream, stop, or failure
    pub(crate) fn run(mut self) -> Result<()> {
        debug!("{}: running {:?}", self.name, self.stage_names());

        let result = self.start_stages().and_then(|()| self.pump());
        match &result {
            Ok(()) => self.release_queues(),
            Err(e) => {
                error!("{}: {e}; stopping pipeline", self.name);
                self.stop.raise();
            }
        }

        let shutdown = self.shutdown_stages();
        debug!("{}: finished", self.name);
        result.and(shutdown)
    }

    fn pump(&mut self) -> Result<()> {
        while !self.stop.is_raised() {
            let Some(item) = self.next_item()? else {
                return Ok(());
            };
            let Some(item) = self.transform(item)? else {
                return Ok(());
            };
            if !self.deliver(item)? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        let source = match &mut self.head {
            Head::Queue(queue) => return Ok(queue.pop()),
            Head::Source(source) => source,
        };

        let start = Instant::now();
        match source.stage.produce() {
            Ok(Some(item)) => {
                source.metrics.record(start.elapsed());
                Ok(Some(item))
            }
            Ok(None) => {
                info!("{}: end of stream", source.stage.name());
                Ok(None)
            }
            Err(e) => {
                source.metrics.record_failure();
                Err(stage_failed(source.stage.name(), e))
            }
        }
    }

    fn transform(&mut self, mut item: T) -> Result<Option<T>> {
        for slot in &mut self.transforms {
            let start = Instant::now();
            match slot.stage.process(item) {
                Ok(Some(next)) => {
                    slot.metrics.record(start.elapsed());
                    item = next;
                }
                Ok(None) => {
                    info!("{}: end of stream", slot.stage.name());
                    return Ok(None);
                }
                Err(e) => {
                    slot.metrics.record_failure();
                    return Err(stage_failed(slot.stage.name(), e));
                }
            }
        }
        Ok(Some(item))
    }

    /// Returns false once nothing downstream will take more items
    fn deliver(&mut self, item: T) -> Result<bool> {
        let sink = match &mut self.tail {
            Tail::Queue(queue) => return Ok(queue.push(item).is_ok()),
            Tail::Sink(sink) => sink,
        };

        let start = Instant::now();
        match sink.stage.consume(item) {
            Ok(ControlFlow::Continue(())) => {
                sink.metrics.record(start.elapsed());
                Ok(true)
            }
            Ok(ControlFlow::Break(())) => {
                sink.metrics.record(start.elapsed());
                info!("{}: no more items wanted", sink.stage.name());
                Ok(false)
            }
            Err(e) => {
                sink.metrics.record_failure();
                Err(stage_failed(sink.stage.name(), e))
            }
        }
    }

    /// Downstream drains what it already has; everything upstream is told to
    /// stop producing, up to and including the entry queue
    fn release_queues(&self) {
        if let Tail::Queue(queue) = &self.tail {
            queue.close();
        }
        if let Head::Queue(queue) = &self.head {
            self.stop.stop_through(queue);
        }
    }

    fn start_stages(&mut self) -> Result<()> {
        if let Head::Source(source) = &mut self.head {
            source
                .stage
                .on_start()
                .map_err(|e| stage_failed(source.stage.name(), e))?;
        }
        for slot in &mut self.transforms {
            slot.stage
                .on_start()
                .map_err(|e| stage_failed(slot.stage.name(), e))?;
        }
        if let Tail::Sink(sink) = &mut self.tail {
            sink.stage
                .on_start()
                .map_err(|e| stage_failed(sink.stage.name(), e))?;
        }
        Ok(())
    }

    /// Every stage gets its shutdown hook; the first failure is reported
    fn shutdown_stages(&mut self) -> Result<()> {
        let mut results = Vec::with_capacity(self.transforms.len() + 2);
        if let Head::Source(source) = &mut self.head {
            results.push(
                source
                    .stage
                    .on_shutdown()
                    .map_err(|e| stage_failed(source.stage.name(), e)),
            );
        }
        for slot in &mut self.transforms {
            results.push(
                slot.stage
                    .on_shutdown()
                    .map_err(|e| stage_failed(slot.stage.name(), e)),
            );
        }
        if let Tail::Sink(sink) = &mut self.tail {
            results.push(
                sink.stage
                    .on_shutdown()
                    .map_err(|e| stage_failed(sink.stage.name(), e)),
            );
        }

        let mut first = Ok(());
        for result in results {
            if let Err(e) = result {
                error!("{}: shutdown failed: {e}", self.name);
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

/// Run a runner, turning a panic into an error and a pipeline-wide stop
pub(crate) fn run_guarded<T: Send + 'static>(runner: StageRunner<T>) -> Result<()> {
    let name = runner.name.clone();
    let stop = runner.stop.clone();
    match panic::catch_unwind(AssertUnwindSafe(move || runner.run())) {
        Ok(result) => result,
        Err(_) => {
            error!("{name}: worker panicked; stopping pipeline");
            stop.raise();
            Err(PipelineError::ThreadPanicked(name))
        }
    }
}
