use crate::error::StageResult;
use std::fmt;
use std::ops::ControlFlow;

/// A stage that feeds the pipeline from outside data (camera, file, generator)
pub trait Source<T>: Send + 'static {
    /// Produce the next item, or `None` at end of stream
    fn produce(&mut self) -> StageResult<Option<T>>;

    /// Called before the stage starts producing
    fn on_start(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Called when the stage is shutting down
    fn on_shutdown(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "source"
    }
}

/// A processing stage in the middle of the pipeline
pub trait Stage<T>: Send + 'static {
    /// Transform one item, or return `None` to end the stream here
    fn process(&mut self, input: T) -> StageResult<Option<T>>;

    /// Called before the stage starts processing
    fn on_start(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Called when the stage is shutting down
    fn on_shutdown(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// A stage that takes items out of the pipeline (writer, display)
pub trait Sink<T>: Send + 'static {
    /// Consume one item; `Break` asks the pipeline to wind down
    fn consume(&mut self, input: T) -> StageResult<ControlFlow<()>>;

    /// Called before the stage starts consuming
    fn on_start(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Called when the stage is shutting down
    fn on_shutdown(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "sink"
    }
}

/// Position a stage can take in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Produces items, consumes nothing
    Source,
    /// Consumes one item, produces one item
    Transform,
    /// Consumes items, produces nothing
    Sink,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => f.write_str("source"),
            StageKind::Transform => f.write_str("transform"),
            StageKind::Sink => f.write_str("sink"),
        }
    }
}

/// A stage instance of any kind
pub enum Worker<T> {
    Source(Box<dyn Source<T>>),
    Transform(Box<dyn Stage<T>>),
    Sink(Box<dyn Sink<T>>),
}

impl<T: 'static> Worker<T> {
    /// Wrap a source stage
    pub fn source(stage: impl Source<T>) -> Self {
        Worker::Source(Box::new(stage))
    }

    /// Wrap a transform stage
    pub fn transform(stage: impl Stage<T>) -> Self {
        Worker::Transform(Box::new(stage))
    }

    /// Wrap a sink stage
    pub fn sink(stage: impl Sink<T>) -> Self {
        Worker::Sink(Box::new(stage))
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Worker::Source(_) => StageKind::Source,
            Worker::Transform(_) => StageKind::Transform,
            Worker::Sink(_) => StageKind::Sink,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Worker::Source(stage) => stage.name(),
            Worker::Transform(stage) => stage.name(),
            Worker::Sink(stage) => stage.name(),
        }
    }
}

impl<T: 'static> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// A simple pass-through stage for testing
#[derive(Debug)]
pub struct PassthroughStage;

impl<T: Send + 'static> Stage<T> for PassthroughStage {
    fn process(&mut self, input: T) -> StageResult<Option<T>> {
        Ok(Some(input))
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// A mapping stage that transforms each item
#[derive(Debug)]
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    /// Create a new map stage
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<T, F> Stage<T> for MapStage<F>
where
    F: FnMut(T) -> StageResult<T> + Send + 'static,
{
    fn process(&mut self, input: T) -> StageResult<Option<T>> {
        (self.mapper)(input).map(Some)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A source that drains an iterator, ending the stream when it runs out
#[derive(Debug)]
pub struct IterSource<I> {
    name: String,
    items: I,
}

impl<I: Iterator> IterSource<I> {
    /// Create a source over anything iterable
    pub fn new(name: impl Into<String>, items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            name: name.into(),
            items: items.into_iter(),
        }
    }
}

impl<T, I> Source<T> for IterSource<I>
where
    I: Iterator<Item = T> + Send + 'static,
{
    fn produce(&mut self) -> StageResult<Option<T>> {
        Ok(self.items.next())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A sink that hands every item to a closure
#[derive(Debug)]
pub struct FnSink<F> {
    name: String,
    consumer: F,
}

impl<F> FnSink<F> {
    /// Create a new closure sink
    pub fn new(name: impl Into<String>, consumer: F) -> Self {
        Self {
            name: name.into(),
            consumer,
        }
    }
}

impl<T, F> Sink<T> for FnSink<F>
where
    F: FnMut(T) -> StageResult<()> + Send + 'static,
{
    fn consume(&mut self, input: T) -> StageResult<ControlFlow<()>> {
        (self.consumer)(input)?;
        Ok(ControlFlow::Continue(()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_passthrough_stage() {
        let mut stage = PassthroughStage;
        let output = Stage::process(&mut stage, vec![1u8, 2, 3]).unwrap();
        assert_eq!(output, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new("double", |x: u32| -> StageResult<u32> { Ok(x * 2) });
        assert_eq!(stage.process(5).unwrap(), Some(10));
        assert_eq!(Stage::<u32>::name(&stage), "double");
    }

    #[test]
    fn test_map_stage_error() {
        let mut stage = MapStage::new("fail", |_: u32| -> StageResult<u32> {
            Err(StageError::new("boom"))
        });
        let err = stage.process(1).unwrap_err();
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_iter_source_ends_stream() {
        let mut source = IterSource::new("numbers", 0..2u32);
        assert_eq!(source.produce().unwrap(), Some(0));
        assert_eq!(source.produce().unwrap(), Some(1));
        assert_eq!(source.produce().unwrap(), None);
    }

    #[test]
    fn test_fn_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sink = FnSink::new("collect", {
            let seen = Arc::clone(&seen);
            move |x: u32| {
                seen.lock().push(x);
                Ok(())
            }
        });
        assert_eq!(sink.consume(7).unwrap(), ControlFlow::Continue(()));
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn test_worker_kind_and_name() {
        let worker: Worker<u32> = Worker::source(IterSource::new("frames", 0..1u32));
        assert_eq!(worker.kind(), StageKind::Source);
        assert_eq!(worker.name(), "frames");

        let worker: Worker<u32> = Worker::transform(PassthroughStage);
        assert_eq!(worker.kind(), StageKind::Transform);
        assert_eq!(worker.name(), "passthrough");
    }
}
