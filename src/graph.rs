use crate::config::PipelineConfig;
use crate::error::{End, PipelineError, Result, UsageError};
use crate::manager::ThreadManagerMode;
use crate::metrics::StageMetrics;
use crate::queue::BoundedQueue;
use crate::runner::{StageRunner, StopSignal};
use crate::stage::{StageKind, Worker};
use log::debug;
use std::fmt;

/// One stage in pipeline order, with its threading preference
pub struct StageEntry<T> {
    pub worker: Worker<T>,
    /// Open a new thread for this stage instead of running after its predecessor
    pub on_new_thread: bool,
}

impl<T> StageEntry<T> {
    pub fn new(worker: Worker<T>, on_new_thread: bool) -> Self {
        Self {
            worker,
            on_new_thread,
        }
    }
}

impl<T: 'static> fmt::Debug for StageEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEntry")
            .field("worker", &self.worker)
            .field("on_new_thread", &self.on_new_thread)
            .finish()
    }
}

/// Check an ordered list of stages against a mode
///
/// A source may only open the pipeline and a sink may only close it. An end the
/// mode drives internally needs such a stage; an external end must not have one.
pub fn validate_layout(stages: &[(&str, StageKind)], mode: ThreadManagerMode) -> Result<()> {
    let (Some(&(_, first)), Some(&(_, last))) = (stages.first(), stages.last()) else {
        return Err(PipelineError::NoStages);
    };

    let last_index = stages.len() - 1;
    for (index, &(name, kind)) in stages.iter().enumerate() {
        let misplaced = match kind {
            StageKind::Source => index != 0,
            StageKind::Sink => index != last_index,
            StageKind::Transform => false,
        };
        if misplaced {
            return Err(UsageError::Misplaced {
                name: name.to_string(),
                kind,
                index,
            }
            .into());
        }
    }

    check_end(mode, End::Input, mode.input_is_external(), first, StageKind::Source)?;
    check_end(mode, End::Output, mode.output_is_external(), last, StageKind::Sink)
}

fn check_end(
    mode: ThreadManagerMode,
    end: End,
    external: bool,
    found: StageKind,
    driver: StageKind,
) -> Result<()> {
    match (external, found == driver) {
        (true, true) => Err(UsageError::EndConflict {
            mode,
            end,
            kind: driver,
        }
        .into()),
        (false, false) => Err(UsageError::MissingEndStage {
            mode,
            end,
            kind: driver,
        }
        .into()),
        _ => Ok(()),
    }
}

/// Stages grouped onto threads, wired together with queues, ready to launch
pub struct PipelineGraph<T> {
    pub(crate) runners: Vec<StageRunner<T>>,
    pub(crate) entry: Option<BoundedQueue<T>>,
    pub(crate) exit: Option<BoundedQueue<T>>,
    pub(crate) stop: StopSignal<T>,
    metrics: Vec<(String, StageMetrics)>,
    queue_count: usize,
}

impl<T: Send + 'static> PipelineGraph<T> {
    /// Validate the stages and lay them out onto threads
    pub fn build(
        stages: Vec<StageEntry<T>>,
        mode: ThreadManagerMode,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        {
            let layout: Vec<(&str, StageKind)> = stages
                .iter()
                .map(|entry| (entry.worker.name(), entry.worker.kind()))
                .collect();
            validate_layout(&layout, mode)?;
        }

        let mut groups: Vec<Vec<Worker<T>>> = Vec::new();
        for entry in stages {
            let dedicated = config.multi_threaded && entry.on_new_thread;
            match groups.last_mut() {
                Some(group) if !dedicated => group.push(entry.worker),
                _ => groups.push(vec![entry.worker]),
            }
        }

        let capacity = config.queue_capacity;
        let entry = mode.input_is_external().then(|| BoundedQueue::new(capacity));
        let exit = mode.output_is_external().then(|| BoundedQueue::new(capacity));
        let links: Vec<BoundedQueue<T>> = (1..groups.len())
            .map(|_| BoundedQueue::new(capacity))
            .collect();

        let mut queues = Vec::with_capacity(links.len() + 2);
        queues.extend(entry.clone());
        queues.extend(links.iter().cloned());
        queues.extend(exit.clone());
        let queue_count = queues.len();
        let stop = StopSignal::new(queues);

        let group_count = groups.len();
        let mut runners = Vec::with_capacity(group_count);
        let mut metrics = Vec::new();
        for (index, group) in groups.into_iter().enumerate() {
            let upstream = match index {
                0 => entry.clone(),
                _ => Some(links[index - 1].clone()),
            };
            let downstream = if index + 1 == group_count {
                exit.clone()
            } else {
                Some(links[index].clone())
            };
            let runner = StageRunner::new(
                config.thread_name_for(index),
                group,
                upstream,
                downstream,
                stop.clone(),
            )?;
            metrics.extend(runner.metrics());
            runners.push(runner);
        }

        let graph = Self {
            runners,
            entry,
            exit,
            stop,
            metrics,
            queue_count,
        };
        debug!(
            "{mode} pipeline laid out on {} thread(s) with {} queue(s): {:?}",
            graph.thread_count(),
            graph.queue_count,
            graph.placement()
        );
        Ok(graph)
    }
}

impl<T: Send + 'static> PipelineGraph<T> {
    /// Stage names per thread, in pipeline order
    pub fn placement(&self) -> Vec<Vec<String>> {
        self.runners.iter().map(|runner| runner.stage_names()).collect()
    }

    pub fn thread_count(&self) -> usize {
        self.runners.len()
    }

    /// Number of queues, counting the entry and exit queues
    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub(crate) fn metrics(&self) -> &[(String, StageMetrics)] {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageResult;
    use crate::stage::{FnSink, IterSource, PassthroughStage};
    use rstest::rstest;

    fn source() -> Worker<u32> {
        Worker::source(IterSource::new("source", 0..3u32))
    }

    fn sink() -> Worker<u32> {
        Worker::sink(FnSink::new("sink", |_: u32| -> StageResult<()> { Ok(()) }))
    }

    fn pass() -> Worker<u32> {
        Worker::transform(PassthroughStage)
    }

    #[test]
    fn test_empty_layout_rejected() {
        let result = validate_layout(&[], ThreadManagerMode::Asynchronous);
        assert!(matches!(result, Err(PipelineError::NoStages)));
    }

    #[rstest]
    #[case::synchronous(ThreadManagerMode::Synchronous, true, true)]
    #[case::async_in(ThreadManagerMode::AsynchronousIn, false, true)]
    #[case::async_out(ThreadManagerMode::AsynchronousOut, true, false)]
    #[case::asynchronous(ThreadManagerMode::Asynchronous, false, false)]
    fn test_valid_layout_per_mode(
        #[case] mode: ThreadManagerMode,
        #[case] with_source: bool,
        #[case] with_sink: bool,
    ) {
        let mut layout = Vec::new();
        if with_source {
            layout.push(("source", StageKind::Source));
        }
        layout.push(("pass", StageKind::Transform));
        if with_sink {
            layout.push(("sink", StageKind::Sink));
        }
        assert!(validate_layout(&layout, mode).is_ok());
    }

    #[test]
    fn test_source_on_external_input_conflicts() {
        let layout = [("source", StageKind::Source), ("pass", StageKind::Transform)];
        let err = validate_layout(&layout, ThreadManagerMode::Asynchronous).unwrap_err();
        assert_eq!(
            err.as_usage(),
            Some(&UsageError::EndConflict {
                mode: ThreadManagerMode::Asynchronous,
                end: End::Input,
                kind: StageKind::Source,
            })
        );
    }

    #[test]
    fn test_internal_output_needs_sink() {
        let layout = [("source", StageKind::Source), ("pass", StageKind::Transform)];
        let err = validate_layout(&layout, ThreadManagerMode::Synchronous).unwrap_err();
        assert_eq!(
            err.as_usage(),
            Some(&UsageError::MissingEndStage {
                mode: ThreadManagerMode::Synchronous,
                end: End::Output,
                kind: StageKind::Sink,
            })
        );
    }

    #[test]
    fn test_sink_in_the_middle_is_misplaced() {
        let layout = [
            ("sink", StageKind::Sink),
            ("pass", StageKind::Transform),
        ];
        let err = validate_layout(&layout, ThreadManagerMode::Asynchronous).unwrap_err();
        assert!(matches!(
            err.as_usage(),
            Some(UsageError::Misplaced { index: 0, .. })
        ));
    }

    #[test]
    fn test_dedicated_stages_get_their_own_threads() {
        let stages = vec![
            StageEntry::new(source(), true),
            StageEntry::new(pass(), true),
            StageEntry::new(sink(), true),
        ];
        let graph =
            PipelineGraph::build(stages, ThreadManagerMode::Synchronous, &PipelineConfig::new())
                .unwrap();
        assert_eq!(graph.thread_count(), 3);
        assert_eq!(graph.queue_count(), 2);
        assert_eq!(graph.metrics().len(), 3);
    }

    #[test]
    fn test_shared_stages_fold_into_previous_thread() {
        let stages = vec![
            StageEntry::new(source(), true),
            StageEntry::new(pass(), false),
            StageEntry::new(sink(), true),
        ];
        let graph =
            PipelineGraph::build(stages, ThreadManagerMode::Synchronous, &PipelineConfig::new())
                .unwrap();
        assert_eq!(
            graph.placement(),
            vec![
                vec!["source".to_string(), "passthrough".to_string()],
                vec!["sink".to_string()],
            ]
        );
        assert_eq!(graph.queue_count(), 1);
    }

    #[test]
    fn test_single_thread_mode_uses_one_group() {
        let stages = vec![
            StageEntry::new(pass(), true),
            StageEntry::new(pass(), true),
        ];
        let config = PipelineConfig::new().with_multi_threading(false);
        let graph =
            PipelineGraph::build(stages, ThreadManagerMode::Asynchronous, &config).unwrap();
        assert_eq!(graph.thread_count(), 1);
        // entry and exit only
        assert_eq!(graph.queue_count(), 2);
        assert!(graph.entry.is_some());
        assert!(graph.exit.is_some());
    }

    #[test]
    fn test_invalid_config_rejected_before_layout() {
        let stages = vec![StageEntry::new(pass(), true)];
        let config = PipelineConfig::new().with_queue_capacity(0);
        let result = PipelineGraph::build(stages, ThreadManagerMode::Asynchronous, &config);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
