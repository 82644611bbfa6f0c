use crate::config::PipelineConfig;
use crate::error::{End, Result, UsageError};
use crate::graph::{validate_layout, StageEntry};
use crate::manager::{PipelineState, ThreadManager, ThreadManagerMode};
use crate::metrics::MetricsSnapshot;
use crate::stage::{StageKind, Worker};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Role a stage plays; the ordering is the pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerType {
    Input,
    PreProcessing,
    /// User stages, ordered by their index
    Custom(u16),
    PostProcessing,
    Output,
}

impl WorkerType {
    /// Stage kind a worker must have to fill this role
    pub fn stage_kind(self) -> StageKind {
        match self {
            WorkerType::Input => StageKind::Source,
            WorkerType::Output => StageKind::Sink,
            _ => StageKind::Transform,
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Input => f.write_str("input"),
            WorkerType::PreProcessing => f.write_str("pre-processing"),
            WorkerType::Custom(index) => write!(f, "custom #{index}"),
            WorkerType::PostProcessing => f.write_str("post-processing"),
            WorkerType::Output => f.write_str("output"),
        }
    }
}

struct Registration<T> {
    worker: Worker<T>,
    on_new_thread: bool,
}

/// Role-based front end over a [`ThreadManager`]
///
/// Stages are registered per [`WorkerType`] and assembled in role order when the
/// pipeline starts. Starting consumes the registrations; after `reset` new ones
/// can be made.
pub struct Wrapper<T: Send + 'static> {
    config: PipelineConfig,
    registrations: Mutex<BTreeMap<WorkerType, Registration<T>>>,
    manager: ThreadManager<T>,
}

impl<T: Send + 'static> Wrapper<T> {
    pub fn new(mode: ThreadManagerMode) -> Self {
        Self::with_config(mode, PipelineConfig::default())
    }

    pub fn with_config(mode: ThreadManagerMode, config: PipelineConfig) -> Self {
        Self {
            config,
            registrations: Mutex::new(BTreeMap::new()),
            manager: ThreadManager::new(mode),
        }
    }

    pub fn mode(&self) -> ThreadManagerMode {
        self.manager.mode()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register a stage for a role
    ///
    /// With `on_new_thread` false the stage shares the thread of the stage before it.
    pub fn set_worker(
        &mut self,
        role: WorkerType,
        worker: Worker<T>,
        on_new_thread: bool,
    ) -> std::result::Result<(), UsageError> {
        self.ensure_idle()?;
        let expected = role.stage_kind();
        if worker.kind() != expected {
            return Err(UsageError::KindMismatch {
                role,
                expected,
                found: worker.kind(),
            });
        }

        let registrations = self.registrations.get_mut();
        if registrations.contains_key(&role) {
            return Err(UsageError::RoleAlreadyBound(role));
        }
        debug!(
            "registered {role} worker '{}' on {} thread",
            worker.name(),
            if on_new_thread { "a new" } else { "the previous" }
        );
        registrations.insert(
            role,
            Registration {
                worker,
                on_new_thread,
            },
        );
        Ok(())
    }

    /// Remove the stage registered for a role, handing it back
    pub fn clear_worker(&mut self, role: WorkerType) -> Option<Worker<T>> {
        self.registrations
            .get_mut()
            .remove(&role)
            .map(|registration| registration.worker)
    }

    /// Run every stage on a single thread
    pub fn disable_multi_threading(&mut self) {
        if self.ensure_idle().is_err() {
            warn!("disable_multi_threading ignored: pipeline has already been started");
            return;
        }
        self.config.multi_threaded = false;
    }

    fn ensure_idle(&self) -> std::result::Result<(), UsageError> {
        match self.manager.state() {
            PipelineState::Idle | PipelineState::Configured => Ok(()),
            PipelineState::Running | PipelineState::Stopping => Err(UsageError::AlreadyRunning),
            PipelineState::Stopped => Err(UsageError::Terminated),
        }
    }

    /// Hand the registrations to the manager, leaving them untouched on rejection
    fn configure(&self) -> Result<()> {
        self.ensure_idle()?;
        self.config.validate()?;

        let mut registrations = self.registrations.lock();
        let layout: Vec<(&str, StageKind)> = registrations
            .values()
            .map(|registration| (registration.worker.name(), registration.worker.kind()))
            .collect();
        validate_layout(&layout, self.mode())?;

        let stages: Vec<StageEntry<T>> = std::mem::take(&mut *registrations)
            .into_values()
            .map(|registration| StageEntry::new(registration.worker, registration.on_new_thread))
            .collect();
        info!("configuring {} pipeline with {} stage(s)", self.mode(), stages.len());
        self.manager.configure(stages, &self.config)
    }

    /// Start the pipeline and return immediately
    pub fn start(&self) -> Result<()> {
        self.configure()?;
        self.manager.start()
    }

    /// Run the pipeline to completion on the calling thread
    pub fn exec(&self) -> Result<()> {
        self.configure()?;
        self.manager.exec()
    }

    pub fn stop(&self) -> Result<()> {
        self.manager.stop()
    }

    /// Stop and return to a fresh, unconfigured state
    pub fn reset(&self) -> Result<()> {
        self.manager.reset()
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    pub fn state(&self) -> PipelineState {
        self.manager.state()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.manager.wait_timeout(timeout)
    }

    pub fn stage_metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.manager.stage_metrics()
    }

    pub fn metrics_summary(&self) -> String {
        self.manager.metrics_summary()
    }

    /// Reject a transfer call on an end that a registered stage drives
    fn guard(&self, operation: &'static str, end: End) -> Result<()> {
        let (role, started_with_stage) = match end {
            End::Input => (WorkerType::Input, self.manager.input_has_stage()),
            End::Output => (WorkerType::Output, self.manager.output_has_stage()),
        };
        if started_with_stage || self.registrations.lock().contains_key(&role) {
            return Err(UsageError::EndDrivenByStage { operation, end }.into());
        }
        Ok(())
    }

    /// Move an item into the pipeline if there is room right now
    ///
    /// On `Ok(false)` the item is dropped; use `try_push` to keep a copy.
    pub fn try_emplace(&self, item: T) -> Result<bool> {
        self.guard("try_emplace", End::Input)?;
        self.manager.try_emplace(item)
    }

    /// Move an item into the pipeline, waiting for room
    ///
    /// On `Ok(false)` (not running, stopped, or past end of stream) the item
    /// is dropped; use `push` to keep a copy.
    pub fn emplace(&self, item: T) -> Result<bool> {
        self.guard("emplace", End::Input)?;
        self.manager.emplace(item)
    }

    pub fn try_pop(&self) -> Result<Option<T>> {
        self.guard("try_pop", End::Output)?;
        self.manager.try_pop()
    }

    pub fn pop(&self) -> Result<Option<T>> {
        self.guard("pop", End::Output)?;
        self.manager.pop()
    }

    /// Feed one item and wait for one result; a refused item is dropped
    pub fn emplace_and_pop(&self, item: T) -> Result<Option<T>> {
        self.guard("emplace_and_pop", End::Input)?;
        self.guard("emplace_and_pop", End::Output)?;
        self.manager.emplace_and_pop(item)
    }

    pub fn close_input(&self) -> Result<()> {
        self.guard("close_input", End::Input)?;
        self.manager.close_input()
    }
}

impl<T: Clone + Send + 'static> Wrapper<T> {
    /// Copy an item into the pipeline if there is room right now
    pub fn try_push(&self, item: &T) -> Result<bool> {
        self.guard("try_push", End::Input)?;
        self.manager.try_push(item)
    }

    /// Copy an item into the pipeline, waiting for room
    pub fn push(&self, item: &T) -> Result<bool> {
        self.guard("push", End::Input)?;
        self.manager.push(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, StageResult};
    use crate::stage::{FnSink, IterSource, MapStage, PassthroughStage};

    fn add(n: u32) -> Worker<u32> {
        Worker::transform(MapStage::new(
            format!("add-{n}"),
            move |x: u32| -> StageResult<u32> { Ok(x + n) },
        ))
    }

    #[test]
    fn test_worker_type_order() {
        assert!(WorkerType::Input < WorkerType::PreProcessing);
        assert!(WorkerType::PreProcessing < WorkerType::Custom(0));
        assert!(WorkerType::Custom(0) < WorkerType::Custom(9));
        assert!(WorkerType::Custom(u16::MAX) < WorkerType::PostProcessing);
        assert!(WorkerType::PostProcessing < WorkerType::Output);
        assert_eq!(WorkerType::Custom(3).to_string(), "custom #3");
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Synchronous);
        let err = wrapper
            .set_worker(WorkerType::Input, Worker::transform(PassthroughStage), true)
            .unwrap_err();
        assert_eq!(
            err,
            UsageError::KindMismatch {
                role: WorkerType::Input,
                expected: StageKind::Source,
                found: StageKind::Transform,
            }
        );
    }

    #[test]
    fn test_role_cannot_be_bound_twice() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Asynchronous);
        wrapper.set_worker(WorkerType::Custom(1), add(1), true).unwrap();
        let err = wrapper
            .set_worker(WorkerType::Custom(1), add(2), true)
            .unwrap_err();
        assert_eq!(err, UsageError::RoleAlreadyBound(WorkerType::Custom(1)));

        let cleared = wrapper.clear_worker(WorkerType::Custom(1)).unwrap();
        assert_eq!(cleared.name(), "add-1");
        wrapper.set_worker(WorkerType::Custom(1), add(2), true).unwrap();
    }

    #[test]
    fn test_stages_run_in_role_order() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Asynchronous);
        // registered out of order on purpose
        wrapper
            .set_worker(
                WorkerType::PostProcessing,
                Worker::transform(MapStage::new("double", |x: u32| -> StageResult<u32> {
                    Ok(x * 2)
                })),
                false,
            )
            .unwrap();
        wrapper.set_worker(WorkerType::PreProcessing, add(1), true).unwrap();

        wrapper.start().unwrap();
        assert!(wrapper.emplace(1).unwrap());
        // (1 + 1) * 2, not 1 * 2 + 1
        assert_eq!(wrapper.pop().unwrap(), Some(4));
        wrapper.stop().unwrap();
    }

    #[test]
    fn test_rejected_start_keeps_registrations() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Asynchronous);
        wrapper
            .set_worker(
                WorkerType::Input,
                Worker::source(IterSource::new("numbers", 0..3u32)),
                true,
            )
            .unwrap();
        let err = wrapper.start().unwrap_err();
        assert!(matches!(
            err.as_usage(),
            Some(UsageError::EndConflict { end: End::Input, .. })
        ));
        assert!(wrapper.clear_worker(WorkerType::Input).is_some());
    }

    #[test]
    fn test_start_without_stages() {
        let wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Asynchronous);
        assert!(matches!(wrapper.start(), Err(PipelineError::NoStages)));
    }

    #[test]
    fn test_output_stage_blocks_pop() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::AsynchronousIn);
        wrapper
            .set_worker(
                WorkerType::Output,
                Worker::sink(FnSink::new("drop", |_: u32| -> StageResult<()> { Ok(()) })),
                true,
            )
            .unwrap();
        let err = wrapper.try_pop().unwrap_err();
        assert_eq!(
            err.as_usage(),
            Some(&UsageError::EndDrivenByStage {
                operation: "try_pop",
                end: End::Output,
            })
        );
    }

    #[test]
    fn test_disable_multi_threading_ignored_after_start() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Asynchronous);
        wrapper.set_worker(WorkerType::Custom(0), add(1), true).unwrap();
        wrapper.start().unwrap();
        wrapper.disable_multi_threading();
        assert!(wrapper.config().multi_threaded);
        wrapper.stop().unwrap();
    }

    #[test]
    fn test_reset_allows_new_registrations() {
        let mut wrapper: Wrapper<u32> = Wrapper::new(ThreadManagerMode::Asynchronous);
        wrapper.set_worker(WorkerType::Custom(0), add(1), true).unwrap();
        wrapper.start().unwrap();
        assert_eq!(
            wrapper.set_worker(WorkerType::Custom(1), add(2), true),
            Err(UsageError::AlreadyRunning)
        );
        wrapper.stop().unwrap();
        wrapper.reset().unwrap();
        assert_eq!(wrapper.state(), PipelineState::Idle);

        wrapper.set_worker(WorkerType::Custom(0), add(10), true).unwrap();
        wrapper.start().unwrap();
        assert_eq!(wrapper.emplace_and_pop(1).unwrap(), Some(11));
        wrapper.stop().unwrap();
    }
}
