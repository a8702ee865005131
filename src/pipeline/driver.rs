//! Pipeline construction and lifecycle control.
//!
//! [`Pipeline`] is a builder: seed first, then any number of transform
//! stages. [`Pipeline::start`] spawns every stage and hands back the output
//! conduit plus a [`PipelineHandle`], which owns the cancellation trigger and
//! is the only thing that can raise it.

use crate::cancel::{CancelTrigger, CancellationSignal, StopCause};
use crate::conduit::{conduit, Receiver};
use crate::config::{ErrorPolicy, PipelineConfig};
use crate::error::{PipelineError, TransformError};
use crate::pipeline::stages::{self, MapFn, StageContext, StageState, StageTask};
use crate::pipeline::{Metrics, MetricsReporter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Wire<S, T> = Box<dyn FnOnce(Receiver<S>, &mut Wiring) -> Receiver<T> + Send>;

/// Builder for a source → transform* pipeline producing items of type `T`
/// from seeds of type `S`.
pub struct Pipeline<S, T> {
    seed: Box<dyn Iterator<Item = S> + Send>,
    config: PipelineConfig,
    transform_stages: usize,
    wire: Wire<S, T>,
}

impl<S: Send + 'static> Pipeline<S, S> {
    /// Start a pipeline from a finite or infinite seed sequence. The
    /// sequence is consumed lazily, one item per free slot downstream.
    pub fn from_seed<I>(seed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: Send + 'static,
    {
        Self {
            seed: Box::new(seed.into_iter()),
            config: PipelineConfig::default(),
            transform_stages: 0,
            wire: Box::new(|source, _| source),
        }
    }
}

impl<S, T> Pipeline<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    pub fn replicas(mut self, count: usize) -> Self {
        self.config.replica_count = count;
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.config.on_error = policy;
        self
    }

    /// Append a transform stage with an infallible mapping function.
    pub fn map<U, F>(self, f: F) -> Pipeline<S, U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |item| Ok::<U, anyhow::Error>(f(item)))
    }

    /// Append a transform stage whose mapping function may fail. Failures
    /// are handled according to the configured [`ErrorPolicy`].
    ///
    /// The function must not block for unbounded time: cancellation is only
    /// observed between items.
    pub fn try_map<U, E, F>(self, f: F) -> Pipeline<S, U>
    where
        U: Send + 'static,
        E: Into<anyhow::Error>,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let map: MapFn<T, U> = Arc::new(move |item| f(item).map_err(Into::into));
        let stage = self.transform_stages;
        let upstream = self.wire;

        Pipeline {
            seed: self.seed,
            config: self.config,
            transform_stages: stage + 1,
            wire: Box::new(move |source, wiring| {
                let input = upstream(source, wiring);
                wiring.transform_stage(stage, input, map)
            }),
        }
    }

    /// Spawn every stage and return the output conduit with the control handle.
    ///
    /// Must be called from within a Tokio runtime. The output has to be
    /// drained (or the pipeline cancelled) for [`PipelineHandle::wait`] to
    /// return.
    pub fn start(self) -> Result<(Receiver<T>, PipelineHandle), PipelineError> {
        self.config
            .validate()
            .map_err(PipelineError::InvalidConfig)?;

        let (signal, trigger) = CancellationSignal::new();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let metrics = Metrics::new();

        let mut wiring = Wiring {
            ctx: StageContext {
                signal: signal.clone(),
                failures: failures_tx,
                metrics: metrics.clone(),
                on_error: self.config.on_error,
            },
            capacity: self.config.buffer_capacity,
            replicas: self.config.replica_count,
            final_stage: self.transform_stages.checked_sub(1),
            stages: Vec::new(),
        };

        let (source_tx, source_rx) = conduit(wiring.capacity);
        let source = stages::spawn_source(
            self.seed,
            source_tx,
            wiring.ctx.clone(),
            self.transform_stages == 0,
        );
        wiring.stages.push(source);

        let output = (self.wire)(source_rx, &mut wiring);

        // The supervisor runs until the last stage drops its failure sender,
        // so the wiring's own copy has to go first.
        let Wiring { stages, .. } = wiring;
        let supervisor = tokio::spawn(supervise(failures_rx, trigger.clone()));

        let reporter = if self.config.enable_metrics {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let reporter = MetricsReporter::new(metrics.clone(), self.config.metrics_interval_secs);
            Some((shutdown_tx, tokio::spawn(reporter.run(shutdown_rx))))
        } else {
            None
        };

        tracing::info!(
            "Pipeline started: {} stages ({} transform stages x {} replicas, buffer {}, on_error {:?})",
            stages.len(),
            self.transform_stages,
            self.config.replica_count,
            self.config.buffer_capacity,
            self.config.on_error,
        );

        let handle = PipelineHandle {
            trigger,
            signal,
            stages,
            supervisor: Some(supervisor),
            reporter,
            metrics,
            metrics_output_path: self.config.metrics_output_path,
        };
        Ok((output, handle))
    }
}

/// Stage bookkeeping while the builder's wiring closures run.
struct Wiring {
    ctx: StageContext,
    capacity: usize,
    replicas: usize,
    final_stage: Option<usize>,
    stages: Vec<StageTask>,
}

impl Wiring {
    /// Fan `input` out to `replicas` copies of `map` and merge them back into one conduit.
    fn transform_stage<T, U>(&mut self, stage: usize, input: Receiver<T>, map: MapFn<T, U>) -> Receiver<U>
    where
        T: Send + 'static,
        U: Send + 'static,
    {
        let mut outputs = Vec::with_capacity(self.replicas);
        for replica in 0..self.replicas {
            let (tx, rx) = conduit(self.capacity);
            let task = stages::spawn_transform(
                stage,
                replica,
                input.clone(),
                tx,
                map.clone(),
                self.ctx.clone(),
            );
            self.stages.push(task);
            outputs.push(rx);
        }

        let (merged_tx, merged_rx) = conduit(self.capacity);
        let merge = stages::spawn_merge(
            stage,
            outputs,
            merged_tx,
            self.ctx.clone(),
            self.final_stage == Some(stage),
        );
        self.stages.push(merge);
        merged_rx
    }
}

/// Keep the first transform failure and stop the pipeline on it.
async fn supervise(
    mut failures: mpsc::UnboundedReceiver<TransformError>,
    trigger: CancelTrigger,
) -> Option<TransformError> {
    let mut first = None;
    while let Some(error) = failures.recv().await {
        if first.is_none() {
            tracing::error!("Aborting pipeline: {}", error);
            trigger.raise(StopCause::TransformFailure);
            first = Some(error);
        } else {
            tracing::debug!("Additional transform failure while aborting: {}", error);
        }
    }
    first
}

/// Cloneable handle that can only cancel a pipeline.
#[derive(Debug, Clone)]
pub struct Canceller {
    trigger: CancelTrigger,
}

impl Canceller {
    /// Raise cancellation. Safe to call any number of times, from any task.
    pub fn cancel(&self) {
        if self.trigger.raise(StopCause::External) {
            tracing::info!("Pipeline cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.trigger.is_raised()
    }
}

/// Control handle of a running pipeline.
///
/// Dropping it without calling [`wait`](Self::wait) cancels the pipeline.
#[must_use = "dropping a PipelineHandle cancels the pipeline"]
pub struct PipelineHandle {
    trigger: CancelTrigger,
    signal: CancellationSignal,
    stages: Vec<StageTask>,
    supervisor: Option<JoinHandle<Option<TransformError>>>,
    reporter: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
    metrics: Arc<Metrics>,
    metrics_output_path: Option<String>,
}

impl PipelineHandle {
    /// Raise cancellation. A no-op once the pipeline has finished or was
    /// already cancelled.
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// A detached canceller for use from other tasks.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            trigger: self.trigger.clone(),
        }
    }

    /// Observer view of the pipeline's cancellation signal.
    pub fn signal(&self) -> CancellationSignal {
        self.signal.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Stages that have not reached a terminal state yet.
    pub fn running_stages(&self) -> usize {
        self.stages.iter().filter(|s| !s.is_finished()).count()
    }

    /// Wait for every stage to reach a terminal state.
    ///
    /// Returns the first transform failure if the pipeline aborted on one.
    /// A caller-requested cancellation is not an error here; check
    /// [`PipelineStats::cancelled`] or use [`PipelineStats::ensure_completed`].
    ///
    /// Stages stay owned by the handle until they have all been joined, so
    /// dropping this future early still cancels the pipeline.
    pub async fn wait(mut self) -> Result<PipelineStats, PipelineError> {
        let mut stats = PipelineStats::default();
        let mut panicked = None;

        for task in self.stages.iter_mut() {
            match (&mut task.handle).await {
                Ok(state) => stats.record(state),
                Err(e) => {
                    // Stop the rest rather than leave them blocked on a dead peer.
                    self.trigger.raise(StopCause::StagePanicked);
                    stats.stages_failed += 1;
                    if panicked.is_none() {
                        panicked = Some(PipelineError::StagePanicked {
                            stage: task.name.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        self.stages.clear();

        let first_failure = match self.supervisor.take() {
            Some(supervisor) => supervisor.await.ok().flatten(),
            None => None,
        };

        if let Some((shutdown, reporter)) = self.reporter.take() {
            let _ = shutdown.send(()).await;
            let _ = reporter.await;
        }

        let snapshot = self.metrics.snapshot();
        if let Some(ref path) = self.metrics_output_path {
            if let Err(e) = snapshot.save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }

        stats.items_produced = snapshot.items_produced;
        stats.items_emitted = snapshot.items_emitted;
        stats.items_skipped = snapshot.items_skipped;
        stats.cancelled = stats.stages_cancelled > 0 || stats.stages_failed > 0;
        stats.stop_cause = if stats.cancelled { self.signal.cause() } else { None };

        if let Some(failure) = first_failure {
            return Err(failure.into());
        }
        if let Some(panic) = panicked {
            return Err(panic);
        }

        tracing::info!("Pipeline finished: {}", stats);
        Ok(stats)
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.stages.iter().any(|s| !s.is_finished())
            && self.trigger.raise(StopCause::External)
        {
            tracing::debug!("Pipeline handle dropped while running, cancelling");
        }
    }
}

/// Outcome of a finished pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub stages_completed: usize,
    pub stages_cancelled: usize,
    pub stages_failed: usize,
    /// Some stage stopped before exhausting its input.
    pub cancelled: bool,
    /// Why the pipeline was stopped, when it was.
    pub stop_cause: Option<StopCause>,
    pub items_produced: u64,
    pub items_emitted: u64,
    pub items_skipped: u64,
}

impl PipelineStats {
    fn record(&mut self, state: StageState) {
        match state {
            StageState::Completed => self.stages_completed += 1,
            StageState::Cancelled => self.stages_cancelled += 1,
            StageState::Failed => self.stages_failed += 1,
            StageState::Running => {}
        }
    }

    /// Turn a caller-requested stop into [`PipelineError::Cancelled`].
    ///
    /// Stages that stopped because the output was dropped do not count: no
    /// one asked for cancellation.
    pub fn ensure_completed(&self) -> Result<(), PipelineError> {
        if self.cancelled && self.stop_cause == Some(StopCause::External) {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Produced: {}, Emitted: {}, Skipped: {}, Stages: {} completed / {} cancelled / {} failed",
            self.items_produced,
            self.items_emitted,
            self.items_skipped,
            self.stages_completed,
            self.stages_cancelled,
            self.stages_failed,
        )?;
        if let Some(cause) = self.stop_cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_stats_default() {
        let stats = PipelineStats::default();
        assert_eq!(stats.stages_completed, 0);
        assert!(!stats.cancelled);
        assert!(stats.ensure_completed().is_ok());
    }

    #[test]
    fn test_pipeline_stats_display() {
        let stats = PipelineStats {
            stages_completed: 3,
            stages_cancelled: 1,
            stages_failed: 0,
            cancelled: true,
            stop_cause: Some(StopCause::External),
            items_produced: 10,
            items_emitted: 8,
            items_skipped: 0,
        };

        let display = format!("{}", stats);
        assert!(display.contains("Produced: 10"));
        assert!(display.contains("Emitted: 8"));
        assert!(display.contains("cancelled by caller"));
    }

    #[test]
    fn test_ensure_completed_reports_cancellation() {
        let stats = PipelineStats {
            cancelled: true,
            stop_cause: Some(StopCause::External),
            ..Default::default()
        };
        assert!(stats.ensure_completed().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_ensure_completed_ignores_unrequested_stop() {
        let stats = PipelineStats {
            cancelled: true,
            stop_cause: None,
            ..Default::default()
        };
        assert!(stats.ensure_completed().is_ok());
    }

    #[tokio::test]
    async fn test_start_rejects_zero_replicas() {
        let result = Pipeline::from_seed(0..3).replicas(0).map(|x: i32| x).start();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
