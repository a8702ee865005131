//! Stage tasks: source, transform replicas, and merge.
//!
//! ```text
//!              ┌──────────────┐
//!          ┌──▶│ transform[0] │──┐
//! ┌──────┐ │   │  replica 0   │  │   ┌──────────┐
//! │source│─┤   └──────────────┘  ├──▶│ merge[0] │──▶ next stage / output
//! └──────┘ │   ┌──────────────┐  │   └──────────┘
//!          └──▶│ transform[0] │──┘
//!              │  replica 1   │
//!              └──────────────┘
//! ```
//!
//! Every stage owns its output [`Sender`] and closes it on the way out,
//! whichever way it stops. Replicas of one transform stage pull from clones
//! of the same [`Receiver`], so each item reaches exactly one of them.
//!
//! Stages return a [`StageState`]; the driver joins them and never relies on
//! a stage to tell it anything else. Transform failures under the abort
//! policy go to the driver's supervisor over `failures`.

use crate::cancel::CancellationSignal;
use crate::conduit::{Halt, Receiver, Sender};
use crate::config::ErrorPolicy;
use crate::error::TransformError;
use crate::pipeline::Metrics;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A mapping function after normalization by the driver.
pub(crate) type MapFn<T, U> = Arc<dyn Fn(T) -> anyhow::Result<U> + Send + Sync>;

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Running,
    /// Input exhausted and output closed.
    Completed,
    /// Stopped by the cancellation signal, or because nobody downstream was
    /// left to read.
    Cancelled,
    /// A mapping function failed under the abort policy.
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Cancelled => "cancelled",
            StageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What every stage of one pipeline shares.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub signal: CancellationSignal,
    pub failures: mpsc::UnboundedSender<TransformError>,
    pub metrics: Arc<Metrics>,
    pub on_error: ErrorPolicy,
}

/// A spawned stage and its identity.
pub(crate) struct StageTask {
    pub name: String,
    pub handle: JoinHandle<StageState>,
}

impl StageTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn the source stage, feeding `seed` into `out` one item at a time.
pub(crate) fn spawn_source<I>(
    seed: I,
    out: Sender<I::Item>,
    ctx: StageContext,
    final_output: bool,
) -> StageTask
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    let name = "source".to_string();
    let handle = tokio::spawn(async move {
        let state = run_source(seed, &out, &ctx, final_output).await;
        out.close();
        tracing::debug!("source {}", state);
        state
    });
    StageTask { name, handle }
}

async fn run_source<I>(
    seed: I,
    out: &Sender<I::Item>,
    ctx: &StageContext,
    final_output: bool,
) -> StageState
where
    I: Iterator,
{
    for item in seed {
        if let Err(halt) = out.send(item, &ctx.signal).await {
            if halt == Halt::Closed {
                tracing::debug!("source output dropped, abandoning seed sequence");
            }
            return StageState::Cancelled;
        }
        ctx.metrics.add_item_produced();
        if final_output {
            ctx.metrics.add_item_emitted();
        }
    }
    StageState::Completed
}

/// Spawn one replica of a transform stage.
pub(crate) fn spawn_transform<T, U>(
    stage: usize,
    replica: usize,
    input: Receiver<T>,
    out: Sender<U>,
    map: MapFn<T, U>,
    ctx: StageContext,
) -> StageTask
where
    T: Send + 'static,
    U: Send + 'static,
{
    let name = format!("transform[{}].replica[{}]", stage, replica);
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let state = run_transform(stage, replica, input, &out, &map, &ctx).await;
        out.close();
        tracing::debug!("{} {}", task_name, state);
        state
    });
    StageTask { name, handle }
}

async fn run_transform<T, U>(
    stage: usize,
    replica: usize,
    input: Receiver<T>,
    out: &Sender<U>,
    map: &MapFn<T, U>,
    ctx: &StageContext,
) -> StageState {
    let mut received: u64 = 0;

    loop {
        let item = match input.recv_until_cancelled(&ctx.signal).await {
            Ok(item) => item,
            Err(Halt::Closed) => return StageState::Completed,
            Err(Halt::Cancelled) => return StageState::Cancelled,
        };
        let seq = received;
        received += 1;

        let start = Instant::now();
        let mapped = apply(map, item);
        ctx.metrics.add_transform_time(start.elapsed());

        match mapped {
            Ok(value) => {
                ctx.metrics.add_item_transformed();
                if out.send(value, &ctx.signal).await.is_err() {
                    return StageState::Cancelled;
                }
            }
            Err(source) => {
                ctx.metrics.add_transform_failure();
                match ctx.on_error {
                    ErrorPolicy::SkipItem => {
                        ctx.metrics.add_item_skipped();
                        tracing::warn!(
                            "transform[{}].replica[{}] skipped item #{}: {}",
                            stage,
                            replica,
                            seq,
                            source
                        );
                    }
                    ErrorPolicy::AbortPipeline => {
                        // The supervisor only goes away after every stage is done.
                        let _ = ctx.failures.send(TransformError {
                            stage,
                            replica,
                            item: seq,
                            source,
                        });
                        return StageState::Failed;
                    }
                }
            }
        }
    }
}

/// Run the mapping function, turning a panic into an ordinary failure.
fn apply<T, U>(map: &MapFn<T, U>, item: T) -> anyhow::Result<U> {
    match panic::catch_unwind(AssertUnwindSafe(|| map(item))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("mapping function panicked: {}", message))
        }
    }
}

/// Spawn a merge stage multiplexing `inputs` onto `out`.
///
/// One forwarder task runs per input. The coordinator joins all of them and
/// only then closes `out`, so the output closes exactly once, after the last
/// input finishes (or after every forwarder has seen cancellation).
pub(crate) fn spawn_merge<T>(
    index: usize,
    inputs: Vec<Receiver<T>>,
    out: Sender<T>,
    ctx: StageContext,
    final_output: bool,
) -> StageTask
where
    T: Send + 'static,
{
    let name = format!("merge[{}]", index);
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let forwarders: Vec<_> = inputs
            .into_iter()
            .map(|input| {
                let out = out.share();
                let ctx = ctx.clone();
                tokio::spawn(async move { forward(input, &out, &ctx, final_output).await })
            })
            .collect();

        let results = futures::future::join_all(forwarders).await;
        out.close();

        let mut state = StageState::Completed;
        for result in results {
            match result {
                Ok(StageState::Completed) => {}
                Ok(other) => state = other,
                Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
                Err(_) => state = StageState::Cancelled,
            }
        }

        tracing::debug!("{} {}", task_name, state);
        state
    });
    StageTask { name, handle }
}

async fn forward<T>(
    input: Receiver<T>,
    out: &Sender<T>,
    ctx: &StageContext,
    final_output: bool,
) -> StageState {
    loop {
        let item = match input.recv_until_cancelled(&ctx.signal).await {
            Ok(item) => item,
            Err(Halt::Closed) => return StageState::Completed,
            Err(Halt::Cancelled) => return StageState::Cancelled,
        };
        if out.send(item, &ctx.signal).await.is_err() {
            return StageState::Cancelled;
        }
        if final_output {
            ctx.metrics.add_item_emitted();
        }
    }
}
