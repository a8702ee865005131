//! fanpipe
//!
//! Bounded fan-out/fan-in pipeline with cooperative cancellation.
//!
//! # Architecture
//!
//! A pipeline is a chain of stages connected by bounded conduits:
//!
//! - **Source**: lazily walks a seed sequence onto the first conduit
//! - **Transform**: `N` replicas compete for items and apply a mapping function
//! - **Merge**: fans the replica outputs back into one conduit and closes it
//!   once every replica is done
//! - **Cancellation**: one broadcast signal every stage checks at each
//!   suspension point
//!
//! # Usage
//!
//! ```no_run
//! use fanpipe::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (output, handle) = Pipeline::from_seed(1..=5i64)
//!         .replicas(2)
//!         .map(|x| x * x)
//!         .start()?;
//!
//!     while let Some(square) = output.recv().await {
//!         println!("{}", square);
//!     }
//!     handle.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod conduit;
pub mod config;
pub mod error;
pub mod pipeline;

pub use cancel::{CancellationSignal, StopCause};
pub use conduit::{conduit, Halt, Receiver, Sender};
pub use config::{Config, ErrorPolicy, PipelineConfig};
pub use error::{PipelineError, TransformError};
pub use pipeline::{Canceller, Metrics, Pipeline, PipelineHandle, PipelineStats, StageState};

use anyhow::Result;

/// The demo transform: square `n`, failing on multiples of `fail_multiples_of`
/// and on overflow. A divisor of 0 never matches.
pub fn square(n: i64, fail_multiples_of: Option<i64>) -> Result<i64> {
    if let Some(m) = fail_multiples_of {
        // wrapping_rem: i64::MIN % -1 is 0, not an overflow.
        if m != 0 && n.wrapping_rem(m) == 0 {
            anyhow::bail!("{} is a multiple of {}", n, m);
        }
    }
    n.checked_mul(n)
        .ok_or_else(|| anyhow::anyhow!("{} squared overflows i64", n))
}

/// Results of a demo run.
#[derive(Debug)]
pub struct RunReport {
    /// Output items in the order they were read.
    pub outputs: Vec<i64>,
    pub stats: PipelineStats,
}

/// Run the squares pipeline described by `config` and collect its output.
///
/// Seeds count up from `run.start` and stop at `i64::MAX` at the latest.
pub async fn run_pipeline(config: Config) -> Result<RunReport> {
    config.validate()?;

    let run = config.run.clone();
    let seeds = run.start..=i64::MAX;
    let seed: Box<dyn Iterator<Item = i64> + Send> = match run.count {
        Some(count) => Box::new(seeds.take(usize::try_from(count)?)),
        None => Box::new(seeds),
    };

    tracing::info!(
        "Starting squares pipeline: start {}, count {}, take {}",
        run.start,
        run.count.map_or("unbounded".to_string(), |c| c.to_string()),
        run.take.map_or("all".to_string(), |t| t.to_string()),
    );

    let fail_multiples_of = run.fail_multiples_of;
    let (output, handle) = Pipeline::from_seed(seed)
        .with_config(config.pipeline)
        .try_map(move |n| square(n, fail_multiples_of))
        .start()?;

    let mut outputs = Vec::new();
    while let Some(value) = output.recv().await {
        tracing::info!("<- {}", value);
        outputs.push(value);

        if run.take.is_some_and(|take| outputs.len() as u64 >= take) {
            handle.cancel();
            break;
        }
    }
    drop(output);

    let stats = handle.wait().await?;
    tracing::info!("Run complete: {} outputs read", outputs.len());

    Ok(RunReport { outputs, stats })
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square() {
        assert_eq!(square(7, None).unwrap(), 49);
        assert_eq!(square(-3, Some(2)).unwrap(), 9);
        assert!(square(6, Some(3)).is_err());
        assert!(square(i64::MAX, None).is_err());
    }

    #[test]
    fn test_square_edge_divisors() {
        // Every value is a multiple of -1, including i64::MIN.
        assert!(square(i64::MIN, Some(-1)).is_err());
        assert!(square(i64::MIN, Some(1)).is_err());
        assert_eq!(square(5, Some(0)).unwrap(), 25);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_endless_stops_at_i64_max() {
        let mut config = Config::default();
        config.run.start = i64::MAX - 1;
        config.run.count = None;
        config.run.take = Some(5);
        config.pipeline.on_error = ErrorPolicy::SkipItem;

        // Both seeds overflow when squared; the sequence then ends.
        let report = run_pipeline(config).await.unwrap();
        assert!(report.outputs.is_empty());
        assert_eq!(report.stats.items_skipped, 2);
        assert!(!report.stats.cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_default_config() {
        let report = run_pipeline(Config::default()).await.unwrap();

        let mut outputs = report.outputs;
        outputs.sort();
        assert_eq!(outputs, vec![1, 4, 9, 16, 25]);
        assert!(!report.stats.cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_endless_with_take() {
        let mut config = Config::default();
        config.run.count = None;
        config.run.take = Some(2);

        let report = run_pipeline(config).await.unwrap();
        assert_eq!(report.outputs.len(), 2);
        assert!(report.stats.cancelled);
        assert_eq!(report.stats.stop_cause, Some(StopCause::External));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_aborts_on_failure() {
        let mut config = Config::default();
        config.run.count = Some(20);
        config.run.fail_multiples_of = Some(7);

        let err = run_pipeline(config).await.unwrap_err();
        assert!(err.to_string().contains("multiple of 7"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_skips_failures() {
        let mut config = Config::default();
        config.run.count = Some(10);
        config.run.fail_multiples_of = Some(5);
        config.pipeline.on_error = ErrorPolicy::SkipItem;

        let report = run_pipeline(config).await.unwrap();
        assert_eq!(report.outputs.len(), 8);
        assert_eq!(report.stats.items_skipped, 2);
    }

    #[test]
    fn test_build_runtime() {
        let runtime = build_runtime(Some(2)).unwrap();
        assert_eq!(runtime.block_on(async { 1 + 1 }), 2);
    }
}
