//! Throughput counters for a single pipeline instance.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by every stage of one pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Items the source placed on its conduit
    pub items_produced: AtomicU64,

    /// Items a transform replica mapped successfully
    pub items_transformed: AtomicU64,

    /// Items dropped under the skip policy
    pub items_skipped: AtomicU64,

    /// Items delivered onto the pipeline's output conduit
    pub items_emitted: AtomicU64,

    /// Mapping function failures, skipped or not
    pub transform_failures: AtomicU64,

    /// Time spent inside mapping functions (microseconds, summed across replicas)
    pub transform_us: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_item_produced(&self) {
        self.items_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_transformed(&self) {
        self.items_transformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_skipped(&self) {
        self.items_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_emitted(&self) {
        self.items_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transform_failure(&self) {
        self.transform_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in a mapping function.
    pub fn add_transform_time(&self, duration: Duration) {
        self.transform_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Output items per second since start.
    pub fn items_per_second(&self) -> f64 {
        let items = self.items_emitted.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_produced: self.items_produced.load(Ordering::Relaxed),
            items_transformed: self.items_transformed.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_second: self.items_per_second(),
            transform_secs: self.transform_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_produced: u64,
    pub items_transformed: u64,
    pub items_skipped: u64,
    pub items_emitted: u64,
    pub transform_failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_second: f64,
    /// Total time spent in mapping functions (seconds, summed across replicas)
    pub transform_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {} produced, {} transformed, {} emitted, {} skipped | \
             Failures: {} | Rate: {:.1} items/s | Transform: {:.3}s | Elapsed: {:.1}s",
            self.items_produced,
            self.items_transformed,
            self.items_emitted,
            self.items_skipped,
            self.transform_failures,
            self.items_per_second,
            self.transform_secs,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Log a snapshot every interval until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_item_produced();
        metrics.add_item_produced();
        metrics.add_item_emitted();

        assert_eq!(metrics.items_produced.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.items_emitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_all_counters() {
        let metrics = Metrics::new();

        metrics.add_item_produced();
        metrics.add_item_transformed();
        metrics.add_item_skipped();
        metrics.add_item_emitted();
        metrics.add_transform_failure();
        metrics.add_transform_time(Duration::from_millis(250));

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.items_produced, 1);
        assert_eq!(snapshot.items_transformed, 1);
        assert_eq!(snapshot.items_skipped, 1);
        assert_eq!(snapshot.items_emitted, 1);
        assert_eq!(snapshot.transform_failures, 1);
        assert!((snapshot.transform_secs - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            items_produced: 100,
            items_transformed: 98,
            items_skipped: 2,
            items_emitted: 98,
            transform_failures: 2,
            elapsed: Duration::from_secs(4),
            items_per_second: 24.5,
            transform_secs: 0.5,
        };

        let display = format!("{}", snapshot);

        assert!(display.contains("100 produced"));
        assert!(display.contains("2 skipped"));
        assert!(display.contains("Failures: 2"));
        assert!(display.contains("24.5 items/s"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_item_emitted();

        assert_eq!(metrics.items_per_second(), 0.0);
        assert_eq!(metrics.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_snapshot_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = Metrics::new();
        metrics.add_item_produced();

        metrics
            .snapshot()
            .save_to_file(path.to_str().unwrap())
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["items_produced"], 1);
        assert!(json["elapsed"].is_f64());
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 3600);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(reporter.run(shutdown_rx));
        shutdown_tx.send(()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop")
            .unwrap();
    }
}
