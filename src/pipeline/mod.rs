//! Pipeline stages, wiring, and metrics.

mod driver;
mod metrics;
mod stages;


pub use driver::{Canceller, Pipeline, PipelineHandle, PipelineStats};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use stages::StageState;
