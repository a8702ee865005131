//! Error types surfaced by a running pipeline.

use thiserror::Error;

/// A mapping function failed on one item.
#[derive(Debug, Error)]
#[error("transform stage {stage} replica {replica} failed on item #{item}: {source}")]
pub struct TransformError {
    /// Index of the transform stage in the chain, starting at 0.
    pub stage: usize,
    /// Replica within that stage.
    pub replica: usize,
    /// Position of the item in the order this replica received items.
    pub item: u64,
    #[source]
    pub source: anyhow::Error,
}

/// Terminal errors reported by [`PipelineHandle::wait`](crate::pipeline::PipelineHandle::wait)
/// and [`Pipeline::start`](crate::pipeline::Pipeline::start).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The caller stopped the pipeline before its input ran out.
    #[error("pipeline cancelled before completion")]
    Cancelled,

    #[error("stage {stage} panicked: {message}")]
    StagePanicked { stage: String, message: String },
}

impl PipelineError {
    /// Whether this is a deliberate stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_error_display() {
        let err = TransformError {
            stage: 0,
            replica: 1,
            item: 42,
            source: anyhow::anyhow!("division by zero"),
        };

        let display = err.to_string();
        assert!(display.contains("stage 0"));
        assert!(display.contains("replica 1"));
        assert!(display.contains("#42"));
        assert!(display.contains("division by zero"));
    }

    #[test]
    fn test_pipeline_error_is_cancelled() {
        assert!(PipelineError::Cancelled.is_cancelled());
        assert!(!PipelineError::InvalidConfig("replica_count".into()).is_cancelled());
    }

    #[test]
    fn test_transform_converts_transparently() {
        let err: PipelineError = TransformError {
            stage: 2,
            replica: 0,
            item: 0,
            source: anyhow::anyhow!("bad input"),
        }
        .into();

        assert!(matches!(err, PipelineError::Transform(_)));
        assert!(err.to_string().contains("bad input"));
    }
}
