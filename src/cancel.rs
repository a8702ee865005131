//! Broadcast cancellation shared by every stage of a pipeline.
//!
//! Stages hold a [`CancellationSignal`] and can only observe it. The raising
//! side, [`CancelTrigger`], never leaves the driver.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a pipeline was stopped before its input ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The caller asked for it, or dropped the handle without waiting.
    External,
    /// A transform failed under the abort policy.
    TransformFailure,
    /// A stage task panicked outside its mapping function.
    StagePanicked,
}

impl StopCause {
    fn encode(self) -> u8 {
        match self {
            StopCause::External => 1,
            StopCause::TransformFailure => 2,
            StopCause::StagePanicked => 3,
        }
    }

    fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(StopCause::External),
            2 => Some(StopCause::TransformFailure),
            3 => Some(StopCause::StagePanicked),
            _ => None,
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::External => write!(f, "cancelled by caller"),
            StopCause::TransformFailure => write!(f, "aborted on transform failure"),
            StopCause::StagePanicked => write!(f, "aborted on stage panic"),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    token: CancellationToken,
    /// 0 while active, otherwise the encoded cause of the first raise.
    cause: AtomicU8,
}

/// Observer side of a pipeline's cancellation.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    shared: Arc<Shared>,
}

impl CancellationSignal {
    /// Create a fresh signal and the trigger that can raise it.
    pub(crate) fn new() -> (Self, CancelTrigger) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            CancelTrigger { shared },
        )
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Resolves once the signal has been raised. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        self.shared.token.cancelled().await
    }

    /// Cause recorded by the first raise, if any.
    pub fn cause(&self) -> Option<StopCause> {
        StopCause::decode(self.shared.cause.load(Ordering::Acquire))
    }
}

/// Raising side of the signal, owned by the pipeline driver.
#[derive(Debug, Clone)]
pub(crate) struct CancelTrigger {
    shared: Arc<Shared>,
}

impl CancelTrigger {
    /// Raise the signal. Only the first call records its cause and returns
    /// `true`; later calls are no-ops.
    pub(crate) fn raise(&self, cause: StopCause) -> bool {
        let first = self
            .shared
            .cause
            .compare_exchange(0, cause.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.shared.token.cancel();
        first
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}
