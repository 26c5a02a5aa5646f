use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of an extraction run.
///
/// `Idle -> Running -> (Cancelling ->) Succeeded | Failed | Cancelled`. A new
/// run may start from `Idle` or any terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Idle,
    Running,
    /// A cancel was requested and the worker has not reached a checkpoint yet.
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl Status {
    /// Returns `true` while a worker owns the run.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    /// Returns `true` for `Succeeded`, `Failed` and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// A snapshot of the extraction state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionState {
    pub status: Status,
    /// Percentage of the file set extracted, `0..=100`.
    pub progress_percent: u8,
    /// The last status line.
    pub message: String,
    /// Whether the current run has been asked to stop.
    pub cancel_requested: bool,
}

/// One-way cancellation flag shared with a single run's worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Never reset for the lifetime of the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
