mod error;
mod state;

pub use self::error::ExtractionError;
pub use self::state::{CancelToken, ExtractionState, Status};

use self::error::{ExtractFileFailedSnafu, PrepareFailedSnafu, ReopenFailedSnafu};
use crate::archive::{PackageReader, PackageSource, reason};
use crate::events::UnpackEvents;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub const STATUS_EXTRACTING: &str = "Extracting...";
pub const STATUS_CANCELLING: &str = "Cancelling...";
pub const STATUS_CANCELLED: &str = "Extraction cancelled";
pub const STATUS_SUCCEEDED: &str = "Extraction finished successfully";

/// Prefix of every failure message.
pub const ERROR_PREFIX: &str = "Error: ";

/// Runs extractions on a background worker, one at a time.
///
/// The caller drives the controller only through [`start`](Self::start) and
/// [`cancel`](Self::cancel) and observes it through [`state`](Self::state)
/// and the [`UnpackEvents`] listener.
pub struct ExtractionController<S, E> {
    source: Arc<S>,
    reporter: Reporter<E>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    status: Status,
    progress: u8,
    message: String,
    token: CancelToken,
}

impl<S: PackageSource + 'static, E: UnpackEvents + 'static> ExtractionController<S, E> {
    pub fn new(source: Arc<S>, events: Arc<E>) -> Self {
        let inner = Inner {
            status: Status::Idle,
            progress: 0,
            message: String::new(),
            token: CancelToken::new(),
        };

        Self {
            source,
            reporter: Reporter {
                inner: Arc::new(Mutex::new(inner)),
                events,
            },
            worker: Mutex::new(None),
        }
    }

    /// Returns a snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> ExtractionState {
        let inner = self.reporter.lock();

        ExtractionState {
            status: inner.status,
            progress_percent: inner.progress,
            message: inner.message.clone(),
            cancel_requested: inner.token.is_cancelled(),
        }
    }

    /// Starts extracting `package` into `destination` on a background worker.
    ///
    /// The archive is opened again by the worker, independently of any reader
    /// the caller holds. Returns `false` without touching the state if a run
    /// is already active, and `false` with a `Failed` state if the worker
    /// thread cannot be created.
    ///
    /// A previous worker that is still delivering its final notifications is
    /// joined first, so a new run never reports before the last one is done.
    pub fn start(&self, package: &Path, destination: &Path, delete_source_after: bool) -> bool {
        // Held for the whole call so that concurrent starts are serialized.
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let status = self.reporter.lock().status;

        if status.is_active() {
            debug!("extraction already running, ignoring start");
            return false;
        }

        if let Some(previous) = worker.take() {
            debug_assert!(status.is_terminal());

            // A listener restarting from its own callback runs on that worker.
            if previous.thread().id() != std::thread::current().id() {
                let _ = previous.join();
            }
        }

        let token = {
            let mut inner = self.reporter.lock();
            inner.status = Status::Running;
            inner.progress = 0;
            inner.message = STATUS_EXTRACTING.to_owned();
            inner.token = CancelToken::new();
            inner.token.clone()
        };

        self.reporter.events.status_changed(STATUS_EXTRACTING);

        let run = Run {
            source: self.source.clone(),
            reporter: self.reporter.clone(),
            package: package.to_path_buf(),
            destination: destination.to_path_buf(),
            delete_source_after,
            token,
        };

        let spawned = std::thread::Builder::new()
            .name("orbis-unpacker-extract".to_owned())
            .spawn(move || {
                let reporter = run.reporter.clone();

                if std::panic::catch_unwind(AssertUnwindSafe(|| run.execute())).is_err() {
                    reporter.finish(
                        Status::Failed,
                        format!("{ERROR_PREFIX}extraction worker panicked"),
                    );
                }
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(source) => self.spawn_failed(source),
        }
    }

    /// Fails the run that could not get a worker thread.
    fn spawn_failed(&self, source: std::io::Error) -> bool {
        let e = ExtractionError::SpawnFailed { source };
        error!("{e}");
        self.reporter.finish(Status::Failed, format!("{ERROR_PREFIX}{e}"));

        false
    }

    /// Requests the running extraction to stop at the next file boundary.
    ///
    /// Does nothing unless the status is `Running`. The file being extracted
    /// when the request arrives is completed, and files already written stay
    /// on disk.
    pub fn cancel(&self) {
        {
            let mut inner = self.reporter.lock();

            if inner.status != Status::Running {
                return;
            }

            inner.token.cancel();
            inner.status = Status::Cancelling;
            inner.message = STATUS_CANCELLING.to_owned();
        }

        info!("cancel requested");
        self.reporter.events.status_changed(STATUS_CANCELLING);
    }

    /// Blocks until the current worker (if any) has exited, then returns the
    /// final state.
    ///
    /// Must not be called from an [`UnpackEvents`] callback.
    pub fn wait(&self) -> ExtractionState {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            // Panics are caught inside the worker.
            let _ = handle.join();
        }

        self.state()
    }
}

impl<S, E> Drop for ExtractionController<S, E> {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            self.reporter.lock().token.cancel();
            let _ = handle.join();
        }
    }
}

/// Writes state updates and forwards them to the listener.
struct Reporter<E> {
    inner: Arc<Mutex<Inner>>,
    events: Arc<E>,
}

impl<E> Clone for Reporter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}

impl<E> Reporter<E> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: UnpackEvents> Reporter<E> {
    fn progress(&self, percent: u8) {
        {
            let mut inner = self.lock();
            inner.progress = inner.progress.max(percent);
        }

        self.events.progress_changed(percent);
    }

    fn finish(&self, status: Status, message: String) {
        {
            let mut inner = self.lock();
            inner.status = status;
            inner.message = message.clone();
        }

        self.events.status_changed(&message);
        self.events
            .extraction_finished(status == Status::Succeeded, &message);
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

/// Everything one worker needs, moved onto its thread.
struct Run<S, E> {
    source: Arc<S>,
    reporter: Reporter<E>,
    package: PathBuf,
    destination: PathBuf,
    delete_source_after: bool,
    token: CancelToken,
}

impl<S: PackageSource, E: UnpackEvents> Run<S, E> {
    fn execute(self) {
        info!(
            "starting extraction of {} to {}",
            self.package.display(),
            self.destination.display()
        );

        match self.extract() {
            Ok(Outcome::Completed) => {
                // A cancel that arrives after the last file keeps the package.
                if self.delete_source_after && !self.token.is_cancelled() {
                    match std::fs::remove_file(&self.package) {
                        Ok(()) => info!("deleted {}", self.package.display()),
                        Err(e) => warn!("cannot delete {}: {e}", self.package.display()),
                    }
                }

                self.reporter
                    .finish(Status::Succeeded, STATUS_SUCCEEDED.to_owned());
            }
            Ok(Outcome::Cancelled) => {
                info!("extraction cancelled by user");
                self.reporter
                    .finish(Status::Cancelled, STATUS_CANCELLED.to_owned());
            }
            Err(e) => {
                error!("extraction failed: {e}");
                self.reporter
                    .finish(Status::Failed, format!("{ERROR_PREFIX}{e}"));
            }
        }
    }

    fn extract(&self) -> Result<Outcome, ExtractionError> {
        let mut reader = self.source.open(&self.package).map_err(|e| {
            ReopenFailedSnafu {
                reason: reason(&*e),
            }
            .build()
        })?;

        reader.prepare_extraction(&self.destination).map_err(|e| {
            PrepareFailedSnafu {
                reason: reason(&*e),
            }
            .build()
        })?;

        let total = reader.file_count();
        info!("extracting {total} files");

        if total == 0 {
            self.reporter.progress(100);
            return Ok(Outcome::Completed);
        }

        for index in 0..total {
            if self.token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            reader.extract_file(index).map_err(|e| {
                ExtractFileFailedSnafu {
                    index,
                    reason: reason(&*e),
                }
                .build()
            })?;

            let done = index + 1;
            // Bounded by 100 since done <= total.
            self.reporter.progress((done * 100 / total) as u8);

            if index % 100 == 0 || done == total {
                info!("extracted {done}/{total} files");
            }
        }

        Ok(Outcome::Completed)
    }
}
