use crate::archive::{PackageSource, PkgSource};
use crate::conflict::{self, ConflictVerdict};
use crate::events::UnpackEvents;
use crate::extract::{ExtractionController, ExtractionState};
use crate::plist::{PropertyListReader, SfoReader};
use crate::session::{OpenError, PackageIdentity, PackageSession};
use orbis_pkg::keys::PkgKeys;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Opens one package at a time, checks it against installed titles and
/// extracts it in the background.
///
/// All notifications go to the single listener `E`.
pub struct Unpacker<S, P, E> {
    session: PackageSession<S, P, E>,
    controller: ExtractionController<S, E>,
}

impl<E: UnpackEvents + 'static> Unpacker<PkgSource, SfoReader, E> {
    /// Creates an unpacker for `.pkg` files with `param.sfo` metadata.
    ///
    /// Only the plain entries of a package can be extracted.
    pub fn new(events: E) -> Self {
        Self::with_readers(PkgSource::default(), SfoReader, events)
    }

    /// Creates an unpacker that decrypts packages with `keys`, so encrypted
    /// entries and the game files of the PFS image are extracted too.
    pub fn with_keys(keys: PkgKeys, events: E) -> Self {
        Self::with_readers(PkgSource::with_keys(keys), SfoReader, events)
    }
}

impl<S, P, E> Unpacker<S, P, E>
where
    S: PackageSource + 'static,
    P: PropertyListReader,
    E: UnpackEvents + 'static,
{
    /// Creates an unpacker on top of custom archive and property list readers.
    pub fn with_readers(source: S, plist: P, events: E) -> Self {
        let source = Arc::new(source);
        let events = Arc::new(events);

        Self {
            session: PackageSession::new(source.clone(), plist, events.clone()),
            controller: ExtractionController::new(source, events),
        }
    }

    /// Opens `path` and makes it the current package.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Arc<PackageIdentity>, OpenError> {
        self.session.open(path)
    }

    /// Returns the currently opened package, if any.
    #[must_use]
    pub fn identity(&self) -> Option<Arc<PackageIdentity>> {
        self.session.identity()
    }

    /// Starts extracting the current package into `destination`.
    ///
    /// Returns `false` if no package is open, an extraction is already
    /// running, or the worker could not be started.
    pub fn extract(&self, destination: impl AsRef<Path>, delete_source_after: bool) -> bool {
        let Some(identity) = self.identity() else {
            warn!("extract requested with no package open");
            return false;
        };

        self.controller
            .start(&identity.source_path, destination.as_ref(), delete_source_after)
    }

    /// Requests the running extraction to stop.
    pub fn cancel(&self) {
        self.controller.cancel();
    }

    /// Checks whether extracting the current package into `destination`
    /// would overwrite an installed title.
    #[must_use]
    pub fn check_patch_status(&self, destination: impl AsRef<Path>) -> ConflictVerdict {
        conflict::check_conflict(
            self.session.property_lists(),
            destination.as_ref(),
            self.identity().as_deref(),
        )
    }

    /// Returns a snapshot of the extraction state.
    #[must_use]
    pub fn state(&self) -> ExtractionState {
        self.controller.state()
    }

    /// Blocks until the running extraction (if any) has finished.
    pub fn wait(&self) -> ExtractionState {
        self.controller.wait()
    }
}
