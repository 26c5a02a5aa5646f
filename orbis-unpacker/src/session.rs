use crate::archive::{PackageReader, PackageSource, reason};
use crate::events::UnpackEvents;
use crate::plist::{self, PropertyListReader};
use snafu::Snafu;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Status line shown after a package has been opened.
pub const STATUS_READY: &str = "Ready to extract";

/// The identity of an opened package.
///
/// Built in one piece when a package is opened and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageIdentity {
    /// Title ID (e.g. `CUSA03173`), never empty.
    pub title_id: String,
    /// Display name, empty if the package carries no `TITLE`.
    pub title: String,
    /// Application version (e.g. `01.05`), empty if unknown.
    pub version: String,
    /// Whether the package flags mark it as a patch.
    pub is_patch: bool,
    /// The package file this identity was read from.
    pub source_path: PathBuf,
}

/// Errors from [`PackageSession::open()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    /// The archive reader rejected the file; `reason` is shown verbatim.
    #[snafu(display("{reason}"))]
    ArchiveInvalid { reason: String },
}

/// Owns the identity of the currently opened package.
///
/// Opening replaces the identity as a whole: readers get an [`Arc`] to either
/// the previous or the new identity, never a mix.
pub struct PackageSession<S, P, E> {
    source: Arc<S>,
    plist: P,
    events: Arc<E>,
    identity: RwLock<Option<Arc<PackageIdentity>>>,
}

impl<S: PackageSource, P: PropertyListReader, E: UnpackEvents> PackageSession<S, P, E> {
    /// Creates a session with no package open.
    pub fn new(source: Arc<S>, plist: P, events: Arc<E>) -> Self {
        Self {
            source,
            plist,
            events,
            identity: RwLock::new(None),
        }
    }

    /// Opens the package at `path` and makes it the current package.
    ///
    /// Missing or malformed property lists leave `title` and `version` empty
    /// instead of failing the open. On failure no package is open afterwards.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Arc<PackageIdentity>, OpenError> {
        let path = path.as_ref();

        let reader = match self.source.open(path) {
            Ok(reader) => reader,
            Err(e) => {
                let reason = reason(&*e);
                info!("cannot open {}: {reason}", path.display());
                self.replace(None);
                self.events.package_info_changed(None);
                self.events.status_changed(&reason);
                return ArchiveInvalidSnafu { reason }.fail();
            }
        };

        let title_id = reader.title_id();

        if title_id.is_empty() {
            let reason = "package has no title ID".to_owned();
            self.replace(None);
            self.events.package_info_changed(None);
            self.events.status_changed(&reason);
            return ArchiveInvalidSnafu { reason }.fail();
        }

        let flags = reader.flags();
        let (title, version) = self.read_metadata(&reader);

        let identity = Arc::new(PackageIdentity {
            title_id,
            title,
            version,
            is_patch: flags.contains("PATCH"),
            source_path: path.to_path_buf(),
        });

        info!(
            "opened {} ({}, version '{}', flags '{flags}')",
            path.display(),
            identity.title_id,
            identity.version
        );

        self.replace(Some(identity.clone()));
        self.events.package_info_changed(Some(&identity));
        self.events.status_changed(STATUS_READY);

        Ok(identity)
    }

    /// Returns the currently opened package, if any.
    #[must_use]
    pub fn identity(&self) -> Option<Arc<PackageIdentity>> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the property list reader used by this session.
    pub fn property_lists(&self) -> &P {
        &self.plist
    }

    fn read_metadata(&self, reader: &S::Reader) -> (String, String) {
        let Some(blob) = reader.property_list() else {
            debug!("package has no property list");
            return Default::default();
        };

        match self.plist.parse(&blob) {
            Ok(list) => (
                plist::get_text(&list, plist::KEY_TITLE).unwrap_or_default(),
                plist::get_text(&list, plist::KEY_APP_VER).unwrap_or_default(),
            ),
            Err(e) => {
                debug!("ignoring unreadable property list: {}", reason(&*e));
                Default::default()
            }
        }
    }

    fn replace(&self, identity: Option<Arc<PackageIdentity>>) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identity;
    }
}
