//! Cancellable extraction of PlayStation 4 PKG files.
//!
//! This crate drives the extraction of a package: it opens the package and
//! reads its identity, warns when a patch would overwrite an installed title
//! of the same or a newer version, and extracts the package on a background
//! worker that reports progress and can be cancelled between files.
//!
//! # Overview
//!
//! - [`PackageSession`] opens one package at a time and exposes its
//!   [`PackageIdentity`].
//! - [`ExtractionController`] runs one extraction at a time as a
//!   cancellable background task.
//! - [`check_conflict()`] compares a patch against the installed title.
//! - [`Unpacker`] ties the three together around a single [`UnpackEvents`]
//!   listener.
//!
//! Archive and metadata formats are reached through the [`PackageSource`]
//! and [`PropertyListReader`] capabilities. [`PkgSource`] and [`SfoReader`]
//! implement them for `.pkg` and `param.sfo` files. Given the console RSA
//! keys ([`Unpacker::with_keys`]), [`PkgSource`] also decrypts entries and
//! unpacks the game files from the PFS image.
//!
//! # Example
//!
//! ```no_run
//! use orbis_unpacker::{ConflictVerdict, SilentEvents, Unpacker};
//!
//! let unpacker = Unpacker::new(SilentEvents);
//! let identity = unpacker.open("patch.pkg").expect("failed to open PKG");
//!
//! if let ConflictVerdict::Older(v) = unpacker.check_patch_status("games/") {
//!     eprintln!("{} would downgrade {}", identity.title_id, v.installed);
//! } else {
//!     unpacker.extract("games/", false);
//!     println!("{}", unpacker.wait().message);
//! }
//! ```
//!
//! # Custom notifications
//!
//! Implement [`UnpackEvents`] to receive progress and status updates, or use
//! [`ChannelEvents`] to consume them from a queue.

pub mod archive;
pub mod conflict;
pub mod events;
pub mod extract;
pub mod plist;
pub mod session;
mod unpacker;

pub use self::archive::{BoxError, PackageReader, PackageSource, PkgReader, PkgSource};
pub use self::conflict::{ConflictVerdict, Versions, check_conflict, compare_versions};
pub use self::events::{ChannelEvents, SilentEvents, UnpackEvent, UnpackEvents};
pub use self::extract::{ExtractionController, ExtractionError, ExtractionState, Status};
pub use self::plist::{PropertyList, PropertyListReader, SfoReader};
pub use self::session::{OpenError, PackageIdentity, PackageSession};
pub use self::unpacker::Unpacker;

#[cfg(feature = "cli")]
pub use self::events::ConsoleEvents;
