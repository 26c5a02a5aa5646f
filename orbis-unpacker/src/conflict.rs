//! Detection of patches that would overwrite an installed title.

use crate::archive::reason;
use crate::plist::{self, PropertyListReader};
use crate::session::PackageIdentity;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The version strings compared by [`check_conflict()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions {
    /// Version carried by the package being extracted.
    pub package: String,
    /// Version of the title already installed.
    pub installed: String,
}

/// What extracting the current package would do to an installed title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictVerdict {
    /// No package is open.
    NoPackageOpen,
    /// The package is not a patch, so nothing installed can be overwritten.
    NotAPatch,
    /// The patch targets a title that is not installed under the destination.
    TargetNotInstalled,
    /// The installed title has no readable version; extraction is permitted.
    NoComparableVersion,
    /// The patch has the same version as the installed title.
    Match(Versions),
    /// The patch is older than the installed title.
    Older(Versions),
    /// The patch is newer than the installed title.
    Newer(Versions),
}

impl ConflictVerdict {
    /// Returns both version strings for `Match`, `Older` and `Newer`.
    #[must_use]
    pub fn versions(&self) -> Option<&Versions> {
        match self {
            Self::Match(v) | Self::Older(v) | Self::Newer(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` for `Match` and `Older`, where the user should confirm
    /// before extracting.
    #[must_use]
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, Self::Match(_) | Self::Older(_))
    }
}

impl fmt::Display for ConflictVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPackageOpen => f.write_str("no package is open"),
            Self::NotAPatch => f.write_str("package is not a patch"),
            Self::TargetNotInstalled => f.write_str("the game this patch belongs to is not installed"),
            Self::NoComparableVersion => f.write_str("installed version is unknown"),
            Self::Match(v) => write!(f, "version {} is already installed", v.installed),
            Self::Older(v) => write!(
                f,
                "patch version {} is older than installed version {}",
                v.package, v.installed
            ),
            Self::Newer(v) => write!(
                f,
                "patch version {} updates installed version {}",
                v.package, v.installed
            ),
        }
    }
}

/// Returns the `param.sfo` location of `title_id` installed under `root`.
#[must_use]
pub fn installed_param_sfo(root: &Path, title_id: &str) -> PathBuf {
    root.join(title_id).join("sce_sys").join("param.sfo")
}

/// Decides whether extracting `identity` below `destination_root` would
/// overwrite a differently versioned installed title.
pub fn check_conflict<P: PropertyListReader>(
    plist: &P,
    destination_root: &Path,
    identity: Option<&PackageIdentity>,
) -> ConflictVerdict {
    let Some(identity) = identity else {
        return ConflictVerdict::NoPackageOpen;
    };

    if !identity.is_patch {
        return ConflictVerdict::NotAPatch;
    }

    if !destination_root.join(&identity.title_id).is_dir() {
        return ConflictVerdict::TargetNotInstalled;
    }

    let sfo = installed_param_sfo(destination_root, &identity.title_id);

    let list = match plist.open(&sfo) {
        Ok(list) => list,
        Err(e) => {
            debug!("cannot read {}: {}", sfo.display(), reason(&*e));
            return ConflictVerdict::NoComparableVersion;
        }
    };

    let Some(installed) = plist::get_text(&list, plist::KEY_APP_VER) else {
        return ConflictVerdict::NoComparableVersion;
    };

    let versions = Versions {
        package: identity.version.clone(),
        installed,
    };

    match compare_versions(&versions.package, &versions.installed) {
        Ordering::Equal => ConflictVerdict::Match(versions),
        Ordering::Less => ConflictVerdict::Older(versions),
        Ordering::Greater => ConflictVerdict::Newer(versions),
    }
}

/// Compares two version strings as decimal numbers.
///
/// `"01.05"` and `"1.05"` are equal. Multi-component versions do not parse
/// and compare as zero, and `"1.10"` orders before `"1.9"`.
#[must_use]
pub fn compare_versions(package: &str, installed: &str) -> Ordering {
    // Both sides are finite, so they are always comparable.
    parse_decimal(package)
        .partial_cmp(&parse_decimal(installed))
        .unwrap_or(Ordering::Equal)
}

/// Parses `version` as a decimal number, falling back to `0.0`.
#[must_use]
pub fn parse_decimal(version: &str) -> f64 {
    match version.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}
