//! Property list capability and its `param.sfo` implementation.

use crate::archive::BoxError;
use orbis_sfo::Sfo;
use std::path::Path;

/// Key of the display name.
pub const KEY_TITLE: &str = "TITLE";

/// Key of the application version (e.g. `01.05`).
pub const KEY_APP_VER: &str = "APP_VER";

/// A parsed key/value property list.
pub trait PropertyList {
    /// Returns the string value stored under `key`, without terminator.
    fn get_string(&self, key: &str) -> Option<&[u8]>;
}

/// Parses property lists from bytes or from a file.
pub trait PropertyListReader: Send + Sync {
    type List: PropertyList;

    /// Parses a property list from raw bytes.
    fn parse(&self, data: &[u8]) -> Result<Self::List, BoxError>;

    /// Reads and parses a property list file.
    fn open(&self, path: &Path) -> Result<Self::List, BoxError> {
        let data = std::fs::read(path)?;
        self.parse(&data)
    }
}

/// Reads a string value and converts it lossily to UTF-8.
pub(crate) fn get_text<L: PropertyList>(list: &L, key: &str) -> Option<String> {
    list.get_string(key)
        .map(|value| String::from_utf8_lossy(value).into_owned())
}

impl PropertyList for Sfo {
    fn get_string(&self, key: &str) -> Option<&[u8]> {
        Sfo::get_string(self, key)
    }
}

/// Reads `param.sfo` tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct SfoReader;

impl PropertyListReader for SfoReader {
    type List = Sfo;

    fn parse(&self, data: &[u8]) -> Result<Sfo, BoxError> {
        Ok(Sfo::read(data)?)
    }

    fn open(&self, path: &Path) -> Result<Sfo, BoxError> {
        Ok(Sfo::open(path)?)
    }
}
