//! A library for reading PlayStation 4 `param.sfo` files.
//!
//! `param.sfo` (also known as PSF) is a small typed key/value table shipped in
//! every package and installed title. It carries the title name, title ID,
//! application version and other attributes.
//!
//! # Example
//!
//! ```no_run
//! use orbis_sfo::Sfo;
//!
//! let sfo = Sfo::open("CUSA00001/sce_sys/param.sfo").unwrap();
//!
//! if let Some(title) = sfo.get_str("TITLE") {
//!     println!("Title: {title}");
//! }
//! ```
//!
//! # References
//!
//! - [PS4 Developer Wiki - Param.sfo](https://www.psdevwiki.com/ps4/Param.sfo)

use snafu::{ResultExt, Snafu, ensure};
use std::fmt;
use std::path::{Path, PathBuf};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const SFO_MAGIC: u32 = 0x46535000; // "\0PSF"

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SfoHeaderRaw {
    magic: U32,
    version: U32,
    key_table_offset: U32,
    data_table_offset: U32,
    entry_count: U32,
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SfoIndexRaw {
    key_offset: U16,
    format: U16,
    len: U32,
    max_len: U32,
    data_offset: U32,
}

/// Errors when parsing `param.sfo` data.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("SFO data is too small"))]
    TooSmall,

    #[snafu(display("invalid SFO magic"))]
    InvalidMagic,

    #[snafu(display("index entry #{num} is out of bounds"))]
    InvalidIndex { num: usize },

    #[snafu(display("key of entry #{num} is out of bounds or not terminated"))]
    InvalidKey { num: usize },

    #[snafu(display("data of entry '{key}' is out of bounds"))]
    InvalidData { key: String },

    #[snafu(display("entry '{key}' has an unknown format 0x{format:04X}"))]
    UnknownFormat { key: String, format: u16 },

    #[snafu(display("integer entry '{key}' is not 4 bytes long"))]
    InvalidInteger { key: String },
}

/// Errors for [`Sfo::open()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot read {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot parse {}", path.display()))]
    Parse { path: PathBuf, source: ReadError },
}

/// A single value stored in a `param.sfo` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfoValue {
    /// UTF-8 data that is not NUL-terminated (format `0x0004`).
    Utf8Special(Vec<u8>),
    /// NUL-terminated UTF-8 string (format `0x0204`).
    Utf8(Vec<u8>),
    /// 32-bit unsigned integer (format `0x0404`).
    Integer(u32),
}

impl SfoValue {
    const FMT_UTF8_SPECIAL: u16 = 0x0004;
    const FMT_UTF8: u16 = 0x0204;
    const FMT_INTEGER: u16 = 0x0404;

    /// Returns the string bytes up to the first NUL, or `None` for integers.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Utf8Special(v) | Self::Utf8(v) => {
                let len = v.iter().position(|&b| b == 0).unwrap_or(v.len());
                Some(&v[..len])
            }
            Self::Integer(_) => None,
        }
    }

    /// Returns the integer value, or `None` for strings.
    #[must_use]
    pub const fn as_integer(&self) -> Option<u32> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for SfoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "0x{v:08X}"),
            _ => {
                let bytes = self.as_bytes().unwrap_or_default();
                write!(f, "{}", String::from_utf8_lossy(bytes))
            }
        }
    }
}

/// A parsed `param.sfo` table.
///
/// Entries keep the order in which they appear in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct Sfo {
    version: u32,
    entries: Vec<(String, SfoValue)>,
}

impl Sfo {
    /// Parses a `param.sfo` table from raw bytes.
    pub fn read(data: &[u8]) -> Result<Self, ReadError> {
        let (header, _) = SfoHeaderRaw::read_from_prefix(data).map_err(|_| TooSmallSnafu.build())?;

        ensure!(header.magic.get() == SFO_MAGIC, InvalidMagicSnafu);

        let key_table = header.key_table_offset.get() as usize;
        let data_table = header.data_table_offset.get() as usize;
        let count = header.entry_count.get() as usize;
        let mut entries = Vec::with_capacity(count.min(256));

        for num in 0..count {
            let offset = size_of::<SfoHeaderRaw>() + num * size_of::<SfoIndexRaw>();
            let (index, _) = data
                .get(offset..)
                .and_then(|raw| SfoIndexRaw::read_from_prefix(raw).ok())
                .ok_or(ReadError::InvalidIndex { num })?;

            // Keys are NUL-terminated ASCII.
            let key = data
                .get(key_table + index.key_offset.get() as usize..)
                .and_then(|raw| raw.iter().position(|&b| b == 0).map(|end| &raw[..end]))
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .ok_or(ReadError::InvalidKey { num })?
                .to_owned();

            let start = data_table + index.data_offset.get() as usize;
            let end = start + index.len.get() as usize;
            let Some(raw) = data.get(start..end) else {
                return InvalidDataSnafu { key }.fail();
            };

            let value = match index.format.get() {
                SfoValue::FMT_UTF8_SPECIAL => SfoValue::Utf8Special(raw.to_vec()),
                SfoValue::FMT_UTF8 => SfoValue::Utf8(raw.to_vec()),
                SfoValue::FMT_INTEGER => {
                    let Ok(bytes) = <[u8; 4]>::try_from(raw) else {
                        return InvalidIntegerSnafu { key }.fail();
                    };
                    SfoValue::Integer(u32::from_le_bytes(bytes))
                }
                format => return UnknownFormatSnafu { key, format }.fail(),
            };

            entries.push((key, value));
        }

        Ok(Self {
            version: header.version.get(),
            entries,
        })
    }

    /// Reads and parses a `param.sfo` file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let data = std::fs::read(path).context(ReadFileSnafu { path })?;
        Self::read(&data).context(ParseSnafu { path })
    }

    /// Returns the format version from the header (usually `0x0101`).
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SfoValue> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    /// Returns the string bytes stored under `key`, without the NUL terminator.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&[u8]> {
        self.get(key)?.as_bytes()
    }

    /// Like [`Sfo::get_string()`] but only returns valid UTF-8.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        std::str::from_utf8(self.get_string(key)?).ok()
    }

    /// Returns the integer stored under `key`.
    #[must_use]
    pub fn get_integer(&self, key: &str) -> Option<u32> {
        self.get(key)?.as_integer()
    }

    /// Returns an iterator over all entries in file order.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = (&str, &SfoValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
