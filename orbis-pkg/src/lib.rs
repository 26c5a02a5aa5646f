//! A library for reading PlayStation 4 PKG files.
//!
//! This crate parses the PKG header and entry table, the part of a package
//! that carries its identity (content ID, flags) and the `sce_sys` metadata
//! files such as `param.sfo` and `icon0.png`. With [`PkgKeys`] it also
//! decrypts encrypted entries and recovers the EKPFS that unlocks the PFS
//! image holding the game files.
//!
//! # Example
//!
//! ```no_run
//! use orbis_pkg::Pkg;
//! use orbis_pkg::keys::PkgKeys;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = PkgKeys::load(Path::new("entry_key3.pem"), Path::new("pfs_image_key.pem"))?;
//! let bytes = std::fs::read("game.pkg")?;
//! let pkg = Pkg::with_keys(bytes, &keys)?;
//!
//! println!("Content ID: {}", pkg.header().content_id());
//! println!("Flags: {}", pkg.header().content_flags());
//!
//! for result in pkg.entries() {
//!     let (_, entry) = result?;
//!
//!     if let Some(path) = entry.relative_path() {
//!         let data = pkg.entry_data(&entry)?;
//!         println!("sce_sys/{} ({} bytes)", path.display(), data.len());
//!     }
//! }
//!
//! if let Some(range) = pkg.pfs_image_range() {
//!     println!("PFS image: {} bytes", range.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [PS4 Developer Wiki - PKG files](https://www.psdevwiki.com/ps4/PKG_files)

use self::entry::PkgEntry;
use self::header::PkgHeader;
use self::keys::PkgKeys;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use sha2::Digest;
use snafu::{ResultExt, Snafu};
use std::borrow::Cow;
use std::ops::Range;

pub mod entry;
pub mod header;
pub mod keys;

/// Layout of the entry keys entry: seed, 7 digests, 7 RSA-wrapped keys.
const ENTRY_KEYS_SEED: usize = 32;
const ENTRY_KEYS_DIGEST: usize = 32;
const ENTRY_KEYS_KEY: usize = 256;
const ENTRY_KEYS_SLOTS: usize = 7;

/// A parsed PS4 PKG file.
///
/// Generic over the byte source so it works on memory maps and owned buffers.
#[must_use]
pub struct Pkg<R: AsRef<[u8]>> {
    raw: R,
    header: PkgHeader,
    entry_key3: Vec<u8>,
    ekpfs: Vec<u8>,
}

impl<R: AsRef<[u8]>> std::fmt::Debug for Pkg<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkg")
            .field("header", &self.header)
            .field("entry_count", &self.entry_count())
            .field("has_keys", &!self.entry_key3.is_empty())
            .finish_non_exhaustive()
    }
}

impl<R: AsRef<[u8]>> Pkg<R> {
    /// Creates a new [`Pkg`] from raw bytes, without keys.
    ///
    /// Parses the header and checks that the whole entry table is in bounds.
    /// Encrypted entries of such a package cannot be read.
    pub fn new(raw: R) -> Result<Self, OpenError> {
        let header = PkgHeader::read(raw.as_ref()).context(open_error::ReadHeaderFailedSnafu)?;

        let table_end = header
            .entry_count()
            .checked_mul(PkgEntry::RAW_SIZE)
            .and_then(|len| len.checked_add(header.table_offset()));

        match table_end {
            Some(end) if end <= raw.as_ref().len() => {}
            _ => {
                return open_error::EntryTableOutOfBoundsSnafu {
                    count: header.entry_count(),
                }
                .fail();
            }
        }

        Ok(Self {
            raw,
            header,
            entry_key3: Vec::new(),
            ekpfs: Vec::new(),
        })
    }

    /// Creates a new [`Pkg`] and unwraps its entry key and EKPFS with `keys`.
    pub fn with_keys(raw: R, keys: &PkgKeys) -> Result<Self, OpenError> {
        let mut pkg = Self::new(raw)?;

        pkg.load_entry_key3(keys)?;
        pkg.load_ekpfs(keys)?;

        Ok(pkg)
    }

    /// Returns a reference to the PKG header.
    pub fn header(&self) -> &PkgHeader {
        &self.header
    }

    /// Returns the number of entries in the PKG.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.header.entry_count()
    }

    /// Returns an iterator over all entries in the PKG.
    ///
    /// Each item contains the entry index and the entry metadata.
    pub fn entries(&self) -> PkgEntries<'_> {
        PkgEntries {
            raw: self.raw.as_ref(),
            table_offset: self.header.table_offset(),
            current: 0,
            total: self.header.entry_count(),
        }
    }

    /// Returns `true` if [`Pkg::entry_data()`] can read `entry`.
    #[must_use]
    pub fn can_read(&self, entry: &PkgEntry) -> bool {
        !entry.is_encrypted() || (entry.key_index() == 3 && !self.entry_key3.is_empty())
    }

    /// Returns the data of an entry, decrypted if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EntryDataError::NoDecryptionKey`] if the entry is encrypted
    /// and no key is available for its key index.
    pub fn entry_data(&self, entry: &PkgEntry) -> Result<Cow<'_, [u8]>, EntryDataError> {
        if !self.can_read(entry) {
            return Err(EntryDataError::NoDecryptionKey {
                key_index: entry.key_index(),
            });
        }

        let offset = entry.data_offset();
        let padded_size = if entry.is_encrypted() {
            // Encrypted data is stored padded to the AES block size.
            entry.data_size().next_multiple_of(16)
        } else {
            entry.data_size()
        };

        let raw_data = offset
            .checked_add(padded_size)
            .and_then(|end| self.raw.as_ref().get(offset..end))
            .ok_or(EntryDataError::InvalidDataOffset)?;

        if !entry.is_encrypted() {
            return Ok(Cow::Borrowed(raw_data));
        }

        let mut decrypted = self.decrypt_entry_data(entry, raw_data);
        decrypted.truncate(entry.data_size());

        Ok(Cow::Owned(decrypted))
    }

    /// Returns the byte range of the PFS image within the package.
    ///
    /// Returns `None` if the package has no PFS image or it is out of bounds.
    #[must_use]
    pub fn pfs_image_range(&self) -> Option<Range<usize>> {
        let offset = self.header.pfs_offset();
        let size = self.header.pfs_size();
        let end = offset.checked_add(size)?;

        (size != 0 && end <= self.raw.as_ref().len()).then_some(offset..end)
    }

    /// Returns the key of the PFS image, if the package was opened with keys.
    #[must_use]
    pub fn ekpfs(&self) -> Option<&[u8]> {
        (!self.ekpfs.is_empty()).then_some(self.ekpfs.as_slice())
    }

    /// Finds an entry by its raw numeric ID.
    ///
    /// Returns the entry and its index if found.
    pub fn find_entry(&self, id: u32) -> Result<(PkgEntry, usize), FindEntryError> {
        for result in self.entries() {
            let (num, entry) = result.map_err(|source| FindEntryError::ReadFailed { source })?;

            if entry.id() == id {
                return Ok((entry, num));
            }
        }

        Err(FindEntryError::NotFound)
    }

    /// Returns the `param.sfo` data, if the package carries a readable one.
    #[must_use]
    pub fn param_sfo(&self) -> Option<Cow<'_, [u8]>> {
        let (entry, _) = self.find_entry(entry::ids::PARAM_SFO).ok()?;
        self.entry_data(&entry).ok()
    }

    /// Finds a key entry, mapping a missing one to `not_found`.
    fn find_key_entry(
        &self,
        id: u32,
        not_found: OpenError,
        failed: impl FnOnce(FindEntryError) -> OpenError,
    ) -> Result<(PkgEntry, usize), OpenError> {
        match self.find_entry(id) {
            Ok(found) => Ok(found),
            Err(FindEntryError::NotFound) => Err(not_found),
            Err(e) => Err(failed(e)),
        }
    }

    fn load_entry_key3(&mut self, keys: &PkgKeys) -> Result<(), OpenError> {
        let (entry, num) = self.find_key_entry(
            entry::ids::ENTRY_KEYS,
            OpenError::EntryKeyNotFound,
            |source| OpenError::FindEntryKeyFailed { source },
        )?;

        // The keys entry itself is stored in the clear.
        let start = entry.data_offset();
        let data = start
            .checked_add(entry.data_size())
            .and_then(|end| self.raw.as_ref().get(start..end))
            .ok_or(OpenError::InvalidEntryOffset { num })?;

        let key3_at = ENTRY_KEYS_SEED + ENTRY_KEYS_SLOTS * ENTRY_KEYS_DIGEST + 3 * ENTRY_KEYS_KEY;
        let key3 = data
            .get(key3_at..key3_at + ENTRY_KEYS_KEY)
            .ok_or(OpenError::InvalidEntryOffset { num })?;

        self.entry_key3 = keys
            .entry_key3()
            .decrypt(rsa::Pkcs1v15Encrypt, key3)
            .context(open_error::DecryptEntryKeyFailedSnafu { key_index: 3usize })?;

        Ok(())
    }

    fn load_ekpfs(&mut self, keys: &PkgKeys) -> Result<(), OpenError> {
        let (entry, _) = self.find_key_entry(
            entry::ids::PFS_IMAGE_KEY,
            OpenError::PfsImageKeyNotFound,
            |source| OpenError::FindPfsImageKeyFailed { source },
        )?;

        let ekpfs = {
            let data = self
                .entry_data(&entry)
                .context(open_error::GetPfsImageKeyFailedSnafu)?;

            keys.pfs_image_key()
                .decrypt(rsa::Pkcs1v15Encrypt, &data)
                .context(open_error::DecryptEkpfsFailedSnafu)?
        };

        self.ekpfs = ekpfs;

        Ok(())
    }

    fn decrypt_entry_data(&self, entry: &PkgEntry, encrypted: &[u8]) -> Vec<u8> {
        debug_assert_eq!(encrypted.len() % 16, 0);

        let (key, iv) = self.derive_entry_key3(entry);
        let mut decryptor = cbc::Decryptor::<aes::Aes128>::new(&key.into(), &iv.into());
        let mut out = encrypted.to_vec();

        for block in out.chunks_exact_mut(16) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        out
    }

    /// Derives the AES key and IV of `entry` from `entry_key3`.
    fn derive_entry_key3(&self, entry: &PkgEntry) -> ([u8; 16], [u8; 16]) {
        let mut sha256 = sha2::Sha256::new();
        sha256.update(entry.as_bytes());
        sha256.update(&self.entry_key3);
        let secret = sha256.finalize();

        let mut iv = [0u8; 16];
        let mut key = [0u8; 16];
        iv.copy_from_slice(&secret[..16]);
        key.copy_from_slice(&secret[16..]);

        (key, iv)
    }
}

/// Iterator over PKG entries.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct PkgEntries<'a> {
    raw: &'a [u8],
    table_offset: usize,
    current: usize,
    total: usize,
}

impl std::fmt::Debug for PkgEntries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkgEntries")
            .field("current", &self.current)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl Iterator for PkgEntries<'_> {
    type Item = Result<(usize, PkgEntry), EntryReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.total {
            return None;
        }

        let num = self.current;
        self.current += 1;

        let offset = self.table_offset + num * PkgEntry::RAW_SIZE;
        let Some(raw) = self.raw.get(offset..(offset + PkgEntry::RAW_SIZE)) else {
            return Some(Err(EntryReadError::InvalidOffset { num }));
        };

        Some(
            PkgEntry::read(raw)
                .map_err(|source| EntryReadError::ReadFailed { source })
                .map(|entry| (num, entry)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.current;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PkgEntries<'_> {}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("invalid PKG header"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("entry table with {count} entries is out of bounds"))]
    EntryTableOutOfBounds { count: usize },

    #[snafu(display("no PKG entry key available"))]
    EntryKeyNotFound,

    #[snafu(display("failed to find entry key"))]
    FindEntryKeyFailed { source: FindEntryError },

    #[snafu(display("entry #{num} has invalid data offset"))]
    InvalidEntryOffset { num: usize },

    #[snafu(display("cannot decrypt entry key #{key_index}"))]
    DecryptEntryKeyFailed {
        key_index: usize,
        source: rsa::errors::Error,
    },

    #[snafu(display("no PFS image key in the PKG"))]
    PfsImageKeyNotFound,

    #[snafu(display("failed to get PFS image key"))]
    GetPfsImageKeyFailed { source: EntryDataError },

    #[snafu(display("failed to find PFS image key"))]
    FindPfsImageKeyFailed { source: FindEntryError },

    #[snafu(display("cannot decrypt EKPFS"))]
    DecryptEkpfsFailed { source: rsa::errors::Error },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum FindEntryError {
    #[snafu(display("failed to read entry"))]
    ReadFailed { source: EntryReadError },

    #[snafu(display("the specified entry was not found"))]
    NotFound,
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum EntryReadError {
    #[snafu(display("entry #{num} has invalid offset"))]
    InvalidOffset { num: usize },

    #[snafu(display("failed to read entry"))]
    ReadFailed { source: entry::EntryError },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum EntryDataError {
    #[snafu(display("no decryption key available for key index {key_index}"))]
    NoDecryptionKey { key_index: usize },

    #[snafu(display("entry has invalid data offset"))]
    InvalidDataOffset,
}
