use snafu::Snafu;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EntryError {
    #[snafu(display("source buffer is too short"))]
    SourceTooShort,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct PkgEntryRaw {
    id: U32,
    filename_offset: U32,
    flags1: U32,
    flags2: U32,
    data_offset: U32,
    data_size: U32,
    padding: U64,
}

/// One record of the PKG entry table.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct PkgEntry {
    raw_entry: PkgEntryRaw,
}

impl PkgEntry {
    pub const RAW_SIZE: usize = size_of::<PkgEntryRaw>();

    /// Reads an entry from raw bytes.
    pub fn read(raw: &[u8]) -> Result<Self, EntryError> {
        let (raw_entry, _) =
            PkgEntryRaw::read_from_prefix(raw).map_err(|_| SourceTooShortSnafu.build())?;

        Ok(Self { raw_entry })
    }

    /// Returns the entry ID.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.raw_entry.id.get()
    }

    /// Returns `true` if this entry is encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.raw_entry.flags1.get() & 0x80000000 != 0
    }

    /// Returns the key index used for encryption.
    #[must_use]
    pub const fn key_index(&self) -> usize {
        ((self.raw_entry.flags2.get() & 0xf000) >> 12) as _
    }

    /// Returns the data offset within the PKG file.
    #[must_use]
    pub const fn data_offset(&self) -> usize {
        self.raw_entry.data_offset.get() as _
    }

    /// Returns the data size in bytes.
    #[must_use]
    pub const fn data_size(&self) -> usize {
        self.raw_entry.data_size.get() as _
    }

    /// Returns the raw table record, which seeds the entry's AES key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw_entry.as_bytes()
    }

    /// Returns the path of this entry relative to `sce_sys`.
    ///
    /// Returns `None` if the entry ID has no known file name.
    #[must_use]
    pub fn relative_path(&self) -> Option<PathBuf> {
        relative_path(self.id())
    }

    /// Joins [`PkgEntry::relative_path()`] onto `base`.
    #[must_use]
    pub fn to_path<B: AsRef<Path>>(&self, base: B) -> Option<PathBuf> {
        Some(base.as_ref().join(self.relative_path()?))
    }
}

/// Well-known entry IDs.
pub mod ids {
    pub const ENTRY_KEYS: u32 = 0x00000010;
    pub const PFS_IMAGE_KEY: u32 = 0x00000020;
    pub const PARAM_SFO: u32 = 0x00001000;
    pub const ICON0_PNG: u32 = 0x00001200;
}

/// Entries with a single fixed name.
const NAMED: &[(u32, &str)] = &[
    (0x00000001, "digests"),
    (ids::ENTRY_KEYS, "entry_keys"),
    (ids::PFS_IMAGE_KEY, "image_key"),
    (0x00000080, "general_digests"),
    (0x00000100, "metas"),
    (0x00000200, "entry_names"),
    (0x00000400, "license.dat"),
    (0x00000401, "license.info"),
    (0x00000402, "nptitle.dat"),
    (0x00000403, "npbind.dat"),
    (0x00000404, "selfinfo.dat"),
    (0x00000406, "imageinfo.dat"),
    (0x00000407, "target-deltainfo.dat"),
    (0x00000408, "origin-deltainfo.dat"),
    (0x00000409, "psreserved.dat"),
    (ids::PARAM_SFO, "param.sfo"),
    (0x00001001, "playgo-chunk.dat"),
    (0x00001002, "playgo-chunk.sha"),
    (0x00001003, "playgo-manifest.xml"),
    (0x00001004, "pronunciation.xml"),
    (0x00001005, "pronunciation.sig"),
    (0x00001006, "pic1.png"),
    (0x00001007, "pubtoolinfo.dat"),
    (0x00001008, "app/playgo-chunk.dat"),
    (0x00001009, "app/playgo-chunk.sha"),
    (0x0000100a, "app/playgo-manifest.xml"),
    (0x0000100b, "shareparam.json"),
    (0x0000100c, "shareoverlayimage.png"),
    (0x0000100d, "save_data.png"),
    (0x0000100e, "shareprivacyguardimage.png"),
    (ids::ICON0_PNG, "icon0.png"),
    (0x00001220, "pic0.png"),
    (0x00001240, "snd0.at9"),
    (0x00001260, "changeinfo/changeinfo.xml"),
    (0x00001280, "icon0.dds"),
    (0x000012a0, "pic0.dds"),
    (0x000012c0, "pic1.dds"),
];

/// Entries numbered `_00` upwards from a base ID: `(first, last, prefix, suffix)`.
const INDEXED: &[(u32, u32, &str, &str)] = &[
    (0x00001201, 0x0000121f, "icon0_", ".png"),
    (0x00001241, 0x0000125f, "pic1_", ".png"),
    (0x00001261, 0x0000127f, "changeinfo/changeinfo_", ".xml"),
    (0x00001281, 0x0000129f, "icon0_", ".dds"),
    (0x000012c1, 0x000012df, "pic1_", ".dds"),
    (0x00001400, 0x00001463, "trophy/trophy", ".trp"),
];

/// Maps an entry ID to its path relative to `sce_sys`.
#[must_use]
pub fn relative_path(id: u32) -> Option<PathBuf> {
    if let Some((_, name)) = NAMED.iter().find(|(known, _)| *known == id) {
        return Some(PathBuf::from(name));
    }

    INDEXED
        .iter()
        .find(|(first, last, ..)| (*first..=*last).contains(&id))
        .map(|(first, _, prefix, suffix)| {
            PathBuf::from(format!("{prefix}{:02}{suffix}", id - first))
        })
}
