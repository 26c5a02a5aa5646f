use std::fmt;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32, U64},
};

/// Errors when reading a PKG header.
#[derive(Debug, snafu::Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("PKG file is too small"))]
    TooSmall,

    #[snafu(display("invalid PKG magic"))]
    InvalidMagic,
}

const PKG_MAGIC: u32 = 0x7F434E54;

/// Size of the full PKG header, including digests and PFS info.
pub const HEADER_SIZE: usize = 0x1000;

/// The PKG header up to the PFS image info.
///
/// The digest table is skipped; nothing here verifies digests.
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PkgHeaderRaw {
    pub pkg_magic: U32,            // 0x000 - 0x7F434E54
    pub pkg_type: U32,             // 0x004
    pub pkg_0x008: U32,            // 0x008 - unknown field
    pub pkg_file_count: U32,       // 0x00C
    pub pkg_entry_count: U32,      // 0x010
    pub pkg_sc_entry_count: U16,   // 0x014
    pub pkg_entry_count_2: U16,    // 0x016 - same as pkg_entry_count
    pub pkg_table_offset: U32,     // 0x018 - file table offset
    pub pkg_entry_data_size: U32,  // 0x01C
    pub pkg_body_offset: U64,      // 0x020
    pub pkg_body_size: U64,        // 0x028
    pub pkg_content_offset: U64,   // 0x030
    pub pkg_content_size: U64,     // 0x038
    pub pkg_content_id: ContentId, // 0x040 - 36 bytes
    pub pkg_padding: [u8; 0xC],    // 0x064
    pub pkg_drm_type: U32,         // 0x070
    pub pkg_content_type: U32,     // 0x074
    pub pkg_content_flags: U32,    // 0x078
    pub pkg_promote_size: U32,     // 0x07C
    pub pkg_version_date: U32,     // 0x080
    pub pkg_version_hash: U32,     // 0x084
    pub pkg_reserved: [u8; 0x18],  // 0x088 - 0x0A0

    // Digest table and padding (0x0A0 - 0x404)
    pub padding_0x0a0: [u8; 0x364],

    // PFS image info
    pub pfs_image_count: U32,  // 0x404 - count of PFS images
    pub pfs_image_flags: U64,  // 0x408 - PFS flags
    pub pfs_image_offset: U64, // 0x410 - offset to start of external PFS image
    pub pfs_image_size: U64,   // 0x418 - size of external PFS image
}

/// Content ID structure (36 bytes).
///
/// Format: `<service_id><publisher>-<title_id>_<version>-<label>`
/// Example: `UP0102-CUSA03173_00-PSYCHONAUTS1PS40`
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct ContentId {
    service_id: [u8; 2],
    publisher_code: [u8; 4],
    _sep1: u8,
    title_id: [u8; 9],
    _sep2: u8,
    version: [u8; 2],
    _sep3: u8,
    label: [u8; 16],
}

/// Interprets `bytes` as a NUL-padded string.
fn padded_str(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..len]).unwrap_or("")
}

impl ContentId {
    /// Returns the service ID (e.g., "UP", "EP", "JP").
    #[must_use]
    pub fn service_id(&self) -> &str {
        padded_str(&self.service_id)
    }

    /// Returns the title ID (e.g., "CUSA03173").
    #[must_use]
    pub fn title_id(&self) -> &str {
        padded_str(&self.title_id)
    }

    /// Returns the content label (e.g., "PSYCHONAUTS1PS40").
    #[must_use]
    pub fn label(&self) -> &str {
        padded_str(&self.label)
    }

    /// Returns the full content ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match padded_str(self.as_bytes()) {
            "" => "<invalid>",
            s => s,
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentId").field(&self.as_str()).finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContentFlags(u32);

bitflags::bitflags! {
    impl ContentFlags: u32 {
        const PLAYGO = 0x00000001;
        const DEBUG = 0x00000002;
        const FIRST_PATCH = 0x00100000;
        const PATCHGO = 0x00200000;
        const REMASTER = 0x00400000;
        const PS_CLOUD = 0x00800000;
        const GD_AC = 0x02000000;
        const NON_GAME = 0x04000000;
        const UNKNOWN_0X8000000 = 0x08000000;
        const SUBSEQUENT_PATCH = 0x40000000;
        const DELTA_PATCH = 0x41000000;
        const CUMULATIVE_PATCH = 0x60000000;
    }
}

impl ContentFlags {
    const NAMES: &'static [(Self, &'static str)] = &[
        (Self::PLAYGO, "PLAYGO"),
        (Self::DEBUG, "DEBUG"),
        (Self::FIRST_PATCH, "FIRST_PATCH"),
        (Self::PATCHGO, "PATCHGO"),
        (Self::REMASTER, "REMASTER"),
        (Self::PS_CLOUD, "PS_CLOUD"),
        (Self::GD_AC, "GD_AC"),
        (Self::NON_GAME, "NON_GAME"),
        (Self::UNKNOWN_0X8000000, "0x8000000 (UNKNOWN)"),
        (Self::SUBSEQUENT_PATCH, "SUBSEQUENT_PATCH"),
        (Self::DELTA_PATCH, "DELTA_PATCH"),
        (Self::CUMULATIVE_PATCH, "CUMULATIVE_PATCH"),
    ];

    /// Returns the names of all flags that are fully set, in bit order.
    ///
    /// Compound flags (e.g. `DELTA_PATCH`) are listed alongside their parts.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for ContentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();

        match names.next() {
            Some(first) => f.write_str(first)?,
            None => return f.write_str("(none)"),
        }

        for name in names {
            write!(f, ", {name}")?;
        }

        Ok(())
    }
}

/// Returns a human-readable name for a content type value.
#[must_use]
pub const fn content_type_name(content_type: u32) -> &'static str {
    match content_type {
        0x01 | 0x1A => "GD (Game Data)",
        0x02 | 0x1B => "AC (Additional Content)",
        0x03 => "AL (App License)",
        0x04 => "DP (Delta Patch)",
        0x05 => "DP (Cumulative Patch)",
        0x06 => "Remaster",
        _ => "Unknown",
    }
}

/// Parsed PKG header information.
#[derive(Debug)]
#[must_use]
pub struct PkgHeader {
    raw_header: PkgHeaderRaw,
}

impl PkgHeader {
    /// Parses a PKG header from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is smaller than [`HEADER_SIZE`] or has an
    /// invalid magic number.
    pub fn read(pkg: &[u8]) -> Result<Self, ReadError> {
        snafu::ensure!(pkg.len() >= HEADER_SIZE, TooSmallSnafu);

        // The length check above guarantees the prefix is available.
        let (raw_header, _) =
            PkgHeaderRaw::read_from_prefix(pkg).map_err(|_| TooSmallSnafu.build())?;

        snafu::ensure!(raw_header.pkg_magic.get() == PKG_MAGIC, InvalidMagicSnafu);

        Ok(Self { raw_header })
    }

    /// Returns the number of entries in the PKG.
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.raw_header.pkg_entry_count.get() as _
    }

    /// Returns the offset to the entry table.
    #[must_use]
    pub const fn table_offset(&self) -> usize {
        self.raw_header.pkg_table_offset.get() as _
    }

    /// Returns the content ID.
    pub fn content_id(&self) -> &ContentId {
        &self.raw_header.pkg_content_id
    }

    /// Returns the content type.
    #[must_use]
    pub const fn content_type(&self) -> u32 {
        self.raw_header.pkg_content_type.get()
    }

    /// Returns the content flags.
    #[must_use]
    pub const fn content_flags(&self) -> ContentFlags {
        ContentFlags::from_bits_truncate(self.raw_header.pkg_content_flags.get())
    }

    /// Returns the offset of the PFS image.
    #[must_use]
    pub const fn pfs_offset(&self) -> usize {
        self.raw_header.pfs_image_offset.get() as _
    }

    /// Returns the size of the PFS image; zero when the package has none.
    #[must_use]
    pub const fn pfs_size(&self) -> usize {
        self.raw_header.pfs_image_size.get() as _
    }

    /// Returns the file count.
    #[must_use]
    pub const fn file_count(&self) -> u32 {
        self.raw_header.pkg_file_count.get()
    }

    /// Returns the raw header.
    #[must_use]
    pub const fn raw_header(&self) -> &PkgHeaderRaw {
        &self.raw_header
    }
}
