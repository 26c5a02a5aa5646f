use snafu::{Snafu, ensure};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use std::fmt;

/// Errors when parsing a PFS superblock.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("superblock is truncated"))]
    Truncated,

    #[snafu(display("unsupported PFS version {version}"))]
    UnsupportedVersion { version: u64 },

    #[snafu(display("unknown PFS format {format}"))]
    UnknownFormat { format: u64 },

    #[snafu(display("inode block count {count} does not fit a block number"))]
    TooManyInodeBlocks { count: u64 },
}

const VERSION: u64 = 1;
const FORMAT: u64 = 20130315;

/// Bytes of block 0 that hold the superblock, key seed included.
pub(crate) const HEADER_SIZE: usize = 0x380;

const KEY_SEED_OFFSET: usize = 0x370;

/// On-disk superblock, see <https://www.psdevwiki.com/ps4/PFS#Header.2FSuperblock>.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SuperblockRaw {
    version: U64,        // 0x00
    format: U64,         // 0x08
    id: U64,             // 0x10
    fmode: u8,           // 0x18
    clean: u8,           // 0x19
    read_only: u8,       // 0x1A
    reserved: u8,        // 0x1B
    mode: Mode,          // 0x1C
    unknown: U16,        // 0x1E
    block_size: U32,     // 0x20
    backup_count: U32,   // 0x24
    block_count: U64,    // 0x28
    inode_count: U64,    // 0x30
    data_blocks: U64,    // 0x38
    inode_blocks: U64,   // 0x40
    super_root: U64,     // 0x48
}

/// Superblock fields needed to walk the image.
pub(crate) struct PfsHeader {
    raw: SuperblockRaw,
    key_seed: [u8; 16],
}

impl PfsHeader {
    /// Parses the superblock at the start of `data`.
    pub(crate) fn read(data: &[u8]) -> Result<Self, ReadError> {
        let (raw, _) = SuperblockRaw::read_from_prefix(data).map_err(|_| TruncatedSnafu.build())?;

        ensure!(
            raw.version.get() == VERSION,
            UnsupportedVersionSnafu {
                version: raw.version.get()
            }
        );
        ensure!(
            raw.format.get() == FORMAT,
            UnknownFormatSnafu {
                format: raw.format.get()
            }
        );
        ensure!(
            raw.inode_blocks.get() <= u64::from(u32::MAX),
            TooManyInodeBlocksSnafu {
                count: raw.inode_blocks.get()
            }
        );

        let key_seed = data
            .get(KEY_SEED_OFFSET..KEY_SEED_OFFSET + 16)
            .and_then(|seed| <[u8; 16]>::try_from(seed).ok())
            .ok_or_else(|| TruncatedSnafu.build())?;

        Ok(Self { raw, key_seed })
    }

    pub fn mode(&self) -> Mode {
        self.raw.mode
    }

    pub fn block_size(&self) -> u32 {
        self.raw.block_size.get()
    }

    pub fn inode_count(&self) -> usize {
        self.raw.inode_count.get() as usize
    }

    /// Number of blocks holding the inode table.
    pub fn inode_blocks(&self) -> u32 {
        self.raw.inode_blocks.get() as u32
    }

    pub fn super_root(&self) -> usize {
        self.raw.super_root.get() as usize
    }

    pub fn key_seed(&self) -> &[u8; 16] {
        &self.key_seed
    }
}

/// PFS mode bits.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub struct Mode {
    bits: U16,
}

impl Mode {
    /// Inodes carry a 32-byte signature per block pointer.
    #[inline]
    #[must_use]
    pub const fn is_signed(&self) -> bool {
        self.bits.get() & 0x1 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_64bits(&self) -> bool {
        self.bits.get() & 0x2 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.bits.get() & 0x4 != 0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits.get())?;

        let names: Vec<&str> = [
            (self.is_signed(), "signed"),
            (self.is_64bits(), "64-bits"),
            (self.is_encrypted(), "encrypted"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();

        if !names.is_empty() {
            write!(f, " ({})", names.join(", "))?;
        }

        Ok(())
    }
}
