use crate::image::Image;

use snafu::{ResultExt, Snafu};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// Errors when resolving the data blocks of an inode.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LoadBlocksError {
    #[snafu(display("cannot read indirect block #{block}"))]
    ReadIndirect { block: u32, source: std::io::Error },

    #[snafu(display("inode #{inode} needs more than two levels of indirection"))]
    TooManyBlocks { inode: usize },
}

/// Fixed part of an on-disk inode (100 bytes).
#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct InodeRaw {
    mode: U16,            // 0x00
    nlink: U16,           // 0x02
    flags: U32,           // 0x04
    size: U64,            // 0x08
    size_compressed: U64, // 0x10
    times: [U64; 4],      // 0x18 - atime, mtime, ctime, birthtime
    nsecs: [U32; 4],      // 0x38
    uid: U32,             // 0x48
    gid: U32,             // 0x4C
    spare: [u8; 16],      // 0x50
    blocks: U32,          // 0x60
}

/// Block pointers of an unsigned inode.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PointersRaw {
    direct: [U32; 12],
    indirect: [U32; 5],
}

/// A block pointer preceded by the block's signature.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SignedPointerRaw {
    signature: [u8; 32],
    block: U32,
}

/// Marks `direct[1]` of an inode whose blocks are consecutive.
const CONTIGUOUS: u32 = 0xffffffff;

pub(crate) const MODE_DIRECTORY: u16 = 0x4000;
pub(crate) const MODE_FILE: u16 = 0x8000;

const FLAG_COMPRESSED: u32 = 0x1;

/// An entry of the inode table.
pub struct Inode {
    index: usize,
    raw: InodeRaw,
    direct: [u32; 12],
    indirect: [u32; 5],
    signed: bool,
}

impl Inode {
    /// Reads the next inode from `src` and advances it.
    ///
    /// Returns `None` once the remaining bytes cannot hold an inode; inodes
    /// never straddle blocks.
    pub(crate) fn read(index: usize, signed: bool, src: &mut &[u8]) -> Option<Self> {
        let (raw, rest) = InodeRaw::read_from_prefix(src).ok()?;
        let mut direct = [0u32; 12];
        let mut indirect = [0u32; 5];

        let rest = if signed {
            let (pointers, rest) = <[SignedPointerRaw; 17]>::read_from_prefix(rest).ok()?;
            let blocks = pointers.iter().map(|p| p.block.get());

            for (slot, block) in direct.iter_mut().chain(indirect.iter_mut()).zip(blocks) {
                *slot = block;
            }

            rest
        } else {
            let (pointers, rest) = PointersRaw::read_from_prefix(rest).ok()?;

            direct = pointers.direct.map(|b| b.get());
            indirect = pointers.indirect.map(|b| b.get());
            rest
        };

        *src = rest;

        Some(Self {
            index,
            raw,
            direct,
            indirect,
            signed,
        })
    }

    /// Maps each logical block of the inode to its physical block.
    pub(crate) fn load_block_map(
        &self,
        image: &dyn Image,
        block_size: u32,
    ) -> Result<Vec<u32>, LoadBlocksError> {
        let count = self.block_count() as usize;

        if count == 0 {
            return Ok(Vec::new());
        }

        if self.direct[1] == CONTIGUOUS {
            let start = self.direct[0];
            return Ok((0..self.block_count())
                .map(|i| start.wrapping_add(i))
                .collect());
        }

        let mut blocks: Vec<u32> = self.direct.iter().copied().take(count).collect();

        if blocks.len() == count {
            return Ok(blocks);
        }

        let mut table = vec![0u8; block_size as usize];

        // Single indirect.
        self.read_table(image, self.indirect[0], &mut table)?;

        for block in self.pointers(&table) {
            blocks.push(block);

            if blocks.len() == count {
                return Ok(blocks);
            }
        }

        // Double indirect.
        let mut outer = vec![0u8; block_size as usize];
        self.read_table(image, self.indirect[1], &mut outer)?;

        for inner in self.pointers(&outer) {
            self.read_table(image, inner, &mut table)?;

            for block in self.pointers(&table) {
                blocks.push(block);

                if blocks.len() == count {
                    return Ok(blocks);
                }
            }
        }

        TooManyBlocksSnafu { inode: self.index }.fail()
    }

    fn read_table(
        &self,
        image: &dyn Image,
        block: u32,
        table: &mut [u8],
    ) -> Result<(), LoadBlocksError> {
        let offset = u64::from(block) * table.len() as u64;

        image
            .read_exact_at(offset, table)
            .context(ReadIndirectSnafu { block })
    }

    /// Iterates the block pointers of an indirect block.
    fn pointers<'t>(&self, table: &'t [u8]) -> impl Iterator<Item = u32> + 't {
        let (stride, at) = if self.signed { (36, 32) } else { (4, 0) };

        table.chunks_exact(stride).map(move |entry| {
            let mut value = [0u8; 4];
            value.copy_from_slice(&entry[at..at + 4]);
            u32::from_le_bytes(value)
        })
    }

    fn block_count(&self) -> u32 {
        self.raw.blocks.get()
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        self.raw.mode.get()
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode() & MODE_DIRECTORY != 0
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.raw.flags.get() & FLAG_COMPRESSED != 0
    }

    /// Size of the contents once decompressed.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.raw.size.get()
    }

    /// Number of bytes the contents occupy in the image.
    #[must_use]
    pub fn stored_size(&self) -> u64 {
        if self.is_compressed() {
            self.raw.size_compressed.get()
        } else {
            self.size()
        }
    }
}
