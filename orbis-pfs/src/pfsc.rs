use crate::image::Image;

use flate2::{Decompress, FlushDecompress, Status};
use snafu::{ResultExt, Snafu, ensure};
use std::cmp::{Ordering, min};
use std::io;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// PFSC stream header (48 bytes).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PfscHeaderRaw {
    magic: [u8; 4],      // 0x00 - "PFSC"
    unknown_04: U32,     // 0x04
    unknown_08: U32,     // 0x08
    stored_block: U32,   // 0x0C
    block_size: U64,     // 0x10 - decompressed block size
    offsets_table: U64,  // 0x18
    unknown_20: U64,     // 0x20
    data_length: U64,    // 0x28 - decompressed size
}

const PFSC_MAGIC: &[u8; 4] = b"PFSC";

/// Upper bound for a decompressed block, to reject absurd headers.
const MAX_BLOCK_SIZE: u64 = 0x100_0000;

/// Errors of [`PfscImage::open()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot read PFSC header"))]
    ReadHeader { source: io::Error },

    #[snafu(display("not a PFSC stream"))]
    InvalidMagic,

    #[snafu(display("unsupported PFSC block size {size}"))]
    InvalidBlockSize { size: u64 },

    #[snafu(display("cannot read PFSC block table"))]
    ReadBlockTable { source: io::Error },
}

/// Decompressed view of a PFSC stream.
///
/// Every block is a standalone zlib stream, so a read only inflates the
/// blocks it touches.
pub struct PfscImage<I: Image> {
    source: I,
    block_size: u64,
    /// `offsets[i]..offsets[i + 1]` holds block `i` in `source`.
    offsets: Vec<u64>,
    len: u64,
}

impl<I: Image> std::fmt::Debug for PfscImage<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PfscImage")
            .field("block_size", &self.block_size)
            .field("blocks", &self.offsets.len().saturating_sub(1))
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl<I: Image> PfscImage<I> {
    /// Reads the header and block table of the PFSC stream in `source`.
    pub fn open(source: I) -> Result<Self, OpenError> {
        let mut header = [0u8; size_of::<PfscHeaderRaw>()];

        source
            .read_exact_at(0, &mut header)
            .context(ReadHeaderSnafu)?;

        let Ok(header) = PfscHeaderRaw::read_from_bytes(&header) else {
            unreachable!("buffer has the size of the header");
        };

        ensure!(&header.magic == PFSC_MAGIC, InvalidMagicSnafu);

        let block_size = header.block_size.get();

        ensure!(
            block_size > 0 && block_size <= MAX_BLOCK_SIZE,
            InvalidBlockSizeSnafu { size: block_size }
        );

        let len = header.data_length.get();
        let blocks = len.div_ceil(block_size) as usize;
        let mut table = vec![U64::ZERO; blocks + 1];

        source
            .read_exact_at(header.offsets_table.get(), table.as_mut_bytes())
            .context(ReadBlockTableSnafu)?;

        Ok(Self {
            source,
            block_size,
            offsets: table.into_iter().map(|offset| offset.get()).collect(),
            len,
        })
    }

    /// Inflates block `index` into `out`, which is one block long.
    fn read_block(&self, index: usize, out: &mut [u8]) -> io::Result<()> {
        let (Some(&start), Some(&end)) = (self.offsets.get(index), self.offsets.get(index + 1))
        else {
            return Err(io::Error::other(format!("PFSC block #{index} is out of range")));
        };

        let stored = end.checked_sub(start).ok_or_else(|| {
            io::Error::other(format!("PFSC block #{index} has a negative size"))
        })?;

        match stored.cmp(&self.block_size) {
            Ordering::Less => {
                let mut compressed = vec![0u8; stored as usize];
                self.source.read_exact_at(start, &mut compressed)?;

                let mut inflate = Decompress::new(true);
                let status = inflate
                    .decompress(&compressed, out, FlushDecompress::Finish)
                    .map_err(io::Error::other)?;

                if status != Status::StreamEnd || inflate.total_out() != out.len() as u64 {
                    return Err(io::Error::other(format!(
                        "PFSC block #{index} does not inflate to a full block"
                    )));
                }
            }
            // Stored without compression.
            Ordering::Equal => self.source.read_exact_at(start, out)?,
            // Sparse.
            Ordering::Greater => out.fill(0),
        }

        Ok(())
    }
}

impl<I: Image> Image for PfscImage<I> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.len {
            return Ok(0);
        }

        let mut block = vec![0u8; self.block_size as usize];
        let mut copied = 0;
        let mut pos = offset;

        while copied < buf.len() && pos < self.len {
            let index = pos / self.block_size;
            let within = (pos % self.block_size) as usize;

            self.read_block(index as usize, &mut block)?;

            // The last block may extend past the end of the data.
            let valid = min(self.block_size, self.len - index * self.block_size) as usize;
            let n = min(valid - within, buf.len() - copied);

            buf[copied..copied + n].copy_from_slice(&block[within..within + n]);
            copied += n;
            pos += n as u64;
        }

        Ok(copied)
    }

    fn len(&self) -> u64 {
        self.len
    }
}
