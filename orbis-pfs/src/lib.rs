//! A library for reading PlayStation 4 PFS images.
//!
//! A PKG stores the game's files in an outer PFS image, encrypted with
//! AES-XTS under a key derived from the package's EKPFS. That image holds
//! `uroot/pfs_image.dat`, an inner PFS (usually PFSC compressed) whose `uroot`
//! directory is the game's file tree.
//!
//! # Example
//!
//! ```no_run
//! use orbis_pfs::directory::DirEntry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = std::fs::read("image.pfs")?;
//! let pfs = orbis_pfs::open(data, None)?;
//!
//! for (name, entry) in pfs.root().open()? {
//!     let kind = match entry {
//!         DirEntry::Directory(_) => "dir",
//!         DirEntry::File(_) => "file",
//!     };
//!
//!     println!("{kind} {}", String::from_utf8_lossy(&name));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [PS4 Developer Wiki - PFS](https://www.psdevwiki.com/ps4/PFS)

use self::directory::Directory;
use self::header::{Mode, PfsHeader};
use self::image::{Image, PlainImage, XTS_SECTOR_SIZE, XtsImage};
use self::inode::Inode;
use aes::Aes128;
use aes::cipher::KeyInit;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::sync::Arc;
use xts_mode::Xts128;

pub mod directory;
pub mod file;
pub mod header;
pub mod image;
pub mod inode;
pub mod pfsc;

/// Errors of [`open()`] and [`open_image()`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot read PFS superblock"))]
    ReadHeader { source: std::io::Error },

    #[snafu(display("invalid PFS superblock"))]
    ParseHeader { source: header::ReadError },

    #[snafu(display("PFS is encrypted but no EKPFS was given"))]
    MissingEkpfs,

    #[snafu(display("block size {block_size} is too small for an encrypted PFS"))]
    EncryptionBlockSizeTooSmall { block_size: u32 },

    #[snafu(display("nested PFS with mode {mode} is not supported"))]
    UnsupportedNestedMode { mode: Mode },

    #[snafu(display("invalid block size {block_size}"))]
    InvalidBlockSize { block_size: u32 },

    #[snafu(display("cannot read inode block #{block}"))]
    ReadInodeBlock { block: u32, source: std::io::Error },

    #[snafu(display("super-root inode #{inode} does not exist"))]
    InvalidSuperRoot { inode: usize },

    #[snafu(display("cannot map the blocks of inode #{inode}"))]
    LoadBlockMap {
        inode: usize,
        source: inode::LoadBlocksError,
    },
}

/// An opened PFS.
///
/// Block maps of all inodes are resolved when the image is opened, so reads
/// only touch the data blocks they need.
#[must_use]
pub struct Pfs<I: Image> {
    image: I,
    inodes: Vec<Inode>,
    block_maps: Vec<Vec<u32>>,
    super_root: usize,
    block_size: u32,
}

impl<I: Image> std::fmt::Debug for Pfs<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pfs")
            .field("inode_count", &self.inodes.len())
            .field("super_root", &self.super_root)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl<I: Image> Pfs<I> {
    /// Returns the super-root directory.
    pub fn root(self: &Arc<Self>) -> Directory<I> {
        Directory::new(self.clone(), self.super_root)
    }

    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn image(&self) -> &I {
        &self.image
    }

    pub(crate) fn inode(&self, index: usize) -> &Inode {
        &self.inodes[index]
    }

    pub(crate) fn block_map(&self, inode: usize) -> &[u32] {
        &self.block_maps[inode]
    }
}

/// Opens the PFS stored in `data`.
///
/// `ekpfs` is required when the image is encrypted and ignored otherwise.
pub fn open<D>(data: D, ekpfs: Option<&[u8]>) -> Result<Arc<Pfs<Box<dyn Image>>>, OpenError>
where
    D: AsRef<[u8]> + Send + Sync + 'static,
{
    let header = PfsHeader::read(data.as_ref()).context(open_error::ParseHeaderSnafu)?;
    let block_size = header.block_size();

    let image: Box<dyn Image> = if header.mode().is_encrypted() {
        ensure!(
            block_size as usize >= XTS_SECTOR_SIZE,
            open_error::EncryptionBlockSizeTooSmallSnafu { block_size }
        );

        let ekpfs = ekpfs.context(open_error::MissingEkpfsSnafu)?;
        let (data_key, tweak_key) = image::xts_keys(ekpfs, header.key_seed());
        let cipher = Xts128::new(
            Aes128::new((&data_key).into()),
            Aes128::new((&tweak_key).into()),
        );

        // The superblock occupies block 0 and is never encrypted.
        Box::new(XtsImage::new(
            data,
            cipher,
            block_size as usize / XTS_SECTOR_SIZE,
        ))
    } else {
        Box::new(PlainImage::new(data))
    };

    load(image, &header)
}

/// Opens a PFS nested in another image, such as `pfs_image.dat`.
pub fn open_image<I: Image>(image: I) -> Result<Arc<Pfs<I>>, OpenError> {
    let mut superblock = [0u8; header::HEADER_SIZE];

    image
        .read_exact_at(0, &mut superblock)
        .context(open_error::ReadHeaderSnafu)?;

    let header = PfsHeader::read(&superblock).context(open_error::ParseHeaderSnafu)?;

    ensure!(
        !header.mode().is_encrypted(),
        open_error::UnsupportedNestedModeSnafu {
            mode: header.mode()
        }
    );

    load(image, &header)
}

fn load<I: Image>(image: I, header: &PfsHeader) -> Result<Arc<Pfs<I>>, OpenError> {
    let block_size = header.block_size();

    ensure!(
        block_size.is_power_of_two() && block_size as usize >= header::HEADER_SIZE,
        open_error::InvalidBlockSizeSnafu { block_size }
    );

    let inodes = read_inodes(&image, header)?;
    let super_root = header.super_root();

    ensure!(
        super_root < inodes.len(),
        open_error::InvalidSuperRootSnafu { inode: super_root }
    );

    let block_maps = inodes
        .iter()
        .enumerate()
        .map(|(index, inode)| {
            inode
                .load_block_map(&image, block_size)
                .context(open_error::LoadBlockMapSnafu { inode: index })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Arc::new(Pfs {
        image,
        inodes,
        block_maps,
        super_root,
        block_size,
    }))
}

/// Reads the inode table, which starts at block 1.
fn read_inodes<I: Image>(image: &I, header: &PfsHeader) -> Result<Vec<Inode>, OpenError> {
    let block_size = header.block_size();
    let count = header.inode_count();
    let signed = header.mode().is_signed();
    let mut inodes = Vec::new();
    let mut data = vec![0u8; block_size as usize];

    for block in 0..header.inode_blocks() {
        if inodes.len() == count {
            break;
        }

        let offset = (u64::from(block) + 1) * u64::from(block_size);

        image
            .read_exact_at(offset, &mut data)
            .context(open_error::ReadInodeBlockSnafu { block })?;

        let mut rest = data.as_slice();

        while inodes.len() < count {
            match Inode::read(inodes.len(), signed, &mut rest) {
                Some(inode) => inodes.push(inode),
                None => break,
            }
        }
    }

    Ok(inodes)
}
