use crate::Pfs;
use crate::file::File;
use crate::image::Image;

use snafu::{ResultExt, Snafu, ensure};
use std::collections::BTreeMap;
use std::sync::Arc;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// Errors of [`Directory::open()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("cannot read directory block #{block}"))]
    ReadBlock { block: u32, source: std::io::Error },

    #[snafu(display("dirent #{dirent} in block #{block} has an invalid size"))]
    InvalidSize { block: u32, dirent: usize },

    #[snafu(display("dirent #{dirent} in block #{block} has unknown type {ty}"))]
    UnknownType { block: u32, dirent: usize, ty: u32 },

    #[snafu(display("dirent '{name}' points to missing inode #{inode}"))]
    InvalidInode { name: String, inode: usize },
}

/// Dirent header, see <https://www.psdevwiki.com/ps4/PFS#Dirents>.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DirentRaw {
    inode: U32,
    ty: U32,
    name_len: U32,
    size: U32,
}

const DIRENT_FILE: u32 = 2;
const DIRENT_DIRECTORY: u32 = 3;
const DIRENT_SELF: u32 = 4;
const DIRENT_PARENT: u32 = 5;

/// A directory of a [`Pfs`].
#[must_use]
pub struct Directory<I: Image> {
    pfs: Arc<Pfs<I>>,
    inode: usize,
}

impl<I: Image> std::fmt::Debug for Directory<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("inode", &self.inode)
            .finish_non_exhaustive()
    }
}

impl<I: Image> Directory<I> {
    pub(crate) fn new(pfs: Arc<Pfs<I>>, inode: usize) -> Self {
        Self { pfs, inode }
    }

    /// Reads the entries of this directory, without `.` and `..`.
    pub fn open(&self) -> Result<DirEntries<I>, OpenError> {
        let block_size = self.pfs.block_size();
        let mut items = BTreeMap::new();
        let mut data = vec![0u8; block_size as usize];

        for &block in self.pfs.block_map(self.inode) {
            self.pfs
                .image()
                .read_exact_at(u64::from(block) * u64::from(block_size), &mut data)
                .context(ReadBlockSnafu { block })?;

            let mut rest = data.as_slice();

            for dirent in 0usize.. {
                // The rest of the block is zero-filled after the last dirent.
                let Ok((raw, after)) = DirentRaw::read_from_prefix(rest) else {
                    break;
                };

                let size = raw.size.get() as usize;

                if size == 0 {
                    break;
                }

                let name_len = raw.name_len.get() as usize;

                ensure!(
                    name_len <= after.len()
                        && size >= size_of::<DirentRaw>() + name_len
                        && size <= rest.len(),
                    InvalidSizeSnafu { block, dirent }
                );

                let name = after[..name_len].to_vec();
                let inode = raw.inode.get() as usize;
                rest = &rest[size..];

                let entry = match raw.ty.get() {
                    DIRENT_SELF | DIRENT_PARENT => continue,
                    DIRENT_FILE => DirEntry::File(File::new(self.pfs.clone(), inode)),
                    DIRENT_DIRECTORY => {
                        DirEntry::Directory(Directory::new(self.pfs.clone(), inode))
                    }
                    ty => return UnknownTypeSnafu { block, dirent, ty }.fail(),
                };

                ensure!(
                    inode < self.pfs.inode_count(),
                    InvalidInodeSnafu {
                        name: String::from_utf8_lossy(&name),
                        inode,
                    }
                );

                items.insert(name, entry);
            }
        }

        Ok(DirEntries { items })
    }
}

/// The entries of a directory, ordered by name.
#[derive(Debug)]
#[must_use]
pub struct DirEntries<I: Image> {
    items: BTreeMap<Vec<u8>, DirEntry<I>>,
}

impl<I: Image> DirEntries<I> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Takes the entry called `name` out of the listing.
    pub fn remove(&mut self, name: &[u8]) -> Option<DirEntry<I>> {
        self.items.remove(name)
    }
}

impl<I: Image> IntoIterator for DirEntries<I> {
    type Item = (Vec<u8>, DirEntry<I>);
    type IntoIter = std::collections::btree_map::IntoIter<Vec<u8>, DirEntry<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// A file or a subdirectory.
#[derive(Debug)]
pub enum DirEntry<I: Image> {
    Directory(Directory<I>),
    File(File<I>),
}
