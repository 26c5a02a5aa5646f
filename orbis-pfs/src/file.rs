use crate::Pfs;
use crate::image::Image;
use crate::inode::Inode;

use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// A regular file of a [`Pfs`].
///
/// Compressed files read back as their PFSC stream; wrap
/// [`into_image()`](Self::into_image) in a [`PfscImage`](crate::pfsc::PfscImage)
/// to get the contents.
#[must_use]
pub struct File<I: Image> {
    pfs: Arc<Pfs<I>>,
    inode: usize,
}

impl<I: Image> Clone for File<I> {
    fn clone(&self) -> Self {
        Self {
            pfs: self.pfs.clone(),
            inode: self.inode,
        }
    }
}

impl<I: Image> std::fmt::Debug for File<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("inode", &self.inode)
            .field("len", &self.len())
            .field("compressed", &self.is_compressed())
            .finish_non_exhaustive()
    }
}

impl<I: Image> File<I> {
    pub(crate) fn new(pfs: Arc<Pfs<I>>, inode: usize) -> Self {
        Self { pfs, inode }
    }

    /// Size of the contents once decompressed.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inode().size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.inode().is_compressed()
    }

    /// Reads stored bytes at `offset` without moving any cursor.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        read_stored(&self.pfs, self.inode, offset, buf)
    }

    /// Returns a cursor over the stored bytes.
    pub fn reader(&self) -> FileReader<I> {
        FileReader {
            file: self.clone(),
            pos: 0,
        }
    }

    /// Turns the file into an [`Image`], e.g. to open a PFS stored inside it.
    pub fn into_image(self) -> FileImage<I> {
        FileImage {
            pfs: self.pfs,
            inode: self.inode,
        }
    }

    fn inode(&self) -> &Inode {
        self.pfs.inode(self.inode)
    }
}

/// [`Read`] and [`Seek`] over a [`File`].
#[derive(Debug)]
pub struct FileReader<I: Image> {
    file: File<I>,
    pos: u64,
}

impl<I: Image> Read for FileReader<I> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<I: Image> Seek for FileReader<I> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let stored = self.file.inode().stored_size();

        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => stored.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };

        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of file")
        })?;

        Ok(self.pos)
    }
}

/// The stored bytes of a [`File`] as an [`Image`].
pub struct FileImage<I: Image> {
    pfs: Arc<Pfs<I>>,
    inode: usize,
}

impl<I: Image> Image for FileImage<I> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        read_stored(&self.pfs, self.inode, offset, buf)
    }

    fn len(&self) -> u64 {
        self.pfs.inode(self.inode).stored_size()
    }
}

/// Reads the stored bytes of `inode` through its block map.
fn read_stored<I: Image>(
    pfs: &Pfs<I>,
    inode: usize,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<usize> {
    let size = pfs.inode(inode).stored_size();

    if buf.is_empty() || offset >= size {
        return Ok(0);
    }

    let blocks = pfs.block_map(inode);
    let block_size = u64::from(pfs.block_size());
    let mut copied = 0;
    let mut pos = offset;

    while copied < buf.len() && pos < size {
        let logical = pos / block_size;
        let within = pos % block_size;

        let Some(&physical) = usize::try_from(logical)
            .ok()
            .and_then(|logical| blocks.get(logical))
        else {
            return Err(io::Error::other(format!(
                "inode #{inode} has no block #{logical}"
            )));
        };

        let block_end = min((logical + 1) * block_size, size);
        let n = min((block_end - pos) as usize, buf.len() - copied);

        pfs.image().read_exact_at(
            u64::from(physical) * block_size + within,
            &mut buf[copied..copied + n],
        )?;

        copied += n;
        pos += n as u64;
    }

    Ok(copied)
}
