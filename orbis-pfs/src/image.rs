use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::cmp::min;
use std::io;
use xts_mode::{Xts128, get_tweak_default};

/// Size of one XTS sector.
pub(crate) const XTS_SECTOR_SIZE: usize = 0x1000;

/// Random-access view of a PFS image.
///
/// Reads take an explicit offset instead of a cursor, so one image can serve
/// several readers at once.
pub trait Image: Send + Sync {
    /// Reads into `buf` starting at `offset`; a short count means end of image.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Fills `buf` from `offset` or fails with [`io::ErrorKind::UnexpectedEof`].
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;

        while filled < buf.len() {
            match self.read_at(offset + filled as u64, &mut buf[filled..])? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past the end of the image",
                    ));
                }
                n => filled += n,
            }
        }

        Ok(())
    }

    /// Returns the image size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<I: Image + ?Sized> Image for Box<I> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }
}

/// Derives the XTS `(data key, tweak key)` pair from EKPFS and the image seed.
pub(crate) fn xts_keys(ekpfs: &[u8], seed: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    // HMAC accepts keys of any length.
    let Ok(mut hmac) = Hmac::<Sha256>::new_from_slice(ekpfs) else {
        unreachable!("HMAC-SHA256 rejected a key");
    };

    hmac.update(&1u32.to_le_bytes());
    hmac.update(seed);

    let secret = hmac.finalize().into_bytes();
    let mut data_key = [0u8; 16];
    let mut tweak_key = [0u8; 16];

    tweak_key.copy_from_slice(&secret[..16]);
    data_key.copy_from_slice(&secret[16..]);

    (data_key, tweak_key)
}

/// A plain image over any byte buffer.
pub struct PlainImage<D> {
    data: D,
}

impl<D: AsRef<[u8]>> PlainImage<D> {
    pub fn new(data: D) -> Self {
        Self { data }
    }
}

impl<D: AsRef<[u8]> + Send + Sync> Image for PlainImage<D> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.as_ref();
        let Some(available) = usize::try_from(offset)
            .ok()
            .and_then(|start| data.get(start..))
        else {
            return Ok(0);
        };

        let n = min(buf.len(), available.len());
        buf[..n].copy_from_slice(&available[..n]);

        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.as_ref().len() as u64
    }
}

/// An AES-XTS encrypted image over any byte buffer.
///
/// Sectors before `first_encrypted` (the superblock) are stored in the clear.
pub struct XtsImage<D> {
    data: D,
    cipher: Xts128<Aes128>,
    first_encrypted: usize,
}

impl<D: AsRef<[u8]>> XtsImage<D> {
    pub fn new(data: D, cipher: Xts128<Aes128>, first_encrypted: usize) -> Self {
        Self {
            data,
            cipher,
            first_encrypted,
        }
    }
}

impl<D: AsRef<[u8]> + Send + Sync> Image for XtsImage<D> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.as_ref();
        let len = data.len() as u64;

        if buf.is_empty() || offset >= len {
            return Ok(0);
        }

        let mut sector = vec![0u8; XTS_SECTOR_SIZE];
        let mut copied = 0;
        let mut pos = offset as usize;

        while copied < buf.len() && pos < data.len() {
            let index = pos / XTS_SECTOR_SIZE;
            let start = index * XTS_SECTOR_SIZE;
            let within = pos - start;

            let stored = data.get(start..start + XTS_SECTOR_SIZE).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("XTS sector #{index} is truncated"),
                )
            })?;

            sector.copy_from_slice(stored);

            if index >= self.first_encrypted {
                self.cipher
                    .decrypt_sector(&mut sector, get_tweak_default(index as u128));
            }

            let n = min(XTS_SECTOR_SIZE - within, buf.len() - copied);
            let n = min(n, data.len() - pos);

            buf[copied..copied + n].copy_from_slice(&sector[within..within + n]);
            copied += n;
            pos += n;
        }

        Ok(copied)
    }

    fn len(&self) -> u64 {
        self.data.as_ref().len() as u64
    }
}
