#![allow(dead_code)]

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyInit, KeyIvInit};
use crossbeam_channel::{Receiver, Sender};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use hmac::{Hmac, Mac};
use orbis_pkg::entry::ids;
use orbis_pkg::keys::PkgKeys;
use orbis_unpacker::{
    BoxError, ChannelEvents, PackageReader, PackageSource, PropertyList, PropertyListReader,
    UnpackEvent, Unpacker,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use xts_mode::{Xts128, get_tweak_default};

/// Blocks the fake reader at a chosen point until the test releases it.
#[derive(Clone)]
pub struct Gate {
    /// `None` blocks in `prepare_extraction`, `Some(i)` before writing file `i`.
    at: Option<usize>,
    entered: Sender<()>,
    release: Receiver<()>,
}

/// The test's side of a [`Gate`].
pub struct GateHandle {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl GateHandle {
    /// Waits until the worker reaches the gate.
    pub fn wait_entered(&self) {
        self.entered.recv().unwrap();
    }

    /// Lets the worker continue.
    pub fn release(&self) {
        self.release.send(()).unwrap();
    }
}

pub fn gate(at: Option<usize>) -> (Gate, GateHandle) {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();

    (
        Gate {
            at,
            entered: entered_tx,
            release: release_rx,
        },
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

impl Gate {
    fn pass(&self, at: Option<usize>) {
        if self.at == at {
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
        }
    }
}

/// An archive source producing `files` entries named `file_<i>.bin`.
#[derive(Clone)]
pub struct FakeSource {
    pub files: usize,
    pub title_id: String,
    pub flags: String,
    pub property_list: Option<Vec<u8>>,
    pub fail_prepare: bool,
    pub fail_at: Option<usize>,
    pub gate: Option<Gate>,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            files: 3,
            title_id: "CUSA00001".to_owned(),
            flags: "PLAYGO".to_owned(),
            property_list: Some(b"TITLE=Fake Game\nAPP_VER=01.00\n".to_vec()),
            fail_prepare: false,
            fail_at: None,
            gate: None,
        }
    }
}

pub struct FakeReader {
    config: FakeSource,
    output: Option<PathBuf>,
}

impl PackageSource for FakeSource {
    type Reader = FakeReader;

    fn open(&self, path: &Path) -> Result<FakeReader, BoxError> {
        if !path.is_file() {
            return Err(format!("cannot open {}: no such package", path.display()).into());
        }

        Ok(FakeReader {
            config: self.clone(),
            output: None,
        })
    }
}

impl PackageReader for FakeReader {
    fn title_id(&self) -> String {
        self.config.title_id.clone()
    }

    fn flags(&self) -> String {
        self.config.flags.clone()
    }

    fn property_list(&self) -> Option<Vec<u8>> {
        self.config.property_list.clone()
    }

    fn prepare_extraction(&mut self, destination: &Path) -> Result<(), BoxError> {
        if let Some(gate) = &self.config.gate {
            gate.pass(None);
        }

        if self.config.fail_prepare {
            return Err("destination is read-only".into());
        }

        std::fs::create_dir_all(destination)?;
        self.output = Some(destination.to_path_buf());
        Ok(())
    }

    fn file_count(&self) -> usize {
        self.config.files
    }

    fn extract_file(&mut self, index: usize) -> Result<(), BoxError> {
        if let Some(gate) = &self.config.gate {
            gate.pass(Some(index));
        }

        if self.config.fail_at == Some(index) {
            return Err("corrupt entry".into());
        }

        let output = self.output.as_ref().ok_or("not prepared")?;
        std::fs::write(output.join(file_name(index)), format!("file {index}"))?;
        Ok(())
    }
}

pub fn file_name(index: usize) -> String {
    format!("file_{index}.bin")
}

/// A `KEY=VALUE` per line property list.
pub struct FakeList(HashMap<String, Vec<u8>>);

impl PropertyList for FakeList {
    fn get_string(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }
}

pub struct FakePlist;

impl PropertyListReader for FakePlist {
    type List = FakeList;

    fn parse(&self, data: &[u8]) -> Result<FakeList, BoxError> {
        let text = std::str::from_utf8(data)?;
        let mut values = HashMap::new();

        for line in text.lines().filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("malformed line '{line}'"))?;
            values.insert(key.to_owned(), value.as_bytes().to_vec());
        }

        Ok(FakeList(values))
    }
}

pub type FakeUnpacker = Unpacker<FakeSource, FakePlist, ChannelEvents>;

pub fn unpacker(source: FakeSource) -> (FakeUnpacker, Receiver<UnpackEvent>) {
    let (events, receiver) = ChannelEvents::new();
    (Unpacker::with_readers(source, FakePlist, events), receiver)
}

/// Creates an (empty) package file in `dir`.
pub fn package_file(dir: &Path) -> PathBuf {
    let path = dir.join("game.pkg");
    std::fs::write(&path, b"").unwrap();
    path
}

pub fn drain(receiver: &Receiver<UnpackEvent>) -> Vec<UnpackEvent> {
    receiver.try_iter().collect()
}

pub fn progress(events: &[UnpackEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            UnpackEvent::ProgressChanged(p) => Some(*p),
            _ => None,
        })
        .collect()
}

pub fn statuses(events: &[UnpackEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            UnpackEvent::StatusChanged(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

/// Builds a `param.sfo` image holding UTF-8 string values.
pub fn build_sfo(values: &[(&str, &str)]) -> Vec<u8> {
    let index_end = 20 + values.len() * 16;
    let mut index = Vec::new();
    let mut keys = Vec::new();
    let mut data = Vec::new();

    for (key, value) in values {
        let len = value.len() as u32 + 1;
        index.extend_from_slice(&(keys.len() as u16).to_le_bytes());
        index.extend_from_slice(&0x0204u16.to_le_bytes());
        index.extend_from_slice(&len.to_le_bytes());
        index.extend_from_slice(&len.to_le_bytes());
        index.extend_from_slice(&(data.len() as u32).to_le_bytes());
        keys.extend_from_slice(key.as_bytes());
        keys.push(0);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"\0PSF");
    out.extend_from_slice(&0x0101u32.to_le_bytes());
    out.extend_from_slice(&(index_end as u32).to_le_bytes());
    out.extend_from_slice(&((index_end + keys.len()) as u32).to_le_bytes());
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    out.extend_from_slice(&index);
    out.extend_from_slice(&keys);
    out.extend_from_slice(&data);
    out
}

pub const ENTRY_KEY3: [u8; 32] = [0x33; 32];
pub const EKPFS: [u8; 32] = [0xEF; 32];

const ENTRY_KEY3_PEM: &str = include_str!("../data/entry_key3.pem");
const PFS_IMAGE_KEY_PEM: &str = include_str!("../data/pfs_image_key.pem");

/// The keys matching [`key_entries()`].
pub fn test_keys() -> PkgKeys {
    PkgKeys::from_pem(ENTRY_KEY3_PEM, PFS_IMAGE_KEY_PEM).unwrap()
}

fn wrap(key: &RsaPrivateKey, secret: &[u8]) -> Vec<u8> {
    RsaPublicKey::from(key)
        .encrypt(&mut rsa::rand_core::OsRng, Pkcs1v15Encrypt, secret)
        .unwrap()
}

/// The entry keys and PFS image key entries, wrapping [`ENTRY_KEY3`] and
/// [`EKPFS`] for [`test_keys()`].
pub fn key_entries() -> [PkgEntrySpec; 2] {
    let entry_key = RsaPrivateKey::from_pkcs1_pem(ENTRY_KEY3_PEM).unwrap();
    let pfs_key = RsaPrivateKey::from_pkcs8_pem(PFS_IMAGE_KEY_PEM).unwrap();

    // Seed and digests, then seven key slots.
    let mut entry_keys = vec![0u8; 32 + 7 * 32];
    for slot in 0..7 {
        match slot {
            3 => entry_keys.extend(wrap(&entry_key, &ENTRY_KEY3)),
            _ => entry_keys.extend([0u8; 256]),
        }
    }

    [
        PkgEntrySpec::plain(ids::ENTRY_KEYS, entry_keys),
        PkgEntrySpec::encrypted(ids::PFS_IMAGE_KEY, wrap(&pfs_key, &EKPFS)),
    ]
}

/// An entry of a synthetic PKG.
pub struct PkgEntrySpec {
    pub id: u32,
    pub encrypted: bool,
    pub data: Vec<u8>,
}

impl PkgEntrySpec {
    pub fn plain(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            encrypted: false,
            data: data.into(),
        }
    }

    /// An entry encrypted with key index 3 under [`ENTRY_KEY3`].
    pub fn encrypted(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            encrypted: true,
            data: data.into(),
        }
    }
}

/// Encrypts `data` with the key derived from its table `record`.
fn encrypt_entry(record: &[u8], data: &[u8]) -> Vec<u8> {
    let secret = Sha256::new()
        .chain_update(record)
        .chain_update(ENTRY_KEY3)
        .finalize();
    let mut encryptor = cbc::Encryptor::<Aes128>::new(
        GenericArray::from_slice(&secret[16..]),
        GenericArray::from_slice(&secret[..16]),
    );

    let mut out = data.to_vec();
    out.resize(data.len().next_multiple_of(16), 0);

    for block in out.chunks_exact_mut(16) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    out
}

/// Builds a PKG with the given content ID, content flags and entries,
/// followed by `pfs` as its PFS image.
pub fn build_pkg(
    content_id: &str,
    flags: u32,
    entries: &[PkgEntrySpec],
    pfs: Option<&[u8]>,
) -> Vec<u8> {
    const HEADER_SIZE: usize = 0x1000;
    const ENTRY_SIZE: usize = 32;

    let mut raw = vec![0u8; HEADER_SIZE + entries.len() * ENTRY_SIZE];
    raw[0..4].copy_from_slice(&0x7F434E54u32.to_be_bytes());
    raw[0x10..0x14].copy_from_slice(&(entries.len() as u32).to_be_bytes());
    raw[0x18..0x1C].copy_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
    raw[0x40..0x40 + content_id.len()].copy_from_slice(content_id.as_bytes());
    raw[0x78..0x7C].copy_from_slice(&flags.to_be_bytes());

    for (num, entry) in entries.iter().enumerate() {
        let at = HEADER_SIZE + num * ENTRY_SIZE;
        let offset = raw.len() as u32;
        let (flags1, flags2) = if entry.encrypted {
            (0x80000000u32, 0x3000u32)
        } else {
            (0, 0)
        };

        raw[at..at + 4].copy_from_slice(&entry.id.to_be_bytes());
        raw[at + 8..at + 12].copy_from_slice(&flags1.to_be_bytes());
        raw[at + 12..at + 16].copy_from_slice(&flags2.to_be_bytes());
        raw[at + 16..at + 20].copy_from_slice(&offset.to_be_bytes());
        raw[at + 20..at + 24].copy_from_slice(&(entry.data.len() as u32).to_be_bytes());

        if entry.encrypted {
            let stored = encrypt_entry(&raw[at..at + ENTRY_SIZE], &entry.data);
            raw.extend_from_slice(&stored);
        } else {
            raw.extend_from_slice(&entry.data);
        }
    }

    if let Some(pfs) = pfs {
        raw.resize(raw.len().next_multiple_of(0x1000), 0);

        let offset = raw.len() as u64;
        raw[0x410..0x418].copy_from_slice(&offset.to_be_bytes());
        raw[0x418..0x420].copy_from_slice(&(pfs.len() as u64).to_be_bytes());
        raw.extend_from_slice(pfs);
    }

    raw
}

/// A node of a synthetic PFS.
pub enum PfsNode {
    File(Vec<u8>),
    /// A file stored as a PFSC stream.
    Compressed(Vec<u8>),
    Dir(Vec<(&'static str, PfsNode)>),
}

const PFS_BLOCK: usize = 0x1000;
const PFS_INODE_SIZE: usize = 168;
const PFS_SEED: [u8; 16] = [0x5E; 16];

/// An inode to be written: mode, flags, logical size and stored bytes.
struct PfsInode {
    mode: u16,
    flags: u32,
    size: u64,
    stored: Vec<u8>,
}

fn dirent(inode: usize, ty: u32, name: &str) -> Vec<u8> {
    let size = (16 + name.len()).next_multiple_of(8);
    let mut out = Vec::with_capacity(size);

    for value in [inode as u32, ty, name.len() as u32, size as u32] {
        out.extend_from_slice(&value.to_le_bytes());
    }

    out.extend_from_slice(name.as_bytes());
    out.resize(size, 0);
    out
}

/// Packs `data` into a PFSC stream with zlib-compressed blocks.
fn pfsc(data: &[u8]) -> Vec<u8> {
    let blocks: Vec<Vec<u8>> = data
        .chunks(PFS_BLOCK)
        .map(|chunk| {
            let mut padded = chunk.to_vec();
            padded.resize(PFS_BLOCK, 0);

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&padded).unwrap();
            encoder.finish().unwrap()
        })
        .collect();

    let mut out = vec![0u8; 0x30];
    out[0..4].copy_from_slice(b"PFSC");
    out[0x10..0x18].copy_from_slice(&(PFS_BLOCK as u64).to_le_bytes());
    out[0x18..0x20].copy_from_slice(&0x30u64.to_le_bytes());
    out[0x28..0x30].copy_from_slice(&(data.len() as u64).to_le_bytes());

    let mut offset = (0x30 + (blocks.len() + 1) * 8) as u64;
    for block in &blocks {
        out.extend_from_slice(&offset.to_le_bytes());
        offset += block.len() as u64;
    }

    out.extend_from_slice(&offset.to_le_bytes());
    blocks.iter().for_each(|b| out.extend_from_slice(b));
    out
}

fn flatten(node: &PfsNode, parent: usize, inodes: &mut Vec<PfsInode>) -> usize {
    let index = inodes.len();
    inodes.push(PfsInode {
        mode: 0x8000,
        flags: 0,
        size: 0,
        stored: Vec::new(),
    });

    let inode = match node {
        PfsNode::File(data) => PfsInode {
            mode: 0x8000,
            flags: 0,
            size: data.len() as u64,
            stored: data.clone(),
        },
        PfsNode::Compressed(data) => PfsInode {
            mode: 0x8000,
            flags: 0x1,
            size: data.len() as u64,
            stored: pfsc(data),
        },
        PfsNode::Dir(children) => {
            let mut data = dirent(index, 4, ".");
            data.extend(dirent(parent, 5, ".."));

            for (name, child) in children {
                let child_index = flatten(child, index, inodes);
                let ty = if matches!(child, PfsNode::Dir(_)) { 3 } else { 2 };
                data.extend(dirent(child_index, ty, name));
            }

            PfsInode {
                mode: 0x4000,
                flags: 0,
                size: data.len() as u64,
                stored: data,
            }
        }
    };

    inodes[index] = inode;
    index
}

/// Builds an unsigned PFS rooted at `root`, XTS-encrypted under `ekpfs` if
/// given.
pub fn build_pfs(root: &PfsNode, ekpfs: Option<&[u8]>) -> Vec<u8> {
    let mut inodes = Vec::new();
    flatten(root, 0, &mut inodes);

    let inode_blocks = (inodes.len() * PFS_INODE_SIZE).div_ceil(PFS_BLOCK);
    let mut image = vec![0u8; (1 + inode_blocks) * PFS_BLOCK];
    let mut table = Vec::new();

    for inode in &inodes {
        let start = image.len() / PFS_BLOCK;
        let blocks = inode.stored.len().div_ceil(PFS_BLOCK).max(1);

        image.extend_from_slice(&inode.stored);
        image.resize((start + blocks) * PFS_BLOCK, 0);

        let mut record = vec![0u8; 100];
        record[0x00..0x02].copy_from_slice(&inode.mode.to_le_bytes());
        record[0x04..0x08].copy_from_slice(&inode.flags.to_le_bytes());
        record[0x08..0x10].copy_from_slice(&inode.size.to_le_bytes());
        record[0x10..0x18].copy_from_slice(&(inode.stored.len() as u64).to_le_bytes());
        record[0x60..0x64].copy_from_slice(&(blocks as u32).to_le_bytes());

        // Consecutive blocks: direct[0] is the first, direct[1] the marker.
        let mut pointers = [0u32; 17];
        pointers[0] = start as u32;
        if blocks > 1 {
            pointers[1] = 0xffffffff;
        }

        pointers.iter().for_each(|p| record.extend_from_slice(&p.to_le_bytes()));
        table.extend(record);
    }

    let mode: u16 = if ekpfs.is_some() { 0x4 } else { 0 };

    image[PFS_BLOCK..PFS_BLOCK + table.len()].copy_from_slice(&table);
    image[0x00..0x08].copy_from_slice(&1u64.to_le_bytes());
    image[0x08..0x10].copy_from_slice(&20130315u64.to_le_bytes());
    image[0x1C..0x1E].copy_from_slice(&mode.to_le_bytes());
    image[0x20..0x24].copy_from_slice(&(PFS_BLOCK as u32).to_le_bytes());
    image[0x30..0x38].copy_from_slice(&(inodes.len() as u64).to_le_bytes());
    image[0x40..0x48].copy_from_slice(&(inode_blocks as u64).to_le_bytes());
    image[0x370..0x380].copy_from_slice(&PFS_SEED);

    if let Some(ekpfs) = ekpfs {
        let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(ekpfs).unwrap();
        hmac.update(&1u32.to_le_bytes());
        hmac.update(&PFS_SEED);
        let secret = hmac.finalize().into_bytes();

        let cipher = Xts128::new(
            Aes128::new(GenericArray::from_slice(&secret[16..])),
            Aes128::new(GenericArray::from_slice(&secret[..16])),
        );

        // The superblock sector stays in the clear.
        for (index, sector) in image.chunks_mut(PFS_BLOCK).enumerate().skip(1) {
            cipher.encrypt_sector(sector, get_tweak_default(index as u128));
        }
    }

    image
}

/// Builds the two-level PFS of a package: an outer image encrypted under
/// [`EKPFS`] whose `uroot/pfs_image.dat` holds an inner image with `game`
/// as its `uroot`.
pub fn build_game_pfs(game: PfsNode) -> Vec<u8> {
    let inner = build_pfs(&PfsNode::Dir(vec![("uroot", game)]), None);

    build_pfs(
        &PfsNode::Dir(vec![(
            "uroot",
            PfsNode::Dir(vec![("pfs_image.dat", PfsNode::Compressed(inner))]),
        )]),
        Some(&EKPFS),
    )
}
