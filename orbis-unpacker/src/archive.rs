//! Package archive capability and its PKG-backed implementation.

use memmap2::Mmap;
use orbis_pfs::directory::{DirEntry, Directory};
use orbis_pfs::image::Image;
use orbis_pfs::pfsc::PfscImage;
use orbis_pkg::Pkg;
use orbis_pkg::entry::PkgEntry;
use orbis_pkg::header::PkgHeader;
use orbis_pkg::keys::PkgKeys;
use snafu::{ResultExt, Snafu};
use std::borrow::Cow;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error type returned by reader capabilities.
///
/// Only its message (including the `source()` chain) is ever shown, see
/// [`reason()`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Renders an error and all of its sources as a single line.
#[must_use]
pub fn reason(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(e) = source {
        let text = e.to_string();
        // Some errors repeat their source in their own message.
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = e.source();
    }

    message
}

/// Opens package archives.
///
/// Every call returns a fresh, independent reader so a running extraction
/// never shares read state with metadata queries.
pub trait PackageSource: Send + Sync {
    type Reader: PackageReader;

    /// Opens the archive at `path`.
    fn open(&self, path: &Path) -> Result<Self::Reader, BoxError>;
}

/// An opened package archive.
pub trait PackageReader: Send {
    /// Returns the title ID (e.g. `CUSA03173`).
    fn title_id(&self) -> String;

    /// Returns the package flags as a list of names.
    fn flags(&self) -> String;

    /// Returns the embedded property list, if any.
    fn property_list(&self) -> Option<Vec<u8>>;

    /// Performs archive-level setup before any file is extracted.
    fn prepare_extraction(&mut self, destination: &Path) -> Result<(), BoxError>;

    /// Returns the number of files in the extractable file set.
    fn file_count(&self) -> usize;

    /// Extracts file `index` of the file set.
    ///
    /// [`PackageReader::prepare_extraction()`] must have succeeded first.
    fn extract_file(&mut self, index: usize) -> Result<(), BoxError>;
}

/// Errors from [`PkgSource`] and [`PkgReader`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PkgReaderError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to parse PKG"))]
    ParsePkg { source: orbis_pkg::OpenError },

    #[snafu(display("failed to read entry table"))]
    ReadEntry { source: orbis_pkg::EntryReadError },

    #[snafu(display("failed to open outer PFS"))]
    OpenOuterPfs { source: orbis_pfs::OpenError },

    #[snafu(display("failed to open inner PFS"))]
    OpenInnerPfs { source: orbis_pfs::OpenError },

    #[snafu(display("PFS has no {name}"))]
    MissingPfsEntry { name: &'static str },

    #[snafu(display("cannot open PFS directory '{path}'"))]
    OpenPfsDirectory {
        path: String,
        source: orbis_pfs::directory::OpenError,
    },

    #[snafu(display("cannot decompress '{path}'"))]
    OpenPfsc {
        path: String,
        source: orbis_pfs::pfsc::OpenError,
    },

    #[snafu(display("PFS file name '{path}' is not valid UTF-8"))]
    UnsupportedFileName { path: String },

    #[snafu(display("extraction was not prepared"))]
    NotPrepared,

    #[snafu(display("file #{index} is out of range"))]
    IndexOutOfRange { index: usize },

    #[snafu(display("failed to get data for entry 0x{id:08X}"))]
    EntryData {
        id: u32,
        source: orbis_pkg::EntryDataError,
    },

    #[snafu(display("cannot read '{}' from the PFS", path.display()))]
    ReadPfsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot create directory {}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write {}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Directory of the title that receives the package entries.
const SCE_SYS: &str = "sce_sys";

/// Chunk size when copying PFS files to disk.
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

type PfsDirectory = Directory<Box<dyn Image>>;
type PfsFile = orbis_pfs::file::File<Box<dyn Image>>;

/// Opens `.pkg` files from disk through a memory map.
///
/// Without [`PkgKeys`] only the plain entries are readable; encrypted
/// entries and the PFS image are skipped with a warning.
#[derive(Debug, Default, Clone)]
pub struct PkgSource {
    keys: Option<Arc<PkgKeys>>,
}

impl PkgSource {
    /// Creates a source that decrypts packages with `keys`.
    pub fn with_keys(keys: PkgKeys) -> Self {
        Self {
            keys: Some(Arc::new(keys)),
        }
    }
}

impl PackageSource for PkgSource {
    type Reader = PkgReader;

    fn open(&self, path: &Path) -> Result<PkgReader, BoxError> {
        Ok(PkgReader::open(path, self.keys.as_deref())?)
    }
}

/// A shared window into the package map.
///
/// The package and its PFS image read from the same map.
#[derive(Clone)]
struct MapSlice {
    map: Arc<Mmap>,
    range: Range<usize>,
}

impl AsRef<[u8]> for MapSlice {
    fn as_ref(&self) -> &[u8] {
        &self.map[self.range.clone()]
    }
}

/// Where the bytes of a file in the set come from.
enum FileSource {
    Entry(PkgEntry),
    Pfs(PfsFile),
}

struct PackageFile {
    /// Relative to the title directory.
    path: PathBuf,
    source: FileSource,
}

/// A PKG file opened for reading.
///
/// The file set lists the readable named entries, written to
/// `<destination>/<title id>/sce_sys/`, followed by the game files of the
/// PFS image, written to `<destination>/<title id>/`.
pub struct PkgReader {
    pkg: Pkg<MapSlice>,
    files: Vec<PackageFile>,
    /// PFS directories, parents first.
    dirs: Vec<PathBuf>,
    output: Option<PathBuf>,
}

impl std::fmt::Debug for PkgReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkgReader")
            .field("pkg", &self.pkg)
            .field("files", &self.files.len())
            .field("dirs", &self.dirs.len())
            .field("output", &self.output)
            .finish()
    }
}

impl PkgReader {
    /// Maps and parses the PKG at `path` and lists its files.
    ///
    /// With `keys`, encrypted entries are decrypted and the PFS image is
    /// opened.
    pub fn open(path: &Path, keys: Option<&PkgKeys>) -> Result<Self, PkgReaderError> {
        let file = File::open(path).context(OpenFileSnafu)?;
        // SAFETY: the map is read-only and lives as long as the reader. A
        // package truncated by another process while mapped is not supported.
        let map = Arc::new(unsafe { Mmap::map(&file).context(MmapFileSnafu)? });
        let whole = MapSlice {
            map: map.clone(),
            range: 0..map.len(),
        };

        let pkg = match keys {
            Some(keys) => Pkg::with_keys(whole, keys),
            None => Pkg::new(whole),
        }
        .context(ParsePkgSnafu)?;

        let mut files = Vec::new();
        let mut dirs = Vec::new();

        for result in pkg.entries() {
            let (num, entry) = result.context(ReadEntrySnafu)?;

            let Some(path) = entry.relative_path() else {
                debug!("skipping unnamed entry #{num} (id 0x{:08X})", entry.id());
                continue;
            };

            if !pkg.can_read(&entry) {
                warn!(
                    "skipping encrypted entry {}: no key for index {}",
                    path.display(),
                    entry.key_index()
                );
                continue;
            }

            files.push(PackageFile {
                path: Path::new(SCE_SYS).join(path),
                source: FileSource::Entry(entry),
            });
        }

        match pkg.pfs_image_range() {
            Some(range) => {
                let image = MapSlice { map, range };

                if let Some(uroot) = open_game_root(image, pkg.ekpfs())? {
                    collect_pfs_files(uroot, Path::new(""), &mut dirs, &mut files)?;
                }
            }
            None => debug!("package has no PFS image"),
        }

        Ok(Self {
            pkg,
            files,
            dirs,
            output: None,
        })
    }

    /// Returns the PKG header.
    pub fn header(&self) -> &PkgHeader {
        self.pkg.header()
    }

    /// Returns the paths of the extractable files relative to the title
    /// directory, in order.
    pub fn file_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|file| file.path.as_path())
    }
}

/// Opens the nested PFS and returns its `uroot`, the root of the game files.
///
/// Returns `None` if the image is encrypted and no EKPFS is available.
fn open_game_root(
    image: MapSlice,
    ekpfs: Option<&[u8]>,
) -> Result<Option<PfsDirectory>, PkgReaderError> {
    let outer = match orbis_pfs::open(image, ekpfs) {
        Ok(pfs) => pfs,
        Err(orbis_pfs::OpenError::MissingEkpfs) => {
            warn!("skipping PFS image: package keys are required to decrypt it");
            return Ok(None);
        }
        Err(source) => return Err(PkgReaderError::OpenOuterPfs { source }),
    };

    let mut root = outer
        .root()
        .open()
        .context(OpenPfsDirectorySnafu { path: "/" })?;

    let Some(DirEntry::Directory(uroot)) = root.remove(b"uroot") else {
        return MissingPfsEntrySnafu { name: "uroot" }.fail();
    };

    let mut uroot = uroot
        .open()
        .context(OpenPfsDirectorySnafu { path: "/uroot" })?;

    let Some(DirEntry::File(inner)) = uroot.remove(b"pfs_image.dat") else {
        return MissingPfsEntrySnafu {
            name: "uroot/pfs_image.dat",
        }
        .fail();
    };

    let inner = contents(inner).context(OpenPfscSnafu {
        path: "/uroot/pfs_image.dat",
    })?;
    let inner = orbis_pfs::open_image(inner).context(OpenInnerPfsSnafu)?;

    let mut root = inner
        .root()
        .open()
        .context(OpenPfsDirectorySnafu { path: "pfs_image.dat:/" })?;

    match root.remove(b"uroot") {
        Some(DirEntry::Directory(uroot)) => Ok(Some(uroot)),
        _ => MissingPfsEntrySnafu {
            name: "pfs_image.dat:/uroot",
        }
        .fail(),
    }
}

/// Returns the contents of `file`, inflating PFSC compressed files.
fn contents(file: PfsFile) -> Result<Box<dyn Image>, orbis_pfs::pfsc::OpenError> {
    let compressed = file.is_compressed();
    let image = file.into_image();

    let contents: Box<dyn Image> = if compressed {
        Box::new(PfscImage::open(image)?)
    } else {
        Box::new(image)
    };

    Ok(contents)
}

/// Appends the files below `dir` to `files` in name order, depth first.
fn collect_pfs_files(
    dir: PfsDirectory,
    relative: &Path,
    dirs: &mut Vec<PathBuf>,
    files: &mut Vec<PackageFile>,
) -> Result<(), PkgReaderError> {
    let items = dir.open().context(OpenPfsDirectorySnafu {
        path: format!("/{}", relative.display()),
    })?;

    for (name, item) in items {
        let name = String::from_utf8(name).map_err(|e| PkgReaderError::UnsupportedFileName {
            path: relative
                .join(&*String::from_utf8_lossy(e.as_bytes()))
                .display()
                .to_string(),
        })?;

        let path = relative.join(name);

        match item {
            DirEntry::Directory(subdir) => {
                dirs.push(path.clone());
                collect_pfs_files(subdir, &path, dirs, files)?;
            }
            DirEntry::File(file) => files.push(PackageFile {
                path,
                source: FileSource::Pfs(file),
            }),
        }
    }

    Ok(())
}

/// Copies a PFS file to `destination`.
fn write_pfs_file(file: &PfsFile, path: &Path, destination: &Path) -> Result<(), PkgReaderError> {
    let image = contents(file.clone()).context(OpenPfscSnafu {
        path: path.display().to_string(),
    })?;

    let mut out = File::create(destination).context(WriteFileSnafu { path: destination })?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut offset = 0u64;

    loop {
        let read = match image.read_at(offset, &mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(PkgReaderError::ReadPfsFile {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        out.write_all(&buffer[..read])
            .context(WriteFileSnafu { path: destination })?;

        offset += read as u64;
    }

    Ok(())
}

impl PackageReader for PkgReader {
    fn title_id(&self) -> String {
        self.pkg.header().content_id().title_id().to_owned()
    }

    fn flags(&self) -> String {
        self.pkg.header().content_flags().names().collect::<Vec<_>>().join(", ")
    }

    fn property_list(&self) -> Option<Vec<u8>> {
        self.pkg.param_sfo().map(Cow::into_owned)
    }

    fn prepare_extraction(&mut self, destination: &Path) -> Result<(), BoxError> {
        let output = destination.join(self.title_id());

        let dirs = self.dirs.iter().map(PathBuf::as_path);

        for dir in std::iter::once(Path::new(SCE_SYS)).chain(dirs) {
            let path = output.join(dir);
            create_dir_all(&path).context(CreateDirectorySnafu { path: &path })?;
        }

        self.output = Some(output);

        Ok(())
    }

    fn file_count(&self) -> usize {
        self.files.len()
    }

    fn extract_file(&mut self, index: usize) -> Result<(), BoxError> {
        let output = self.output.as_ref().ok_or(PkgReaderError::NotPrepared)?;
        let file = self
            .files
            .get(index)
            .ok_or(PkgReaderError::IndexOutOfRange { index })?;

        let path = output.join(&file.path);

        if let Some(parent) = path.parent() {
            create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
        }

        match &file.source {
            FileSource::Entry(entry) => {
                let data = self
                    .pkg
                    .entry_data(entry)
                    .context(EntryDataSnafu { id: entry.id() })?;

                std::fs::write(&path, data).context(WriteFileSnafu { path: &path })?;
            }
            FileSource::Pfs(pfs_file) => write_pfs_file(pfs_file, &file.path, &path)?,
        }

        Ok(())
    }
}
