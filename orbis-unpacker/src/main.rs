mod cli;

use clap::Parser;
use cli::{Cli, Command, KeyArgs};
use orbis_pkg::keys::{KeyError, PkgKeys};
use orbis_unpacker::archive::{PkgReader, PkgReaderError};
use orbis_unpacker::{
    ConflictVerdict, ConsoleEvents, PkgSource, SfoReader, SilentEvents, Status, UnpackEvents,
    Unpacker,
};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Top-level application errors for orbis-unpacker.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to load package keys"))]
    LoadKeys { source: KeyError },

    #[snafu(display("failed to open PKG file '{}'", path.display()))]
    OpenPkg {
        path: PathBuf,
        source: orbis_unpacker::OpenError,
    },

    #[snafu(display("failed to read PKG file '{}'", path.display()))]
    ReadPkg {
        path: PathBuf,
        source: PkgReaderError,
    },

    #[snafu(display("{verdict}; pass --force to extract anyway"))]
    Conflict { verdict: ConflictVerdict },

    #[snafu(display("extraction did not start"))]
    NotStarted,

    #[snafu(display("{message}"))]
    Extract { message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let keys = load_keys(&cli.keys)?;

    match cli.command {
        Command::Extract {
            pkg_path,
            destination,
            delete_source,
            force,
            quiet,
        } => {
            if quiet {
                cmd_extract(
                    unpacker(keys, SilentEvents),
                    &pkg_path,
                    &destination,
                    delete_source,
                    force,
                )
            } else {
                cmd_extract(
                    unpacker(keys, ConsoleEvents::new()),
                    &pkg_path,
                    &destination,
                    delete_source,
                    force,
                )
            }
        }
        Command::Info { pkg_path } => cmd_info(keys, &pkg_path),
        Command::Check {
            pkg_path,
            destination,
        } => cmd_check(unpacker(keys, SilentEvents), &pkg_path, &destination),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_keys(args: &KeyArgs) -> Result<Option<PkgKeys>> {
    match (&args.entry_key, &args.pfs_key) {
        (Some(entry_key), Some(pfs_key)) => {
            let keys = PkgKeys::load(entry_key, pfs_key).context(LoadKeysSnafu)?;
            Ok(Some(keys))
        }
        _ => Ok(None),
    }
}

fn unpacker<E: UnpackEvents + 'static>(
    keys: Option<PkgKeys>,
    events: E,
) -> Unpacker<PkgSource, SfoReader, E> {
    match keys {
        Some(keys) => Unpacker::with_keys(keys, events),
        None => Unpacker::new(events),
    }
}

fn cmd_extract<E: UnpackEvents + 'static>(
    unpacker: Unpacker<PkgSource, SfoReader, E>,
    path: &Path,
    destination: &Path,
    delete_source: bool,
    force: bool,
) -> Result<()> {
    unpacker.open(path).context(OpenPkgSnafu { path })?;

    let verdict = unpacker.check_patch_status(destination);

    if verdict.needs_confirmation() {
        if !force {
            return ConflictSnafu { verdict }.fail();
        }

        eprintln!("warning: {verdict}");
    }

    let start = std::time::Instant::now();

    if !unpacker.extract(destination, delete_source) {
        return NotStartedSnafu.fail();
    }

    let state = unpacker.wait();

    if state.status != Status::Succeeded {
        return ExtractSnafu {
            message: state.message,
        }
        .fail();
    }

    println!("Done in {:.2}s.", start.elapsed().as_secs_f64());

    Ok(())
}

fn cmd_info(keys: Option<PkgKeys>, path: &Path) -> Result<()> {
    use orbis_pkg::header::content_type_name;

    let decrypting = keys.is_some();
    let reader = PkgReader::open(path, keys.as_ref()).context(ReadPkgSnafu { path })?;
    let header = reader.header();
    let unpacker = unpacker(keys, SilentEvents);
    let identity = unpacker.open(path).context(OpenPkgSnafu { path })?;

    println!("PKG: {}", path.display());
    println!();
    println!("Title:          {}", identity.title);
    println!("Title ID:       {}", identity.title_id);
    println!("Version:        {}", identity.version);
    println!("Patch:          {}", if identity.is_patch { "yes" } else { "no" });
    println!("Content ID:     {}", header.content_id());
    println!(
        "Content Type:   0x{:02X} ({})",
        header.content_type(),
        content_type_name(header.content_type())
    );
    println!("Content Flags:  {}", header.content_flags());
    println!("Entry Count:    {}", header.entry_count());
    println!("PFS Image:      {} bytes", header.pfs_size());
    println!("Decryption:     {}", if decrypting { "keys loaded" } else { "no keys" });
    println!();
    println!("Extractable files:");

    for file in reader.file_paths() {
        println!("  {}", file.display());
    }

    Ok(())
}

fn cmd_check(
    unpacker: Unpacker<PkgSource, SfoReader, SilentEvents>,
    path: &Path,
    destination: &Path,
) -> Result<()> {
    unpacker.open(path).context(OpenPkgSnafu { path })?;

    let verdict = unpacker.check_patch_status(destination);

    println!("{verdict}");

    if let Some(versions) = verdict.versions() {
        println!("  package:   {}", versions.package);
        println!("  installed: {}", versions.installed);
    }

    Ok(())
}
