use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "orbis-unpacker")]
#[command(about = "PS4 PKG unpacker", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub keys: KeyArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// RSA keys that decrypt encrypted entries and the PFS image.
#[derive(Debug, Args)]
pub struct KeyArgs {
    /// PEM file with the key that unwraps entry key 3
    #[arg(long, value_name = "PEM", global = true, requires = "pfs_key")]
    pub entry_key: Option<PathBuf>,

    /// PEM file with the key that unwraps the PFS image key
    #[arg(long, value_name = "PEM", global = true, requires = "entry_key")]
    pub pfs_key: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Extract a PKG file into a games directory
    Extract {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,

        /// Games directory; the package goes to <DIR>/<title id>
        #[arg(value_name = "DIR")]
        destination: PathBuf,

        /// Delete the PKG file after a successful extraction
        #[arg(short, long)]
        delete_source: bool,

        /// Extract even if the same or a newer version is installed
        #[arg(short, long)]
        force: bool,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a PKG file
    Info {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,
    },

    /// Compare a patch against the title installed in a games directory
    Check {
        /// Path to the PKG file
        #[arg(value_name = "PKG_FILE")]
        pkg_path: PathBuf,

        /// Games directory
        #[arg(value_name = "DIR")]
        destination: PathBuf,
    },
}
