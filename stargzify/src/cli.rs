use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "stargzify",
    about = "Convert tar layers into seekable stargz archives.",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(visible_alias = "c", about = "Convert a tar or tar.gz into a stargz archive")]
    Create(CreateArgs),

    #[command(visible_aliases = ["l", "ls"], about = "List the table of contents of an archive")]
    List(ListArgs),
}

#[derive(Debug, clap::Args)]
pub struct CreateArgs {
    /// Input tar, plain or gzip-compressed. `-` reads standard input.
    pub input: PathBuf,

    /// Output archive path
    pub output: PathBuf,

    /// Largest uncompressed chunk, in bytes
    #[arg(long, default_value_t = stargz::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    /// Archive to list
    pub archive: PathBuf,

    /// Include chunk entries and offsets
    #[arg(short, long)]
    pub long: bool,

    /// Print the table of contents as JSON
    #[arg(long)]
    pub json: bool,
}
