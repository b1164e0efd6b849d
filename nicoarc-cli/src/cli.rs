use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "nicoarc", about = "Durable nicovideo archiving pipeline", version)]
pub struct Args {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More logging (debug level).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Less logging (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the worker loops against the configured Redis store.
    Serve,

    /// List available formats for a watch URL.
    List {
        /// Watch URL.
        url: String,
    },

    /// Download one video in the foreground.
    Download {
        /// Watch URL.
        url: String,

        /// Format selector: `max`, a size like `500M` (`!` forces the
        /// smallest when nothing fits), or an explicit `vID--aID` pair.
        #[arg(short, long, default_value = "max")]
        format: String,

        /// Output directory; defaults to the configured save dir.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
