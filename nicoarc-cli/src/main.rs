mod cli;
mod commands;
mod config;
mod error;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::config::AppConfig;
use crate::error::Result;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Serve => commands::serve(&config).await,
        Commands::List { url } => commands::list(&config, &url).await,
        Commands::Download {
            url,
            format,
            output,
        } => commands::download(&config, &url, &format, output).await,
    }
}
