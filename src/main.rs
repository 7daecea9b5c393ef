//! updelta CLI: publish self-update artifacts for a binary.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "updelta")]
#[command(author, version, about = "Publish content-addressed self-update artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the update tree for a freshly compiled binary
    Generate(cmd::generate::GenerateArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Generate(args) => cmd::generate::run(args),
    }
}
