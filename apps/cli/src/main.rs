//! subst CLI: resolve `(( path ))` substitutions in rendered manifests.
//!
//! Reads a manifest tree, merges its substitution files (decrypting sealed
//! ones), and prints the substituted manifests as a YAML stream.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
