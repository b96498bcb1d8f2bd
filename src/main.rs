//! Payment-intake service entrypoint.
//!
//! Launches the HTTP server (webhook ingress, health), the polling
//! fallback, the sweep re-drive, and pool maintenance. Configuration comes
//! from the environment; see the `config` module for the recognized
//! options.

use clap::Parser;
use std::path::PathBuf;

/// Stablecoin off-ramp payment-intake service.
#[derive(Parser, Debug)]
#[command(name = "rampline")]
#[command(version, about)]
struct CliArgs {
    /// Env file loaded before configuration is read.
    #[arg(long, short, env = "ENV_FILE", default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if args.env_file.exists() {
        dotenvy::from_path(&args.env_file).ok();
    }
    if let Err(error) = rampline::runtime::run().await {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
}
