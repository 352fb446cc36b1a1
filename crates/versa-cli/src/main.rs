//! Versa CLI - headless tools for the Versa player core
//!
//! Features:
//! - Engine error code classification
//! - Content key delivery checks against a real license server
//! - Scripted playback against the simulated engine

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use versa_core::PlayerConfig;

mod commands;
mod output;

/// Versa CLI - playback core toolkit
#[derive(Parser)]
#[command(name = "versa-cli")]
#[command(author = "Quasar Studio")]
#[command(version)]
#[command(about = "Key delivery checks, error classification and scripted playback", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Player configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify engine error codes
    Classify {
        /// Underlying engine error codes
        #[arg(allow_negative_numbers = true)]
        codes: Vec<i64>,

        /// List every known code
        #[arg(short, long)]
        all: bool,
    },

    /// Fetch a content key from a license server
    ResolveKey {
        /// Content identifier sent with the key request
        content_id: String,

        /// Application certificate (URL or local path)
        #[arg(long)]
        certificate: String,

        /// License server endpoint
        #[arg(long)]
        license_server: String,

        /// Extra license request header as KEY=VALUE (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Key URL reported by the engine (defaults to skd://<content-id>)
        #[arg(long)]
        key_url: Option<String>,
    },

    /// Run a scripted playback session on the simulated engine
    Simulate {
        /// Item duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Stall for one tick at this second
        #[arg(long)]
        stall_at: Option<u64>,

        /// Fail the item with this underlying code halfway through
        #[arg(long, allow_negative_numbers = true)]
        fail_code: Option<i64>,

        /// Seek to this second after the first tick
        #[arg(long)]
        seek_to: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .init();

    versa_core::init();

    let config = match &cli.config {
        Some(path) => PlayerConfig::from_json_file(path)?,
        None => PlayerConfig::default(),
    };

    match cli.command {
        Commands::Classify { codes, all } => {
            commands::classify(&codes, all, &cli.format)?;
        }
        Commands::ResolveKey { content_id, certificate, license_server, headers, key_url } => {
            let request = commands::KeyCheck {
                content_id,
                certificate,
                license_server,
                headers,
                key_url,
            };
            commands::resolve_key(request, config, &cli.format).await?;
        }
        Commands::Simulate { duration, stall_at, fail_code, seek_to } => {
            let script = commands::Script {
                duration,
                stall_at,
                fail_code,
                seek_to,
            };
            commands::simulate(script, config, &cli.format).await?;
        }
    }

    Ok(())
}
