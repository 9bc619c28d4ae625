//! Profile Memory CLI Entry Point
//!
//! Ingests documents into a local store and queries them. Results are
//! printed as JSON on stdout; logs go to stderr.

use clap::Parser;
use profile_memory_cli::commands::{self, Command};
use profile_memory_cli::memory::{self, ProviderKind, StoreOptions};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "profile-memory")]
#[command(about = "Per-user retrieval memory for agents")]
#[command(version)]
struct Args {
    /// Directory holding the index
    #[arg(long, global = true, env = "PROFILE_MEMORY_DATA_DIR", default_value = ".profile-memory")]
    data_dir: PathBuf,

    /// JSON configuration file
    #[arg(long, global = true, env = "PROFILE_MEMORY_CONFIG")]
    config: Option<PathBuf>,

    /// Embedding provider
    #[arg(long, global = true, value_enum, default_value_t = ProviderKind::Local)]
    provider: ProviderKind,

    /// Override the provider's vector dimension
    #[arg(long, global = true)]
    dimension: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "profile_memory=info,profile_memory_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = StoreOptions {
        data_dir: args.data_dir,
        config: args.config,
        provider: args.provider,
        dimension: args.dimension,
    };

    if let Err(e) = run(&options, args.command).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(options: &StoreOptions, command: Command) -> anyhow::Result<()> {
    let memory = memory::open(options)?;
    let output = commands::run(&memory, command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
