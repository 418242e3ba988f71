// crates/manifold-server/src/main.rs
// Manifold - aggregating MCP proxy

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};
use manifold::ManifoldError;

#[tokio::main]
async fn main() {
    // Load .env from ~/.manifold/.env only (never from CWD — a malicious
    // directory could override embedding API keys)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".manifold/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    // stdout carries protocol frames when serving; all logging goes to
    // stderr. MANIFOLD_DEBUG=1 raises the level for diagnostics.
    let debug = std::env::var("MANIFOLD_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    let log_level = if debug {
        Level::DEBUG
    } else {
        match &cli.command {
            None | Some(Commands::Serve { .. }) => Level::WARN,
            Some(Commands::Validate { .. }) => Level::WARN,
            Some(Commands::Reindex { .. }) => Level::INFO,
        }
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let result = run(cli).await;

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("[manifold] {e:#}");
            // Fatal initialization problems (malformed profile, unusable
            // cache directory) exit 1; anything else unhandled exits 2.
            let code = match e.downcast_ref::<ManifoldError>() {
                Some(ManifoldError::Fatal(_)) | Some(ManifoldError::Config(_)) => 1,
                _ => 2,
            };
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        None => cli::serve::run("default").await,
        Some(Commands::Serve { profile }) => cli::serve::run(&profile).await,
        Some(Commands::Validate { profile }) => cli::validate::run(&profile),
        Some(Commands::Reindex { profile }) => cli::reindex::run(&profile).await,
    }
}
