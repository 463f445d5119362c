//! Turnix server binary: CLI parsing, engine boot, HTTP/WS serving.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use turnix_core::engine::{build_roots, DEFAULT_APP_SELECTOR};
use turnix_core::{Engine, Settings};

mod server;

#[derive(Parser, Debug)]
#[command(name = "turnix", about = "An extensible engine hosting interactive AI-driven applications", version)]
struct Cli {
    /// Port for the HTTP/WebSocket server
    #[arg(long, short)]
    port: Option<u16>,

    /// Extra content root (created with all subdirectories if missing)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Force this exact directory for userdata writes
    #[arg(long)]
    userdata: Option<PathBuf>,

    /// Force this exact directory for save writes
    #[arg(long)]
    saves: Option<PathBuf>,

    /// Repository root (defaults to the working directory)
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// App pack selector to mount at boot
    #[arg(long, default_value = DEFAULT_APP_SELECTOR)]
    app: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let port = cli.port.unwrap_or(settings.http.port);

    let repo_root = match &cli.repo_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };

    // Missing repo subdirectories are a startup invariant; refuse to run.
    let roots = match build_roots(
        cli.root.as_deref(),
        cli.userdata.as_deref(),
        cli.saves.as_deref(),
        &repo_root,
    ) {
        Ok(roots) => roots,
        Err(err) => {
            eprintln!("turnix: {err}");
            std::process::exit(2);
        }
    };

    let engine = Engine::new(settings, roots);
    if let Err(err) = engine.boot(&cli.app) {
        eprintln!("turnix: boot failed: {err}");
        std::process::exit(2);
    }

    let serve = server::serve(engine.clone(), port);
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            engine.shutdown().await;
        }
    }
    Ok(())
}
