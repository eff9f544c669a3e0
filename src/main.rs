//! Sitedump CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sitedump::config::Config;
use sitedump::server::ControlServer;
use sitedump::session::{Context, SessionController};

/// Snapshot a live site's network traffic and replay it offline
#[derive(Parser)]
#[command(name = "sitedump")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SITEDUMP_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control surface
    Serve,
    /// Capture a site into a new session
    Dump {
        /// Absolute http(s) URL to load
        url: String,
    },
    /// Replay a session until Ctrl-C
    Show {
        /// Session id
        id: i64,
    },
    /// List stored sessions
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Unable to load configuration from {}", path.display()))?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    let context = Context::from_config(&config).context("Unable to open the record store")?;
    let controller = Arc::new(SessionController::new(context, &config));

    match args.command {
        Command::Serve => {
            ControlServer::new(Arc::clone(&controller), &config)
                .run(&config.server)
                .await?;
        }
        Command::Dump { url } => {
            let report = controller.dump(&url).await?;
            println!("session {}: {}", report.session_id, report.base_url);
            if let Some(summary) = report.summary {
                println!(
                    "stored {} ({} captured, {} preflight, {} non-success), dropped {}",
                    summary.stored(),
                    summary.captured,
                    summary.preflight,
                    summary.non_success,
                    summary.failed
                );
            }
            controller.shutdown().await;
        }
        Command::Show { id } => {
            let report = controller.show(id).await?;
            println!(
                "showing session {} ({}), {} exchanges; Ctrl-C to stop",
                report.session_id, report.base_url, report.stats.size
            );
            tokio::signal::ctrl_c().await?;
            let stats = controller.close_show(id).await?;
            info!(
                "show({}): {} hits, {} misses, hit rate {:.2}",
                id, stats.hits, stats.misses, stats.hit_rate
            );
            controller.shutdown().await;
        }
        Command::Sessions => {
            for session in controller.list_sessions().await? {
                println!(
                    "{}\t{}\t{}",
                    session.id,
                    session.created_at.to_rfc3339(),
                    session.base_url
                );
            }
        }
    }

    Ok(())
}
