use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use gator::commands::{self, Session};
use gator::config::Config;
use gator::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "gator", version, about = "Command-line RSS aggregator")]
struct Args {
    /// Config file (default: ~/.config/gator/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user and log in as them
    Register { name: String },
    /// Switch to an existing user
    Login { name: String },
    /// Delete all users, feeds, follows and posts
    Reset,
    /// List users
    Users,
    /// Poll feeds forever, one per interval (e.g. 30s, 1m, 1h)
    Agg {
        #[arg(value_name = "INTERVAL")]
        time_between_reqs: String,
    },
    /// Add a feed and follow it
    #[command(name = "addfeed")]
    AddFeed { name: String, url: String },
    /// List all feeds
    Feeds,
    /// Follow an existing feed by URL
    Follow { url: String },
    /// List feeds the current user follows
    Following,
    /// Stop following a feed
    Unfollow { url: String },
    /// Show the newest posts from followed feeds
    Browse {
        #[arg(short, long, default_value_t = 2)]
        limit: i64,
    },
    /// Fetch one feed now
    Fetch { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gator=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config.database_path(&config_path);
    ensure_parent_dir(&db_path)?;
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let mut session = Session::new(db, config, config_path);
    let mut out = std::io::stdout().lock();

    match args.command {
        Command::Register { name } => commands::register(&mut session, &name, &mut out).await,
        Command::Login { name } => commands::login(&mut session, &name, &mut out).await,
        Command::Reset => commands::reset(&mut session, &mut out).await,
        Command::Users => commands::users(&session, &mut out).await,
        Command::Agg { time_between_reqs } => {
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    shutdown_signal().await;
                    tracing::info!("Shutdown requested");
                    cancel.cancel();
                }
            });
            commands::agg(&session, &time_between_reqs, cancel, &mut out).await
        }
        Command::AddFeed { name, url } => commands::add_feed(&session, &name, &url, &mut out).await,
        Command::Feeds => commands::feeds(&session, &mut out).await,
        Command::Follow { url } => commands::follow(&session, &url, &mut out).await,
        Command::Following => commands::following(&session, &mut out).await,
        Command::Unfollow { url } => commands::unfollow(&session, &url, &mut out).await,
        Command::Browse { limit } => commands::browse(&session, limit, &mut out).await,
        Command::Fetch { url } => commands::fetch(&session, &url, &mut out).await,
    }
}

/// Create the database's directory with user-only permissions if missing.
fn ensure_parent_dir(db_path: &Path) -> Result<()> {
    let Some(dir) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if dir.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    // SEC-007: user-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set directory permissions to 0700"
            );
        }
    }
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
