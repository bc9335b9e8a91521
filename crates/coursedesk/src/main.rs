use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

mod admin;
mod auth;
mod config;
mod db;
mod downloads;
mod error;
mod favorites;
mod html;
mod library;
mod notify;
mod relay;
mod server;
mod session;
mod store;
mod sync;
mod timer;
mod types;

use auth::LocalIdentityProvider;
use config::Config;
use db::SqliteStore;
use relay::LogRelay;
use session::{PageSession, Services};
use timer::{PomodoroTimer, Tick, DEFAULT_PRESET, MAX_MINUTES};

#[derive(Parser, Debug)]
#[command(name = "coursedesk")]
#[command(about = "Course resource site with synced favorites, study timer and download tracking")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// SQLite database file (overrides COURSEDESK_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory holding catalog.json and static files (overrides COURSEDESK_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the web server (default)
    Serve {
        /// Port to listen on (overrides COURSEDESK_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Create the database and apply migrations
    InitDb,

    /// Run a study countdown in the terminal and record it
    Study {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,

        /// Countdown length in minutes
        #[arg(short, long, default_value_t = DEFAULT_PRESET)]
        minutes: u64,
    },
}

fn init_tracing(log_level: &str) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    for directive in ["hyper=warn", "tower_http=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_max_level(Level::TRACE)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn build_services(config: &Config) -> Result<Services> {
    let store = SqliteStore::open(&config.db_path)?;
    let identity = LocalIdentityProvider::new(store.connection());
    info!(db = %config.db_path.display(), "Database ready");

    Ok(Services {
        store: Arc::new(store),
        identity: Arc::new(identity),
        relay: Arc::new(LogRelay::new()),
        contact_to: config.contact_to.clone(),
        lookup_timeout: config.lookup_timeout,
    })
}

/// Count down `minutes` in the terminal, then record the session for `email`.
async fn study(config: &Config, email: &str, password: &str, minutes: u64) -> Result<()> {
    if !timer::is_valid_length(minutes) {
        bail!("minutes must be between 1 and {MAX_MINUTES}");
    }

    let session = PageSession::new(build_services(config)?);
    let user = session
        .sign_in(email, password)
        .await
        .map_err(|e| anyhow::anyhow!(e.message(auth::AuthOp::SignIn)))
        .context("Sign-in failed")?;

    let mut timer = PomodoroTimer::new(minutes);
    timer.start();
    info!(uid = %user.uid, minutes = minutes, phase = timer.phase().label(), "Countdown started");

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;
    loop {
        interval.tick().await;
        match timer.tick() {
            Tick::Running { .. } => {
                print!("\r{} {}", timer.phase().label(), timer.display());
                let _ = std::io::stdout().flush();
            }
            Tick::Completed { minutes } => {
                println!();
                match session.complete_timer(minutes).await {
                    Ok(Some(stats)) => info!(
                        sessions = stats.sessions_completed,
                        total_minutes = stats.total_minutes,
                        "Session recorded"
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Session not recorded"),
                }
                break;
            }
            Tick::Idle => break,
        }
    }

    for toast in session.notifier().drain() {
        info!(level = ?toast.level, "{}", toast.message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args.log_level);

    let config = load_config(&args)?;

    match args.command {
        // Default to serve if no command specified
        None => {
            let services = build_services(&config)?;
            server::serve(config.port, config.data_dir, services).await?;
        }
        Some(Commands::Serve { port }) => {
            let services = build_services(&config)?;
            let port = port.unwrap_or(config.port);
            server::serve(port, config.data_dir, services).await?;
        }
        Some(Commands::InitDb) => {
            db::init_db(&config.db_path)?;
            info!(path = %config.db_path.display(), "Database initialised");
        }
        Some(Commands::Study {
            email,
            password,
            minutes,
        }) => {
            study(&config, &email, &password, minutes).await?;
        }
    }

    Ok(())
}
