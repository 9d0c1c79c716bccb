//! # Cadence: outbound sequence send scheduler
//!
//! Usage:
//!   cadence serve                         # Admin API + send/reply/follow-up loops
//!   cadence worker                        # Loops only, no HTTP
//!   cadence run-once --ignore-send-window # One send tick, JSON report on stdout
//!   cadence reply-once                    # One reply-detection pass
//!   cadence init-db --write-config        # Create schema (and a default config)

use anyhow::Result;
use cadence_channels::{MemoryTransport, SmtpImapTransport};
use cadence_core::{CadenceConfig, MailTransport};
use cadence_db::CadenceDb;
use cadence_scheduler::{FollowUpPlanner, ReplyWorker, SendQueueWorker, TickOptions};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "📬 Cadence: outbound sequence send scheduler")]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG or ~/.cadence/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Use the in-process recording transport; no mail leaves the host
    #[arg(long, global = true)]
    memory_transport: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the admin API and every background worker
    Serve,
    /// Run the background workers without the admin API
    Worker,
    /// Run a single send queue tick and print its report
    RunOnce {
        /// Dispatch outside the send window (audited as send_window_bypass)
        #[arg(long)]
        ignore_send_window: bool,
    },
    /// Run a single reply-detection pass and print its report
    ReplyOnce,
    /// Create the database schema
    InitDb {
        /// Also write a default config file if none exists
        #[arg(long)]
        write_config: bool,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var("CADENCE_CONFIG").ok())
        .map(|p| PathBuf::from(shellexpand::tilde(&p).to_string()))
        .unwrap_or_else(CadenceConfig::default_path)
}

fn load_config(path: &Path) -> Result<CadenceConfig> {
    let mut config = if path.exists() {
        CadenceConfig::load_from(path)?
    } else {
        tracing::info!("📄 No config at {}, using defaults", path.display());
        CadenceConfig::default()
    };
    if let Ok(token) = std::env::var("CADENCE_ADMIN_TOKEN") {
        config.gateway.admin_token = token;
    }
    Ok(config)
}

fn open_db(config: &CadenceConfig) -> Result<Arc<CadenceDb>> {
    let path = config.database.resolved_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = CadenceDb::open(&path)?;
    tracing::info!("💾 Database: {}", path.display());
    Ok(Arc::new(db))
}

fn transport(cli: &Cli) -> Arc<dyn MailTransport> {
    if cli.memory_transport {
        tracing::warn!("🧪 Using the in-memory transport; nothing will be delivered");
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(SmtpImapTransport::new())
    }
}

/// Spawn the send, reply and follow-up loops.
fn spawn_workers(config: &CadenceConfig, db: &Arc<CadenceDb>, transport: &Arc<dyn MailTransport>) {
    let send_worker = Arc::new(SendQueueWorker::new(
        db.clone(),
        transport.clone(),
        config.worker.clone(),
    ));
    let reply_worker = Arc::new(ReplyWorker::new(
        db.clone(),
        transport.clone(),
        config.replies.clone(),
    ));
    let planner = Arc::new(
        FollowUpPlanner::new(db.clone(), config.followups.clone())
            .with_multi_step(config.worker.multi_step_enabled),
    );

    tokio::spawn(cadence_scheduler::spawn_send_worker(
        send_worker,
        db.clone(),
        config.sending.clone(),
    ));
    tokio::spawn(cadence_scheduler::spawn_reply_worker(
        reply_worker,
        config.replies.tick_secs,
    ));
    tokio::spawn(cadence_scheduler::spawn_planner(
        planner,
        config.followups.tick_secs,
    ));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "cadence=debug,cadence_scheduler=debug,cadence_db=debug,cadence_gateway=debug,cadence_channels=debug,tower_http=debug"
    } else {
        "cadence=info,cadence_scheduler=info,cadence_db=info,cadence_gateway=info,cadence_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);
    let config = load_config(&path)?;

    match &cli.command {
        Command::InitDb { write_config } => {
            open_db(&config)?;
            if *write_config && !path.exists() {
                config.save_to(&path)?;
                println!("✅ Wrote default config to {}", path.display());
            }
            println!("✅ Database ready at {}", config.database.resolved_path().display());
        }
        Command::RunOnce { ignore_send_window } => {
            let db = open_db(&config)?;
            let worker = SendQueueWorker::new(db.clone(), transport(&cli), config.worker.clone());
            let controls = db.load_sending_controls(&config.sending)?;
            let opts = TickOptions {
                ignore_send_window: *ignore_send_window,
            };
            let report = worker.tick(&controls, opts, chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ReplyOnce => {
            let db = open_db(&config)?;
            let worker = ReplyWorker::new(db, transport(&cli), config.replies.clone());
            let report = worker.tick(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Worker => {
            let db = open_db(&config)?;
            spawn_workers(&config, &db, &transport(&cli));
            tracing::info!("🚀 Workers running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("👋 Shutting down");
        }
        Command::Serve => {
            let db = open_db(&config)?;
            let transport = transport(&cli);
            spawn_workers(&config, &db, &transport);

            let state = cadence_gateway::AppState::new(
                db.clone(),
                Arc::new(SendQueueWorker::new(db.clone(), transport.clone(), config.worker.clone())),
                Arc::new(ReplyWorker::new(db.clone(), transport.clone(), config.replies.clone())),
                config.sending.clone(),
                &config.gateway.admin_token,
            );
            tokio::select! {
                res = cadence_gateway::start(&config.gateway, state) => res?,
                _ = tokio::signal::ctrl_c() => tracing::info!("👋 Shutting down"),
            }
        }
    }
    Ok(())
}
