use anyhow::Result;
use clap::{Parser, Subcommand};
use kazi_types::UserId;
use std::path::PathBuf;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod logging;

use commands::Admin;
use config::AdminConfig;

#[derive(Parser)]
#[command(name = "kazi-admin")]
#[command(about = "Kazi referral reward administration", long_about = None)]
struct Cli {
    /// Configuration file path (defaults to ./kazi.toml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Settle the referral reward owed for an invitee
    Settle {
        #[arg(long)]
        invitee: UserId,
    },

    /// Release pending rewards for a user who has left level 0
    Upgrade {
        #[arg(long)]
        user: UserId,
    },

    /// Link an invitee to their inviter, by id or invitation code
    Link {
        #[arg(long)]
        invitee: UserId,

        #[arg(long, conflicts_with = "code", required_unless_present = "code")]
        inviter: Option<UserId>,

        #[arg(long)]
        code: Option<String>,
    },

    /// Reverse a completed reward
    Reverse {
        /// Reward event id (hex)
        #[arg(long)]
        event: String,

        #[arg(long)]
        actor: String,

        #[arg(long)]
        reason: String,

        /// Floor the wallet at zero and record the shortfall instead of refusing
        #[arg(long)]
        force: bool,
    },

    /// Scan for drift between users and the ledger
    Reconcile {
        /// Settle missing and stuck rewards found by the scan
        #[arg(long)]
        repair: bool,
    },

    /// List an inviter's reward events
    Ledger {
        #[arg(long)]
        inviter: UserId,
    },

    /// Summarise an inviter's referrals and rewards
    Summary {
        #[arg(long)]
        inviter: UserId,
    },

    /// Load or update users from a JSON file
    ImportUsers {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = AdminConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    if let Err(e) = logging::init_logging(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "kazi_rewards=info".to_string()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    debug!(database = %config.database_path.display(), "Opening settlement store");
    let admin = Admin::open(&config)?;

    let result = match cli.command {
        Commands::Settle { invitee } => admin.settle(invitee).await,
        Commands::Upgrade { user } => admin.upgrade(user).await,
        Commands::Link {
            invitee,
            inviter,
            code,
        } => admin.link(invitee, inviter, code.as_deref()).await,
        Commands::Reverse {
            event,
            actor,
            reason,
            force,
        } => admin.reverse(&event, &actor, &reason, force).await,
        Commands::Reconcile { repair } => admin.reconcile(repair).await,
        Commands::Ledger { inviter } => admin.ledger(inviter).await,
        Commands::Summary { inviter } => admin.summary(inviter).await,
        Commands::ImportUsers { file } => admin.import_users(&file).await,
    };

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "❌ Command failed");
            Err(e)
        }
    }
}
