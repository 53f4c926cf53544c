use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use classroom_sync::{
    AuthToken, ClassroomSync, Completion, CycleOutcome, Difficulty, GameCompletion,
    QuizCompletion, SyncConfig,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "classroom-sync")]
#[command(about = "Offline-first result buffer and synchronizer for classroom apps", long_about = None)]
struct Args {
    /// Directory containing classroom-sync.toml and .env
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Data directory path (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Progress server base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// Treat the device as offline
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background synchronizer until interrupted
    Run,
    /// Show unsynced counts and connectivity
    Status,
    /// Run one sync cycle now
    Sync,
    /// Record a finished quiz
    RecordQuiz {
        #[arg(long)]
        quiz_id: String,
        #[arg(long)]
        total: u32,
        #[arg(long)]
        correct: u32,
        /// Percentage; derived from total/correct when omitted
        #[arg(long)]
        score: Option<u8>,
        /// Seconds
        #[arg(long)]
        time_spent: Option<u64>,
        #[arg(long)]
        difficulty: Option<Difficulty>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Record a finished game session
    RecordGame {
        #[arg(long)]
        game_id: String,
        #[arg(long)]
        score: u32,
        #[arg(long)]
        level: Option<u32>,
        /// Game state as JSON
        #[arg(long)]
        progress: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Store a session token
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: String,
        /// Profile snapshot as JSON
        #[arg(long)]
        user: Option<String>,
        /// Token lifetime; no expiry when omitted
        #[arg(long)]
        expires_in_hours: Option<i64>,
    },
    /// Drop the session and all local data
    Logout {
        /// Also discard results that were never synced
        #[arg(long)]
        force: bool,
    },
    /// Wipe every local collection
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classroom_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = SyncConfig::load(&args.config_dir)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    config.validate()?;

    let service = ClassroomSync::from_config(&config)?;
    service.network().set_online(!args.offline);
    service.init().await?;
    tracing::debug!("Using data directory {}", config.data_dir.display());

    match args.command {
        Command::Run => {
            service.add_sync_listener(|event| {
                tracing::info!("{}", serde_json::to_string(event).unwrap_or_default());
            });
            service.start().await?;
            shutdown_signal().await;
            service.stop().await?;
        }
        Command::Status => {
            let status = service.get_sync_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            match service.store().get_auth_token().await? {
                Some(token) => println!("Logged in as {}", token.user_id),
                None => println!("Not logged in"),
            }
            println!("Device: {}", service.store().device_id().await?);
        }
        Command::Sync => match service.manual_sync().await {
            CycleOutcome::Completed {
                quiz_count,
                game_count,
            } => println!("Synced {} quiz results and {} game sessions", quiz_count, game_count),
            CycleOutcome::Skipped(reason) => println!("Sync skipped: {:?}", reason),
            CycleOutcome::Failed(message) => anyhow::bail!("Sync failed: {}", message),
        },
        Command::RecordQuiz {
            quiz_id,
            total,
            correct,
            score,
            time_spent,
            difficulty,
            subject,
            user_id,
        } => {
            let completion = Completion::Quiz(QuizCompletion {
                user_id,
                quiz_id,
                score,
                total_items: total,
                correct_answers: correct,
                time_spent,
                difficulty,
                subject,
                ..Default::default()
            });
            let outcome = service.record_completion(completion).await?;
            println!("{:?}", outcome);
        }
        Command::RecordGame {
            game_id,
            score,
            level,
            progress,
            user_id,
        } => {
            let progress = match progress {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            let completion = Completion::Game(GameCompletion {
                user_id,
                game_id,
                score,
                level,
                progress,
                timestamp: None,
            });
            let outcome = service.record_completion(completion).await?;
            println!("{:?}", outcome);
        }
        Command::Login {
            token,
            user_id,
            user,
            expires_in_hours,
        } => {
            let user = match user {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::json!({}),
            };
            let expires_at = expires_in_hours.map(|hours| Utc::now() + ChronoDuration::hours(hours));
            let saved = service
                .login(AuthToken::new(token, user_id, user, expires_at))
                .await?;
            println!("Logged in as {} on device {}", saved.user_id, saved.device_id);
        }
        Command::Logout { force } => {
            let pending = service.store().get_storage_stats().await?.total();
            if pending > 0 && !force {
                anyhow::bail!(
                    "{} records are not synced yet; run `sync` first or pass --force",
                    pending
                );
            }
            service.logout().await?;
            println!("Logged out");
        }
        Command::Clear => {
            service.store().clear_all_data().await?;
            println!("Local data cleared");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
