//! esports-ingest - incremental esports data ingestion
//!
//! Command-line entry point: one-off syncs, the long-running scheduler and
//! credential management.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use esports_ingest::auth::{HttpCredentialExchange, TokenManager, TokenProvider};
use esports_ingest::clock::{Clock, SystemClock};
use esports_ingest::config::Config;
use esports_ingest::database::{CredentialStore, RecordStore, SqliteDatabase};
use esports_ingest::jobs::{build_runners, JobContext, JobRunner, ALL_FAMILIES};
use esports_ingest::logging::init_tracing;
use esports_ingest::models::SecretMaterial;
use esports_ingest::sync::{
    sink_from_config, HostRateLimiter, JobScheduler, JobScope, NotificationSink, RemoteClient,
    RetryManager, ScheduledJob, StopSignal, SyncOrchestrator,
};

/// esports-ingest - incremental esports data ingestion
#[derive(Parser, Debug)]
#[command(name = "esports-ingest")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "ESPORTS_INGEST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job (or all of them) once and print the stats
    Sync {
        /// Job name or `all`
        job: String,
        /// `all`, `org:<slug>` or an entity id
        #[arg(default_value = "all")]
        scope: String,
    },
    /// Run every enabled job on its interval until interrupted
    Schedule,
    /// Manage stored device credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsCommand,
    },
    /// Inspect the authenticated API session
    Auth {
        #[command(subcommand)]
        action: AuthCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CredentialsCommand {
    /// Store device credentials, superseding older ones for the subject
    Add {
        /// Account id
        #[arg(long)]
        subject: String,
        /// Device id
        #[arg(long)]
        device: String,
        /// Device secret
        #[arg(long, env = "ESPORTS_INGEST_DEVICE_SECRET", hide_env_values = true)]
        secret: String,
    },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Obtain a token and print its status
    Status,
    /// Invalidate the current session remotely
    Logout,
}

/// How long exit waits for queued webhook summaries
const NOTIFY_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a command may need, built once
struct App {
    config: Config,
    database: Arc<SqliteDatabase>,
    tokens: TokenManager,
    runners: Vec<Arc<JobRunner>>,
    sink: Arc<dyn NotificationSink>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_tracing(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting esports-ingest");

    let app = build_app(config).await?;

    match args.command {
        Command::Sync { job, scope } => {
            let result = run_sync(&app, &job, &scope).await;
            app.sink.flush(NOTIFY_FLUSH_TIMEOUT).await;
            result
        }
        Command::Schedule => run_schedule(app).await,
        Command::Credentials {
            action:
                CredentialsCommand::Add {
                    subject,
                    device,
                    secret,
                },
        } => {
            let id = app
                .database
                .upsert_credential(&subject, &SecretMaterial {
                    device_id: device,
                    secret,
                })
                .await?;
            info!(subject = %subject, credential_id = %id, "Credential stored");
            println!("{}", json!({ "subject_id": subject, "credential_id": id }));
            Ok(())
        }
        Command::Auth {
            action: AuthCommand::Status,
        } => {
            if let Err(e) = app.tokens.initialize().await {
                warn!(error = %e, "Could not obtain a token");
            }
            let status = json!({
                "state": app.tokens.state().to_string(),
                "last_error": app.tokens.last_error().map(|e| e.to_string()),
                "token": app.tokens.token_info(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Auth {
            action: AuthCommand::Logout,
        } => {
            app.tokens.logout().await;
            println!("{}", json!({ "state": app.tokens.state().to_string() }));
            Ok(())
        }
    }
}

async fn build_app(config: Config) -> anyhow::Result<App> {
    let database = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = Arc::new(HostRateLimiter::new(config.rate_limits.clone(), clock.clone()));
    let client = Arc::new(RemoteClient::new(&config.http, limiter.clone())?);

    let exchange = HttpCredentialExchange::new(config.api.clone(), &config.http, clock.clone())?;
    let credential_store: Arc<dyn CredentialStore> = database.clone();
    let tokens = TokenManager::new(
        &config.api,
        Arc::new(exchange),
        Some(credential_store),
        clock.clone(),
    );

    let store: Arc<dyn RecordStore> = database.clone();
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        limiter,
        RetryManager::with_clock(config.retry.clone(), clock.clone()),
        &config.sync,
    ));
    let sink: Arc<dyn NotificationSink> = Arc::from(sink_from_config(&config.notify, &config.http));

    let provider: Arc<dyn TokenProvider> = Arc::new(tokens.clone());
    let ctx = JobContext {
        store,
        client,
        tokens: provider,
        orchestrator,
        sink: sink.clone(),
        clock,
    };
    let runners = build_runners(&config, &ctx)?;
    info!(jobs = runners.len(), "Jobs configured");

    Ok(App {
        config,
        database,
        tokens,
        runners,
        sink,
    })
}

/// Run one job or all of them; item errors do not fail the command
async fn run_sync(app: &App, job: &str, scope: &str) -> anyhow::Result<()> {
    let scope: JobScope = scope.parse()?;

    let selected: Vec<_> = if job.eq_ignore_ascii_case("all") {
        app.runners.iter().collect()
    } else {
        match app.runners.iter().find(|r| r.name() == job) {
            Some(runner) => vec![runner],
            None => {
                let known = ALL_FAMILIES.iter().any(|d| d.name == job);
                anyhow::bail!(if known {
                    format!("job {} is not enabled in the configuration", job)
                } else {
                    format!("unknown job: {}", job)
                });
            }
        }
    };

    let stop = StopSignal::new();
    let mut fatal = Vec::new();

    for runner in selected {
        let running = runner.run(&scope, &stop);
        tokio::pin!(running);

        let finished = tokio::select! {
            result = &mut running => Some(result),
            _ = shutdown_signal() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                // Let the pass finish its current item
                stop.stop();
                running.await
            }
        };

        match result {
            Ok(report) => {
                println!(
                    "{}",
                    serde_json::to_string(&json!({
                        "job": report.job,
                        "created": report.stats.created,
                        "updated": report.stats.updated,
                        "skipped": report.stats.skipped,
                        "errors": report.stats.errors,
                        "total_records": report.total_records,
                        "active_records": report.active_records,
                    }))?
                );
            }
            Err(e) => {
                error!(job = %runner.name(), error = %e, "Job aborted");
                fatal.push(format!("{}: {}", runner.name(), e));
            }
        }

        if stop.is_stopped() {
            break;
        }
    }

    if fatal.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} job(s) failed: {}", fatal.len(), fatal.join("; "))
    }
}

async fn run_schedule(app: App) -> anyhow::Result<()> {
    if app.runners.is_empty() {
        anyhow::bail!("no sources are enabled");
    }

    if let Err(e) = app.tokens.initialize().await {
        warn!(error = %e, "Starting without an API token");
    }

    let jobs: Vec<Arc<dyn ScheduledJob>> = app
        .runners
        .iter()
        .map(|r| r.clone() as Arc<dyn ScheduledJob>)
        .collect();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = JobScheduler::new(app.config.scheduler.clone(), jobs, shutdown_rx);
    let handle = tokio::spawn(scheduler.run());

    shutdown_signal().await;
    let _ = shutdown_tx.send(());
    handle.await?;

    app.sink.flush(NOTIFY_FLUSH_TIMEOUT).await;
    app.tokens.logout().await;
    info!("esports-ingest shutdown complete");
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
