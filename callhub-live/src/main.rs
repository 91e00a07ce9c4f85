//! callhub-live - live call-session orchestrator
//!
//! Receives telephony provider webhooks, keeps per-call session state, pushes
//! transcript and call updates to observers over SSE, and runs coaching
//! analysis and the post-call recording pipeline.

use anyhow::{Context, Result};
use callhub_common::config::{CoachingConfig, ServiceConfig};
use callhub_common::db::init_database;
use callhub_live::coaching::{CoachingTrigger, FileKnowledgeBase, HttpCoachingAnalyzer};
use callhub_live::hub::BroadcastHub;
use callhub_live::ingest::SweepPolicy;
use callhub_live::recording::{
    FsBlobStore, HttpInboxReprocessor, InboxReprocessor, ProviderClient, RecordingCollaborators,
    SkippedReprocessor,
};
use callhub_live::store::{SessionStore, SqliteSessionStore};
use callhub_live::{build_router, AppState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "callhub-live")]
#[command(about = "Live call-session orchestrator")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CALLHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Socket address to listen on (overrides [server].bind)
    #[arg(short, long, env = "CALLHUB_BIND")]
    bind: Option<String>,

    /// SQLite database path (overrides [database].path)
    #[arg(short, long, env = "CALLHUB_DATABASE")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging level comes from the config file, so read it before tracing is up
    let loaded = ServiceConfig::load(args.config.as_deref());
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("callhub_live={level},callhub_common={level},tower_http={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = loaded.context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(database) = args.database {
        config.database.path = database;
    }

    info!("Starting callhub-live (call-session orchestrator)");
    info!(
        "Version: {} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match &args.config {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }

    // Durable storage
    info!("Database: {}", config.database.path.display());
    let pool = init_database(&config.database.path)
        .await
        .context("Failed to initialize database")?;
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));

    let hub = Arc::new(BroadcastHub::new(
        config.hub.subscriber_buffer,
        config.hub.publish_timeout(),
    ));

    let coaching = build_coaching(&config.coaching, hub.clone())?;
    let recording = build_recording_collaborators(&config)?;

    let state = AppState::new(
        hub,
        store,
        coaching,
        recording,
        &config.provider.recording_extension,
    );

    let policy = SweepPolicy::from(&config.registry);
    info!(
        "Session eviction: idle {:?}, ended retention {:?}, sweep every {:?}",
        policy.idle_timeout, policy.ended_retention, policy.interval
    );
    let sweeper = state.ingestor.spawn_sweeper(policy);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    info!("Listening on http://{}", config.server.bind);
    info!("Health check: http://{}/health", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    info!("Server shutdown complete");
    Ok(())
}

fn build_coaching(config: &CoachingConfig, hub: Arc<BroadcastHub>) -> Result<CoachingTrigger> {
    let Some(endpoint) = config.endpoint.clone() else {
        info!("Coaching: no analyzer endpoint configured, coaching disabled");
        return Ok(CoachingTrigger::disabled());
    };

    info!(
        "Coaching: analyzer {}, knowledge base {}",
        endpoint,
        config.knowledge_base_dir.display()
    );
    let analyzer = HttpCoachingAnalyzer::new(endpoint, Duration::from_secs(config.timeout_secs), hub)
        .context("Failed to build coaching client")?;
    let knowledge = FileKnowledgeBase::new(config.knowledge_base_dir.clone());
    Ok(CoachingTrigger::new(Arc::new(knowledge), Arc::new(analyzer)))
}

fn build_recording_collaborators(config: &ServiceConfig) -> Result<RecordingCollaborators> {
    if config.provider.account_sid.is_none() || config.provider.auth_token.is_none() {
        warn!("Provider credentials not configured; recording downloads will be unauthenticated");
    }
    let fetcher = ProviderClient::new(&config.provider, config.recording.download_timeout())
        .context("Failed to build provider client")?;

    info!("Recordings stored under {}", config.recording.storage_dir.display());
    let blobs = FsBlobStore::new(config.recording.storage_dir.clone());

    let reprocessor: Arc<dyn InboxReprocessor> = match &config.reprocess.endpoint {
        Some(endpoint) => {
            info!("Reprocess: {}", endpoint);
            Arc::new(
                HttpInboxReprocessor::new(endpoint.clone(), Duration::from_secs(config.reprocess.timeout_secs))
                    .context("Failed to build reprocess client")?,
            )
        }
        None => {
            info!("Reprocess: no endpoint configured, step will report skipped");
            Arc::new(SkippedReprocessor)
        }
    };

    Ok(RecordingCollaborators {
        fetcher: Arc::new(fetcher),
        blobs: Arc::new(blobs),
        reprocessor,
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
