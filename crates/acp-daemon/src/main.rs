//! acp-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! connects and migrates the database, fails fast on catalog
//! misconfiguration, spawns the background workers, and starts the HTTP
//! server. All route handlers live in `routes.rs`; shared state in
//! `state.rs`.

use std::sync::Arc;

use anyhow::{bail, Context};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use acp_access::spawn_cache_invalidator;
use acp_config::CoreConfig;
use acp_daemon::{routes, state::AppState};
use acp_outbox::{Dispatcher, DispatcherConfig, EventTransport, HttpTransport, LogTransport};
use acp_schemas::reason;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = CoreConfig::from_env()?;

    let pool = acp_db::connect(&cfg.database_url).await?;
    acp_db::migrate(&pool).await?;

    // Fail fast: every fixed reason code must be present. A catalog
    // without POLICY_ERROR cannot express engine fallbacks, and any
    // other gap turns rule matches into insert failures at decision time.
    let missing = acp_db::missing_reason_codes(&pool, reason::ALL).await?;
    if !missing.is_empty() {
        bail!(
            "reason catalog is missing {}; refusing to start",
            missing.join(", ")
        );
    }

    let transport: Arc<dyn EventTransport> = match &cfg.webhook_url {
        Some(url) => Arc::new(HttpTransport::new(url.clone(), cfg.webhook_timeout)?),
        None => Arc::new(LogTransport),
    };

    let shared = Arc::new(AppState::new(cfg, pool.clone()));

    // Background workers: local cache invalidation off the in-process
    // bus, and the outbox dispatcher (which also runs the lock janitor).
    let _invalidator =
        spawn_cache_invalidator(Arc::clone(&shared.cache), shared.publisher.subscribe());
    let _dispatcher = Dispatcher::new(
        pool,
        transport,
        DispatcherConfig::from(shared.cfg.as_ref()),
    )
    .spawn();

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = shared.cfg.bind_addr;
    info!(instance = %shared.cfg.instance_id, "acp-daemon listening on http://{addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
