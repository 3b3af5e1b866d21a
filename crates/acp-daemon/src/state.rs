//! Shared runtime state for acp-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself.

use std::sync::Arc;

use sqlx::PgPool;

use acp_access::{
    AccessService, CallbackService, CandidateProvider, EventPublisher, PolicyService,
};
use acp_config::CoreConfig;
use acp_engine::{CandidateCache, ConfigZoneProvider};
use acp_outbox::DlqHandler;
use serde::{Deserialize, Serialize};

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub pool: PgPool,
    pub cfg: Arc<CoreConfig>,
    pub build: BuildInfo,
    pub publisher: EventPublisher,
    pub cache: Arc<CandidateCache>,
    pub access: AccessService,
    pub callback: CallbackService,
    pub policy: PolicyService,
    pub dlq: DlqHandler,
}

impl AppState {
    pub fn new(cfg: CoreConfig, pool: PgPool) -> Self {
        let cfg = Arc::new(cfg);
        let publisher = EventPublisher::new(1024);
        let cache = Arc::new(CandidateCache::new(cfg.cache_ttl, cfg.cache_capacity));
        let zones = Arc::new(ConfigZoneProvider::new(
            cfg.default_tz,
            cfg.area_tz_overrides.clone(),
        ));
        let candidates = CandidateProvider::new(pool.clone(), Arc::clone(&cache));

        Self {
            access: AccessService::new(
                pool.clone(),
                candidates,
                zones,
                publisher.clone(),
            ),
            callback: CallbackService::new(pool.clone(), publisher.clone()),
            policy: PolicyService::new(pool.clone(), publisher.clone()),
            dlq: DlqHandler::new(pool.clone()),
            build: BuildInfo {
                service: "acp-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            publisher,
            cache,
            pool,
            cfg,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
