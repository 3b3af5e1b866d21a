//! Cache-backed candidate retrieval for the engine.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use acp_engine::{CacheKey, CandidateCache};
use acp_schemas::{Rule, SubjectType};

/// Read-through provider: cache hit or a short read-only fetch. Runs
/// before the pipeline's business transaction opens, never inside it.
#[derive(Clone)]
pub struct CandidateProvider {
    pool: PgPool,
    cache: Arc<CandidateCache>,
}

impl CandidateProvider {
    pub fn new(pool: PgPool, cache: Arc<CandidateCache>) -> Self {
        Self { pool, cache }
    }

    pub async fn candidates(
        &self,
        org_id: Uuid,
        area_id: Uuid,
        subject: SubjectType,
    ) -> anyhow::Result<Arc<[Rule]>> {
        let key = CacheKey {
            org_id,
            area_id,
            subject,
        };
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let rules = acp_db::fetch_candidates(&self.pool, org_id, area_id, subject).await?;
        Ok(self.cache.insert(key, rules).await)
    }
}
