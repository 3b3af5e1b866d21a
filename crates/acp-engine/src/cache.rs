//! In-process candidate cache.
//!
//! Entries are immutable `Arc<[Rule]>` snapshots keyed by
//! `(org, area, subject)` — a reader always sees a whole candidate list,
//! never a torn one. Event-driven invalidation is the primary coherency
//! mechanism; the TTL is only a safety net against missed invalidations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use acp_schemas::{Rule, SubjectType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub org_id: Uuid,
    pub area_id: Uuid,
    pub subject: SubjectType,
}

struct CacheEntry {
    rules: Arc<[Rule]>,
    inserted_at: Instant,
}

pub struct CandidateCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl CandidateCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Snapshot for `key`, or `None` on miss / TTL expiry. Expired entries
    /// are left in place for the next insert to overwrite; reads stay
    /// lock-cheap.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<[Rule]>> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(Arc::clone(&entry.rules))
    }

    /// Store a fresh snapshot, returning it for immediate use.
    pub async fn insert(&self, key: CacheKey, rules: Vec<Rule>) -> Arc<[Rule]> {
        let snapshot: Arc<[Rule]> = rules.into();
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            evict_oldest(&mut entries);
        }
        entries.insert(
            key,
            CacheEntry {
                rules: Arc::clone(&snapshot),
                inserted_at: Instant::now(),
            },
        );
        snapshot
    }

    /// Drop every subject variant for `(org, area)`.
    pub async fn invalidate_area(&self, org_id: Uuid, area_id: Uuid) {
        self.entries
            .write()
            .await
            .retain(|k, _| !(k.org_id == org_id && k.area_id == area_id));
    }

    /// Drop every entry belonging to the org.
    pub async fn invalidate_org(&self, org_id: Uuid) {
        self.entries.write().await.retain(|k, _| k.org_id != org_id);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn evict_oldest(entries: &mut HashMap<CacheKey, CacheEntry>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, e)| e.inserted_at)
        .map(|(k, _)| *k)
    {
        entries.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(org: Uuid, area: Uuid, subject: SubjectType) -> CacheKey {
        CacheKey {
            org_id: org,
            area_id: area,
            subject,
        }
    }

    #[tokio::test]
    async fn insert_then_get_returns_snapshot() {
        let cache = CandidateCache::new(Duration::from_secs(300), 16);
        let k = key(Uuid::new_v4(), Uuid::new_v4(), SubjectType::Resident);
        cache.insert(k, vec![]).await;
        assert!(cache.get(&k).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = CandidateCache::new(Duration::from_secs(60), 16);
        let k = key(Uuid::new_v4(), Uuid::new_v4(), SubjectType::Unknown);
        cache.insert(k, vec![]).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&k).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_area_drops_all_subjects() {
        let cache = CandidateCache::new(Duration::from_secs(300), 16);
        let org = Uuid::new_v4();
        let area = Uuid::new_v4();
        cache.insert(key(org, area, SubjectType::Resident), vec![]).await;
        cache.insert(key(org, area, SubjectType::Visitor), vec![]).await;
        let other_area = key(org, Uuid::new_v4(), SubjectType::Resident);
        cache.insert(other_area, vec![]).await;

        cache.invalidate_area(org, area).await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&other_area).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_org_is_tenant_scoped() {
        let cache = CandidateCache::new(Duration::from_secs(300), 16);
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        cache
            .insert(key(org_a, Uuid::new_v4(), SubjectType::Resident), vec![])
            .await;
        let keep = key(org_b, Uuid::new_v4(), SubjectType::Resident);
        cache.insert(keep, vec![]).await;

        cache.invalidate_org(org_a).await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&keep).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_entry() {
        let cache = CandidateCache::new(Duration::from_secs(300), 2);
        let first = key(Uuid::new_v4(), Uuid::new_v4(), SubjectType::Resident);
        cache.insert(first, vec![]).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = key(Uuid::new_v4(), Uuid::new_v4(), SubjectType::Resident);
        cache.insert(second, vec![]).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let third = key(Uuid::new_v4(), Uuid::new_v4(), SubjectType::Resident);
        cache.insert(third, vec![]).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&first).await.is_none());
        assert!(cache.get(&second).await.is_some());
        assert!(cache.get(&third).await.is_some());
    }
}
