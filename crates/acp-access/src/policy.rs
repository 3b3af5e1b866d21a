//! Policy-change publication and cluster-wide cache invalidation.
//!
//! Rule writes commit together with a `PolicyChanged` outbox row; the
//! in-process bus invalidates the local cache immediately, and remote
//! nodes receive the same event through the dispatcher and apply it via
//! [`apply_policy_envelope`]. Propagation is eventually consistent by
//! design — a remote node may evaluate against its prior snapshot until
//! the event lands.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use acp_db::rules::{upsert_rule, RuleUpsert};
use acp_engine::CandidateCache;
use acp_schemas::{
    events::{InvalidateAllRequested, PolicyChanged, PolicyChangeType},
    DomainEvent, EventEnvelope, RuleState,
};

use crate::{CoreError, EventPublisher};

pub struct PolicyService {
    pool: PgPool,
    publisher: EventPublisher,
}

impl PolicyService {
    pub fn new(pool: PgPool, publisher: EventPublisher) -> Self {
        Self { pool, publisher }
    }

    /// Insert or update a rule and publish the matching `PolicyChanged`.
    pub async fn upsert_rule(&self, rule: RuleUpsert) -> Result<PolicyChangeType, CoreError> {
        if rule.daily_from_local.is_some() != rule.daily_to_local.is_some() {
            return Err(CoreError::Validation(
                "daily window requires both bounds or neither".to_string(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::Unavailable(format!("begin transaction: {e}")))?;

        let inserted = upsert_rule(&mut *tx, &rule).await?;
        let change_type = if inserted {
            PolicyChangeType::Created
        } else if rule.state == RuleState::Inactive {
            PolicyChangeType::Deactivated
        } else {
            PolicyChangeType::Updated
        };

        let event = DomainEvent::PolicyChanged(PolicyChanged {
            org_id: rule.org_id,
            area_id: rule.area_id,
            rule_id: rule.rule_id,
            change_type,
            occurred_at: chrono::Utc::now(),
        });
        self.publisher.append_tx(&mut tx, &event).await?;

        tx.commit()
            .await
            .map_err(|e| CoreError::Unavailable(format!("commit failed: {e}")))?;

        let events = [event];
        self.publisher.fan_out(&events);
        self.publisher.audit(&self.pool, &events).await;

        info!(org_id = %rule.org_id, rule_id = %rule.rule_id, ?change_type, "rule upserted");
        Ok(change_type)
    }

    /// Publish a tenant-wide invalidation request.
    pub async fn invalidate_all(&self, org_id: Uuid) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::Unavailable(format!("begin transaction: {e}")))?;

        let event = DomainEvent::InvalidateAllRequested(InvalidateAllRequested {
            org_id,
            occurred_at: chrono::Utc::now(),
        });
        self.publisher.append_tx(&mut tx, &event).await?;

        tx.commit()
            .await
            .map_err(|e| CoreError::Unavailable(format!("commit failed: {e}")))?;

        let events = [event];
        self.publisher.fan_out(&events);
        self.publisher.audit(&self.pool, &events).await;

        info!(%org_id, "tenant-wide invalidation requested");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Invalidation subscriber
// ---------------------------------------------------------------------------

/// Apply one policy event to the local cache.
async fn apply_policy_event(cache: &CandidateCache, event: &DomainEvent) {
    match event {
        DomainEvent::PolicyChanged(e) => {
            cache.invalidate_area(e.org_id, e.area_id).await;
        }
        DomainEvent::InvalidateAllRequested(e) => {
            cache.invalidate_org(e.org_id).await;
        }
        _ => {}
    }
}

/// Subscribe the local candidate cache to the in-process bus.
///
/// On broadcast lag (dropped messages) the cache is cleared outright:
/// losing entries is safe, evaluating against a snapshot we were told to
/// drop is not.
pub fn spawn_cache_invalidator(
    cache: Arc<CandidateCache>,
    mut rx: broadcast::Receiver<DomainEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => apply_policy_event(&cache, &event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation bus lagged; clearing candidate cache");
                    cache.clear().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Apply a policy event delivered from another node's dispatcher.
///
/// Returns `true` when the envelope carried a policy event; non-policy
/// event types are ignored so the endpoint can receive the full stream.
pub async fn apply_policy_envelope(
    cache: &CandidateCache,
    envelope: &EventEnvelope,
) -> Result<bool, CoreError> {
    match envelope.event_type.as_str() {
        "policy.rule.changed" => {
            let payload: PolicyChanged = serde_json::from_str(&envelope.payload)
                .map_err(|e| CoreError::Validation(format!("malformed PolicyChanged: {e}")))?;
            cache.invalidate_area(payload.org_id, payload.area_id).await;
            Ok(true)
        }
        "policy.invalidate_all.requested" => {
            let payload: InvalidateAllRequested = serde_json::from_str(&envelope.payload)
                .map_err(|e| {
                    CoreError::Validation(format!("malformed InvalidateAllRequested: {e}"))
                })?;
            cache.invalidate_org(payload.org_id).await;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_schemas::SubjectType;
    use chrono::Utc;
    use std::time::Duration;

    fn empty_cache() -> Arc<CandidateCache> {
        Arc::new(CandidateCache::new(Duration::from_secs(300), 16))
    }

    #[tokio::test]
    async fn policy_changed_event_invalidates_area() {
        let org = Uuid::new_v4();
        let area = Uuid::new_v4();
        let cache = empty_cache();
        cache
            .insert(
                acp_engine::CacheKey {
                    org_id: org,
                    area_id: area,
                    subject: SubjectType::Resident,
                },
                vec![],
            )
            .await;

        let event = DomainEvent::PolicyChanged(PolicyChanged {
            org_id: org,
            area_id: area,
            rule_id: Uuid::new_v4(),
            change_type: PolicyChangeType::Updated,
            occurred_at: Utc::now(),
        });
        apply_policy_event(&cache, &event).await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn envelope_from_remote_node_invalidates() {
        let org = Uuid::new_v4();
        let area = Uuid::new_v4();
        let cache = empty_cache();
        cache
            .insert(
                acp_engine::CacheKey {
                    org_id: org,
                    area_id: area,
                    subject: SubjectType::Visitor,
                },
                vec![],
            )
            .await;

        let payload = PolicyChanged {
            org_id: org,
            area_id: area,
            rule_id: Uuid::new_v4(),
            change_type: PolicyChangeType::Created,
            occurred_at: Utc::now(),
        };
        let envelope = EventEnvelope {
            id_event: Uuid::new_v4(),
            org_id: org,
            event_type: "policy.rule.changed".to_string(),
            aggregate_type: "rule".to_string(),
            aggregate_id: payload.rule_id.to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::to_string(&payload).unwrap(),
        };

        let applied = apply_policy_envelope(&cache, &envelope).await.unwrap();
        assert!(applied);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn non_policy_envelope_is_ignored() {
        let cache = Arc::new(CandidateCache::new(Duration::from_secs(300), 16));
        let envelope = EventEnvelope {
            id_event: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            event_type: "access.decision.made".to_string(),
            aggregate_type: "attempt".to_string(),
            aggregate_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            payload: "{}".to_string(),
        };
        let applied = apply_policy_envelope(&cache, &envelope).await.unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn subscriber_applies_events_from_the_bus() {
        let org = Uuid::new_v4();
        let area = Uuid::new_v4();
        let cache = Arc::new(CandidateCache::new(Duration::from_secs(300), 16));
        cache
            .insert(
                acp_engine::CacheKey {
                    org_id: org,
                    area_id: area,
                    subject: SubjectType::Unknown,
                },
                vec![],
            )
            .await;

        let publisher = EventPublisher::new(16);
        let handle = spawn_cache_invalidator(Arc::clone(&cache), publisher.subscribe());

        publisher.fan_out(&[DomainEvent::InvalidateAllRequested(
            InvalidateAllRequested {
                org_id: org,
                occurred_at: Utc::now(),
            },
        )]);

        // Give the subscriber task a moment to drain the bus.
        for _ in 0..50 {
            if cache.len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len().await, 0);
        handle.abort();
    }
}
