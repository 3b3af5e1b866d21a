//! Scenario: a rule write invalidates the candidate cache via the bus.
//!
//! Node-local propagation: register caches the (empty) candidate set,
//! a rule upsert publishes `PolicyChanged`, the invalidator drops the
//! snapshot, and the next evaluation sees the new rule.
//!
//! Skips gracefully when `ACP_DATABASE_URL` is not set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use acp_access::{
    spawn_cache_invalidator, AccessService, CandidateProvider, EventPublisher, PolicyService,
    RegisterAttempt,
};
use acp_db::rules::RuleUpsert;
use acp_engine::{CandidateCache, ConfigZoneProvider};
use acp_schemas::{DecisionResult, Direction, RuleAction, RuleState, SubjectType};

#[tokio::test]
async fn rule_upsert_invalidates_and_next_evaluation_sees_it() -> anyhow::Result<()> {
    if std::env::var(acp_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: ACP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = acp_db::testkit_db_pool().await?;

    let org = Uuid::new_v4();
    let area = Uuid::new_v4();
    let device = Uuid::new_v4();
    acp_db::insert_organization(&pool, org, "policy org").await?;
    acp_db::insert_area(&pool, org, area, "wing-a", None).await?;
    acp_db::insert_device(&pool, org, area, device, "door-3").await?;

    let publisher = EventPublisher::new(64);
    let cache = Arc::new(CandidateCache::new(Duration::from_secs(300), 64));
    let invalidator = spawn_cache_invalidator(Arc::clone(&cache), publisher.subscribe());

    let access = AccessService::new(
        pool.clone(),
        CandidateProvider::new(pool.clone(), Arc::clone(&cache)),
        Arc::new(ConfigZoneProvider::new(chrono_tz::UTC, HashMap::new())),
        publisher.clone(),
    );
    let policy = PolicyService::new(pool.clone(), publisher);

    let request = |key: &str| RegisterAttempt {
        device_id: device,
        area_id: area,
        direction: Direction::In,
        auth_method: Some("CARD".to_string()),
        credential_ref: None,
        raw_payload: None,
        idempotency_key: key.to_string(),
        gateway_request_id: None,
        occurred_at: None,
    };

    // No rules yet: DENY, and the empty candidate set is now cached.
    let before = access.register(org, request("K-before")).await?;
    assert_eq!(before.decision_result, DecisionResult::Deny);
    assert_eq!(cache.len().await, 1);

    // Rule write publishes PolicyChanged; the subscriber drops the area.
    policy
        .upsert_rule(RuleUpsert {
            rule_id: Uuid::new_v4(),
            org_id: org,
            area_id: area,
            device_id: None,
            subject_type: SubjectType::Unknown,
            direction: None,
            auth_method: None,
            action: RuleAction::Permit,
            priority: 100,
            state: RuleState::Active,
            message: None,
            valid_from_utc: None,
            valid_to_utc: None,
            daily_from_local: None,
            daily_to_local: None,
        })
        .await?;

    // Bounded wait for the invalidator task to drain the bus.
    for _ in 0..100 {
        if cache.len().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cache.len().await, 0, "snapshot must be invalidated");

    // Fresh evaluation reflects the new rule.
    let after = access.register(org, request("K-after")).await?;
    assert_eq!(after.decision_result, DecisionResult::Permit);

    invalidator.abort();
    Ok(())
}

#[tokio::test]
async fn rule_upsert_with_half_open_daily_window_is_rejected() -> anyhow::Result<()> {
    if std::env::var(acp_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: ACP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = acp_db::testkit_db_pool().await?;

    let policy = PolicyService::new(pool, EventPublisher::new(8));
    let err = policy
        .upsert_rule(RuleUpsert {
            rule_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            area_id: Uuid::new_v4(),
            device_id: None,
            subject_type: SubjectType::Unknown,
            direction: None,
            auth_method: None,
            action: RuleAction::Permit,
            priority: 100,
            state: RuleState::Active,
            message: None,
            valid_from_utc: None,
            valid_to_utc: None,
            daily_from_local: chrono::NaiveTime::from_hms_opt(22, 0, 0),
            daily_to_local: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);
    Ok(())
}
