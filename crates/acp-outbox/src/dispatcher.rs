//! The outbox dispatcher worker.
//!
//! Each tick claims a batch of dispatchable rows, transports them one by
//! one, and completes each row with an ownership-safe update. Claims are
//! cooperative across nodes (skip-locked) and self-healing (TTL reclaim
//! plus a janitor sweep), so a crashed dispatcher never strands a row.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use acp_config::CoreConfig;
use acp_db::outbox::{
    outbox_claim_batch, outbox_mark_failed, outbox_mark_published, outbox_mark_retry,
    outbox_release_expired_locks, outbox_stats, LastError, OutboxEventRow,
};
use acp_schemas::{limits, truncate_chars, EventEnvelope};

use crate::backoff::backoff_delay;
use crate::transport::EventTransport;

/// Janitor + gauge cadence, in ticks.
const MAINTENANCE_EVERY: u64 = 10;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub interval: Duration,
    pub lock_ttl: Duration,
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub instance_id: String,
}

impl From<&CoreConfig> for DispatcherConfig {
    fn from(cfg: &CoreConfig) -> Self {
        Self {
            batch_size: cfg.dispatch_batch_size,
            interval: cfg.dispatch_interval,
            lock_ttl: cfg.lock_ttl,
            max_attempts: cfg.retry_max_attempts,
            base_backoff: cfg.retry_base_backoff,
            max_backoff: cfg.retry_max_backoff,
            instance_id: cfg.instance_id.clone(),
        }
    }
}

/// What one tick accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    /// Rows whose claim was lost to TTL reclaim between claim and update.
    pub claim_lost: usize,
}

pub struct Dispatcher {
    pool: PgPool,
    transport: Arc<dyn EventTransport>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(pool: PgPool, transport: Arc<dyn EventTransport>, cfg: DispatcherConfig) -> Self {
        Self {
            pool,
            transport,
            cfg,
        }
    }

    /// Run the dispatch loop at fixed cadence until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                instance = %self.cfg.instance_id,
                transport = self.transport.name(),
                "outbox dispatcher started"
            );
            let mut ticker = tokio::time::interval(self.cfg.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick_no: u64 = 0;
            loop {
                ticker.tick().await;
                tick_no += 1;

                if let Err(err) = self.tick().await {
                    error!(error = %err, "dispatch tick failed");
                }
                if tick_no % MAINTENANCE_EVERY == 0 {
                    self.maintenance().await;
                }
            }
        })
    }

    /// One dispatch pass: claim then transport-and-complete each row.
    pub async fn tick(&self) -> anyhow::Result<TickSummary> {
        let rows = outbox_claim_batch(
            &self.pool,
            self.cfg.batch_size,
            self.cfg.lock_ttl,
            &self.cfg.instance_id,
        )
        .await?;

        let mut summary = TickSummary {
            claimed: rows.len(),
            ..TickSummary::default()
        };

        for row in rows {
            match self.dispatch_one(&row).await {
                Ok(outcome) => match outcome {
                    DispatchOutcome::Published => summary.published += 1,
                    DispatchOutcome::Retried => summary.retried += 1,
                    DispatchOutcome::Failed => summary.failed += 1,
                    DispatchOutcome::ClaimLost => summary.claim_lost += 1,
                },
                Err(err) => {
                    // Completion update itself failed (DB trouble). The
                    // claim TTL will surface the row again.
                    error!(event_id = %row.event_id, error = %err, "outbox completion failed");
                }
            }
        }

        if summary.claimed > 0 {
            debug!(?summary, "dispatch tick");
        }
        Ok(summary)
    }

    async fn dispatch_one(&self, row: &OutboxEventRow) -> anyhow::Result<DispatchOutcome> {
        let envelope = envelope_for(row);

        match self.transport.deliver(&envelope).await {
            Ok(()) => {
                let owned = outbox_mark_published(
                    &self.pool,
                    row.event_id,
                    &self.cfg.instance_id,
                    self.cfg.lock_ttl,
                )
                .await?;
                if owned {
                    metrics::counter!("outbox_dispatched_total", "outcome" => "published")
                        .increment(1);
                    Ok(DispatchOutcome::Published)
                } else {
                    metrics::counter!("outbox_dispatched_total", "outcome" => "claim_lost")
                        .increment(1);
                    warn!(event_id = %row.event_id, "claim lost after successful delivery");
                    Ok(DispatchOutcome::ClaimLost)
                }
            }
            Err(failure) => {
                let last_error = LastError {
                    code: Some(failure.kind.code().to_string()),
                    message: truncate_chars(&failure.message, limits::DLQ_ERROR_MESSAGE)
                        .to_string(),
                    http_status: failure.http_status.map(i32::from),
                };
                let attempts_after = row.attempts + 1;

                if failure.is_retryable() && attempts_after < self.cfg.max_attempts {
                    let delay = backoff_delay(
                        row.attempts,
                        self.cfg.base_backoff,
                        self.cfg.max_backoff,
                        failure.retry_after,
                    );
                    let next = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    let owned = outbox_mark_retry(
                        &self.pool,
                        row.event_id,
                        &self.cfg.instance_id,
                        self.cfg.lock_ttl,
                        &last_error,
                        next,
                    )
                    .await?;
                    if owned {
                        metrics::counter!("outbox_dispatched_total", "outcome" => "retried")
                            .increment(1);
                        debug!(
                            event_id = %row.event_id,
                            attempts = attempts_after,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "delivery failed; retry scheduled"
                        );
                        Ok(DispatchOutcome::Retried)
                    } else {
                        Ok(DispatchOutcome::ClaimLost)
                    }
                } else {
                    let owned = outbox_mark_failed(
                        &self.pool,
                        row.event_id,
                        &self.cfg.instance_id,
                        self.cfg.lock_ttl,
                        &last_error,
                    )
                    .await?;
                    if owned {
                        metrics::counter!("outbox_dispatched_total", "outcome" => "failed")
                            .increment(1);
                        warn!(
                            event_id = %row.event_id,
                            attempts = attempts_after,
                            retryable = failure.is_retryable(),
                            error = %failure,
                            "delivery demoted to FAILED"
                        );
                        Ok(DispatchOutcome::Failed)
                    } else {
                        Ok(DispatchOutcome::ClaimLost)
                    }
                }
            }
        }
    }

    /// Janitor sweep + gauge refresh.
    async fn maintenance(&self) {
        match outbox_release_expired_locks(&self.pool, self.cfg.lock_ttl).await {
            Ok(0) => {}
            Ok(released) => warn!(released, "released expired outbox locks"),
            Err(err) => error!(error = %err, "lock janitor failed"),
        }
        if let Err(err) = self.publish_gauges().await {
            error!(error = %err, "outbox gauge refresh failed");
        }
    }

    /// Refresh the queue-depth and age gauges from one stats query.
    pub async fn publish_gauges(&self) -> anyhow::Result<()> {
        let stats = outbox_stats(&self.pool, self.cfg.lock_ttl).await?;
        metrics::gauge!("outbox_pending").set(stats.pending as f64);
        metrics::gauge!("outbox_inflight").set(stats.inflight as f64);
        metrics::gauge!("outbox_ready").set(stats.ready as f64);
        metrics::gauge!("outbox_failed").set(stats.failed as f64);
        metrics::gauge!("outbox_oldest_pending_age_seconds")
            .set(stats.oldest_pending_age_secs.unwrap_or(0) as f64);
        metrics::gauge!("outbox_oldest_ready_age_seconds")
            .set(stats.oldest_ready_age_secs.unwrap_or(0) as f64);
        metrics::gauge!("outbox_oldest_inflight_age_seconds")
            .set(stats.oldest_inflight_age_secs.unwrap_or(0) as f64);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Published,
    Retried,
    Failed,
    ClaimLost,
}

/// Build the wire envelope for a stored row.
fn envelope_for(row: &OutboxEventRow) -> EventEnvelope {
    EventEnvelope {
        id_event: row.event_id,
        org_id: row.org_id,
        event_type: row.event_type.clone(),
        aggregate_type: row.aggregate_type.clone(),
        aggregate_id: row.aggregate_id.clone(),
        occurred_at: row.occurred_at_utc,
        payload: row.payload.clone(),
    }
}
