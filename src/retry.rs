use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::{NotifyError, Result};
use crate::metrics::{NOTIFICATIONS_EXPIRED, RETRIES_SCHEDULED};
use crate::models::Notification;
use crate::store::NotificationStore;

/// Exponential backoff: wait `2^retry_count * base` since the last
/// attempt before handing the record back to the dispatcher.
pub fn backoff(retry_count: i32, base_seconds: i64) -> Duration {
    let exponent = retry_count.clamp(0, 30) as u32;
    Duration::seconds(base_seconds.saturating_mul(1_i64 << exponent))
}

pub struct RetryWorker {
    store: Arc<dyn NotificationStore>,
    config: RetryConfig,
    dispatch_tx: mpsc::Sender<Notification>,
}

impl RetryWorker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        config: RetryConfig,
        dispatch_tx: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            store,
            config,
            dispatch_tx,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// One pass: expire what is overdue, re-queue failed records whose
    /// backoff elapsed, and rescue pending work abandoned by a previous
    /// shutdown. Returns (expired, retried).
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let expired = self.store.claim_expired(now).await?;
        if !expired.is_empty() {
            NOTIFICATIONS_EXPIRED.inc_by(expired.len() as f64);
            info!(count = expired.len(), "expired notifications failed terminally");
        }

        // Records left pending by an interrupted dispatch. Scanned before
        // the retry pass so a record reset below is not queued twice.
        let stale_cutoff = now - Duration::seconds(self.config.sweep_interval_secs as i64 * 2);
        for notification in self.store.list_stale_pending(stale_cutoff).await? {
            debug!(id = %notification.id, "re-queueing stale pending notification");
            if self.dispatch_tx.send(notification).await.is_err() {
                return Err(NotifyError::Layer("dispatch queue closed".to_string()));
            }
        }

        let mut retried = 0;
        for notification in self.store.list_failed_retryable(now).await? {
            let last_attempt = self
                .store
                .last_attempt_at(notification.id)
                .await?
                .unwrap_or(notification.created_at);
            let due = last_attempt + backoff(notification.retry_count, self.config.base_seconds);
            if now < due {
                debug!(id = %notification.id, due = %due, "retry not yet due");
                continue;
            }

            match self.store.retry_reset(notification.id).await {
                Ok(reset) => {
                    RETRIES_SCHEDULED.inc();
                    retried += 1;
                    debug!(id = %reset.id, retry_count = reset.retry_count, "retry scheduled");
                    if self.dispatch_tx.send(reset).await.is_err() {
                        return Err(NotifyError::Layer("dispatch queue closed".to_string()));
                    }
                }
                Err(NotifyError::RetryBudgetExceeded(id)) => {
                    debug!(id = %id, "retry budget exhausted, leaving terminal");
                }
                Err(NotifyError::StorageConflict(id)) => {
                    // Another worker or a concurrent mark got there first
                    debug!(id = %id, "lost retry race, skipping");
                }
                Err(e) => warn!(id = %notification.id, error = %e, "retry reset failed"),
            }
        }

        Ok((expired.len(), retried))
    }
}

pub async fn run_retry_worker(worker: Arc<RetryWorker>, shutdown: broadcast::Sender<()>) {
    info!(
        interval_secs = worker.config().sweep_interval_secs,
        "Retry worker started"
    );
    let mut shutdown = shutdown.subscribe();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        worker.config().sweep_interval_secs.max(1),
    ));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = worker.sweep(Utc::now()).await {
                    error!(error = %e, "retry sweep failed");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    info!("Retry worker stopped");
}
