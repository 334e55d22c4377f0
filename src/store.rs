use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{NotifyError, Result};
use crate::models::{
    Channel, DeliveryLog, Frequency, NewNotification, Notification, NotificationStatus,
};

/// Terminal statuses never transition again (except failed -> pending
/// through the bounded retry path).
fn is_terminal(status: NotificationStatus) -> bool {
    matches!(
        status,
        NotificationStatus::Read | NotificationStatus::Failed
    )
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new record: status=pending, created_at=now, expiry
    /// computed from the template's expiry window.
    async fn create(&self, new: NewNotification) -> Result<Notification>;

    async fn get(&self, id: Uuid) -> Result<Notification>;

    /// Newest first.
    async fn list_for_user(
        &self,
        user_id: &str,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>>;

    /// Unread records for the websocket greeting, newest first.
    async fn list_unread(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>>;

    async fn count_unread(&self, user_id: &str) -> Result<i64>;

    /// Idempotent, forward-only marks. A mark that the record has
    /// already passed is a no-op success; marks against a terminal
    /// record are treated as idempotently-succeeded.
    async fn mark_sent(&self, id: Uuid) -> Result<()>;
    async fn mark_delivered(&self, id: Uuid) -> Result<()>;
    async fn mark_read(&self, id: Uuid) -> Result<()>;
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()>;

    async fn mark_all_read(&self, user_id: &str) -> Result<u64>;

    /// Flag a record as waiting for the next digest instead of
    /// immediate delivery.
    async fn mark_deferred(&self, id: Uuid) -> Result<()>;

    /// Deferred, not-yet-digested records for a (user, type) in the
    /// given window.
    async fn list_deferred(
        &self,
        user_id: &str,
        type_name: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Notification>>;

    /// Stamp a digested record: digest_id in metadata, status sent.
    async fn complete_digest_item(&self, id: Uuid, digest_id: Uuid) -> Result<()>;

    /// At-most-one digest per (user, frequency, window); returns false
    /// when another run already claimed it.
    async fn try_claim_digest_run(
        &self,
        user_id: &str,
        frequency: Frequency,
        window_start: DateTime<Utc>,
    ) -> Result<bool>;

    /// Undo a window claim whose digest could not be sent, so the next
    /// tick can try again.
    async fn release_digest_run(
        &self,
        user_id: &str,
        frequency: Frequency,
        window_start: DateTime<Utc>,
    ) -> Result<()>;

    /// Transactional select+update: every non-terminal record whose
    /// expiry passed becomes terminal failed; returns the ids touched.
    async fn claim_expired(&self, before: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Failed records with retry budget left and time on the clock.
    async fn list_failed_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Notification>>;

    /// Pending, non-deferred records abandoned by a shutdown mid-flight;
    /// the sweep hands them back to the dispatcher.
    async fn list_stale_pending(&self, created_before: DateTime<Utc>)
        -> Result<Vec<Notification>>;

    /// Guarded failed -> pending edge; bumps retry_count. Errors with
    /// RetryBudgetExceeded once the budget is spent.
    async fn retry_reset(&self, id: Uuid) -> Result<Notification>;

    /// Append-only per-channel attempt log.
    async fn append_log(
        &self,
        notification_id: Uuid,
        channel: Channel,
        status: &str,
        email_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn last_attempt_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>>;

    async fn logs_for(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>>;

    /// At-least-once dedup: true when this fingerprint is new.
    async fn claim_event(&self, fingerprint: &str) -> Result<bool>;
}

fn build_notification(new: NewNotification, now: DateTime<Utc>) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        recipient_id: new.recipient_id,
        sender_id: new.sender_id,
        type_name: new.type_name,
        priority: new.priority,
        status: NotificationStatus::Pending,
        title: new.title,
        message: new.message,
        action_url: new.action_url,
        action_text: new.action_text,
        related_kind: new.related_kind,
        related_id: new.related_id,
        metadata: if new.metadata.is_null() {
            serde_json::json!({})
        } else {
            new.metadata
        },
        created_at: now,
        sent_at: None,
        delivered_at: None,
        read_at: None,
        expires_at: now + Duration::minutes(new.expiry_minutes),
        retry_count: 0,
        max_retries: new.max_retries,
        deferred: false,
        send_email: new.send_email,
        send_push: new.send_push,
        send_in_app: new.send_in_app,
    }
}

// ---------------------------------------------------------------------
// Postgres store. Status transitions are optimistic CAS updates
// (`WHERE status = $expected`); a lost race is resolved by re-reading.
// ---------------------------------------------------------------------

pub struct PgNotificationStore {
    pool: Pool<Postgres>,
}

impl PgNotificationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn row_to_notification(row: &sqlx::postgres::PgRow) -> Result<Notification> {
        let status: String = row.try_get("status")?;
        let priority: String = row.try_get("priority")?;
        Ok(Notification {
            id: row.try_get("id")?,
            recipient_id: row.try_get("recipient_id")?,
            sender_id: row.try_get("sender_id")?,
            type_name: row.try_get("type_name")?,
            priority: priority
                .parse()
                .map_err(|e: String| NotifyError::Config(e))?,
            status: status.parse().map_err(|e: String| NotifyError::Config(e))?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            action_url: row.try_get("action_url")?,
            action_text: row.try_get("action_text")?,
            related_kind: row.try_get("related_kind")?,
            related_id: row.try_get("related_id")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            delivered_at: row.try_get("delivered_at")?,
            read_at: row.try_get("read_at")?,
            expires_at: row.try_get("expires_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            deferred: row.try_get("deferred")?,
            send_email: row.try_get("send_email")?,
            send_push: row.try_get("send_push")?,
            send_in_app: row.try_get("send_in_app")?,
        })
    }

    const COLUMNS: &'static str = "id, recipient_id, sender_id, type_name, priority, status, \
         title, message, action_url, action_text, related_kind, related_id, metadata, \
         created_at, sent_at, delivered_at, read_at, expires_at, retry_count, max_retries, \
         deferred, send_email, send_push, send_in_app";

    /// CAS a record from `from` to `to`, stamping `stamp_col` if given.
    /// Returns true when this call performed the transition.
    async fn cas(
        &self,
        id: Uuid,
        from: NotificationStatus,
        to: NotificationStatus,
        stamp_col: Option<&str>,
    ) -> Result<bool> {
        let stamp = stamp_col
            .map(|col| format!(", {} = COALESCE({}, NOW())", col, col))
            .unwrap_or_default();
        let sql = format!(
            "UPDATE notifications SET status = $1{} WHERE id = $2 AND status = $3",
            stamp
        );
        let result = sqlx::query(&sql)
            .bind(to.to_string())
            .bind(id)
            .bind(from.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drive a record forward to `target` along the legal edges,
    /// resolving races by re-reading. Terminal records absorb marks.
    async fn advance(&self, id: Uuid, target: NotificationStatus) -> Result<()> {
        use NotificationStatus::*;
        // Bounded: each iteration either transitions or observes progress.
        for _ in 0..4 {
            let current = self.get(id).await?.status;
            if current == target || is_terminal(current) {
                return Ok(());
            }
            let step = match (current, target) {
                (Pending, Sent) | (Pending, Delivered) | (Pending, Read) => (Pending, Sent, Some("sent_at")),
                (Sent, Delivered) => (Sent, Delivered, Some("delivered_at")),
                (Sent, Read) => (Sent, Read, Some("read_at")),
                (Delivered, Read) => (Delivered, Read, Some("read_at")),
                // Already past the target: idempotent no-op
                (Sent, Sent) | (Delivered, Sent) | (Read, _) => return Ok(()),
                (Delivered, Delivered) => return Ok(()),
                _ => return Ok(()),
            };
            self.cas(id, step.0, step.1, step.2).await?;
        }
        Err(NotifyError::StorageConflict(id))
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification> {
        let n = build_notification(new, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, recipient_id, sender_id, type_name, priority, status, title, message,
                 action_url, action_text, related_kind, related_id, metadata, created_at,
                 expires_at, retry_count, max_retries, deferred, send_email, send_push,
                 send_in_app)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(n.id)
        .bind(&n.recipient_id)
        .bind(&n.sender_id)
        .bind(&n.type_name)
        .bind(n.priority.to_string())
        .bind(n.status.to_string())
        .bind(&n.title)
        .bind(&n.message)
        .bind(&n.action_url)
        .bind(&n.action_text)
        .bind(&n.related_kind)
        .bind(&n.related_id)
        .bind(&n.metadata)
        .bind(n.created_at)
        .bind(n.expires_at)
        .bind(n.retry_count)
        .bind(n.max_retries)
        .bind(n.deferred)
        .bind(n.send_email)
        .bind(n.send_push)
        .bind(n.send_in_app)
        .execute(&self.pool)
        .await?;
        Ok(n)
    }

    async fn get(&self, id: Uuid) -> Result<Notification> {
        let sql = format!("SELECT {} FROM notifications WHERE id = $1", Self::COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| NotifyError::NotFound(format!("notification {}", id)))?;
        Self::row_to_notification(&row)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM notifications WHERE recipient_id = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3 OFFSET $4",
                    Self::COLUMNS
                );
                sqlx::query(&sql)
                    .bind(user_id)
                    .bind(status.to_string())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM notifications WHERE recipient_id = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                    Self::COLUMNS
                );
                sqlx::query(&sql)
                    .bind(user_id)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_notification).collect()
    }

    async fn list_unread(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications WHERE recipient_id = $1 \
             AND status IN ('pending', 'sent', 'delivered') \
             ORDER BY created_at DESC LIMIT $2",
            Self::COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_notification).collect()
    }

    async fn count_unread(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = $1 \
             AND status IN ('pending', 'sent', 'delivered')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<()> {
        self.advance(id, NotificationStatus::Sent).await
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<()> {
        self.advance(id, NotificationStatus::Delivered).await
    }

    async fn mark_read(&self, id: Uuid) -> Result<()> {
        self.advance(id, NotificationStatus::Read).await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'failed',
                metadata = jsonb_set(COALESCE(metadata, '{}'::jsonb),
                                     '{failure_reason}', to_jsonb($1::text))
            WHERE id = $2 AND status IN ('pending', 'sent')
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race or already terminal; both are fine
            debug!(id = %id, "mark_failed found no pending/sent row");
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'read',
                sent_at = COALESCE(sent_at, NOW()),
                read_at = COALESCE(read_at, NOW())
            WHERE recipient_id = $1 AND status IN ('pending', 'sent', 'delivered')
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_deferred(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE notifications SET deferred = TRUE WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_deferred(
        &self,
        user_id: &str,
        type_name: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications \
             WHERE recipient_id = $1 AND type_name = $2 AND deferred = TRUE \
             AND status = 'pending' AND metadata->>'digest_id' IS NULL \
             AND created_at >= $3 AND created_at < $4 \
             ORDER BY created_at ASC",
            Self::COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(type_name)
            .bind(window_start)
            .bind(window_end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_notification).collect()
    }

    async fn complete_digest_item(&self, id: Uuid, digest_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'sent',
                sent_at = COALESCE(sent_at, NOW()),
                deferred = FALSE,
                metadata = jsonb_set(COALESCE(metadata, '{}'::jsonb),
                                     '{digest_id}', to_jsonb($1::text))
            WHERE id = $2 AND status = 'pending' AND metadata->>'digest_id' IS NULL
            "#,
        )
        .bind(digest_id.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_claim_digest_run(
        &self,
        user_id: &str,
        frequency: Frequency,
        window_start: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO digest_runs (user_id, frequency, window_start)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, frequency, window_start) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(frequency.to_string())
        .bind(window_start)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_digest_run(
        &self,
        user_id: &str,
        frequency: Frequency,
        window_start: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM digest_runs \
             WHERE user_id = $1 AND frequency = $2 AND window_start = $3",
        )
        .bind(user_id)
        .bind(frequency.to_string())
        .bind(window_start)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_expired(&self, before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'failed',
                metadata = jsonb_set(COALESCE(metadata, '{}'::jsonb),
                                     '{failure_reason}', '"expired"')
            WHERE expires_at < $1 AND status NOT IN ('failed', 'read')
            RETURNING id
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(NotifyError::from))
            .collect()
    }

    async fn list_failed_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications \
             WHERE status = 'failed' AND retry_count < max_retries AND expires_at >= $1 \
             AND COALESCE(metadata->>'failure_reason', '') <> 'expired' \
             ORDER BY created_at ASC",
            Self::COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_notification).collect()
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications \
             WHERE status = 'pending' AND deferred = FALSE AND created_at < $1 \
             ORDER BY created_at ASC",
            Self::COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(created_before)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_notification).collect()
    }

    async fn retry_reset(&self, id: Uuid) -> Result<Notification> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'pending', retry_count = retry_count + 1
            WHERE id = $1 AND status = 'failed' AND retry_count < max_retries
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(id).await?;
            if current.retry_count >= current.max_retries {
                return Err(NotifyError::RetryBudgetExceeded(id));
            }
            return Err(NotifyError::StorageConflict(id));
        }
        self.get(id).await
    }

    async fn append_log(
        &self,
        notification_id: Uuid,
        channel: Channel,
        status: &str,
        email_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_logs (id, notification_id, channel, status, email_id,
                                           error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification_id)
        .bind(channel.to_string())
        .bind(status)
        .bind(email_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_attempt_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM notification_logs WHERE notification_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    async fn logs_for(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, notification_id, channel, status, email_id, error_message, created_at
            FROM notification_logs
            WHERE notification_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let channel: String = row.try_get("channel")?;
                Ok(DeliveryLog {
                    id: row.try_get("id")?,
                    notification_id: row.try_get("notification_id")?,
                    channel: channel.parse().map_err(|e: String| NotifyError::Config(e))?,
                    status: row.try_get("status")?,
                    email_id: row.try_get("email_id")?,
                    error_message: row.try_get("error_message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn claim_event(&self, fingerprint: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (fingerprint, processed_at)
            VALUES ($1, NOW())
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------
// In-memory store for tests and single-process development. One mutex
// around the whole state keeps transitions trivially serialized.
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    notifications: HashMap<Uuid, Notification>,
    logs: Vec<DeliveryLog>,
    processed_events: HashSet<String>,
    digest_runs: HashSet<(String, String, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryNotificationStore {
    state: Mutex<MemoryState>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: insert a record as-is, bypassing `create`.
    pub fn insert_raw(&self, n: Notification) {
        self.state.lock().unwrap().notifications.insert(n.id, n);
    }

    /// Test helper: rewrite a record's created_at to simulate age.
    pub fn backdate(&self, id: Uuid, created_at: DateTime<Utc>) {
        if let Some(n) = self.state.lock().unwrap().notifications.get_mut(&id) {
            n.created_at = created_at;
        }
    }

    fn advance(n: &mut Notification, target: NotificationStatus, now: DateTime<Utc>) {
        use NotificationStatus::*;
        if is_terminal(n.status) || n.status == target {
            return;
        }
        let rank = |s: NotificationStatus| match s {
            Pending => 0,
            Sent => 1,
            Delivered => 2,
            Read => 3,
            Failed => 4,
        };
        if rank(target) <= rank(n.status) {
            return;
        }
        if rank(n.status) < rank(Sent) && rank(target) >= rank(Sent) {
            n.sent_at.get_or_insert(now);
        }
        if target == Delivered {
            n.delivered_at.get_or_insert(now);
        }
        if target == Read {
            n.read_at.get_or_insert(now);
        }
        n.status = target;
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification> {
        let n = build_notification(new, Utc::now());
        self.state
            .lock()
            .unwrap()
            .notifications
            .insert(n.id, n.clone());
        Ok(n)
    }

    async fn get(&self, id: Uuid) -> Result<Notification> {
        self.state
            .lock()
            .unwrap()
            .notifications
            .get(&id)
            .cloned()
            .ok_or_else(|| NotifyError::NotFound(format!("notification {}", id)))
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        let state = self.state.lock().unwrap();
        let mut list: Vec<_> = state
            .notifications
            .values()
            .filter(|n| n.recipient_id == user_id)
            .filter(|n| status.map(|s| n.status == s).unwrap_or(true))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_unread(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let state = self.state.lock().unwrap();
        let mut list: Vec<_> = state
            .notifications
            .values()
            .filter(|n| n.recipient_id == user_id && n.status.is_unread())
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn count_unread(&self, user_id: &str) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .notifications
            .values()
            .filter(|n| n.recipient_id == user_id && n.status.is_unread())
            .count() as i64)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let n = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| NotifyError::NotFound(format!("notification {}", id)))?;
        Self::advance(n, NotificationStatus::Sent, Utc::now());
        Ok(())
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let n = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| NotifyError::NotFound(format!("notification {}", id)))?;
        Self::advance(n, NotificationStatus::Delivered, Utc::now());
        Ok(())
    }

    async fn mark_read(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let n = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| NotifyError::NotFound(format!("notification {}", id)))?;
        Self::advance(n, NotificationStatus::Read, Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.notifications.get_mut(&id) {
            if matches!(
                n.status,
                NotificationStatus::Pending | NotificationStatus::Sent
            ) {
                n.status = NotificationStatus::Failed;
                if let Some(map) = n.metadata.as_object_mut() {
                    map.insert("failure_reason".into(), serde_json::json!(reason));
                }
            }
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut count = 0;
        for n in state.notifications.values_mut() {
            if n.recipient_id == user_id && n.status.is_unread() {
                Self::advance(n, NotificationStatus::Read, now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_deferred(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.notifications.get_mut(&id) {
            if n.status == NotificationStatus::Pending {
                n.deferred = true;
            }
        }
        Ok(())
    }

    async fn list_deferred(
        &self,
        user_id: &str,
        type_name: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let state = self.state.lock().unwrap();
        let mut list: Vec<_> = state
            .notifications
            .values()
            .filter(|n| {
                n.recipient_id == user_id
                    && n.type_name == type_name
                    && n.deferred
                    && n.status == NotificationStatus::Pending
                    && n.metadata.get("digest_id").is_none()
                    && n.created_at >= window_start
                    && n.created_at < window_end
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn complete_digest_item(&self, id: Uuid, digest_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.notifications.get_mut(&id) {
            if n.status == NotificationStatus::Pending && n.metadata.get("digest_id").is_none() {
                n.status = NotificationStatus::Sent;
                n.sent_at.get_or_insert(Utc::now());
                n.deferred = false;
                if let Some(map) = n.metadata.as_object_mut() {
                    map.insert("digest_id".into(), serde_json::json!(digest_id.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn try_claim_digest_run(
        &self,
        user_id: &str,
        frequency: Frequency,
        window_start: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .digest_runs
            .insert((user_id.to_string(), frequency.to_string(), window_start)))
    }

    async fn release_digest_run(
        &self,
        user_id: &str,
        frequency: Frequency,
        window_start: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .digest_runs
            .remove(&(user_id.to_string(), frequency.to_string(), window_start));
        Ok(())
    }

    async fn claim_expired(&self, before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        for n in state.notifications.values_mut() {
            if n.expires_at < before && !is_terminal(n.status) {
                n.status = NotificationStatus::Failed;
                if let Some(map) = n.metadata.as_object_mut() {
                    map.insert("failure_reason".into(), serde_json::json!("expired"));
                }
                claimed.push(n.id);
            }
        }
        Ok(claimed)
    }

    async fn list_failed_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let state = self.state.lock().unwrap();
        let mut list: Vec<_> = state
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Failed
                    && n.retry_count < n.max_retries
                    && n.expires_at >= now
                    && n.metadata.get("failure_reason").and_then(|v| v.as_str())
                        != Some("expired")
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let state = self.state.lock().unwrap();
        let mut list: Vec<_> = state
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Pending
                    && !n.deferred
                    && n.created_at < created_before
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn retry_reset(&self, id: Uuid) -> Result<Notification> {
        let mut state = self.state.lock().unwrap();
        let n = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| NotifyError::NotFound(format!("notification {}", id)))?;
        if n.status != NotificationStatus::Failed {
            return Err(NotifyError::StorageConflict(id));
        }
        if n.retry_count >= n.max_retries {
            return Err(NotifyError::RetryBudgetExceeded(id));
        }
        n.status = NotificationStatus::Pending;
        n.retry_count += 1;
        Ok(n.clone())
    }

    async fn append_log(
        &self,
        notification_id: Uuid,
        channel: Channel,
        status: &str,
        email_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.logs.push(DeliveryLog {
            id: Uuid::new_v4(),
            notification_id,
            channel,
            status: status.to_string(),
            email_id: email_id.map(str::to_string),
            error_message: error_message.map(str::to_string),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn last_attempt_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|l| l.notification_id == id)
            .map(|l| l.created_at)
            .max())
    }

    async fn logs_for(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|l| l.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn claim_event(&self, fingerprint: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.processed_events.insert(fingerprint.to_string()))
    }
}
