use async_trait::async_trait;
use chrono::NaiveTime;
use moka::future::Cache;
use sqlx::{Pool, Postgres, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::error::{NotifyError, Result};
use crate::models::{
    Channel, Frequency, NotificationType, PreferencePatch, Priority, QuietHours, UserPreference,
};

/// Channels a preference allows for the given priority at the given
/// wall-clock time. `frequency = never` silences everything; high and
/// urgent priorities bypass quiet hours; otherwise quiet hours suppress
/// email and push but leave the in-app record.
pub fn channels_for(
    pref: &UserPreference,
    priority: Priority,
    now: NaiveTime,
) -> HashSet<Channel> {
    let mut channels = HashSet::new();
    if pref.frequency == Frequency::Never {
        return channels;
    }

    let quiet = !priority.bypasses_quiet_hours() && in_quiet_hours(&pref.quiet_hours, now);

    if pref.in_app_enabled {
        channels.insert(Channel::InApp);
    }
    if pref.push_enabled && !quiet {
        channels.insert(Channel::Websocket);
    }
    if pref.email_enabled && !quiet {
        channels.insert(Channel::Email);
    }
    channels
}

/// Immediate delivery applies when the user asked for it or the
/// priority demands it; everything else waits for a digest.
pub fn is_immediate(pref: &UserPreference, priority: Priority) -> bool {
    pref.frequency == Frequency::Immediate || priority.bypasses_quiet_hours()
}

/// Quiet-hours membership; windows crossing midnight (start > end) are
/// cyclic: t >= start OR t <= end.
pub fn in_quiet_hours(quiet_hours: &QuietHours, t: NaiveTime) -> bool {
    if !quiet_hours.enabled {
        return false;
    }
    if quiet_hours.start <= quiet_hours.end {
        t >= quiet_hours.start && t <= quiet_hours.end
    } else {
        t >= quiet_hours.start || t <= quiet_hours.end
    }
}

fn apply_patch(pref: &mut UserPreference, patch: &PreferencePatch) {
    if let Some(v) = patch.email_enabled {
        pref.email_enabled = v;
    }
    if let Some(v) = patch.push_enabled {
        pref.push_enabled = v;
    }
    if let Some(v) = patch.in_app_enabled {
        pref.in_app_enabled = v;
    }
    if let Some(v) = patch.frequency {
        pref.frequency = v;
    }
    if let Some(v) = patch.quiet_hours {
        pref.quiet_hours = v;
    }
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Fetch the (user, type) row, creating it from the type's defaults
    /// on first sight.
    async fn get_or_create(
        &self,
        user_id: &str,
        notification_type: &NotificationType,
    ) -> Result<UserPreference>;

    async fn update(&self, user_id: &str, patch: PreferencePatch) -> Result<UserPreference>;

    /// Atomic over the whole set: either every patch applies or none.
    async fn bulk_update(
        &self,
        user_id: &str,
        patches: Vec<PreferencePatch>,
    ) -> Result<Vec<UserPreference>>;

    async fn set_frequency(
        &self,
        user_id: &str,
        type_name: &str,
        frequency: Frequency,
    ) -> Result<()>;

    async fn list_by_frequency(&self, frequency: Frequency) -> Result<Vec<UserPreference>>;
}

// ---------------------------------------------------------------------
// Postgres store with a read-through cache (60s TTL, invalidated on
// update; consistency is eventual but bounded by the TTL).
// ---------------------------------------------------------------------

pub struct PgPreferenceStore {
    pool: Pool<Postgres>,
    cache: Cache<String, UserPreference>,
}

impl PgPreferenceStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            cache: Cache::builder()
                .max_capacity(50_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    fn cache_key(user_id: &str, type_name: &str) -> String {
        format!("{}:{}", user_id, type_name)
    }

    fn row_to_pref(row: &sqlx::postgres::PgRow) -> Result<UserPreference> {
        let frequency: String = row.try_get("freq")?;
        Ok(UserPreference {
            user_id: row.try_get("user_id")?,
            type_name: row.try_get("type_name")?,
            email_enabled: row.try_get("email_en")?,
            push_enabled: row.try_get("push_en")?,
            in_app_enabled: row.try_get("in_app_en")?,
            frequency: frequency
                .parse()
                .map_err(|e: String| NotifyError::Config(e))?,
            quiet_hours: QuietHours {
                enabled: row.try_get("qh_en")?,
                start: row.try_get("qh_start")?,
                end: row.try_get("qh_end")?,
            },
        })
    }

    async fn fetch(&self, user_id: &str, type_name: &str) -> Result<Option<UserPreference>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, type_name, email_en, push_en, in_app_en, freq,
                   qh_en, qh_start, qh_end
            FROM user_preferences
            WHERE user_id = $1 AND type_name = $2
            "#,
        )
        .bind(user_id)
        .bind(type_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_pref).transpose()
    }

    async fn upsert(
        &self,
        executor: &mut sqlx::PgConnection,
        pref: &UserPreference,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences
                (user_id, type_name, email_en, push_en, in_app_en, freq,
                 qh_en, qh_start, qh_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, type_name) DO UPDATE
            SET email_en = $3, push_en = $4, in_app_en = $5, freq = $6,
                qh_en = $7, qh_start = $8, qh_end = $9
            "#,
        )
        .bind(&pref.user_id)
        .bind(&pref.type_name)
        .bind(pref.email_enabled)
        .bind(pref.push_enabled)
        .bind(pref.in_app_enabled)
        .bind(pref.frequency.to_string())
        .bind(pref.quiet_hours.enabled)
        .bind(pref.quiet_hours.start)
        .bind(pref.quiet_hours.end)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn get_or_create(
        &self,
        user_id: &str,
        notification_type: &NotificationType,
    ) -> Result<UserPreference> {
        let key = Self::cache_key(user_id, &notification_type.name);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        if let Some(pref) = self.fetch(user_id, &notification_type.name).await? {
            self.cache.insert(key, pref.clone()).await;
            return Ok(pref);
        }

        debug!(user_id = %user_id, type_name = %notification_type.name,
               "Creating preference row from type defaults");
        let pref = notification_type.default_preference(user_id);
        sqlx::query(
            r#"
            INSERT INTO user_preferences
                (user_id, type_name, email_en, push_en, in_app_en, freq,
                 qh_en, qh_start, qh_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, type_name) DO NOTHING
            "#,
        )
        .bind(&pref.user_id)
        .bind(&pref.type_name)
        .bind(pref.email_enabled)
        .bind(pref.push_enabled)
        .bind(pref.in_app_enabled)
        .bind(pref.frequency.to_string())
        .bind(pref.quiet_hours.enabled)
        .bind(pref.quiet_hours.start)
        .bind(pref.quiet_hours.end)
        .execute(&self.pool)
        .await?;

        // A concurrent insert may have won; read back the durable row.
        let pref = self
            .fetch(user_id, &notification_type.name)
            .await?
            .unwrap_or(pref);
        self.cache.insert(key, pref.clone()).await;
        Ok(pref)
    }

    async fn update(&self, user_id: &str, patch: PreferencePatch) -> Result<UserPreference> {
        let mut pref = self
            .fetch(user_id, &patch.type_name)
            .await?
            .ok_or_else(|| {
                NotifyError::NotFound(format!("preference {}:{}", user_id, patch.type_name))
            })?;
        apply_patch(&mut pref, &patch);

        let mut conn = self.pool.acquire().await?;
        self.upsert(&mut *conn, &pref).await?;
        self.cache
            .invalidate(&Self::cache_key(user_id, &patch.type_name))
            .await;
        Ok(pref)
    }

    async fn bulk_update(
        &self,
        user_id: &str,
        patches: Vec<PreferencePatch>,
    ) -> Result<Vec<UserPreference>> {
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(patches.len());

        for patch in &patches {
            let row = sqlx::query(
                r#"
                SELECT user_id, type_name, email_en, push_en, in_app_en, freq,
                       qh_en, qh_start, qh_end
                FROM user_preferences
                WHERE user_id = $1 AND type_name = $2
                FOR UPDATE
                "#,
            )
            .bind(user_id)
            .bind(&patch.type_name)
            .fetch_optional(&mut *tx)
            .await?;

            let mut pref = match row.as_ref().map(Self::row_to_pref).transpose()? {
                Some(pref) => pref,
                None => {
                    tx.rollback().await?;
                    return Err(NotifyError::NotFound(format!(
                        "preference {}:{}",
                        user_id, patch.type_name
                    )));
                }
            };
            apply_patch(&mut pref, patch);
            self.upsert(&mut *tx, &pref).await?;
            updated.push(pref);
        }

        tx.commit().await?;
        for patch in &patches {
            self.cache
                .invalidate(&Self::cache_key(user_id, &patch.type_name))
                .await;
        }
        Ok(updated)
    }

    async fn set_frequency(
        &self,
        user_id: &str,
        type_name: &str,
        frequency: Frequency,
    ) -> Result<()> {
        // Upsert: a user may toggle a type they never configured
        let defaults = QuietHours::default();
        sqlx::query(
            r#"
            INSERT INTO user_preferences
                (user_id, type_name, email_en, push_en, in_app_en, freq,
                 qh_en, qh_start, qh_end)
            VALUES ($1, $2, TRUE, TRUE, TRUE, $3, $4, $5, $6)
            ON CONFLICT (user_id, type_name) DO UPDATE SET freq = $3
            "#,
        )
        .bind(user_id)
        .bind(type_name)
        .bind(frequency.to_string())
        .bind(defaults.enabled)
        .bind(defaults.start)
        .bind(defaults.end)
        .execute(&self.pool)
        .await?;
        self.cache
            .invalidate(&Self::cache_key(user_id, type_name))
            .await;
        Ok(())
    }

    async fn list_by_frequency(&self, frequency: Frequency) -> Result<Vec<UserPreference>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, type_name, email_en, push_en, in_app_en, freq,
                   qh_en, qh_start, qh_end
            FROM user_preferences
            WHERE freq = $1
            "#,
        )
        .bind(frequency.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_pref).collect()
    }
}

// ---------------------------------------------------------------------
// In-memory store for tests and single-process development.
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPreferenceStore {
    rows: Mutex<HashMap<(String, String), UserPreference>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a fully-specified preference row.
    pub fn seed(&self, pref: UserPreference) {
        self.rows
            .lock()
            .unwrap()
            .insert((pref.user_id.clone(), pref.type_name.clone()), pref);
    }

    /// Test helper: read a row without creating it.
    pub fn get(&self, user_id: &str, type_name: &str) -> Option<UserPreference> {
        self.rows
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), type_name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get_or_create(
        &self,
        user_id: &str,
        notification_type: &NotificationType,
    ) -> Result<UserPreference> {
        let mut rows = self.rows.lock().unwrap();
        let key = (user_id.to_string(), notification_type.name.clone());
        Ok(rows
            .entry(key)
            .or_insert_with(|| notification_type.default_preference(user_id))
            .clone())
    }

    async fn update(&self, user_id: &str, patch: PreferencePatch) -> Result<UserPreference> {
        let mut rows = self.rows.lock().unwrap();
        let key = (user_id.to_string(), patch.type_name.clone());
        let pref = rows.get_mut(&key).ok_or_else(|| {
            NotifyError::NotFound(format!("preference {}:{}", user_id, patch.type_name))
        })?;
        apply_patch(pref, &patch);
        Ok(pref.clone())
    }

    async fn bulk_update(
        &self,
        user_id: &str,
        patches: Vec<PreferencePatch>,
    ) -> Result<Vec<UserPreference>> {
        let mut rows = self.rows.lock().unwrap();
        // Validate first so the set applies atomically
        for patch in &patches {
            let key = (user_id.to_string(), patch.type_name.clone());
            if !rows.contains_key(&key) {
                return Err(NotifyError::NotFound(format!(
                    "preference {}:{}",
                    user_id, patch.type_name
                )));
            }
        }
        let mut updated = Vec::with_capacity(patches.len());
        for patch in &patches {
            let key = (user_id.to_string(), patch.type_name.clone());
            let pref = rows.get_mut(&key).unwrap();
            apply_patch(pref, patch);
            updated.push(pref.clone());
        }
        Ok(updated)
    }

    async fn set_frequency(
        &self,
        user_id: &str,
        type_name: &str,
        frequency: Frequency,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let key = (user_id.to_string(), type_name.to_string());
        rows.entry(key)
            .or_insert_with(|| UserPreference {
                user_id: user_id.to_string(),
                type_name: type_name.to_string(),
                email_enabled: true,
                push_enabled: true,
                in_app_enabled: true,
                frequency,
                quiet_hours: QuietHours::default(),
            })
            .frequency = frequency;
        Ok(())
    }

    async fn list_by_frequency(&self, frequency: Frequency) -> Result<Vec<UserPreference>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|p| p.frequency == frequency)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn pref() -> UserPreference {
        UserPreference {
            user_id: "u1".into(),
            type_name: "song-approved".into(),
            email_enabled: true,
            push_enabled: true,
            in_app_enabled: true,
            frequency: Frequency::Immediate,
            quiet_hours: QuietHours::default(),
        }
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn never_frequency_silences_all_channels() {
        let mut p = pref();
        p.frequency = Frequency::Never;
        assert!(channels_for(&p, Priority::Urgent, t(12, 0)).is_empty());
    }

    #[test]
    fn quiet_hours_suppress_external_channels_only() {
        let mut p = pref();
        p.quiet_hours = QuietHours {
            enabled: true,
            start: t(22, 0),
            end: t(8, 0),
        };
        // 23:30, normal priority: only the in-app record
        let channels = channels_for(&p, Priority::Normal, t(23, 30));
        assert_eq!(channels, HashSet::from([Channel::InApp]));

        // Urgent bypasses quiet hours
        let channels = channels_for(&p, Priority::Urgent, t(23, 30));
        assert!(channels.contains(&Channel::Email));
        assert!(channels.contains(&Channel::Websocket));
    }

    #[test]
    fn quiet_hours_window_crosses_midnight() {
        let qh = QuietHours {
            enabled: true,
            start: t(22, 0),
            end: t(8, 0),
        };
        assert!(in_quiet_hours(&qh, t(23, 30)));
        assert!(in_quiet_hours(&qh, t(3, 0)));
        assert!(in_quiet_hours(&qh, t(8, 0)));
        assert!(!in_quiet_hours(&qh, t(12, 0)));
        assert!(!in_quiet_hours(&qh, t(21, 59)));

        let same_day = QuietHours {
            enabled: true,
            start: t(13, 0),
            end: t(14, 0),
        };
        assert!(in_quiet_hours(&same_day, t(13, 30)));
        assert!(!in_quiet_hours(&same_day, t(14, 1)));
    }

    #[test]
    fn immediate_when_frequency_or_priority_demands() {
        let mut p = pref();
        assert!(is_immediate(&p, Priority::Low));

        p.frequency = Frequency::Daily;
        assert!(!is_immediate(&p, Priority::Normal));
        assert!(is_immediate(&p, Priority::High));
        assert!(is_immediate(&p, Priority::Urgent));
    }

    #[tokio::test]
    async fn memory_store_creates_from_type_defaults() {
        let store = MemoryPreferenceStore::new();
        let ty = NotificationType {
            name: "welcome".into(),
            category: Category::System,
            email_default: true,
            push_default: false,
            in_app_default: true,
            template: "welcome".into(),
        };
        let created = store.get_or_create("u9", &ty).await.unwrap();
        assert!(created.email_enabled);
        assert!(!created.push_enabled);
        assert_eq!(created.frequency, Frequency::Immediate);

        // Second read returns the same row, not fresh defaults
        store
            .update(
                "u9",
                PreferencePatch {
                    type_name: "welcome".into(),
                    push_enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let again = store.get_or_create("u9", &ty).await.unwrap();
        assert!(again.push_enabled);
    }

    #[tokio::test]
    async fn bulk_update_is_atomic() {
        let store = MemoryPreferenceStore::new();
        store.seed(pref());

        let patches = vec![
            PreferencePatch {
                type_name: "song-approved".into(),
                email_enabled: Some(false),
                ..Default::default()
            },
            PreferencePatch {
                type_name: "does-not-exist".into(),
                email_enabled: Some(false),
                ..Default::default()
            },
        ];
        assert!(store.bulk_update("u1", patches).await.is_err());

        // First patch must not have applied
        let unchanged = store
            .update(
                "u1",
                PreferencePatch {
                    type_name: "song-approved".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(unchanged.email_enabled);
    }
}
