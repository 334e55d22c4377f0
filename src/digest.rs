use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DigestConfig;
use crate::directory::Directory;
use crate::email::{EmailAdapter, EmailMessage};
use crate::error::Result;
use crate::metrics::DIGESTS_SENT;
use crate::models::{Channel, Frequency};
use crate::prefs::PreferenceStore;
use crate::store::NotificationStore;
use crate::templates::TemplateRegistry;

pub struct DigestScheduler {
    store: Arc<dyn NotificationStore>,
    prefs: Arc<dyn PreferenceStore>,
    templates: Arc<TemplateRegistry>,
    directory: Arc<dyn Directory>,
    email: Arc<EmailAdapter>,
    config: DigestConfig,
}

/// Tick timestamps within the same window share one idempotence key.
fn window_key(now: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
    let aligned = now.timestamp() - now.timestamp().rem_euclid(window_secs);
    Utc.timestamp_opt(aligned, 0).single().unwrap_or(now)
}

impl DigestScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        prefs: Arc<dyn PreferenceStore>,
        templates: Arc<TemplateRegistry>,
        directory: Arc<dyn Directory>,
        email: Arc<EmailAdapter>,
        config: DigestConfig,
    ) -> Self {
        Self {
            store,
            prefs,
            templates,
            directory,
            email,
            config,
        }
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    /// One scheduler pass for a frequency: drain each user's deferred
    /// bucket into a single digest email. Returns the digests sent.
    pub async fn run_tick(&self, frequency: Frequency, now: DateTime<Utc>) -> Result<u32> {
        let Some(window_secs) = frequency.window_secs() else {
            return Ok(0);
        };
        let window_start = now - Duration::seconds(window_secs);
        let key = window_key(now, window_secs);

        // user -> types they receive at this frequency
        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pref in self.prefs.list_by_frequency(frequency).await? {
            buckets.entry(pref.user_id).or_default().push(pref.type_name);
        }

        let mut sent = 0;
        for (user_id, type_names) in buckets {
            let mut items = Vec::new();
            for type_name in &type_names {
                items.extend(
                    self.store
                        .list_deferred(&user_id, type_name, window_start, now)
                        .await?,
                );
            }
            if items.is_empty() {
                continue;
            }
            if !self
                .store
                .try_claim_digest_run(&user_id, frequency, key)
                .await?
            {
                debug!(user = %user_id, frequency = %frequency, "digest window already claimed");
                continue;
            }

            let digest_id = Uuid::new_v4();
            items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            if let Err(e) = self.send_digest(&user_id, frequency, digest_id, &items).await {
                // Release the window so the next tick can retry; a
                // consumed claim would strand the items until expiry
                warn!(user = %user_id, frequency = %frequency, error = %e,
                      "digest send failed, releasing window claim");
                self.store
                    .release_digest_run(&user_id, frequency, key)
                    .await?;
                continue;
            }
            for item in &items {
                self.store.complete_digest_item(item.id, digest_id).await?;
                self.store
                    .append_log(
                        item.id,
                        Channel::Email,
                        "digest",
                        Some(digest_id.to_string().as_str()),
                        None,
                    )
                    .await?;
            }
            DIGESTS_SENT.inc();
            sent += 1;
            info!(user = %user_id, frequency = %frequency, count = items.len(),
                  digest_id = %digest_id, "digest sent");
        }
        Ok(sent)
    }

    async fn send_digest(
        &self,
        user_id: &str,
        frequency: Frequency,
        digest_id: Uuid,
        items: &[crate::models::Notification],
    ) -> Result<()> {
        let listing = items
            .iter()
            .map(|n| format!("- {}: {}", n.title, n.message))
            .collect::<Vec<_>>()
            .join("\n");
        let context = json!({
            "digest": {
                "id": digest_id.to_string(),
                "frequency": frequency.to_string(),
                "count": items.len(),
                "items": listing,
            }
        });
        let rendered = self.templates.render("digest", &context)?;

        let contact = self.directory.user_contact(user_id).await?;
        let Some(contact) = contact.filter(|c| c.has_email()) else {
            // Items are still drained below; an addressless user would
            // otherwise churn through every tick
            warn!(user = %user_id, "digest recipient has no email address");
            return Ok(());
        };

        self.email
            .send(&EmailMessage {
                to: contact.email.unwrap_or_default(),
                to_name: contact.first_name,
                subject: rendered.title,
                body_html: rendered.body_html,
                body_text: rendered.body_text,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// One periodic loop per enabled frequency, all stopping on shutdown.
pub async fn run_digest_scheduler(scheduler: Arc<DigestScheduler>, shutdown: broadcast::Sender<()>) {
    info!(
        frequencies = ?scheduler.config().enabled_frequencies,
        "Digest scheduler started"
    );
    let mut tasks = Vec::new();
    for &frequency in &scheduler.config().enabled_frequencies {
        let scheduler = scheduler.clone();
        let mut shutdown = shutdown.subscribe();
        let tick_secs = scheduler.config().tick_secs(frequency).max(1);
        tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(tick_secs));
            // The immediate first tick would race startup; skip it
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match scheduler.run_tick(frequency, Utc::now()).await {
                            Ok(sent) if sent > 0 => {
                                debug!(frequency = %frequency, sent, "digest tick complete");
                            }
                            Ok(_) => {}
                            Err(e) => error!(frequency = %frequency, error = %e, "digest tick failed"),
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    info!("Digest scheduler stopped");
}
