use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel_layer::{user_group, ChannelLayer};
use crate::directory::Directory;
use crate::email::{EmailAdapter, EmailMessage};
use crate::error::{NotifyError, Result};
use crate::hub::ServerFrame;
use crate::ingress::TypeRegistry;
use crate::metrics::{
    CHANNEL_ATTEMPTS, CHANNEL_FAILURES, CHANNEL_SUCCESSES, DISPATCH_TIME, NOTIFICATIONS_DEFERRED,
};
use crate::models::{Channel, Frequency, Notification};
use crate::prefs::{channels_for, is_immediate, PreferenceStore};
use crate::store::NotificationStore;

/// Deterministic channel order: the durable in-app record first, then
/// realtime push, then email.
const CHANNEL_ORDER: [Channel; 3] = [Channel::InApp, Channel::Websocket, Channel::Email];

pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    prefs: Arc<dyn PreferenceStore>,
    types: Arc<TypeRegistry>,
    layer: Arc<dyn ChannelLayer>,
    email: Arc<EmailAdapter>,
    directory: Arc<dyn Directory>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        prefs: Arc<dyn PreferenceStore>,
        types: Arc<TypeRegistry>,
        layer: Arc<dyn ChannelLayer>,
        email: Arc<EmailAdapter>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            store,
            prefs,
            types,
            layer,
            email,
            directory,
        }
    }

    /// Decide which channels fire now, fire them, and settle the
    /// record's status.
    pub async fn dispatch_one(&self, notification: &Notification) -> Result<()> {
        let timer = DISPATCH_TIME.start_timer();
        let result = self.dispatch_inner(notification).await;
        timer.observe_duration();
        result
    }

    async fn dispatch_inner(&self, notification: &Notification) -> Result<()> {
        let now = Utc::now();
        if notification.is_expired(now) {
            warn!(id = %notification.id, "notification expired before send");
            self.store.mark_failed(notification.id, "expired").await?;
            return Ok(());
        }

        let ty = self
            .types
            .get(&notification.type_name)
            .ok_or_else(|| {
                NotifyError::NotFound(format!("notification type {}", notification.type_name))
            })?;
        let pref = self
            .prefs
            .get_or_create(&notification.recipient_id, ty)
            .await?;

        if pref.frequency == Frequency::Never {
            // Muted type: no digest bucket exists for it, so the record
            // settles now instead of waiting for a scheduler that will
            // never pick it up
            debug!(id = %notification.id, user = %notification.recipient_id,
                   "type muted, settling silently");
            self.store.mark_sent(notification.id).await?;
            return Ok(());
        }

        if !is_immediate(&pref, notification.priority) {
            debug!(id = %notification.id, user = %notification.recipient_id,
                   frequency = %pref.frequency, "deferring for digest");
            NOTIFICATIONS_DEFERRED.inc();
            self.store.mark_deferred(notification.id).await?;
            return Ok(());
        }

        let allowed = channels_for(&pref, notification.priority, now.time());

        let mut fired = 0u32;
        let mut succeeded = 0u32;
        let mut last_error: Option<String> = None;

        for channel in CHANNEL_ORDER {
            if !allowed.contains(&channel) || !capability(notification, channel) {
                continue;
            }
            fired += 1;
            let label = channel.to_string();
            CHANNEL_ATTEMPTS.with_label_values(&[label.as_str()]).inc();
            match self.fire(notification, channel).await {
                Ok(receipt_id) => {
                    succeeded += 1;
                    CHANNEL_SUCCESSES.with_label_values(&[label.as_str()]).inc();
                    self.store
                        .append_log(notification.id, channel, "success", receipt_id.as_deref(), None)
                        .await?;
                }
                Err(NotifyError::RecipientUnreachable { channel, reason }) => {
                    // Not a delivery failure: the channel simply does not
                    // apply to this recipient
                    fired -= 1;
                    debug!(id = %notification.id, channel = %channel, reason = %reason,
                           "channel unreachable, skipping");
                    self.store
                        .append_log(notification.id, channel, "skipped", None, Some(&reason))
                        .await?;
                }
                Err(e) => {
                    CHANNEL_FAILURES.with_label_values(&[label.as_str()]).inc();
                    warn!(id = %notification.id, channel = %channel, error = %e,
                          "channel delivery failed");
                    self.store
                        .append_log(notification.id, channel, "failed", None, Some(&e.to_string()))
                        .await?;
                    last_error = Some(e.to_string());
                }
            }
        }

        if succeeded > 0 || fired == 0 {
            // Zero fired channels still counts as a (silent) send; the
            // in-app record exists regardless
            self.store.mark_sent(notification.id).await?;
        } else {
            let reason = last_error.unwrap_or_else(|| "all channels failed".to_string());
            self.store.mark_failed(notification.id, &reason).await?;
        }
        Ok(())
    }

    async fn fire(&self, notification: &Notification, channel: Channel) -> Result<Option<String>> {
        match channel {
            // The stored record is the in-app delivery; it was durable
            // before this dispatch began
            Channel::InApp => Ok(None),

            Channel::Websocket => {
                let frame = ServerFrame::NewNotification {
                    notification: notification.clone(),
                };
                self.layer
                    .publish(
                        &user_group(&notification.recipient_id),
                        &serde_json::to_string(&frame)?,
                    )
                    .await?;
                Ok(None)
            }

            Channel::Email => {
                let contact = self
                    .directory
                    .user_contact(&notification.recipient_id)
                    .await?;
                let Some(contact) = contact.filter(|c| c.has_email()) else {
                    return Err(NotifyError::RecipientUnreachable {
                        channel: Channel::Email,
                        reason: "no email address on file".to_string(),
                    });
                };
                let message = EmailMessage {
                    to: contact.email.unwrap_or_default(),
                    to_name: contact.first_name,
                    subject: notification.title.clone(),
                    body_html: notification
                        .metadata
                        .get("body_html")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("<p>{}</p>", notification.message)),
                    body_text: notification.message.clone(),
                    ..Default::default()
                };
                let receipt = self.email.send(&message).await?;
                Ok(receipt.message_id)
            }
        }
    }
}

fn capability(notification: &Notification, channel: Channel) -> bool {
    match channel {
        Channel::InApp => notification.send_in_app,
        Channel::Websocket => notification.send_push,
        Channel::Email => notification.send_email,
    }
}

/// Dispatcher loop: drains the queue until the ingress hangs up.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<Notification>, dispatcher: Arc<Dispatcher>) {
    info!("Delivery dispatcher started");
    while let Some(notification) = rx.recv().await {
        if let Err(e) = dispatcher.dispatch_one(&notification).await {
            error!(id = %notification.id, error = %e, "dispatch failed");
        }
    }
    info!("Delivery dispatcher stopped");
}
