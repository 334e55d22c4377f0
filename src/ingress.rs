use async_trait::async_trait;
use serde_json::json;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::directory::Directory;
use crate::error::{NotifyError, Result};
use crate::metrics::{EVENTS_DEDUPLICATED, EVENTS_INGESTED, NOTIFICATIONS_CREATED};
use crate::models::{
    Category, DomainEvent, NewNotification, Notification, NotificationType, Priority,
};
use crate::store::NotificationStore;
use crate::templates::TemplateRegistry;

// ---------------------------------------------------------------------
// Notification type registry
// ---------------------------------------------------------------------

pub struct TypeRegistry {
    types: HashMap<String, NotificationType>,
}

impl TypeRegistry {
    pub fn with_builtins() -> Self {
        let mut types = HashMap::new();
        for ty in builtin_types() {
            types.insert(ty.name.clone(), ty);
        }
        Self { types }
    }

    pub fn register(&mut self, ty: NotificationType) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&NotificationType> {
        self.types.get(name)
    }
}

fn notification_type(
    name: &str,
    category: Category,
    email: bool,
    push: bool,
    in_app: bool,
) -> NotificationType {
    NotificationType {
        name: name.to_string(),
        category,
        email_default: email,
        push_default: push,
        in_app_default: in_app,
        template: name.to_string(),
    }
}

/// Bootstrap type set; template names mirror type names.
pub fn builtin_types() -> Vec<NotificationType> {
    vec![
        notification_type("welcome", Category::System, true, true, true),
        notification_type("admin-new-user", Category::Admin, true, false, true),
        notification_type("song-submitted", Category::Music, true, true, true),
        notification_type("song-approved", Category::Music, true, true, true),
        notification_type("song-rejected", Category::Music, true, true, true),
        notification_type("song-distributed", Category::Music, true, true, true),
        notification_type("payment-received", Category::Payment, true, true, true),
        notification_type("payment-failed", Category::Payment, true, true, true),
        notification_type("contact-received", Category::Admin, true, false, true),
        notification_type("contact-replied", Category::System, true, true, true),
        notification_type("referral-credit", Category::System, true, true, true),
        notification_type("digest", Category::System, true, false, false),
    ]
}

// ---------------------------------------------------------------------
// Referral ledger. The paid-count increment and the credit decision
// happen in one atomic step so concurrent payments cannot both observe
// the same count.
// ---------------------------------------------------------------------

#[async_trait]
pub trait ReferralLedger: Send + Sync {
    /// Atomically bump the referrer's paid-referral count; returns the
    /// new count.
    async fn record_paid_referral(&self, referrer_id: &str) -> Result<i64>;
}

/// One free upload credit per two paid referrals.
pub const REFERRALS_PER_CREDIT: i64 = 2;

pub struct PgReferralLedger {
    pool: Pool<Postgres>,
}

impl PgReferralLedger {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralLedger for PgReferralLedger {
    async fn record_paid_referral(&self, referrer_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO referral_counters (referrer_id, paid_count)
            VALUES ($1, 1)
            ON CONFLICT (referrer_id)
            DO UPDATE SET paid_count = referral_counters.paid_count + 1
            RETURNING paid_count
            "#,
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[derive(Default)]
pub struct MemoryReferralLedger {
    counts: Mutex<HashMap<String, i64>>,
}

impl MemoryReferralLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: preset a referrer's paid count.
    pub fn seed(&self, referrer_id: &str, count: i64) {
        self.counts
            .lock()
            .unwrap()
            .insert(referrer_id.to_string(), count);
    }
}

#[async_trait]
impl ReferralLedger for MemoryReferralLedger {
    async fn record_paid_referral(&self, referrer_id: &str) -> Result<i64> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(referrer_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

// ---------------------------------------------------------------------
// Event bindings
// ---------------------------------------------------------------------

/// One notification to materialize for an event.
struct Planned {
    type_name: &'static str,
    priority: Priority,
    recipient_id: String,
    sender_id: Option<String>,
    context: serde_json::Value,
    related_kind: Option<String>,
}

/// Source plans map `pay_per_song` to silver and `yearly` to gold;
/// keep that table verbatim, other values pass through.
pub fn payment_tier(plan: &str) -> &str {
    match plan {
        "pay_per_song" => "silver",
        "yearly" => "gold",
        other => other,
    }
}

fn field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

// ---------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------

pub struct EventIngress {
    store: Arc<dyn NotificationStore>,
    templates: Arc<TemplateRegistry>,
    types: Arc<TypeRegistry>,
    directory: Arc<dyn Directory>,
    ledger: Arc<dyn ReferralLedger>,
    dispatch_tx: mpsc::Sender<Notification>,
}

impl EventIngress {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        templates: Arc<TemplateRegistry>,
        types: Arc<TypeRegistry>,
        directory: Arc<dyn Directory>,
        ledger: Arc<dyn ReferralLedger>,
        dispatch_tx: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            store,
            templates,
            types,
            directory,
            ledger,
            dispatch_tx,
        }
    }

    /// Translate one domain event into notification records. Duplicate
    /// deliveries are dropped on the event fingerprint; per-notification
    /// failures are absorbed so a bad binding cannot poison the producer.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<()> {
        if !self.store.claim_event(&event.fingerprint()).await? {
            EVENTS_DEDUPLICATED.inc();
            debug!(kind = %event.kind, entity = %event.entity_id, "duplicate event dropped");
            return Ok(());
        }
        EVENTS_INGESTED.inc();

        let planned = self.plan(event).await?;
        for plan in planned {
            if let Err(e) = self.materialize(event, plan).await {
                error!(kind = %event.kind, entity = %event.entity_id, error = %e,
                       "could not materialize notification");
            }
        }
        Ok(())
    }

    /// The binding table: event kind and transition to planned
    /// notifications.
    async fn plan(&self, event: &DomainEvent) -> Result<Vec<Planned>> {
        let prev = event.previous_status();
        let cur = event.current_status();
        let mut planned = Vec::new();

        match event.kind.as_str() {
            "user.created" => {
                let context = json!({ "user": event.current });
                planned.push(Planned {
                    type_name: "welcome",
                    priority: Priority::Normal,
                    recipient_id: event.entity_id.clone(),
                    sender_id: None,
                    context: context.clone(),
                    related_kind: Some("user".into()),
                });
                for admin in self.directory.admins().await? {
                    planned.push(Planned {
                        type_name: "admin-new-user",
                        priority: Priority::Normal,
                        recipient_id: admin.user_id,
                        sender_id: Some(event.entity_id.clone()),
                        context: context.clone(),
                        related_kind: Some("user".into()),
                    });
                }
            }

            "song.status" => {
                // Fires once per transition; repeats of the same edge are
                // already deduplicated upstream
                if prev == cur {
                    return Ok(planned);
                }
                let type_name = match cur {
                    Some("pending") => "song-submitted",
                    Some("approved") => "song-approved",
                    Some("rejected") => "song-rejected",
                    Some("distributed") => "song-distributed",
                    _ => return Ok(planned),
                };
                let priority = if type_name == "song-submitted" {
                    Priority::Normal
                } else {
                    Priority::High
                };
                let Some(artist) = field(&event.current, "artist_id") else {
                    warn!(entity = %event.entity_id, "song event without artist_id");
                    return Ok(planned);
                };
                planned.push(Planned {
                    type_name,
                    priority,
                    recipient_id: artist.to_string(),
                    sender_id: None,
                    context: json!({ "song": event.current }),
                    related_kind: Some("song".into()),
                });
            }

            "payment.status" => {
                let Some(user) = field(&event.current, "user_id") else {
                    warn!(entity = %event.entity_id, "payment event without user_id");
                    return Ok(planned);
                };
                let mut payment = event.current.clone();
                if let Some(plan) = field(&event.current, "plan").map(payment_tier) {
                    if let Some(map) = payment.as_object_mut() {
                        map.insert("tier".into(), json!(plan));
                    }
                }
                let context = json!({ "payment": payment });

                if cur == Some("success") && prev != Some("success") {
                    planned.push(Planned {
                        type_name: "payment-received",
                        priority: Priority::High,
                        recipient_id: user.to_string(),
                        sender_id: None,
                        context,
                        related_kind: Some("payment".into()),
                    });
                } else if cur == Some("failed") && prev != Some("failed") {
                    planned.push(Planned {
                        type_name: "payment-failed",
                        priority: Priority::Urgent,
                        recipient_id: user.to_string(),
                        sender_id: None,
                        context,
                        related_kind: Some("payment".into()),
                    });
                }
            }

            "contact.created" => {
                let context = json!({ "contact": event.current });
                for admin in self.directory.admins().await? {
                    planned.push(Planned {
                        type_name: "contact-received",
                        priority: Priority::Normal,
                        recipient_id: admin.user_id,
                        sender_id: field(&event.current, "user_id").map(str::to_string),
                        context: context.clone(),
                        related_kind: Some("contact".into()),
                    });
                }
            }

            "contact.status" => {
                if cur != Some("responded") || prev == Some("responded") {
                    return Ok(planned);
                }
                // Anonymous submitters have no account to notify
                let Some(user) = field(&event.current, "user_id") else {
                    info!(entity = %event.entity_id, "responded contact has no account, skipping");
                    return Ok(planned);
                };
                planned.push(Planned {
                    type_name: "contact-replied",
                    priority: Priority::Normal,
                    recipient_id: user.to_string(),
                    sender_id: None,
                    context: json!({ "contact": event.current }),
                    related_kind: Some("contact".into()),
                });
            }

            "referral.status" => {
                if cur != Some("paid") || prev == Some("paid") {
                    return Ok(planned);
                }
                let Some(owner) = field(&event.current, "owner_id") else {
                    warn!(entity = %event.entity_id, "referral event without owner_id");
                    return Ok(planned);
                };
                let count = self.ledger.record_paid_referral(owner).await?;
                if count % REFERRALS_PER_CREDIT == 0 {
                    planned.push(Planned {
                        type_name: "referral-credit",
                        priority: Priority::Normal,
                        recipient_id: owner.to_string(),
                        sender_id: None,
                        context: json!({ "referral": { "paid_count": count } }),
                        related_kind: Some("referral".into()),
                    });
                }
            }

            other => {
                debug!(kind = %other, "no binding for event kind");
            }
        }
        Ok(planned)
    }

    async fn materialize(&self, event: &DomainEvent, plan: Planned) -> Result<()> {
        let ty = self
            .types
            .get(plan.type_name)
            .ok_or_else(|| NotifyError::NotFound(format!("notification type {}", plan.type_name)))?;

        let mut new = NewNotification {
            recipient_id: plan.recipient_id,
            sender_id: plan.sender_id,
            type_name: ty.name.clone(),
            priority: plan.priority,
            related_kind: plan.related_kind,
            related_id: Some(event.entity_id.clone()),
            ..Default::default()
        };

        match self.templates.render(&ty.template, &plan.context) {
            Ok(rendered) => {
                new.title = rendered.title;
                new.message = rendered.body_text;
                new.action_url = rendered.action_url;
                new.action_text = rendered.action_text;
                new.expiry_minutes = rendered.expiry_minutes;
                new.metadata = json!({ "body_html": rendered.body_html });
            }
            Err(NotifyError::TemplateMissing(name)) => {
                // Degrade to a raw notification rather than losing the event
                warn!(template = %name, kind = %event.kind, "template missing, using raw fallback");
                new.title = event.kind.clone();
                new.message = format!("{} for {}", event.kind, event.entity_id);
            }
            Err(e) => return Err(e),
        }

        let notification = self.store.create(new).await?;
        NOTIFICATIONS_CREATED.inc();
        self.dispatch_tx
            .send(notification)
            .await
            .map_err(|_| NotifyError::Layer("dispatch queue closed".to_string()))?;
        Ok(())
    }
}

/// Ingress loop: drains the event queue until producers hang up.
pub async fn run_event_ingress(mut rx: mpsc::Receiver<DomainEvent>, ingress: Arc<EventIngress>) {
    info!("Event ingress started");
    while let Some(event) = rx.recv().await {
        if let Err(e) = ingress.handle_event(&event).await {
            error!(kind = %event.kind, entity = %event.entity_id, error = %e,
                   "event handling failed");
        }
    }
    info!("Event ingress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::models::UserContact;
    use crate::store::MemoryNotificationStore;
    use chrono::Utc;

    struct Fixture {
        ingress: EventIngress,
        store: Arc<MemoryNotificationStore>,
        ledger: Arc<MemoryReferralLedger>,
        rx: mpsc::Receiver<Notification>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryNotificationStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_admin(UserContact {
            user_id: "admin1".into(),
            email: Some("admin@tunedrop.io".into()),
            first_name: None,
        });
        let ledger = Arc::new(MemoryReferralLedger::new());
        let (tx, rx) = mpsc::channel(64);
        let ingress = EventIngress::new(
            store.clone(),
            Arc::new(TemplateRegistry::with_builtins()),
            Arc::new(TypeRegistry::with_builtins()),
            directory,
            ledger.clone(),
            tx,
        );
        Fixture {
            ingress,
            store,
            ledger,
            rx,
        }
    }

    fn transition(kind: &str, entity: &str, prev: &str, cur: serde_json::Value) -> DomainEvent {
        DomainEvent {
            kind: kind.to_string(),
            entity_id: entity.to_string(),
            previous: Some(json!({ "status": prev })),
            current: cur,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn signup_notifies_user_and_admins() {
        let mut f = fixture();
        let event = DomainEvent {
            kind: "user.created".into(),
            entity_id: "u1".into(),
            previous: None,
            current: json!({ "id": "u1", "email": "a@x", "first_name": "Ada" }),
            occurred_at: Utc::now(),
        };
        f.ingress.handle_event(&event).await.unwrap();

        let welcome = f.rx.recv().await.unwrap();
        assert_eq!(welcome.recipient_id, "u1");
        assert_eq!(welcome.type_name, "welcome");
        assert!(welcome.title.contains("Ada"));
        assert!(welcome.title.contains("Welcome"));

        let admin = f.rx.recv().await.unwrap();
        assert_eq!(admin.recipient_id, "admin1");
        assert_eq!(admin.type_name, "admin-new-user");
        assert!(admin.title.contains("a@x"));
    }

    #[tokio::test]
    async fn duplicate_transition_creates_one_notification() {
        let mut f = fixture();
        let event = transition(
            "song.status",
            "s1",
            "pending",
            json!({ "status": "approved", "artist_id": "u1", "title": "Night Drive" }),
        );
        f.ingress.handle_event(&event).await.unwrap();
        f.ingress.handle_event(&event).await.unwrap();

        let n = f.rx.recv().await.unwrap();
        assert_eq!(n.type_name, "song-approved");
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.related_id.as_deref(), Some("s1"));
        assert!(n.title.contains("Night Drive"));
        assert!(f.rx.try_recv().is_err());
        assert_eq!(f.store.count_unread("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn song_lifecycle_produces_ordered_notifications() {
        let mut f = fixture();
        let stages = [
            ("draft", "pending", "song-submitted", Priority::Normal),
            ("pending", "approved", "song-approved", Priority::High),
            ("approved", "distributed", "song-distributed", Priority::High),
        ];
        for (prev, cur, _, _) in &stages {
            let event = transition(
                "song.status",
                "s1",
                prev,
                json!({ "status": cur, "artist_id": "u1", "title": "Night Drive" }),
            );
            f.ingress.handle_event(&event).await.unwrap();
        }
        for (_, _, expected_type, expected_priority) in &stages {
            let n = f.rx.recv().await.unwrap();
            assert_eq!(&n.type_name, expected_type);
            assert_eq!(&n.priority, expected_priority);
        }
    }

    #[tokio::test]
    async fn payment_success_maps_plan_to_tier() {
        let mut f = fixture();
        let event = transition(
            "payment.status",
            "p1",
            "pending",
            json!({ "status": "success", "user_id": "u1", "amount": 5000,
                    "currency": "NGN", "plan": "pay_per_song" }),
        );
        f.ingress.handle_event(&event).await.unwrap();

        let n = f.rx.recv().await.unwrap();
        assert_eq!(n.type_name, "payment-received");
        assert_eq!(n.priority, Priority::High);
        assert!(n.message.contains("silver"));
        assert!(n.message.contains("5000"));
    }

    #[tokio::test]
    async fn payment_failed_is_urgent_and_success_repeat_is_ignored() {
        let mut f = fixture();
        let failed = transition(
            "payment.status",
            "p2",
            "pending",
            json!({ "status": "failed", "user_id": "u1", "amount": 100, "plan": "yearly" }),
        );
        f.ingress.handle_event(&failed).await.unwrap();
        let n = f.rx.recv().await.unwrap();
        assert_eq!(n.type_name, "payment-failed");
        assert_eq!(n.priority, Priority::Urgent);

        // success -> success transition is not a payment receipt
        let noop = transition(
            "payment.status",
            "p3",
            "success",
            json!({ "status": "success", "user_id": "u1", "amount": 100 }),
        );
        f.ingress.handle_event(&noop).await.unwrap();
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn anonymous_contact_reply_is_skipped() {
        let mut f = fixture();
        let event = transition(
            "contact.status",
            "c1",
            "open",
            json!({ "status": "responded", "subject": "hi" }),
        );
        f.ingress.handle_event(&event).await.unwrap();
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn referral_credit_every_second_paid_referral() {
        let mut f = fixture();
        for i in 0..4 {
            let event = transition(
                "referral.status",
                &format!("r{}", i),
                "signed_up",
                json!({ "status": "paid", "owner_id": "u1" }),
            );
            f.ingress.handle_event(&event).await.unwrap();
        }

        // Counts 1..=4 yield credits at 2 and 4
        let mut credits = Vec::new();
        while let Ok(n) = f.rx.try_recv() {
            credits.push(n);
        }
        assert_eq!(credits.len(), 2);
        assert!(credits.iter().all(|n| n.type_name == "referral-credit"));
        assert!(credits[0].message.contains('2'));
        assert!(credits[1].message.contains('4'));
    }

    #[tokio::test]
    async fn concurrent_paid_referrals_credit_exactly_once_per_pair() {
        // pre-count 1, N=5 concurrent transitions -> counts 2..=6,
        // credits at 2, 4 and 6
        let f = fixture();
        f.ledger.seed("u1", 1);
        let ingress = Arc::new(f.ingress);

        let mut handles = Vec::new();
        for i in 0..5 {
            let ingress = ingress.clone();
            handles.push(tokio::spawn(async move {
                let event = transition(
                    "referral.status",
                    &format!("rc{}", i),
                    "signed_up",
                    json!({ "status": "paid", "owner_id": "u1" }),
                );
                ingress.handle_event(&event).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let credits = f
            .store
            .list_for_user("u1", None, 50, 0)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.type_name == "referral-credit")
            .count();
        assert_eq!(credits, 3);
    }

    #[tokio::test]
    async fn missing_template_degrades_to_raw_notification() {
        let store = Arc::new(MemoryNotificationStore::new());
        let mut types = TypeRegistry::with_builtins();
        types.register(NotificationType {
            name: "song-approved".into(),
            category: Category::Music,
            email_default: true,
            push_default: true,
            in_app_default: true,
            template: "no-such-template".into(),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let ingress = EventIngress::new(
            store,
            Arc::new(TemplateRegistry::with_builtins()),
            Arc::new(types),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryReferralLedger::new()),
            tx,
        );

        let event = transition(
            "song.status",
            "s1",
            "pending",
            json!({ "status": "approved", "artist_id": "u1" }),
        );
        ingress.handle_event(&event).await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.title, "song.status");
        assert!(n.message.contains("s1"));
    }
}
