//! End-to-end pipeline scenarios over the in-memory components:
//! event in, notification out, across dispatch, digest and retry.

use async_trait::async_trait;
use chrono::{Duration, NaiveTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use tunedrop_notifier::channel_layer::{user_group, ChannelLayer, InProcessLayer};
use tunedrop_notifier::config::{DigestConfig, RetryConfig};
use tunedrop_notifier::digest::DigestScheduler;
use tunedrop_notifier::directory::MemoryDirectory;
use tunedrop_notifier::dispatch::Dispatcher;
use tunedrop_notifier::email::{
    EmailAdapter, EmailMessage, EmailReceipt, EmailTransport, MemoryEmailTransport,
};
use tunedrop_notifier::error::{NotifyError, Result};
use tunedrop_notifier::ingress::{EventIngress, MemoryReferralLedger, TypeRegistry};
use tunedrop_notifier::models::{
    Channel, DomainEvent, Frequency, Notification, NotificationStatus, Priority, QuietHours,
    UserContact, UserPreference,
};
use tunedrop_notifier::prefs::MemoryPreferenceStore;
use tunedrop_notifier::retry::{backoff, RetryWorker};
use tunedrop_notifier::store::{MemoryNotificationStore, NotificationStore};
use tunedrop_notifier::templates::TemplateRegistry;

struct SharedEmail(Arc<MemoryEmailTransport>);

#[async_trait]
impl EmailTransport for SharedEmail {
    async fn submit(&self, m: &EmailMessage) -> Result<EmailReceipt> {
        self.0.submit(m).await
    }
}

struct FlakyEmail {
    inner: Arc<MemoryEmailTransport>,
    fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl EmailTransport for FlakyEmail {
    async fn submit(&self, m: &EmailMessage) -> Result<EmailReceipt> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::ChannelTransient {
                channel: Channel::Email,
                reason: "503 from provider".to_string(),
            });
        }
        self.inner.submit(m).await
    }
}

struct Pipeline {
    ingress: EventIngress,
    dispatcher: Dispatcher,
    scheduler: DigestScheduler,
    retry_worker: RetryWorker,
    store: Arc<MemoryNotificationStore>,
    prefs: Arc<MemoryPreferenceStore>,
    layer: Arc<InProcessLayer>,
    email: Arc<MemoryEmailTransport>,
    dispatch_rx: mpsc::Receiver<Notification>,
}

impl Pipeline {
    fn new(failing_email: bool) -> Self {
        let store = Arc::new(MemoryNotificationStore::new());
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let layer = Arc::new(InProcessLayer::new());
        let email = Arc::new(MemoryEmailTransport::new());
        let templates = Arc::new(TemplateRegistry::with_builtins());
        let types = Arc::new(TypeRegistry::with_builtins());

        let directory = Arc::new(MemoryDirectory::new());
        directory.add_user(UserContact {
            user_id: "u1".into(),
            email: Some("ada@example.com".into()),
            first_name: Some("Ada".into()),
        });
        directory.add_user(UserContact {
            user_id: "u2".into(),
            email: Some("u2@example.com".into()),
            first_name: None,
        });
        directory.add_user(UserContact {
            user_id: "u3".into(),
            email: Some("u3@example.com".into()),
            first_name: None,
        });
        directory.add_admin(UserContact {
            user_id: "admin1".into(),
            email: Some("admin@tunedrop.io".into()),
            first_name: None,
        });

        let transport: Box<dyn EmailTransport> = if failing_email {
            Box::new(FlakyEmail {
                inner: email.clone(),
                fail: std::sync::atomic::AtomicBool::new(true),
            })
        } else {
            Box::new(SharedEmail(email.clone()))
        };
        let adapter = Arc::new(EmailAdapter::new(transport, None));

        let (dispatch_tx, dispatch_rx) = mpsc::channel(256);

        let ingress = EventIngress::new(
            store.clone(),
            templates.clone(),
            types.clone(),
            directory.clone(),
            Arc::new(MemoryReferralLedger::new()),
            dispatch_tx.clone(),
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            prefs.clone(),
            types,
            layer.clone(),
            adapter.clone(),
            directory.clone(),
        );
        let scheduler = DigestScheduler::new(
            store.clone(),
            prefs.clone(),
            templates,
            directory,
            adapter,
            DigestConfig {
                enabled_frequencies: vec![Frequency::Daily],
                hourly_tick_secs: 3600,
                daily_tick_secs: 86400,
                weekly_tick_secs: 7 * 86400,
            },
        );
        let retry_worker = RetryWorker::new(
            store.clone(),
            RetryConfig {
                base_seconds: 60,
                max_attempts: 3,
                sweep_interval_secs: 60,
            },
            dispatch_tx,
        );

        Self {
            ingress,
            dispatcher,
            scheduler,
            retry_worker,
            store,
            prefs,
            layer,
            email,
            dispatch_rx,
        }
    }

    /// Ingest one event and run every resulting dispatch to completion.
    async fn ingest(&mut self, event: DomainEvent) {
        self.ingress.handle_event(&event).await.unwrap();
        self.drain().await;
    }

    async fn drain(&mut self) {
        while let Ok(notification) = self.dispatch_rx.try_recv() {
            self.dispatcher.dispatch_one(&notification).await.unwrap();
        }
    }
}

fn transition(kind: &str, entity: &str, prev: &str, current: serde_json::Value) -> DomainEvent {
    DomainEvent {
        kind: kind.to_string(),
        entity_id: entity.to_string(),
        previous: Some(json!({ "status": prev })),
        current,
        occurred_at: Utc::now(),
    }
}

fn pref(user: &str, type_name: &str, frequency: Frequency, quiet_hours: QuietHours) -> UserPreference {
    UserPreference {
        user_id: user.to_string(),
        type_name: type_name.to_string(),
        email_enabled: true,
        push_enabled: true,
        in_app_enabled: true,
        frequency,
        quiet_hours,
    }
}

// Scenario 1
#[tokio::test]
async fn welcome_on_signup() {
    let mut p = Pipeline::new(false);
    p.ingest(DomainEvent {
        kind: "user.created".into(),
        entity_id: "u1".into(),
        previous: None,
        current: json!({ "id": "u1", "email": "ada@example.com", "first_name": "Ada" }),
        occurred_at: Utc::now(),
    })
    .await;

    let records = p.store.list_for_user("u1", None, 10, 0).await.unwrap();
    assert_eq!(records.len(), 1);
    let welcome = &records[0];
    assert!(welcome.title.contains("Ada"));
    assert!(welcome.title.contains("Welcome"));
    assert_eq!(welcome.status, NotificationStatus::Sent);

    // Email went out, and the preference row now exists with defaults
    let to_user: Vec<_> = p
        .email
        .sent()
        .into_iter()
        .filter(|m| m.to == "ada@example.com")
        .collect();
    assert_eq!(to_user.len(), 1);
    let row = p.prefs.get("u1", "welcome").unwrap();
    assert_eq!(row.frequency, Frequency::Immediate);

    // The admin heard about the signup too
    let admin_records = p.store.list_for_user("admin1", None, 10, 0).await.unwrap();
    assert_eq!(admin_records.len(), 1);
    assert_eq!(admin_records[0].type_name, "admin-new-user");
}

// Scenario 2
#[tokio::test]
async fn song_progression_pushes_frames_in_order() {
    let mut p = Pipeline::new(false);
    let mut sub = p.layer.subscribe(&user_group("u1")).await.unwrap();

    for (prev, cur) in [("draft", "pending"), ("pending", "approved"), ("approved", "distributed")] {
        p.ingest(transition(
            "song.status",
            "s1",
            prev,
            json!({ "status": cur, "artist_id": "u1", "title": "Night Drive" }),
        ))
        .await;
    }

    let records = p.store.list_for_user("u1", None, 10, 0).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|n| n.related_id.as_deref() == Some("s1")));

    let expected = ["song-submitted", "song-approved", "song-distributed"];
    for type_name in expected {
        let frame = sub.recv().await.unwrap();
        assert!(frame.contains("new_notification"));
        assert!(frame.contains(type_name), "expected {} in {}", type_name, frame);
    }
}

// Scenario 3
#[tokio::test]
async fn payment_success_then_failure_with_idempotence() {
    let mut p = Pipeline::new(false);
    let success = transition(
        "payment.status",
        "p1",
        "pending",
        json!({ "status": "success", "user_id": "u1", "amount": 5000, "plan": "pay_per_song" }),
    );
    p.ingest(success.clone()).await;
    p.ingest(transition(
        "payment.status",
        "p2",
        "pending",
        json!({ "status": "failed", "user_id": "u1", "amount": 12000, "plan": "yearly" }),
    ))
    .await;

    // Replay of the first event must not create a third record
    p.ingest(success).await;

    let mut records = p.store.list_for_user("u1", None, 10, 0).await.unwrap();
    records.sort_by_key(|n| n.related_id.clone());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].type_name, "payment-received");
    assert_eq!(records[0].priority, Priority::High);
    assert!(records[0].message.contains("5000"));
    assert_eq!(records[1].type_name, "payment-failed");
    assert_eq!(records[1].priority, Priority::Urgent);
}

// Scenario 4
#[tokio::test]
async fn quiet_hours_suppress_email_until_urgent() {
    let mut p = Pipeline::new(false);
    // Whole-day window so the scenario holds at any test hour
    let all_day = QuietHours {
        enabled: true,
        start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
    };
    p.prefs
        .seed(pref("u2", "song-submitted", Frequency::Immediate, all_day));
    p.prefs
        .seed(pref("u2", "payment-failed", Frequency::Immediate, all_day));

    // Normal priority: in-app record only
    p.ingest(transition(
        "song.status",
        "s9",
        "draft",
        json!({ "status": "pending", "artist_id": "u2", "title": "Quiet" }),
    ))
    .await;
    assert_eq!(p.store.count_unread("u2").await.unwrap(), 1);
    assert!(p.email.sent().is_empty());

    // Urgent cuts through
    p.ingest(transition(
        "payment.status",
        "p9",
        "pending",
        json!({ "status": "failed", "user_id": "u2", "amount": 100 }),
    ))
    .await;
    assert_eq!(p.email.sent().len(), 1);
}

// Scenario 5
#[tokio::test]
async fn retry_backoff_and_give_up() {
    let mut p = Pipeline::new(true);
    // Email is the only enabled channel so every dispatch fails outright
    p.prefs.seed(UserPreference {
        push_enabled: false,
        in_app_enabled: false,
        ..pref("u1", "song-approved", Frequency::Immediate, QuietHours::default())
    });

    p.ingest(transition(
        "song.status",
        "s1",
        "pending",
        json!({ "status": "approved", "artist_id": "u1", "title": "Doomed" }),
    ))
    .await;

    let id = p.store.list_for_user("u1", None, 10, 0).await.unwrap()[0].id;
    assert_eq!(
        p.store.get(id).await.unwrap().status,
        NotificationStatus::Failed
    );

    // Sweeps at t+60, t+180, t+420 each re-dispatch once and fail again
    let mut clock = Utc::now();
    for round in 1..=3 {
        clock = clock + Duration::seconds(backoff(round - 1, 60).num_seconds() + 1);
        let (_, retried) = p.retry_worker.sweep(clock).await.unwrap();
        assert_eq!(retried, 1, "round {}", round);
        p.drain().await;
        assert_eq!(
            p.store.get(id).await.unwrap().status,
            NotificationStatus::Failed
        );
    }

    // Budget exhausted: no fourth attempt, record still readable in-app
    let (_, retried) = p.retry_worker.sweep(clock + Duration::hours(1)).await.unwrap();
    assert_eq!(retried, 0);
    let n = p.store.get(id).await.unwrap();
    assert_eq!(n.retry_count, 3);
    assert_eq!(n.status, NotificationStatus::Failed);
    assert!(p.email.sent().is_empty());
    assert_eq!(p.store.list_for_user("u1", None, 10, 0).await.unwrap().len(), 1);
}

// Scenario 6
#[tokio::test]
async fn daily_digest_collects_three_submissions() {
    let mut p = Pipeline::new(false);
    // song-submitted is normal priority, so the daily frequency defers it
    p.prefs.seed(pref(
        "u3",
        "song-submitted",
        Frequency::Daily,
        QuietHours::default(),
    ));

    for (i, title) in ["First", "Second", "Third"].iter().enumerate() {
        p.ingest(transition(
            "song.status",
            &format!("s{}", i),
            "draft",
            json!({ "status": "pending", "artist_id": "u3", "title": title }),
        ))
        .await;
    }

    // Deferred, nothing sent yet
    assert!(p.email.sent().is_empty());
    for n in p.store.list_for_user("u3", None, 10, 0).await.unwrap() {
        assert_eq!(n.status, NotificationStatus::Pending);
        assert!(n.deferred);
    }

    let sent = p
        .scheduler
        .run_tick(Frequency::Daily, Utc::now())
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let emails = p.email.sent();
    assert_eq!(emails.len(), 1);
    for title in ["First", "Second", "Third"] {
        assert!(emails[0].body_text.contains(title));
    }

    let mut digest_ids = std::collections::HashSet::new();
    for n in p.store.list_for_user("u3", None, 10, 0).await.unwrap() {
        assert_eq!(n.status, NotificationStatus::Sent);
        digest_ids.insert(n.metadata["digest_id"].as_str().unwrap().to_string());
    }
    assert_eq!(digest_ids.len(), 1);
}
