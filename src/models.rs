use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    System,
    Music,
    Payment,
    Marketing,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// High and urgent notifications bypass quiet hours and digest deferral.
    pub fn bypasses_quiet_hours(self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Immediate,
    Hourly,
    Daily,
    Weekly,
    Never,
}

impl Frequency {
    pub fn window_secs(self) -> Option<i64> {
        match self {
            Frequency::Hourly => Some(3600),
            Frequency::Daily => Some(86400),
            Frequency::Weekly => Some(7 * 86400),
            Frequency::Immediate | Frequency::Never => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl NotificationStatus {
    /// Statuses that count toward a user's unread total.
    pub fn is_unread(self) -> bool {
        matches!(
            self,
            NotificationStatus::Pending | NotificationStatus::Sent | NotificationStatus::Delivered
        )
    }

    /// Forward-only transitions, plus the failed -> pending retry edge.
    pub fn can_transition_to(self, to: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, to),
            (Pending, Sent)
                | (Pending, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Sent, Failed)
                | (Delivered, Read)
                | (Failed, Pending)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Websocket,
    Email,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $($ty::$variant => $text,)+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(Category {
    System => "system",
    Music => "music",
    Payment => "payment",
    Marketing => "marketing",
    Admin => "admin",
});

text_enum!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

text_enum!(Frequency {
    Immediate => "immediate",
    Hourly => "hourly",
    Daily => "daily",
    Weekly => "weekly",
    Never => "never",
});

text_enum!(NotificationStatus {
    Pending => "pending",
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

text_enum!(Channel {
    InApp => "in_app",
    Websocket => "websocket",
    Email => "email",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: String,
    pub type_name: String,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub in_app_enabled: bool,
    pub frequency: Frequency,
    pub quiet_hours: QuietHours,
}

/// Partial update applied over an existing preference row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencePatch {
    pub type_name: String,
    pub email_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub in_app_enabled: Option<bool>,
    pub frequency: Option<Frequency>,
    pub quiet_hours: Option<QuietHours>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationType {
    pub name: String,
    pub category: Category,
    pub email_default: bool,
    pub push_default: bool,
    pub in_app_default: bool,
    pub template: String,
}

impl NotificationType {
    pub fn default_preference(&self, user_id: &str) -> UserPreference {
        UserPreference {
            user_id: user_id.to_string(),
            type_name: self.name.clone(),
            email_enabled: self.email_default,
            push_enabled: self.push_default,
            in_app_enabled: self.in_app_default,
            frequency: Frequency::Immediate,
            quiet_hours: QuietHours::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub type_name: String,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub action_text: Option<String>,
    pub related_kind: Option<String>,
    pub related_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub deferred: bool,
    pub send_email: bool,
    pub send_push: bool,
    pub send_in_app: bool,
}

impl Notification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fields the caller supplies when creating a notification; the store
/// fills in id, status and timestamps.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub type_name: String,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub action_text: Option<String>,
    pub related_kind: Option<String>,
    pub related_id: Option<String>,
    pub metadata: serde_json::Value,
    pub expiry_minutes: i64,
    pub max_retries: i32,
    pub send_email: bool,
    pub send_push: bool,
    pub send_in_app: bool,
}

impl Default for NewNotification {
    fn default() -> Self {
        Self {
            recipient_id: String::new(),
            sender_id: None,
            type_name: String::new(),
            priority: Priority::Normal,
            title: String::new(),
            message: String::new(),
            action_url: None,
            action_text: None,
            related_kind: None,
            related_id: None,
            metadata: serde_json::Value::Null,
            expiry_minutes: 1440,
            max_retries: 3,
            send_email: true,
            send_push: true,
            send_in_app: true,
        }
    }
}

/// One append-only row per channel attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: Channel,
    pub status: String,
    pub email_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical domain-event envelope received from collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: String,
    pub entity_id: String,
    pub previous: Option<serde_json::Value>,
    pub current: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    fn status_of(value: &serde_json::Value) -> Option<&str> {
        value.get("status").and_then(|s| s.as_str())
    }

    /// Dedup key: transitions are idempotent on (kind, entity, prev
    /// status, new status); creation events on (kind, entity, occurred_at).
    pub fn fingerprint(&self) -> String {
        let prev = self.previous.as_ref().and_then(Self::status_of);
        let cur = Self::status_of(&self.current);
        match (prev, cur) {
            (Some(p), Some(c)) => format!("{}:{}:{}->{}", self.kind, self.entity_id, p, c),
            _ => format!(
                "{}:{}:@{}",
                self.kind,
                self.entity_id,
                self.occurred_at.timestamp()
            ),
        }
    }

    pub fn previous_status(&self) -> Option<&str> {
        self.previous.as_ref().and_then(Self::status_of)
    }

    pub fn current_status(&self) -> Option<&str> {
        Self::status_of(&self.current)
    }
}

/// What the core needs to know about a recipient; the user store
/// itself belongs to a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContact {
    pub user_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
}

impl UserContact {
    pub fn has_email(&self) -> bool {
        self.email.as_deref().map(|e| !e.is_empty()).unwrap_or(false)
    }
}
