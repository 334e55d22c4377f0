use crate::models::Channel;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, NotifyError>;

/// Error taxonomy for the notification core. Public surfaces never leak
/// these directly; the ingress and the websocket hub absorb them.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("template not found: {0}")]
    TemplateMissing(String),

    #[error("recipient unreachable on {channel}: {reason}")]
    RecipientUnreachable { channel: Channel, reason: String },

    #[error("transient failure on {channel}: {reason}")]
    ChannelTransient { channel: Channel, reason: String },

    #[error("permanent failure on {channel}: {reason}")]
    ChannelPermanent { channel: Channel, reason: String },

    #[error("conflicting status update for notification {0}")]
    StorageConflict(Uuid),

    #[error("notification {0} expired before send")]
    Expired(Uuid),

    #[error("retry budget exceeded for notification {0}")]
    RetryBudgetExceeded(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated websocket connection")]
    Unauthenticated,

    #[error("unknown websocket message type: {0}")]
    UnknownMessage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel layer error: {0}")]
    Layer(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl NotifyError {
    /// Whether the failure is worth another attempt at the notification
    /// level. Permanent channel errors and exhausted budgets are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NotifyError::ChannelTransient { .. }
                | NotifyError::Database(_)
                | NotifyError::Layer(_)
        )
    }
}
