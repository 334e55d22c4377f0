use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel_layer::{user_group, ChannelLayer, SYSTEM_GROUP};
use crate::config::WebsocketConfig;
use crate::error::{NotifyError, Result};
use crate::metrics::{metrics_handler, WS_CONNECTIONS, WS_FRAMES_SENT};
use crate::models::{DomainEvent, Frequency, Notification, NotificationStatus};
use crate::prefs::PreferenceStore;
use crate::store::NotificationStore;

/// Close code sent when the connection token fails verification.
const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// Unread records pushed right after the greeting.
const GREETING_UNREAD_LIMIT: i64 = 5;

// ---------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    GetUnreadCount,
    MarkAsRead {
        notification_id: Uuid,
    },
    MarkAllAsRead,
    GetNotifications {
        #[serde(default)]
        status: Option<NotificationStatus>,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        offset: Option<i64>,
    },
    SubscribeToType {
        notification_type: String,
    },
    UnsubscribeFromType {
        notification_type: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionConfirmed {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    UnreadCount {
        count: i64,
    },
    NewNotification {
        notification: Notification,
    },
    Notifications {
        notifications: Vec<Notification>,
    },
    SystemAnnouncement {
        title: String,
        message: String,
        priority: crate::models::Priority,
        timestamp: DateTime<Utc>,
        sender: Option<String>,
    },
    Error {
        message: String,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------
// Connection tokens: "user_id.hex(sha256(user_id || secret))", minted by
// the platform's auth service with the shared secret.
// ---------------------------------------------------------------------

pub fn sign_token(user_id: &str, secret: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", user_id, secret).as_bytes());
    format!("{}.{}", user_id, hex::encode(digest))
}

fn verify_token(token: &str, secret: &str) -> Result<String> {
    let (user_id, signature) = token.rsplit_once('.').ok_or(NotifyError::Unauthenticated)?;
    if user_id.is_empty() {
        return Err(NotifyError::Unauthenticated);
    }
    let expected = Sha256::digest(format!("{}{}", user_id, secret).as_bytes());
    let presented = hex::decode(signature).map_err(|_| NotifyError::Unauthenticated)?;
    if constant_time_eq(&expected, &presented) {
        Ok(user_id.to_string())
    } else {
        Err(NotifyError::Unauthenticated)
    }
}

// ---------------------------------------------------------------------
// Hub state and router
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct HubState {
    pub store: Arc<dyn NotificationStore>,
    pub prefs: Arc<dyn PreferenceStore>,
    pub layer: Arc<dyn ChannelLayer>,
    pub ws_config: WebsocketConfig,
    pub event_tx: tokio::sync::mpsc::Sender<DomainEvent>,
    pub shutdown: broadcast::Sender<()>,
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws/notifications/", get(user_socket))
        .route("/ws/system/", get(system_socket))
        .route("/events", post(ingest_event))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(|| async { metrics_handler() }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Domain-event intake for collaborator services on the internal
/// network, authenticated with the shared secret.
async fn ingest_event(
    State(state): State<HubState>,
    headers: HeaderMap,
    Json(event): Json<DomainEvent>,
) -> StatusCode {
    let authorized = headers
        .get("x-intake-token")
        .and_then(|v| v.to_str().ok())
        .map(|token| {
            constant_time_eq(token.as_bytes(), state.ws_config.auth_secret.as_bytes())
        })
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }
    match state.event_tx.send(event).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn serve(state: HubState, bind_address: &str) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown.subscribe();
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Websocket hub listening on {}", bind_address);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn user_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<HubState>,
) -> impl IntoResponse {
    let auth = params
        .get("token")
        .ok_or(NotifyError::Unauthenticated)
        .and_then(|token| verify_token(token, &state.ws_config.auth_secret));
    ws.on_upgrade(move |socket| async move {
        match auth {
            Ok(user_id) => run_user_connection(socket, user_id, state).await,
            Err(_) => reject_unauthenticated(socket).await,
        }
    })
}

async fn system_socket(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_system_connection(socket, state))
}

async fn reject_unauthenticated(mut socket: WebSocket) {
    warn!("rejecting websocket connection with bad token");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHENTICATED,
            reason: Cow::from("authentication failed"),
        })))
        .await;
}

// ---------------------------------------------------------------------
// Per-user connection loop
// ---------------------------------------------------------------------

async fn run_user_connection(socket: WebSocket, user_id: String, state: HubState) {
    let sub = match state.layer.subscribe(&user_group(&user_id)).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "could not subscribe to user group");
            return;
        }
    };

    WS_CONNECTIONS.inc();
    info!(user_id = %user_id, "websocket connected");
    if let Err(e) = user_connection_loop(socket, &user_id, &state, sub).await {
        debug!(user_id = %user_id, error = %e, "websocket connection ended with error");
    }
    WS_CONNECTIONS.dec();
    info!(user_id = %user_id, "websocket disconnected");
}

async fn user_connection_loop(
    socket: WebSocket,
    user_id: &str,
    state: &HubState,
    mut sub: crate::channel_layer::GroupSubscription,
) -> Result<()> {
    let (mut sink, mut stream) = socket.split();
    let mut shutdown = state.shutdown.subscribe();

    // Greeting: confirm, current unread count, a few recent unread records
    send_frame(
        &mut sink,
        &ServerFrame::ConnectionConfirmed {
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        },
    )
    .await?;
    let count = state.store.count_unread(user_id).await?;
    send_frame(&mut sink, &ServerFrame::UnreadCount { count }).await?;
    for notification in state
        .store
        .list_unread(user_id, GREETING_UNREAD_LIMIT)
        .await?
    {
        send_frame(&mut sink, &ServerFrame::NewNotification { notification }).await?;
    }

    let timeout = Duration::from_secs(state.ws_config.heartbeat_timeout_s);
    let mut heartbeat = tokio::time::interval(timeout / 2);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let Some(message) = inbound else { break };
                last_activity = Instant::now();
                match message {
                    Ok(Message::Text(text)) => {
                        for frame in handle_client_text(state, user_id, &text).await {
                            send_frame(&mut sink, &frame).await?;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            published = sub.recv() => {
                let Some(payload) = published else { break };
                WS_FRAMES_SENT.inc();
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > timeout {
                    debug!(user_id = %user_id, "heartbeat timeout, closing");
                    break;
                }
            }
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(Some(CloseFrame {
                    code: 1000,
                    reason: Cow::from("server shutting down"),
                }))).await;
                break;
            }
        }
    }
    Ok(())
}

async fn run_system_connection(socket: WebSocket, state: HubState) {
    let mut sub = match state.layer.subscribe(SYSTEM_GROUP).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "could not subscribe to system group");
            return;
        }
    };

    WS_CONNECTIONS.inc();
    let (mut sink, mut stream) = socket.split();
    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            published = sub.recv() => {
                let Some(payload) = published else { break };
                WS_FRAMES_SENT.inc();
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(Some(CloseFrame {
                    code: 1000,
                    reason: Cow::from("server shutting down"),
                }))).await;
                break;
            }
        }
    }
    WS_CONNECTIONS.dec();
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &ServerFrame,
) -> Result<()> {
    let payload = serde_json::to_string(frame)?;
    WS_FRAMES_SENT.inc();
    sink.send(Message::Text(payload))
        .await
        .map_err(|_| NotifyError::Layer("websocket send failed".to_string()))
}

/// Decode and execute one client frame; errors become error frames so a
/// misbehaving client never tears down the connection.
async fn handle_client_text(state: &HubState, user_id: &str, text: &str) -> Vec<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return vec![ServerFrame::Error {
                message: format!("unrecognized message: {}", e),
            }]
        }
    };
    match handle_client_frame(state, user_id, frame).await {
        Ok(frames) => frames,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "client frame failed");
            vec![ServerFrame::Error {
                message: e.to_string(),
            }]
        }
    }
}

async fn handle_client_frame(
    state: &HubState,
    user_id: &str,
    frame: ClientFrame,
) -> Result<Vec<ServerFrame>> {
    match frame {
        ClientFrame::Ping => Ok(vec![ServerFrame::Pong {
            timestamp: Utc::now(),
        }]),

        ClientFrame::GetUnreadCount => {
            let count = state.store.count_unread(user_id).await?;
            Ok(vec![ServerFrame::UnreadCount { count }])
        }

        ClientFrame::MarkAsRead { notification_id } => {
            let notification = state.store.get(notification_id).await?;
            if notification.recipient_id != user_id {
                return Err(NotifyError::NotFound(format!(
                    "notification {}",
                    notification_id
                )));
            }
            state.store.mark_read(notification_id).await?;
            let count = state.store.count_unread(user_id).await?;
            Ok(vec![ServerFrame::UnreadCount { count }])
        }

        ClientFrame::MarkAllAsRead => {
            state.store.mark_all_read(user_id).await?;
            let count = state.store.count_unread(user_id).await?;
            Ok(vec![ServerFrame::UnreadCount { count }])
        }

        ClientFrame::GetNotifications {
            status,
            limit,
            offset,
        } => {
            let notifications = state
                .store
                .list_for_user(
                    user_id,
                    status,
                    limit.unwrap_or(20).clamp(1, 100),
                    offset.unwrap_or(0).max(0),
                )
                .await?;
            Ok(vec![ServerFrame::Notifications { notifications }])
        }

        ClientFrame::SubscribeToType { notification_type } => {
            state
                .prefs
                .set_frequency(user_id, &notification_type, Frequency::Immediate)
                .await?;
            Ok(vec![])
        }

        ClientFrame::UnsubscribeFromType { notification_type } => {
            state
                .prefs
                .set_frequency(user_id, &notification_type, Frequency::Never)
                .await?;
            Ok(vec![])
        }
    }
}

/// Publish a platform-wide announcement to every listener on the
/// system socket.
pub async fn broadcast_announcement(
    layer: &dyn ChannelLayer,
    title: &str,
    message: &str,
    sender: Option<&str>,
) -> Result<()> {
    let frame = ServerFrame::SystemAnnouncement {
        title: title.to_string(),
        message: message.to_string(),
        priority: crate::models::Priority::Normal,
        timestamp: Utc::now(),
        sender: sender.map(str::to_string),
    };
    layer.publish(SYSTEM_GROUP, &serde_json::to_string(&frame)?).await
}
