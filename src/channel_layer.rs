use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{NotifyError, Result};

/// Group naming: one group per connected user, plus a broadcast group
/// for platform-wide announcements.
pub fn user_group(user_id: &str) -> String {
    format!("notif:user:{}", user_id)
}

pub const SYSTEM_GROUP: &str = "notif:system";

/// Fan-out seam between the dispatcher and the websocket hub. Payloads
/// are opaque serialized frames; the layer does not interpret them.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    /// Fire-and-forget: publishing to a group nobody listens on is not
    /// an error.
    async fn publish(&self, group: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, group: &str) -> Result<GroupSubscription>;
}

pub struct GroupSubscription {
    rx: mpsc::Receiver<String>,
}

impl GroupSubscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

const GROUP_BUFFER: usize = 64;

/// Single-process fan-out over tokio broadcast channels. The default
/// backend; sufficient whenever the hub and the dispatcher share a
/// process.
#[derive(Default)]
pub struct InProcessLayer {
    groups: DashMap<String, broadcast::Sender<String>>,
}

impl InProcessLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, group: &str) -> broadcast::Sender<String> {
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl ChannelLayer for InProcessLayer {
    async fn publish(&self, group: &str, payload: &str) -> Result<()> {
        // Publishing must not allocate a group nobody joined
        let Some(sender) = self.groups.get(group).map(|s| s.value().clone()) else {
            return Ok(());
        };
        if sender.send(payload.to_string()).is_err() {
            // Last subscriber is gone; drop the entry so the map does
            // not grow one group per user ever seen
            self.groups.remove_if(group, |_, s| s.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> Result<GroupSubscription> {
        let mut source = self.sender(group).subscribe();
        let (tx, rx) = mpsc::channel(GROUP_BUFFER);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "slow group subscriber dropped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(GroupSubscription { rx })
    }
}

/// Redis pub/sub backend for multi-process deployments.
pub struct RedisLayer {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisLayer {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| NotifyError::Layer(format!("redis open: {}", e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| NotifyError::Layer(format!("redis connect: {}", e)))?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl ChannelLayer for RedisLayer {
    async fn publish(&self, group: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .publish(group, payload)
            .await
            .map_err(|e| NotifyError::Layer(format!("redis publish: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> Result<GroupSubscription> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| NotifyError::Layer(format!("redis subscribe: {}", e)))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(group)
            .await
            .map_err(|e| NotifyError::Layer(format!("redis subscribe: {}", e)))?;

        let group = group.to_string();
        let (tx, rx) = mpsc::channel(GROUP_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(group = %group, error = %e, "undecodable pubsub payload"),
                }
            }
            debug!(group = %group, "pubsub stream closed");
        });
        Ok(GroupSubscription { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_group_subscribers() {
        let layer = InProcessLayer::new();
        let mut a = layer.subscribe(&user_group("u1")).await.unwrap();
        let mut b = layer.subscribe(&user_group("u1")).await.unwrap();

        layer.publish(&user_group("u1"), "hello").await.unwrap();
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let layer = InProcessLayer::new();
        let mut u1 = layer.subscribe(&user_group("u1")).await.unwrap();
        let mut u2 = layer.subscribe(&user_group("u2")).await.unwrap();

        layer.publish(&user_group("u2"), "for u2").await.unwrap();
        layer.publish(&user_group("u1"), "for u1").await.unwrap();

        assert_eq!(u1.recv().await.as_deref(), Some("for u1"));
        assert_eq!(u2.recv().await.as_deref(), Some("for u2"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let layer = InProcessLayer::new();
        layer.publish(SYSTEM_GROUP, "announcement").await.unwrap();
        assert!(layer.groups.is_empty());
    }

    #[tokio::test]
    async fn abandoned_groups_are_pruned() {
        let layer = InProcessLayer::new();
        let sub = layer.subscribe(&user_group("u1")).await.unwrap();
        drop(sub);

        // First publish lets the forwarding task notice the dropped
        // subscriber and release its broadcast receiver
        layer.publish(&user_group("u1"), "a").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        layer.publish(&user_group("u1"), "b").await.unwrap();

        assert!(layer.groups.is_empty());
    }
}
