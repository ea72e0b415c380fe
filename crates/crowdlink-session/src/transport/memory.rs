//! In-process topic broker.
//!
//! Same observable semantics as the WebSocket transport — subscribe
//! acknowledgment, authoritative presence snapshots, per-subscriber
//! self-broadcast flag — with delivery over in-memory channels. Lets a
//! single process host a session (host + view in one binary) and drives
//! the test suite deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crowdlink_common::TransportError;

use super::{ChannelEvent, ChannelHandle, ChannelOptions, Transport};

type Topics = Arc<RwLock<HashMap<String, Topic>>>;

#[derive(Default)]
struct Topic {
    members: HashMap<u64, Member>,
}

struct Member {
    tx: mpsc::Sender<ChannelEvent>,
    presence_key: String,
    self_broadcast: bool,
    subscribed: bool,
    meta: Option<Value>,
}

impl Topic {
    /// Presence snapshot over members that are currently tracking.
    fn presence_state(&self) -> HashMap<String, Vec<Value>> {
        let mut state: HashMap<String, Vec<Value>> = HashMap::new();
        for member in self.members.values() {
            if let Some(meta) = &member.meta {
                state
                    .entry(member.presence_key.clone())
                    .or_default()
                    .push(meta.clone());
            }
        }
        state
    }

    /// Senders of all subscribed members, minus `exclude_self` when that
    /// member opted out of its own broadcasts.
    fn fanout(&self, exclude_self: Option<u64>) -> Vec<mpsc::Sender<ChannelEvent>> {
        self.members
            .iter()
            .filter(|(id, m)| m.subscribed && Some(**id) != exclude_self)
            .map(|(_, m)| m.tx.clone())
            .collect()
    }
}

/// In-process [`Transport`].
pub struct MemoryHub {
    topics: Topics,
    next_id: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Number of members currently subscribed to a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.members.values().filter(|m| m.subscribed).count())
            .unwrap_or(0)
    }

    /// Presence keys currently tracked on a topic.
    pub async fn tracked_keys(&self, topic: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .topics
            .read()
            .await
            .get(topic)
            .map(|t| t.presence_state().keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

async fn deliver(targets: Vec<mpsc::Sender<ChannelEvent>>, event: ChannelEvent) {
    for tx in targets {
        // A full or closed receiver only affects that member.
        let _ = tx.send(event.clone()).await;
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn open(
        &self,
        topic: &str,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn ChannelHandle>, mpsc::Receiver<ChannelEvent>), TransportError> {
        let (tx, rx) = mpsc::channel(256);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.write().await;
        topics.entry(topic.to_string()).or_default().members.insert(
            id,
            Member {
                tx,
                presence_key: options.presence_key.clone(),
                self_broadcast: options.self_broadcast,
                subscribed: false,
                meta: None,
            },
        );
        drop(topics);

        let handle = Arc::new(MemoryChannel {
            topics: Arc::clone(&self.topics),
            topic: topic.to_string(),
            id,
        });
        Ok((handle, rx))
    }

    async fn shutdown(&self) {
        // Dropping every member closes their event streams.
        self.topics.write().await.clear();
        debug!("memory hub shut down");
    }
}

struct MemoryChannel {
    topics: Topics,
    topic: String,
    id: u64,
}

impl MemoryChannel {
    async fn with_topic<R>(
        &self,
        f: impl FnOnce(&mut Topic) -> R,
    ) -> Result<R, TransportError> {
        let mut topics = self.topics.write().await;
        match topics.get_mut(&self.topic) {
            Some(topic) => Ok(f(topic)),
            None => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    async fn subscribe(&self) -> Result<(), TransportError> {
        let (own_tx, state) = self
            .with_topic(|topic| {
                let state = topic.presence_state();
                match topic.members.get_mut(&self.id) {
                    Some(member) => {
                        member.subscribed = true;
                        Some((member.tx.clone(), state))
                    }
                    None => None,
                }
            })
            .await?
            .ok_or(TransportError::Closed)?;

        let _ = own_tx.send(ChannelEvent::Subscribed).await;
        let _ = own_tx.send(ChannelEvent::PresenceSync { state }).await;
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let (removed, targets, state) = {
            let mut topics = self.topics.write().await;
            let Some(topic) = topics.get_mut(&self.topic) else {
                return Ok(()); // already torn down
            };
            let removed = topic.members.remove(&self.id);
            let targets = topic.fanout(None);
            let state = topic.presence_state();
            if topic.members.is_empty() {
                topics.remove(&self.topic);
            }
            (removed, targets, state)
        };

        // A member that was still tracking leaves the presence set.
        if let Some(member) = removed {
            if let Some(meta) = member.meta {
                deliver(
                    targets.clone(),
                    ChannelEvent::PresenceLeave {
                        key: member.presence_key,
                        metas: vec![meta],
                    },
                )
                .await;
                deliver(targets, ChannelEvent::PresenceSync { state }).await;
            }
        }
        Ok(())
    }

    async fn track(&self, meta: Value) -> Result<(), TransportError> {
        let (key, targets, state) = self
            .with_topic(|topic| {
                let key = match topic.members.get_mut(&self.id) {
                    Some(member) => {
                        member.meta = Some(meta.clone());
                        member.presence_key.clone()
                    }
                    None => return None,
                };
                Some((key, topic.fanout(None), topic.presence_state()))
            })
            .await?
            .ok_or(TransportError::Closed)?;

        deliver(
            targets.clone(),
            ChannelEvent::PresenceJoin {
                key,
                metas: vec![meta],
            },
        )
        .await;
        deliver(targets, ChannelEvent::PresenceSync { state }).await;
        Ok(())
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        let result = self
            .with_topic(|topic| {
                let (key, meta) = match topic.members.get_mut(&self.id) {
                    Some(member) => (member.presence_key.clone(), member.meta.take()),
                    None => return None,
                };
                Some((key, meta, topic.fanout(None), topic.presence_state()))
            })
            .await?
            .ok_or(TransportError::Closed)?;

        let (key, meta, targets, state) = result;
        if let Some(meta) = meta {
            deliver(
                targets.clone(),
                ChannelEvent::PresenceLeave {
                    key,
                    metas: vec![meta],
                },
            )
            .await;
            deliver(targets, ChannelEvent::PresenceSync { state }).await;
        }
        Ok(())
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let targets = self
            .with_topic(|topic| {
                let exclude_self = match topic.members.get(&self.id) {
                    Some(member) if !member.self_broadcast => Some(self.id),
                    _ => None,
                };
                topic.fanout(exclude_self)
            })
            .await?;

        deliver(
            targets,
            ChannelEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
        )
        .await;
        Ok(())
    }
}
