//! Topic store: subscribers and presence metas per channel topic.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

/// One subscribed connection on a topic.
pub struct Subscriber {
    /// Outbound frame queue of the owning connection.
    pub tx: mpsc::Sender<String>,
    /// Whether this subscriber receives its own broadcasts back.
    pub self_broadcast: bool,
    /// Whether this subscriber's broadcasts are acknowledged.
    pub ack: bool,
    /// Presence key from the join config (the client id).
    pub presence_key: String,
    /// Tracked presence meta, if any.
    pub meta: Option<Value>,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<u64, Subscriber>,
}

impl Topic {
    fn presence_state(&self) -> HashMap<String, Vec<Value>> {
        let mut state: HashMap<String, Vec<Value>> = HashMap::new();
        for sub in self.subscribers.values() {
            if let Some(meta) = &sub.meta {
                state
                    .entry(sub.presence_key.clone())
                    .or_default()
                    .push(meta.clone());
            }
        }
        state
    }
}

/// Thread-safe store of all topics. The relay never inspects broadcast
/// payloads; this store only does membership and presence bookkeeping.
#[derive(Clone)]
pub struct TopicStore {
    topics: Arc<RwLock<HashMap<String, Topic>>>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connection on a topic. A rejoin replaces the previous
    /// registration for that connection.
    pub async fn join(&self, topic: &str, conn_id: u64, subscriber: Subscriber) {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .insert(conn_id, subscriber);
    }

    /// Remove a connection from a topic. Returns `(presence_key, meta)`
    /// when the connection was still tracking presence, so the caller
    /// can fan out a leave diff. Empty topics are dropped.
    pub async fn leave(&self, topic: &str, conn_id: u64) -> Option<(String, Value)> {
        let mut topics = self.topics.write().await;
        let entry = topics.get_mut(topic)?;
        let removed = entry.subscribers.remove(&conn_id);
        if entry.subscribers.is_empty() {
            topics.remove(topic);
        }
        removed.and_then(|sub| sub.meta.map(|meta| (sub.presence_key, meta)))
    }

    /// Remove a connection from every topic (socket closed). Returns
    /// `(topic, presence_key, meta)` for each tracked presence dropped.
    pub async fn leave_all(&self, conn_id: u64) -> Vec<(String, String, Value)> {
        let mut topics = self.topics.write().await;
        let mut left = Vec::new();
        for (name, topic) in topics.iter_mut() {
            if let Some(sub) = topic.subscribers.remove(&conn_id) {
                if let Some(meta) = sub.meta {
                    left.push((name.clone(), sub.presence_key, meta));
                }
            }
        }
        topics.retain(|_, topic| !topic.subscribers.is_empty());
        left
    }

    /// Record a presence meta. Returns the presence key.
    pub async fn track(&self, topic: &str, conn_id: u64, meta: Value) -> Option<String> {
        let mut topics = self.topics.write().await;
        let sub = topics.get_mut(topic)?.subscribers.get_mut(&conn_id)?;
        sub.meta = Some(meta);
        Some(sub.presence_key.clone())
    }

    /// Clear a presence meta. Returns `(presence_key, meta)` when one
    /// was tracked.
    pub async fn untrack(&self, topic: &str, conn_id: u64) -> Option<(String, Value)> {
        let mut topics = self.topics.write().await;
        let sub = topics.get_mut(topic)?.subscribers.get_mut(&conn_id)?;
        sub.meta.take().map(|meta| (sub.presence_key.clone(), meta))
    }

    /// Current presence snapshot of a topic.
    pub async fn presence_state(&self, topic: &str) -> HashMap<String, Vec<Value>> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.presence_state())
            .unwrap_or_default()
    }

    /// Whether a connection's broadcasts on a topic are acknowledged.
    pub async fn wants_ack(&self, topic: &str, conn_id: u64) -> bool {
        self.topics
            .read()
            .await
            .get(topic)
            .and_then(|t| t.subscribers.get(&conn_id))
            .map(|s| s.ack)
            .unwrap_or(false)
    }

    /// Outbound queues of every subscriber of a topic. With
    /// `from = Some(id)`, the sender is excluded when it opted out of
    /// its own broadcasts.
    pub async fn fanout(&self, topic: &str, from: Option<u64>) -> Vec<mpsc::Sender<String>> {
        let topics = self.topics.read().await;
        let Some(entry) = topics.get(topic) else {
            return Vec::new();
        };
        entry
            .subscribers
            .iter()
            .filter(|(id, sub)| match from {
                Some(from_id) if **id == from_id => sub.self_broadcast,
                _ => true,
            })
            .map(|(_, sub)| sub.tx.clone())
            .collect()
    }

    /// Number of topics with at least one subscriber.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Number of subscribers on a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for TopicStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(key: &str, tx: mpsc::Sender<String>) -> Subscriber {
        Subscriber {
            tx,
            self_broadcast: true,
            ack: false,
            presence_key: key.into(),
            meta: None,
        }
    }

    #[tokio::test]
    async fn join_and_leave_bookkeeping() {
        let store = TopicStore::new();
        let (tx, _rx) = mpsc::channel(8);

        store.join("realtime:game", 1, subscriber("a", tx)).await;
        assert_eq!(store.subscriber_count("realtime:game").await, 1);

        store.leave("realtime:game", 1).await;
        assert_eq!(store.subscriber_count("realtime:game").await, 0);
        // Empty topics are dropped.
        assert_eq!(store.topic_count().await, 0);
    }

    #[tokio::test]
    async fn track_untrack_round_trip() {
        let store = TopicStore::new();
        let (tx, _rx) = mpsc::channel(8);
        store.join("realtime:game", 1, subscriber("a", tx)).await;

        let key = store
            .track("realtime:game", 1, serde_json::json!({ "clientId": "a" }))
            .await;
        assert_eq!(key.as_deref(), Some("a"));

        let state = store.presence_state("realtime:game").await;
        assert_eq!(state.len(), 1);
        assert_eq!(state["a"][0]["clientId"], "a");

        let (key, meta) = store.untrack("realtime:game", 1).await.unwrap();
        assert_eq!(key, "a");
        assert_eq!(meta["clientId"], "a");
        assert!(store.presence_state("realtime:game").await.is_empty());
    }

    #[tokio::test]
    async fn leave_reports_tracked_presence() {
        let store = TopicStore::new();
        let (tx, _rx) = mpsc::channel(8);
        store.join("realtime:game", 1, subscriber("a", tx)).await;
        store
            .track("realtime:game", 1, serde_json::json!({ "clientId": "a" }))
            .await;

        let left = store.leave("realtime:game", 1).await;
        assert!(left.is_some());

        // Leaving without a tracked meta reports nothing.
        let (tx2, _rx2) = mpsc::channel(8);
        store.join("realtime:game", 2, subscriber("b", tx2)).await;
        assert!(store.leave("realtime:game", 2).await.is_none());
    }

    #[tokio::test]
    async fn leave_all_spans_topics() {
        let store = TopicStore::new();
        let (tx, _rx) = mpsc::channel(8);
        store.join("realtime:game", 1, subscriber("a", tx.clone())).await;
        store.join("realtime:lobby", 1, subscriber("a", tx)).await;
        store
            .track("realtime:game", 1, serde_json::json!({ "clientId": "a" }))
            .await;

        let left = store.leave_all(1).await;
        // Only the tracked topic reports a presence drop.
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "realtime:game");
        assert_eq!(store.topic_count().await, 0);
    }

    #[tokio::test]
    async fn fanout_honors_self_flag() {
        let store = TopicStore::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        let mut no_self = subscriber("a", tx1);
        no_self.self_broadcast = false;
        store.join("realtime:game", 1, no_self).await;
        store.join("realtime:game", 2, subscriber("b", tx2)).await;

        assert_eq!(store.fanout("realtime:game", Some(1)).await.len(), 1);
        assert_eq!(store.fanout("realtime:game", Some(2)).await.len(), 2);
        assert_eq!(store.fanout("realtime:game", None).await.len(), 2);
    }

    #[tokio::test]
    async fn rejoin_replaces_registration() {
        let store = TopicStore::new();
        let (tx, _rx) = mpsc::channel(8);
        store.join("realtime:game", 1, subscriber("a", tx.clone())).await;
        store
            .track("realtime:game", 1, serde_json::json!({ "clientId": "a" }))
            .await;

        // A rejoin wipes the stale meta with the fresh registration.
        store.join("realtime:game", 1, subscriber("a", tx)).await;
        assert_eq!(store.subscriber_count("realtime:game").await, 1);
        assert!(store.presence_state("realtime:game").await.is_empty());
    }
}
