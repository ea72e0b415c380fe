//! Append-only, size-bounded message log.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::LogConfig;
use crate::protocol::Message;
use crate::store::Store;

/// Ordered sequence of received protocol messages.
///
/// Append order equals broadcast delivery order. The log grows until a
/// periodic prune cycle trims it back: pruning only ever drops the
/// oldest entries, never reorders or rewrites the retained suffix.
#[derive(Clone)]
pub struct MessageLog {
    store: Store<Vec<Message>>,
    config: LogConfig,
}

impl MessageLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            store: Store::new(Vec::new()),
            config,
        }
    }

    /// Append a received message. Never prunes; the pruner runs on its
    /// own wall-clock cadence.
    pub fn append(&self, message: Message) {
        self.store.update(|log| log.push(message));
    }

    /// Trim the log to the retained suffix if it exceeds the bound.
    /// Returns how many entries were dropped.
    pub fn prune(&self) -> usize {
        let mut dropped = 0;
        self.store.update(|log| {
            if log.len() > self.config.max_len {
                dropped = log.len() - self.config.retain;
                log.drain(..dropped);
            }
        });
        if dropped > 0 {
            debug!(dropped, retained = self.config.retain, "pruned message log");
        }
        dropped
    }

    /// Spawn the periodic prune task. The handle must be aborted by the
    /// owner when the log is torn down.
    pub fn spawn_pruner(&self) -> JoinHandle<()> {
        let log = self.clone();
        let period = Duration::from_secs(self.config.prune_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                log.prune();
            }
        })
    }

    /// Clone of the current sequence.
    pub fn snapshot(&self) -> Vec<Message> {
        self.store.get()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live view: current sequence immediately, then every update.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.store.subscribe()
    }
}

/// A consumer's high-water mark over the log.
///
/// The log's indices are not stable: a prune shifts every retained
/// message toward the head. A consumer that remembers "I have processed
/// N messages" and then slices `log[N..]` would skip or re-read entries
/// after a prune. `take_new` therefore clamps the remembered count to
/// the current length before slicing, so the worst case across a prune
/// boundary is seeing nothing new until fresh messages arrive — never a
/// duplicate, never a phantom.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCursor {
    seen: usize,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages appended since the last call, given the current
    /// snapshot.
    pub fn take_new<'a>(&mut self, snapshot: &'a [Message]) -> &'a [Message] {
        if self.seen > snapshot.len() {
            self.seen = snapshot.len();
        }
        let new = &snapshot[self.seen..];
        self.seen = snapshot.len();
        new
    }

    /// How many messages this cursor has consumed.
    pub fn position(&self) -> usize {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    fn input(client: &str, button: &str) -> Message {
        Message::PlayerInput {
            client_id: client.into(),
            role: Role::Controller,
            input: crate::protocol::ButtonInput {
                button: button.into(),
                pressed: true,
            },
        }
    }

    fn test_config() -> LogConfig {
        LogConfig {
            max_len: 100,
            retain: 50,
            prune_interval_secs: 3600,
        }
    }

    #[test]
    fn append_preserves_order() {
        let log = MessageLog::new(test_config());
        log.append(input("a", "jump"));
        log.append(input("b", "duck"));
        let snapshot = log.snapshot();
        assert_eq!(snapshot[0].client_id(), Some("a"));
        assert_eq!(snapshot[1].client_id(), Some("b"));
    }

    #[test]
    fn stays_bounded_under_periodic_prunes() {
        let log = MessageLog::new(test_config());
        for i in 0..150 {
            log.append(input(&format!("c{i}"), "jump"));
            // A prune cycle between appends keeps the bound; the log can
            // only exceed max_len between cycles, never past it after one.
            log.prune();
            assert!(log.len() <= 100);
        }
    }

    #[test]
    fn prune_retains_newest_suffix_in_order() {
        let log = MessageLog::new(test_config());
        for i in 0..101 {
            log.append(input(&format!("c{i}"), "jump"));
        }
        let dropped = log.prune();
        assert_eq!(dropped, 51);
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 50);
        assert_eq!(snapshot.first().unwrap().client_id(), Some("c51"));
        assert_eq!(snapshot.last().unwrap().client_id(), Some("c100"));
    }

    #[test]
    fn prune_below_threshold_is_noop() {
        let log = MessageLog::new(test_config());
        for i in 0..100 {
            log.append(input(&format!("c{i}"), "jump"));
        }
        assert_eq!(log.prune(), 0);
        assert_eq!(log.len(), 100);
    }

    #[test]
    fn cursor_drains_incrementally() {
        let log = MessageLog::new(test_config());
        let mut cursor = LogCursor::new();

        log.append(input("a", "jump"));
        log.append(input("b", "jump"));
        let snapshot = log.snapshot();
        assert_eq!(cursor.take_new(&snapshot).len(), 2);
        assert!(cursor.take_new(&snapshot).is_empty());

        log.append(input("c", "jump"));
        let snapshot = log.snapshot();
        let new = cursor.take_new(&snapshot);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].client_id(), Some("c"));
    }

    #[test]
    fn cursor_clamps_across_prune() {
        let log = MessageLog::new(test_config());
        let mut cursor = LogCursor::new();

        for i in 0..101 {
            log.append(input(&format!("c{i}"), "jump"));
        }
        // Consumer is fully caught up at 101 messages.
        cursor.take_new(&log.snapshot());
        assert_eq!(cursor.position(), 101);

        log.prune();
        // Log is now 50 long; a naive `log[101..]` would panic or, with
        // a length diff, mis-detect. The cursor clamps instead.
        let snapshot = log.snapshot();
        assert!(cursor.take_new(&snapshot).is_empty());
        assert_eq!(cursor.position(), 50);

        log.append(input("fresh", "jump"));
        let snapshot = log.snapshot();
        let new = cursor.take_new(&snapshot);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].client_id(), Some("fresh"));
    }

    #[tokio::test]
    async fn subscribers_observe_appends() {
        let log = MessageLog::new(test_config());
        let mut rx = log.subscribe();
        assert!(rx.borrow().is_empty());

        log.append(input("a", "jump"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn pruner_task_bounds_the_log() {
        let log = MessageLog::new(LogConfig {
            max_len: 10,
            retain: 5,
            prune_interval_secs: 1,
        });
        let pruner = log.spawn_pruner();
        for i in 0..20 {
            log.append(input(&format!("c{i}"), "jump"));
        }
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(log.len() <= 10);
        pruner.abort();
    }
}
