//! Reactive value container for session outputs.

use std::sync::Arc;

use tokio::sync::watch;

/// A shared, observable value.
///
/// Subscribers see the current value immediately on subscribe and are
/// notified of every subsequent update. Writers go through [`set`] or
/// [`update`]; readers never mutate.
///
/// [`set`]: Store::set
/// [`update`]: Store::update
#[derive(Debug)]
pub struct Store<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T: Clone> Store<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Clone of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate the value in place and notify subscribers.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        self.tx.send_modify(f);
    }

    /// Subscribe to the value. The receiver's `borrow()` yields the
    /// current value right away; `changed()` resolves on every update.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_current_value_immediately() {
        let store = Store::new(7u32);
        let rx = store.subscribe();
        assert_eq!(*rx.borrow(), 7);
    }

    #[tokio::test]
    async fn subscriber_sees_updates() {
        let store = Store::new(vec![1u32]);
        let mut rx = store.subscribe();

        store.update(|v| v.push(2));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), vec![1, 2]);
    }

    #[tokio::test]
    async fn set_replaces_wholesale() {
        let store = Store::new(vec![1u32, 2]);
        store.set(vec![9]);
        assert_eq!(store.get(), vec![9]);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = Store::new(0u32);
        let clone = store.clone();
        clone.set(5);
        assert_eq!(store.get(), 5);
    }
}
