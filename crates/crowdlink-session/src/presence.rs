//! Live registry of connected clients.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::watch;

use crate::protocol::{parse_presence_meta, ConnectedClient};
use crate::store::Store;

/// Pure projection of the transport's presence snapshot.
///
/// The only mutation path is [`sync_from`], fed by the channel's
/// presence sync events. Every sync replaces the published set
/// wholesale — the snapshot is authoritative and complete, so a merge
/// could only preserve stale entries.
///
/// [`sync_from`]: PresenceRegistry::sync_from
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Store<Vec<ConnectedClient>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            store: Store::new(Vec::new()),
        }
    }

    /// Replace the connected set from a presence snapshot, taking the
    /// first registered meta per presence key. Entries whose meta does
    /// not parse (missing fields, unknown role) are skipped.
    pub fn sync_from(&self, state: &HashMap<String, Vec<Value>>) {
        let mut clients: Vec<ConnectedClient> = state
            .values()
            .filter_map(|metas| parse_presence_meta(metas))
            .map(|meta| ConnectedClient {
                client_id: meta.client_id,
                role: meta.role,
            })
            .collect();
        // Stable output for consumers diffing successive snapshots.
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        self.store.set(clients);
    }

    /// Clone of the current connected set.
    pub fn snapshot(&self) -> Vec<ConnectedClient> {
        self.store.get()
    }

    /// Live view: current set immediately, then every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ConnectedClient>> {
        self.store.subscribe()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
