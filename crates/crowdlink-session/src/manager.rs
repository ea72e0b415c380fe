//! Process-wide registry of active channel sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crowdlink_common::TransportError;

use crate::config::SyncConfig;
use crate::identity::IdentityStore;
use crate::log::MessageLog;
use crate::presence::PresenceRegistry;
use crate::protocol::Role;
use crate::session::ChannelSession;
use crate::transport::{ChannelOptions, Transport};

/// Owns every active session and enforces at most one live channel per
/// client identity.
///
/// Constructed once per process and passed by reference to callers; it
/// also owns the shared message log and presence registry its sessions
/// write into, and the log's prune task.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    identity: IdentityStore,
    sessions: Mutex<HashMap<String, Arc<ChannelSession>>>,
    log: MessageLog,
    presence: PresenceRegistry,
    pruner: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: SyncConfig) -> Arc<Self> {
        Self::with_identity_store(transport, config, IdentityStore::new())
    }

    /// Construct with an explicit identity store (tests, custom storage
    /// locations).
    pub fn with_identity_store(
        transport: Arc<dyn Transport>,
        config: SyncConfig,
        identity: IdentityStore,
    ) -> Arc<Self> {
        let log = MessageLog::new(config.log);
        let pruner = log.spawn_pruner();
        Arc::new(Self {
            transport,
            config,
            identity,
            sessions: Mutex::new(HashMap::new()),
            log,
            presence: PresenceRegistry::new(),
            pruner,
        })
    }

    /// Connect a new session with the given role.
    ///
    /// The identity is resolved from `existing_id` or device storage. If
    /// a session already exists for that identity, it is removed from
    /// the registry and its transport teardown is kicked off best-effort
    /// (not awaited) *before* the replacement is created — two sessions
    /// never hold current status for one id. The registry lock is held
    /// across the whole evict-then-insert window.
    pub async fn connect(
        self: &Arc<Self>,
        role: Role,
        existing_id: Option<&str>,
    ) -> Result<Arc<ChannelSession>, TransportError> {
        let client_id = self.identity.resolve(existing_id);

        let mut sessions = self.sessions.lock().await;
        if let Some(old) = sessions.remove(&client_id) {
            info!(client_id = %client_id, "replacing existing session for identity");
            old.disconnect_detached();
        }

        let options = ChannelOptions {
            presence_key: client_id.clone(),
            self_broadcast: self.config.self_broadcast,
            ack: self.config.ack,
        };
        let (handle, events) = self.transport.open(&self.config.topic, options).await?;

        let session = Arc::new(ChannelSession::new(
            client_id.clone(),
            role,
            handle,
            Arc::downgrade(self),
        ));
        // Observers first, then subscribe, so nothing slips past them.
        session.spawn_pump(events, self.log.clone(), self.presence.clone());
        if let Err(e) = session.subscribe().await {
            warn!(client_id = %client_id, error = %e, "channel subscribe failed");
        }

        sessions.insert(client_id, Arc::clone(&session));
        info!(role = %role, "session connected");
        Ok(session)
    }

    /// Tear down every registered session and the transport. Used on
    /// full process teardown; never raises — partial cleanup is
    /// acceptable while shutting down, a panic is not.
    pub async fn disconnect_all(&self) {
        let drained: Vec<Arc<ChannelSession>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        info!(count = drained.len(), "disconnecting all sessions");
        for session in drained {
            session.disconnect().await;
        }
        self.transport.shutdown().await;
    }

    /// Remove a session from the registry once its teardown completed.
    /// Pointer-matched so an evicted session cannot remove the
    /// replacement registered under the same identity. When the last
    /// session leaves, the transport is shut down so no idle
    /// connections linger.
    pub(crate) async fn deregister(&self, client_id: &str, session: &ChannelSession) {
        let mut sessions = self.sessions.lock().await;
        let is_current = sessions
            .get(client_id)
            .map(|current| std::ptr::eq(current.as_ref(), session))
            .unwrap_or(false);
        if is_current {
            sessions.remove(client_id);
            debug!(client_id = %client_id, "session deregistered");
        }
        if sessions.is_empty() {
            debug!("no sessions remain; shutting down transport");
            self.transport.shutdown().await;
        }
    }

    /// The shared, bounded log of received protocol messages.
    pub fn messages(&self) -> &MessageLog {
        &self.log
    }

    /// The live set of connected clients.
    pub fn connected_clients(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.pruner.abort();
    }
}
