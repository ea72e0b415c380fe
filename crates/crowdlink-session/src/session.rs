//! One client identity + role bound to one open channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::log::MessageLog;
use crate::manager::ConnectionManager;
use crate::presence::PresenceRegistry;
use crate::protocol::{dedupe_buttons, ButtonConfig, ButtonInput, Message, Role, MESSAGE_EVENT};
use crate::transport::{ChannelEvent, ChannelHandle};

/// A live session: mediates all inbound and outbound traffic for one
/// client on the shared topic.
///
/// Created by [`ConnectionManager::connect`]; at most one live instance
/// exists per client identity (the manager evicts any prior one).
/// Outbound sends are fire-and-forget: failures are logged, never
/// surfaced, because nothing on this path may take the caller down.
pub struct ChannelSession {
    client_id: String,
    role: Role,
    handle: Arc<dyn ChannelHandle>,
    subscribed: Arc<AtomicBool>,
    disconnecting: AtomicBool,
    manager: Weak<ConnectionManager>,
}

impl ChannelSession {
    pub(crate) fn new(
        client_id: String,
        role: Role,
        handle: Arc<dyn ChannelHandle>,
        manager: Weak<ConnectionManager>,
    ) -> Self {
        Self {
            client_id,
            role,
            handle,
            subscribed: Arc::new(AtomicBool::new(false)),
            disconnecting: AtomicBool::new(false),
            manager,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Attach the event pump. Must run before the channel subscribes so
    /// no event can slip past the observers.
    pub(crate) fn spawn_pump(
        &self,
        events: mpsc::Receiver<ChannelEvent>,
        log: MessageLog,
        presence: PresenceRegistry,
    ) {
        tokio::spawn(event_pump(
            events,
            Arc::clone(&self.handle),
            Arc::clone(&self.subscribed),
            self.client_id.clone(),
            self.role,
            log,
            presence,
        ));
    }

    pub(crate) async fn subscribe(&self) -> Result<(), crowdlink_common::TransportError> {
        self.handle.subscribe().await
    }

    // -----------------------------------------------------------------
    // Outbound operations
    // -----------------------------------------------------------------

    /// Broadcast a game state patch (host).
    pub async fn send(&self, game_state: serde_json::Map<String, Value>) {
        self.broadcast(Message::GameUpdate {
            client_id: self.client_id.clone(),
            role: self.role,
            game_state,
        })
        .await;
    }

    /// Broadcast a button press or release (controller).
    pub async fn send_input(&self, button: &str, pressed: bool) {
        self.broadcast(Message::PlayerInput {
            client_id: self.client_id.clone(),
            role: self.role,
            input: ButtonInput {
                button: button.to_string(),
                pressed,
            },
        })
        .await;
    }

    /// Broadcast the full control layout (host). Duplicate button ids
    /// are dropped, first occurrence wins.
    pub async fn send_button_config(&self, buttons: Vec<ButtonConfig>) {
        self.broadcast(Message::ButtonConfig {
            client_id: self.client_id.clone(),
            role: self.role,
            buttons: dedupe_buttons(buttons),
        })
        .await;
    }

    /// Ask the host to rebroadcast the control layout (controller).
    pub async fn request_button_config(&self) {
        self.broadcast(Message::ButtonConfigRequest {
            client_id: self.client_id.clone(),
            role: self.role,
        })
        .await;
    }

    async fn broadcast(&self, message: Message) {
        match serde_json::to_value(&message) {
            Ok(payload) => {
                if let Err(e) = self.handle.send(MESSAGE_EVENT, payload).await {
                    warn!(
                        client_id = %self.client_id,
                        kind = message.type_name(),
                        error = %e,
                        "broadcast send failed"
                    );
                }
            }
            Err(e) => {
                warn!(kind = message.type_name(), error = %e, "message did not serialize");
            }
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Tear this session down. Idempotent: a re-entrant or concurrent
    /// call while teardown is in flight is a no-op.
    ///
    /// Presence untrack and channel unsubscribe run concurrently and
    /// both are always attempted; one failing never aborts the other.
    /// Afterwards the session deregisters from its manager regardless
    /// of either outcome.
    pub async fn disconnect(&self) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "disconnect already in flight");
            return;
        }
        info!(client_id = %self.client_id, role = %self.role, "disconnecting");

        let (untracked, unsubscribed) =
            tokio::join!(self.handle.untrack(), self.handle.unsubscribe());
        if let Err(e) = untracked {
            warn!(client_id = %self.client_id, error = %e, "presence untrack failed");
        }
        if let Err(e) = unsubscribed {
            warn!(client_id = %self.client_id, error = %e, "channel unsubscribe failed");
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(&self.client_id, self).await;
        }
    }

    /// Fire-and-forget [`disconnect`], for shutdown paths that cannot
    /// await (window close, visibility loss, signal handlers). The
    /// spawned teardown is best-effort; the process may exit before it
    /// finishes.
    ///
    /// [`disconnect`]: ChannelSession::disconnect
    pub fn disconnect_detached(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.disconnect().await;
        });
    }
}

// ---------------------------------------------------------------------------
// Event pump
// ---------------------------------------------------------------------------

/// Drives one session's inbound traffic: the sole ingestion point for
/// protocol messages and presence snapshots.
async fn event_pump(
    mut events: mpsc::Receiver<ChannelEvent>,
    handle: Arc<dyn ChannelHandle>,
    subscribed: Arc<AtomicBool>,
    client_id: String,
    role: Role,
    log: MessageLog,
    presence: PresenceRegistry,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Subscribed => {
                // Only the first acknowledgment publishes presence;
                // later acks of the same state are no-ops.
                if !subscribed.swap(true, Ordering::SeqCst) {
                    info!(client_id = %client_id, role = %role, "channel subscribed");
                    let meta = serde_json::json!({
                        "clientId": client_id,
                        "role": role,
                        "online_at": chrono::Utc::now().to_rfc3339(),
                    });
                    if let Err(e) = handle.track(meta).await {
                        warn!(client_id = %client_id, error = %e, "presence track failed");
                    }
                }
            }
            ChannelEvent::Broadcast { event, payload } => {
                if event != MESSAGE_EVENT {
                    debug!(event = %event, "unhandled broadcast event");
                    continue;
                }
                match serde_json::from_value::<Message>(payload) {
                    Ok(message) => {
                        debug!(
                            client_id = %client_id,
                            kind = message.type_name(),
                            from = message.client_id().unwrap_or("?"),
                            "message received"
                        );
                        log.append(message);
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable broadcast payload");
                    }
                }
            }
            ChannelEvent::PresenceSync { state } => {
                presence.sync_from(&state);
            }
            ChannelEvent::PresenceJoin { key, .. } => {
                debug!(key = %key, "client joined");
            }
            ChannelEvent::PresenceLeave { key, .. } => {
                debug!(key = %key, "client left");
            }
            ChannelEvent::ChannelError { message } => {
                warn!(client_id = %client_id, message = %message, "channel error");
            }
            ChannelEvent::Disconnected => {
                debug!(client_id = %client_id, "transport disconnected");
            }
        }
    }
    debug!(client_id = %client_id, "event pump ended");
}
