//! WebSocket transport speaking the Phoenix Channels v1 protocol.
//!
//! Each open channel runs its own connection task: connect with
//! timeout, heartbeat, command forwarding, and auto-reconnect with
//! exponential backoff. Across a reconnect the task rejoins the topic
//! and re-tracks the last presence record, so sessions only observe a
//! `Disconnected` followed by fresh presence syncs. One socket per
//! channel: presence membership is keyed per connection at the server,
//! so channels do not share a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crowdlink_common::wire::{self, events, WireMessage};
use crowdlink_common::{BroadcastPayload, JoinConfig, PresenceCommand, TransportError};

use super::{ChannelEvent, ChannelHandle, ChannelOptions, Transport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// WebSocket URL of the relay or hosted realtime endpoint.
    pub url: String,
    /// Heartbeat interval in seconds (default: 25).
    pub heartbeat_interval_secs: u64,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
    /// Connect attempt timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for PhoenixConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000".to_string(),
            heartbeat_interval_secs: 25,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
            connect_timeout_secs: 15,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Monotonically increasing ref counter for wire messages.
static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_ref() -> String {
    REF_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
}

/// Commands a channel handle sends to its connection task.
#[derive(Debug)]
enum Command {
    Join,
    Leave,
    Track(Value),
    Untrack,
    Broadcast { event: String, payload: Value },
    Close,
}

struct ChannelEntry {
    cmd_tx: mpsc::Sender<Command>,
    closing: Arc<AtomicBool>,
}

/// WebSocket [`Transport`].
pub struct PhoenixTransport {
    config: PhoenixConfig,
    channels: Arc<RwLock<HashMap<u64, ChannelEntry>>>,
    next_id: AtomicU64,
}

impl PhoenixTransport {
    pub fn new(config: PhoenixConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Transport for PhoenixTransport {
    async fn open(
        &self,
        topic: &str,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn ChannelHandle>, mpsc::Receiver<ChannelEvent>), TransportError> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let closing = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.channels.write().await.insert(
            id,
            ChannelEntry {
                cmd_tx: cmd_tx.clone(),
                closing: Arc::clone(&closing),
            },
        );

        tokio::spawn(channel_loop(
            self.config.clone(),
            topic.to_string(),
            options,
            event_tx,
            cmd_rx,
            Arc::clone(&closing),
            Arc::clone(&self.channels),
            id,
        ));

        let handle = Arc::new(PhoenixChannel { cmd_tx, closing });
        Ok((handle, event_rx))
    }

    async fn shutdown(&self) {
        let drained: Vec<ChannelEntry> = {
            let mut channels = self.channels.write().await;
            channels.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.closing.store(true, Ordering::SeqCst);
            let _ = entry.cmd_tx.send(Command::Close).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Channel handle
// ---------------------------------------------------------------------------

struct PhoenixChannel {
    cmd_tx: mpsc::Sender<Command>,
    closing: Arc<AtomicBool>,
}

impl PhoenixChannel {
    async fn command(&self, cmd: Command) -> Result<(), TransportError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl ChannelHandle for PhoenixChannel {
    async fn subscribe(&self) -> Result<(), TransportError> {
        self.command(Command::Join).await
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        // Mark first so a disconnected loop exits instead of reconnecting.
        self.closing.store(true, Ordering::SeqCst);
        self.command(Command::Leave).await
    }

    async fn track(&self, meta: Value) -> Result<(), TransportError> {
        self.command(Command::Track(meta)).await
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        self.command(Command::Untrack).await
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.command(Command::Broadcast {
            event: event.to_string(),
            payload,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Per-channel state carried across reconnects.
#[derive(Default)]
struct ChannelState {
    join_requested: bool,
    presence_meta: Option<Value>,
    presence: HashMap<String, Vec<Value>>,
}

#[allow(clippy::too_many_arguments)]
async fn channel_loop(
    config: PhoenixConfig,
    topic: String,
    options: ChannelOptions,
    event_tx: mpsc::Sender<ChannelEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    closing: Arc<AtomicBool>,
    channels: Arc<RwLock<HashMap<u64, ChannelEntry>>>,
    id: u64,
) {
    let full_topic = format!("{}{}", wire::TOPIC_PREFIX, topic);
    let cmd_rx = Arc::new(Mutex::new(cmd_rx));
    let state = Arc::new(RwLock::new(ChannelState::default()));
    let mut reconnect_delay = config.reconnect_delay_secs;

    loop {
        if closing.load(Ordering::SeqCst) {
            break;
        }

        match tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            tokio_tungstenite::connect_async(&config.url),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = config.reconnect_delay_secs;
                info!(topic = %topic, "transport connected");

                let (ws_write, mut ws_read) = ws_stream.split();
                let ws_write = Arc::new(Mutex::new(ws_write));

                // Rejoin and re-track after a reconnect.
                {
                    let st = state.read().await;
                    if st.join_requested {
                        send_join(&ws_write, &full_topic, &options).await;
                        if let Some(meta) = &st.presence_meta {
                            send_track(&ws_write, &full_topic, meta.clone()).await;
                        }
                    }
                }

                let heartbeat = tokio::spawn(heartbeat_task(
                    Arc::clone(&ws_write),
                    config.heartbeat_interval_secs,
                ));
                let forwarder = tokio::spawn(command_forwarder(
                    Arc::clone(&cmd_rx),
                    Arc::clone(&ws_write),
                    full_topic.clone(),
                    options.clone(),
                    Arc::clone(&state),
                    Arc::clone(&closing),
                ));

                while let Some(frame) = ws_read.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            if let Ok(msg) = serde_json::from_str::<WireMessage>(&text) {
                                handle_frame(&msg, &full_topic, &state, &event_tx).await;
                            } else {
                                debug!(text = %text, "unrecognized frame");
                            }
                        }
                        Ok(WsMessage::Close(_)) => {
                            info!(topic = %topic, "server closed connection");
                            break;
                        }
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "websocket error");
                            break;
                        }
                        _ => {}
                    }
                }

                heartbeat.abort();
                forwarder.abort();
                state.write().await.presence.clear();
                let _ = event_tx.send(ChannelEvent::Disconnected).await;
            }
            Ok(Err(e)) => {
                error!(topic = %topic, error = %e, "transport connect failed");
                let _ = event_tx
                    .send(ChannelEvent::ChannelError {
                        message: format!("connect failed: {e}"),
                    })
                    .await;
            }
            Err(_elapsed) => {
                error!(
                    topic = %topic,
                    timeout = config.connect_timeout_secs,
                    "transport connect timed out"
                );
                let _ = event_tx
                    .send(ChannelEvent::ChannelError {
                        message: "connect timed out".to_string(),
                    })
                    .await;
            }
        }

        if closing.load(Ordering::SeqCst) {
            break;
        }

        // Exponential backoff before reconnecting.
        debug!(topic = %topic, delay = reconnect_delay, "reconnecting after delay");
        tokio::time::sleep(Duration::from_secs(reconnect_delay)).await;
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_secs);
    }

    channels.write().await.remove(&id);
    debug!(topic = %topic, "channel task ended");
}

// ---------------------------------------------------------------------------
// Outbound helpers
// ---------------------------------------------------------------------------

async fn send_frame<S>(ws_write: &Arc<Mutex<S>>, msg: WireMessage)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    if let Ok(json) = serde_json::to_string(&msg) {
        let mut writer = ws_write.lock().await;
        let _ = writer.send(WsMessage::Text(json.into())).await;
    }
}

async fn send_join<S>(ws_write: &Arc<Mutex<S>>, full_topic: &str, options: &ChannelOptions)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let config = JoinConfig {
        presence_key: options.presence_key.clone(),
        self_broadcast: options.self_broadcast,
        ack: options.ack,
    };
    send_frame(
        ws_write,
        WireMessage {
            topic: full_topic.to_string(),
            event: events::JOIN.to_string(),
            payload: config.to_payload(),
            msg_ref: Some(next_ref()),
        },
    )
    .await;
}

async fn send_track<S>(ws_write: &Arc<Mutex<S>>, full_topic: &str, meta: Value)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let payload = match serde_json::to_value(PresenceCommand::track(meta)) {
        Ok(v) => v,
        Err(_) => return,
    };
    send_frame(
        ws_write,
        WireMessage {
            topic: full_topic.to_string(),
            event: events::PRESENCE.to_string(),
            payload,
            msg_ref: Some(next_ref()),
        },
    )
    .await;
}

async fn heartbeat_task<S>(ws_write: Arc<Mutex<S>>, interval_secs: u64)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.tick().await;
    loop {
        interval.tick().await;
        let msg = WireMessage {
            topic: "phoenix".to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: serde_json::json!({}),
            msg_ref: Some(next_ref()),
        };
        if let Ok(json) = serde_json::to_string(&msg) {
            let mut writer = ws_write.lock().await;
            if writer.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    }
}

async fn command_forwarder<S>(
    cmd_rx: Arc<Mutex<mpsc::Receiver<Command>>>,
    ws_write: Arc<Mutex<S>>,
    full_topic: String,
    options: ChannelOptions,
    state: Arc<RwLock<ChannelState>>,
    closing: Arc<AtomicBool>,
) where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut rx = cmd_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Join => {
                send_join(&ws_write, &full_topic, &options).await;
                state.write().await.join_requested = true;
            }
            Command::Track(meta) => {
                // Stored for re-tracking on reconnect.
                state.write().await.presence_meta = Some(meta.clone());
                send_track(&ws_write, &full_topic, meta).await;
            }
            Command::Untrack => {
                state.write().await.presence_meta = None;
                let payload = match serde_json::to_value(PresenceCommand::untrack()) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                send_frame(
                    &ws_write,
                    WireMessage {
                        topic: full_topic.clone(),
                        event: events::PRESENCE.to_string(),
                        payload,
                        msg_ref: Some(next_ref()),
                    },
                )
                .await;
            }
            Command::Broadcast { event, payload } => {
                let payload = match serde_json::to_value(BroadcastPayload::new(&event, payload)) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                send_frame(
                    &ws_write,
                    WireMessage {
                        topic: full_topic.clone(),
                        event: events::BROADCAST.to_string(),
                        payload,
                        msg_ref: Some(next_ref()),
                    },
                )
                .await;
            }
            Command::Leave => {
                send_frame(
                    &ws_write,
                    WireMessage {
                        topic: full_topic.clone(),
                        event: events::LEAVE.to_string(),
                        payload: serde_json::json!({}),
                        msg_ref: Some(next_ref()),
                    },
                )
                .await;
                state.write().await.join_requested = false;
                closing.store(true, Ordering::SeqCst);
                let mut writer = ws_write.lock().await;
                let _ = writer.send(WsMessage::Close(None)).await;
                return;
            }
            Command::Close => {
                closing.store(true, Ordering::SeqCst);
                let mut writer = ws_write.lock().await;
                let _ = writer.send(WsMessage::Close(None)).await;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound frame handling
// ---------------------------------------------------------------------------

async fn handle_frame(
    msg: &WireMessage,
    full_topic: &str,
    state: &Arc<RwLock<ChannelState>>,
    event_tx: &mpsc::Sender<ChannelEvent>,
) {
    if msg.topic != full_topic {
        // Heartbeat replies arrive on the "phoenix" topic.
        if msg.topic != "phoenix" {
            debug!(topic = %msg.topic, event = %msg.event, "frame for other topic");
        }
        return;
    }

    match msg.event.as_str() {
        events::REPLY => {
            if let Some(status) = msg.payload.get("status").and_then(|s| s.as_str()) {
                if status == "ok" {
                    // Join acks and command acks are not ref-matched;
                    // sessions de-duplicate via their subscribed flag.
                    let _ = event_tx.send(ChannelEvent::Subscribed).await;
                } else {
                    let message = msg
                        .payload
                        .get("response")
                        .and_then(|r| r.get("reason"))
                        .and_then(|r| r.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    warn!(status = %status, message = %message, "channel reply error");
                    let _ = event_tx.send(ChannelEvent::ChannelError { message }).await;
                }
            }
        }
        events::ERROR => {
            let _ = event_tx
                .send(ChannelEvent::ChannelError {
                    message: "channel error".to_string(),
                })
                .await;
        }
        events::CLOSE => {
            let _ = event_tx
                .send(ChannelEvent::ChannelError {
                    message: "channel closed".to_string(),
                })
                .await;
        }
        events::BROADCAST => {
            let event = msg
                .payload
                .get("event")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown")
                .to_string();
            let payload = msg
                .payload
                .get("payload")
                .cloned()
                .unwrap_or(Value::Null);
            let _ = event_tx
                .send(ChannelEvent::Broadcast { event, payload })
                .await;
        }
        events::PRESENCE_STATE => {
            let snapshot = wire::parse_presence_map(&msg.payload);
            state.write().await.presence = snapshot.clone();
            let _ = event_tx
                .send(ChannelEvent::PresenceSync { state: snapshot })
                .await;
        }
        events::PRESENCE_DIFF => {
            let joins = msg
                .payload
                .get("joins")
                .map(wire::parse_presence_map)
                .unwrap_or_default();
            let leaves = msg
                .payload
                .get("leaves")
                .map(wire::parse_presence_map)
                .unwrap_or_default();

            let snapshot = {
                let mut st = state.write().await;
                for key in leaves.keys() {
                    st.presence.remove(key);
                }
                for (key, metas) in &joins {
                    st.presence.insert(key.clone(), metas.clone());
                }
                st.presence.clone()
            };

            for (key, metas) in joins {
                let _ = event_tx
                    .send(ChannelEvent::PresenceJoin { key, metas })
                    .await;
            }
            for (key, metas) in leaves {
                let _ = event_tx
                    .send(ChannelEvent::PresenceLeave { key, metas })
                    .await;
            }
            let _ = event_tx
                .send(ChannelEvent::PresenceSync { state: snapshot })
                .await;
        }
        _ => {
            debug!(event = %msg.event, "unhandled channel event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, payload: Value) -> WireMessage {
        WireMessage {
            topic: "realtime:game".into(),
            event: event.into(),
            payload,
            msg_ref: None,
        }
    }

    async fn run_frame(
        msg: &WireMessage,
        state: &Arc<RwLock<ChannelState>>,
    ) -> Vec<ChannelEvent> {
        let (tx, mut rx) = mpsc::channel(32);
        handle_frame(msg, "realtime:game", state, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn refs_are_monotonic() {
        let a: u64 = next_ref().parse().unwrap();
        let b: u64 = next_ref().parse().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn ok_reply_yields_subscribed() {
        let state = Arc::new(RwLock::new(ChannelState::default()));
        let events = run_frame(
            &frame(events::REPLY, serde_json::json!({ "status": "ok", "response": {} })),
            &state,
        )
        .await;
        assert!(matches!(events.as_slice(), [ChannelEvent::Subscribed]));
    }

    #[tokio::test]
    async fn error_reply_yields_channel_error() {
        let state = Arc::new(RwLock::new(ChannelState::default()));
        let events = run_frame(
            &frame(
                events::REPLY,
                serde_json::json!({
                    "status": "error",
                    "response": { "reason": "denied" }
                }),
            ),
            &state,
        )
        .await;
        match events.as_slice() {
            [ChannelEvent::ChannelError { message }] => assert_eq!(message, "denied"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_frame_unwraps_inner_payload() {
        let state = Arc::new(RwLock::new(ChannelState::default()));
        let events = run_frame(
            &frame(
                events::BROADCAST,
                serde_json::json!({
                    "type": "broadcast",
                    "event": "message",
                    "payload": { "type": "buttonConfigRequest", "clientId": "c", "role": "controller" }
                }),
            ),
            &state,
        )
        .await;
        match events.as_slice() {
            [ChannelEvent::Broadcast { event, payload }] => {
                assert_eq!(event, "message");
                assert_eq!(payload["type"], "buttonConfigRequest");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_state_then_diff_maintains_snapshot() {
        let state = Arc::new(RwLock::new(ChannelState::default()));

        let events_out = run_frame(
            &frame(
                events::PRESENCE_STATE,
                serde_json::json!({
                    "a": { "metas": [{ "clientId": "a", "role": "host", "online_at": "t" }] }
                }),
            ),
            &state,
        )
        .await;
        match events_out.as_slice() {
            [ChannelEvent::PresenceSync { state }] => assert!(state.contains_key("a")),
            other => panic!("unexpected events: {other:?}"),
        }

        let events_out = run_frame(
            &frame(
                events::PRESENCE_DIFF,
                serde_json::json!({
                    "joins": {
                        "b": { "metas": [{ "clientId": "b", "role": "controller", "online_at": "t" }] }
                    },
                    "leaves": {
                        "a": { "metas": [{ "clientId": "a", "role": "host", "online_at": "t" }] }
                    }
                }),
            ),
            &state,
        )
        .await;

        let sync = events_out
            .iter()
            .find_map(|e| match e {
                ChannelEvent::PresenceSync { state } => Some(state.clone()),
                _ => None,
            })
            .expect("diff emits a sync");
        assert!(sync.contains_key("b"));
        assert!(!sync.contains_key("a"));
        assert!(events_out
            .iter()
            .any(|e| matches!(e, ChannelEvent::PresenceJoin { key, .. } if key == "b")));
        assert!(events_out
            .iter()
            .any(|e| matches!(e, ChannelEvent::PresenceLeave { key, .. } if key == "a")));
    }

    #[tokio::test]
    async fn frames_for_other_topics_are_ignored() {
        let state = Arc::new(RwLock::new(ChannelState::default()));
        let mut msg = frame(events::BROADCAST, serde_json::json!({}));
        msg.topic = "realtime:other".into();
        let events_out = run_frame(&msg, &state).await;
        assert!(events_out.is_empty());
    }
}
