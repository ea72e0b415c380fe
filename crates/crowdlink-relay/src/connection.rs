//! Per-connection handler: parse envelopes, route, reply.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crowdlink_common::wire::{events, presence_map_to_value, WireMessage};
use crowdlink_common::JoinConfig;

use crate::topics::{Subscriber, TopicStore};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle a single WebSocket connection for its whole lifetime.
pub async fn handle_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    addr: SocketAddr,
    store: TopicStore,
) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = ws.split();

    // All outbound frames (replies, fan-outs, diffs) flow through one
    // queue so the sink has a single writer.
    let (tx, mut rx) = mpsc::channel::<String>(256);

    tracing::info!(peer = %addr, conn = conn_id, "client connected");

    loop {
        tokio::select! {
            // Queued frames → this client's socket.
            Some(frame) = rx.recv() => {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            // Frames from this client.
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WireMessage>(&text) {
                            Ok(msg) => handle_frame(msg, conn_id, &tx, &store).await,
                            Err(e) => {
                                tracing::warn!(peer = %addr, error = %e, "invalid envelope");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Socket gone: drop every membership and tell the others.
    let left = store.leave_all(conn_id).await;
    for (topic, key, meta) in left {
        fan_out_diff(&store, &topic, HashMap::new(), one_entry(key, meta)).await;
    }
    tracing::info!(peer = %addr, conn = conn_id, "client disconnected");
}

/// Dispatch one parsed envelope.
async fn handle_frame(msg: WireMessage, conn_id: u64, tx: &mpsc::Sender<String>, store: &TopicStore) {
    match msg.event.as_str() {
        events::HEARTBEAT => {
            send(tx, &WireMessage::ok_reply(&msg.topic, msg.msg_ref)).await;
        }
        events::JOIN => {
            let config = JoinConfig::from_payload(&msg.payload);
            store
                .join(
                    &msg.topic,
                    conn_id,
                    Subscriber {
                        tx: tx.clone(),
                        self_broadcast: config.self_broadcast,
                        ack: config.ack,
                        presence_key: config.presence_key,
                        meta: None,
                    },
                )
                .await;
            send(tx, &WireMessage::ok_reply(&msg.topic, msg.msg_ref)).await;

            // New joiners get the authoritative snapshot right away.
            let state = store.presence_state(&msg.topic).await;
            send(
                tx,
                &WireMessage {
                    topic: msg.topic,
                    event: events::PRESENCE_STATE.to_string(),
                    payload: presence_map_to_value(&state),
                    msg_ref: None,
                },
            )
            .await;
        }
        events::LEAVE => {
            let left = store.leave(&msg.topic, conn_id).await;
            send(tx, &WireMessage::ok_reply(&msg.topic, msg.msg_ref)).await;
            if let Some((key, meta)) = left {
                fan_out_diff(store, &msg.topic, HashMap::new(), one_entry(key, meta)).await;
            }
        }
        events::PRESENCE => {
            let presence_event = msg
                .payload
                .get("event")
                .and_then(|e| e.as_str())
                .unwrap_or_default();
            match presence_event {
                "track" => {
                    let meta = msg
                        .payload
                        .get("payload")
                        .cloned()
                        .unwrap_or(Value::Null);
                    match store.track(&msg.topic, conn_id, meta.clone()).await {
                        Some(key) => {
                            send(tx, &WireMessage::ok_reply(&msg.topic, msg.msg_ref)).await;
                            fan_out_diff(store, &msg.topic, one_entry(key, meta), HashMap::new())
                                .await;
                        }
                        None => {
                            send(
                                tx,
                                &WireMessage::error_reply(
                                    &msg.topic,
                                    msg.msg_ref,
                                    "not joined",
                                ),
                            )
                            .await;
                        }
                    }
                }
                "untrack" => {
                    let untracked = store.untrack(&msg.topic, conn_id).await;
                    send(tx, &WireMessage::ok_reply(&msg.topic, msg.msg_ref)).await;
                    if let Some((key, meta)) = untracked {
                        fan_out_diff(store, &msg.topic, HashMap::new(), one_entry(key, meta))
                            .await;
                    }
                }
                other => {
                    tracing::debug!(event = %other, "unknown presence event");
                }
            }
        }
        events::BROADCAST => {
            // Payload is opaque; re-emit the envelope without the ref.
            let frame = WireMessage {
                topic: msg.topic.clone(),
                event: events::BROADCAST.to_string(),
                payload: msg.payload,
                msg_ref: None,
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                for peer in store.fanout(&msg.topic, Some(conn_id)).await {
                    let _ = peer.send(json.clone()).await;
                }
            }
            if store.wants_ack(&msg.topic, conn_id).await {
                send(tx, &WireMessage::ok_reply(&msg.topic, msg.msg_ref)).await;
            }
        }
        other => {
            tracing::debug!(event = %other, "unhandled envelope event");
        }
    }
}

fn one_entry(key: String, meta: Value) -> HashMap<String, Vec<Value>> {
    HashMap::from([(key, vec![meta])])
}

async fn send(tx: &mpsc::Sender<String>, msg: &WireMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = tx.send(json).await;
    }
}

/// Broadcast a presence diff to every subscriber of a topic.
async fn fan_out_diff(
    store: &TopicStore,
    topic: &str,
    joins: HashMap<String, Vec<Value>>,
    leaves: HashMap<String, Vec<Value>>,
) {
    let diff = WireMessage {
        topic: topic.to_string(),
        event: events::PRESENCE_DIFF.to_string(),
        payload: serde_json::json!({
            "joins": presence_map_to_value(&joins),
            "leaves": presence_map_to_value(&leaves),
        }),
        msg_ref: None,
    };
    if let Ok(json) = serde_json::to_string(&diff) {
        for peer in store.fanout(topic, None).await {
            let _ = peer.send(json.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<WireMessage> {
        let mut frames = Vec::new();
        while let Ok(json) = rx.try_recv() {
            frames.push(serde_json::from_str(&json).unwrap());
        }
        frames
    }

    fn join_frame(topic: &str, key: &str) -> WireMessage {
        WireMessage {
            topic: topic.into(),
            event: events::JOIN.into(),
            payload: JoinConfig {
                presence_key: key.into(),
                self_broadcast: true,
                ack: false,
            }
            .to_payload(),
            msg_ref: Some("1".into()),
        }
    }

    #[tokio::test]
    async fn join_replies_ok_then_sends_state() {
        let store = TopicStore::new();
        let (tx, mut rx) = mpsc::channel(32);

        handle_frame(join_frame("realtime:game", "a"), 1, &tx, &store).await;

        let frames = drain(&mut rx).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, events::REPLY);
        assert_eq!(frames[0].payload["status"], "ok");
        assert_eq!(frames[1].event, events::PRESENCE_STATE);
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let store = TopicStore::new();
        let (tx, mut rx) = mpsc::channel(32);

        handle_frame(
            WireMessage {
                topic: "phoenix".into(),
                event: events::HEARTBEAT.into(),
                payload: serde_json::json!({}),
                msg_ref: Some("9".into()),
            },
            1,
            &tx,
            &store,
        )
        .await;

        let frames = drain(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::REPLY);
        assert_eq!(frames[0].msg_ref.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn track_fans_out_a_join_diff() {
        let store = TopicStore::new();
        let (tx_a, mut rx_a) = mpsc::channel(32);
        let (tx_b, mut rx_b) = mpsc::channel(32);

        handle_frame(join_frame("realtime:game", "a"), 1, &tx_a, &store).await;
        handle_frame(join_frame("realtime:game", "b"), 2, &tx_b, &store).await;
        drain(&mut rx_a).await;
        drain(&mut rx_b).await;

        handle_frame(
            WireMessage {
                topic: "realtime:game".into(),
                event: events::PRESENCE.into(),
                payload: serde_json::json!({
                    "type": "presence",
                    "event": "track",
                    "payload": { "clientId": "a", "role": "host", "online_at": "t" }
                }),
                msg_ref: Some("2".into()),
            },
            1,
            &tx_a,
            &store,
        )
        .await;

        let frames = drain(&mut rx_b).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::PRESENCE_DIFF);
        assert!(frames[0].payload["joins"]["a"]["metas"][0]["clientId"] == "a");
    }

    #[tokio::test]
    async fn track_without_join_is_an_error() {
        let store = TopicStore::new();
        let (tx, mut rx) = mpsc::channel(32);

        handle_frame(
            WireMessage {
                topic: "realtime:game".into(),
                event: events::PRESENCE.into(),
                payload: serde_json::json!({
                    "type": "presence",
                    "event": "track",
                    "payload": {}
                }),
                msg_ref: Some("2".into()),
            },
            7,
            &tx,
            &store,
        )
        .await;

        let frames = drain(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload["status"], "error");
    }

    #[tokio::test]
    async fn broadcast_reaches_peers_not_sender() {
        let store = TopicStore::new();
        let (tx_a, mut rx_a) = mpsc::channel(32);
        let (tx_b, mut rx_b) = mpsc::channel(32);

        let mut join_a = join_frame("realtime:game", "a");
        join_a.payload = JoinConfig {
            presence_key: "a".into(),
            self_broadcast: false,
            ack: false,
        }
        .to_payload();
        handle_frame(join_a, 1, &tx_a, &store).await;
        handle_frame(join_frame("realtime:game", "b"), 2, &tx_b, &store).await;
        drain(&mut rx_a).await;
        drain(&mut rx_b).await;

        handle_frame(
            WireMessage {
                topic: "realtime:game".into(),
                event: events::BROADCAST.into(),
                payload: serde_json::json!({
                    "type": "broadcast",
                    "event": "message",
                    "payload": { "type": "gameUpdate" }
                }),
                msg_ref: Some("3".into()),
            },
            1,
            &tx_a,
            &store,
        )
        .await;

        // Sender opted out of self-broadcast and asked for no ack.
        assert!(drain(&mut rx_a).await.is_empty());
        let frames = drain(&mut rx_b).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::BROADCAST);
        assert_eq!(frames[0].payload["payload"]["type"], "gameUpdate");
    }

    #[tokio::test]
    async fn leave_fans_out_presence_drop() {
        let store = TopicStore::new();
        let (tx_a, mut rx_a) = mpsc::channel(32);
        let (tx_b, mut rx_b) = mpsc::channel(32);

        handle_frame(join_frame("realtime:game", "a"), 1, &tx_a, &store).await;
        handle_frame(join_frame("realtime:game", "b"), 2, &tx_b, &store).await;
        handle_frame(
            WireMessage {
                topic: "realtime:game".into(),
                event: events::PRESENCE.into(),
                payload: serde_json::json!({
                    "type": "presence",
                    "event": "track",
                    "payload": { "clientId": "a" }
                }),
                msg_ref: None,
            },
            1,
            &tx_a,
            &store,
        )
        .await;
        drain(&mut rx_a).await;
        drain(&mut rx_b).await;

        handle_frame(
            WireMessage {
                topic: "realtime:game".into(),
                event: events::LEAVE.into(),
                payload: serde_json::json!({}),
                msg_ref: Some("4".into()),
            },
            1,
            &tx_a,
            &store,
        )
        .await;

        let frames = drain(&mut rx_b).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::PRESENCE_DIFF);
        assert!(frames[0].payload["leaves"]["a"]["metas"][0]["clientId"] == "a");
        assert_eq!(store.subscriber_count("realtime:game").await, 1);
    }
}
