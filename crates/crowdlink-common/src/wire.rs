//! Channel wire protocol, shared by the client transport and the relay.
//!
//! Frames are Phoenix Channels v1 JSON envelopes, the same shape the
//! hosted realtime service speaks, so a session can talk to either a
//! `crowdlink-relay` instance or a managed deployment unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names used on the wire.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// Topic prefix clients put on every channel topic.
pub const TOPIC_PREFIX: &str = "realtime:";

/// A protocol envelope (v1 JSON format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
}

impl WireMessage {
    /// Reply with `status: ok` and an empty response, echoing `msg_ref`.
    pub fn ok_reply(topic: &str, msg_ref: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: events::REPLY.to_string(),
            payload: serde_json::json!({ "status": "ok", "response": {} }),
            msg_ref,
        }
    }

    /// Reply with `status: error` and a reason.
    pub fn error_reply(topic: &str, msg_ref: Option<String>, reason: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: events::REPLY.to_string(),
            payload: serde_json::json!({
                "status": "error",
                "response": { "reason": reason }
            }),
            msg_ref,
        }
    }
}

/// Strip the `realtime:` prefix from a topic.
pub fn strip_topic_prefix(topic: &str) -> &str {
    topic.strip_prefix(TOPIC_PREFIX).unwrap_or(topic)
}

// ---------------------------------------------------------------------------
// Channel configuration (phx_join payload)
// ---------------------------------------------------------------------------

/// Channel configuration carried in the join payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinConfig {
    /// Presence key identifying this client (its client id).
    pub presence_key: String,
    /// Whether the sender receives its own broadcasts back.
    pub self_broadcast: bool,
    /// Whether broadcasts are acknowledged with a reply.
    pub ack: bool,
}

impl JoinConfig {
    /// Serialize to the JSON payload expected in `phx_join`.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "config": {
                "broadcast": {
                    "self": self.self_broadcast,
                    "ack": self.ack
                },
                "presence": {
                    "key": self.presence_key
                }
            }
        })
    }

    /// Parse from a `phx_join` payload. Missing fields fall back to
    /// defaults (no self-broadcast, no acks, empty key).
    pub fn from_payload(payload: &Value) -> Self {
        let config = payload.get("config");
        let broadcast = config.and_then(|c| c.get("broadcast"));
        let presence = config.and_then(|c| c.get("presence"));
        Self {
            presence_key: presence
                .and_then(|p| p.get("key"))
                .and_then(|k| k.as_str())
                .unwrap_or_default()
                .to_string(),
            self_broadcast: broadcast
                .and_then(|b| b.get("self"))
                .and_then(|s| s.as_bool())
                .unwrap_or(false),
            ack: broadcast
                .and_then(|b| b.get("ack"))
                .and_then(|a| a.as_bool())
                .unwrap_or(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast and presence payloads
// ---------------------------------------------------------------------------

/// Payload of a `broadcast` envelope: an application event wrapped with
/// its own discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub payload: Value,
}

impl BroadcastPayload {
    pub fn new(event: &str, payload: Value) -> Self {
        Self {
            kind: "broadcast".to_string(),
            event: event.to_string(),
            payload,
        }
    }
}

/// Payload of a client→server `presence` envelope (track/untrack).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PresenceCommand {
    pub fn track(meta: Value) -> Self {
        Self {
            kind: "presence".to_string(),
            event: "track".to_string(),
            payload: Some(meta),
        }
    }

    pub fn untrack() -> Self {
        Self {
            kind: "presence".to_string(),
            event: "untrack".to_string(),
            payload: None,
        }
    }
}

/// Parse a presence map into `HashMap<key, Vec<meta>>`.
///
/// The wire shape is `{ "key": { "metas": [{ ... }] } }`.
pub fn parse_presence_map(value: &Value) -> HashMap<String, Vec<Value>> {
    let mut result = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (key, val) in obj {
            if let Some(metas) = val.get("metas").and_then(|m| m.as_array()) {
                result.insert(key.clone(), metas.clone());
            }
        }
    }
    result
}

/// Build the wire shape of a presence map from key → metas.
pub fn presence_map_to_value(map: &HashMap<String, Vec<Value>>) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, metas) in map {
        obj.insert(key.clone(), serde_json::json!({ "metas": metas }));
    }
    Value::Object(obj)
}
