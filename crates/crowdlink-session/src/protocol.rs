//! Protocol types for the session layer.
//!
//! These types define the application-level payloads that ride inside
//! channel broadcast messages. The transport envelope is handled by
//! `crowdlink-common::wire` and the `transport` module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast event name carrying every protocol message.
pub const MESSAGE_EVENT: &str = "message";

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Role a client plays in the session. Determines which protocol
/// messages it is expected to emit or act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Drives the session: broadcasts game state and the control layout.
    Host,
    /// Sends input and asks the host for the control layout.
    Controller,
    /// Renders shared state; emits nothing the others act on.
    View,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Controller => "controller",
            Role::View => "view",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single button press or release from a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonInput {
    pub button: String,
    pub pressed: bool,
}

/// One entry of the host-defined control layout. Ordered; unique by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub id: String,
    pub label: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A protocol message, discriminated by `type` on the wire.
///
/// `clientJoined`/`clientLeft` predate presence tracking; they are never
/// emitted anymore but stay parsable for older peers. Unrecognized
/// discriminants decode to [`Message::Unknown`] so they still reach the
/// log, where every known-type filter simply passes over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Message {
    #[serde(rename = "gameUpdate")]
    GameUpdate {
        client_id: String,
        role: Role,
        /// Arbitrary key/value patch applied onto the shared game state.
        game_state: serde_json::Map<String, Value>,
    },
    #[serde(rename = "playerInput")]
    PlayerInput {
        client_id: String,
        role: Role,
        input: ButtonInput,
    },
    #[serde(rename = "buttonConfig")]
    ButtonConfig {
        client_id: String,
        role: Role,
        /// Full replacement of the control layout, not a patch.
        buttons: Vec<ButtonConfig>,
    },
    #[serde(rename = "buttonConfigRequest")]
    ButtonConfigRequest { client_id: String, role: Role },
    #[serde(rename = "clientJoined")]
    ClientJoined { client_id: String, role: Role },
    #[serde(rename = "clientLeft")]
    ClientLeft { client_id: String },
    #[serde(other)]
    Unknown,
}

impl Message {
    /// The wire discriminant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::GameUpdate { .. } => "gameUpdate",
            Message::PlayerInput { .. } => "playerInput",
            Message::ButtonConfig { .. } => "buttonConfig",
            Message::ButtonConfigRequest { .. } => "buttonConfigRequest",
            Message::ClientJoined { .. } => "clientJoined",
            Message::ClientLeft { .. } => "clientLeft",
            Message::Unknown => "unknown",
        }
    }

    /// The sender's client id, when the variant carries one.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Message::GameUpdate { client_id, .. }
            | Message::PlayerInput { client_id, .. }
            | Message::ButtonConfig { client_id, .. }
            | Message::ButtonConfigRequest { client_id, .. }
            | Message::ClientJoined { client_id, .. }
            | Message::ClientLeft { client_id } => Some(client_id),
            Message::Unknown => None,
        }
    }

    /// The sender's role, when the variant carries one.
    pub fn role(&self) -> Option<Role> {
        match self {
            Message::GameUpdate { role, .. }
            | Message::PlayerInput { role, .. }
            | Message::ButtonConfig { role, .. }
            | Message::ButtonConfigRequest { role, .. }
            | Message::ClientJoined { role, .. } => Some(*role),
            Message::ClientLeft { .. } | Message::Unknown => None,
        }
    }
}

/// Drop duplicate button ids, keeping the first occurrence and the
/// original order.
pub fn dedupe_buttons(buttons: Vec<ButtonConfig>) -> Vec<ButtonConfig> {
    let mut seen = std::collections::HashSet::new();
    buttons
        .into_iter()
        .filter(|b| seen.insert(b.id.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// A currently connected client, derived from the presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedClient {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub role: Role,
}

/// Presence record each client tracks for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub role: Role,
    /// ISO-8601 timestamp of when the client came online.
    pub online_at: String,
}

/// Parse the first presence meta registered under a key.
pub fn parse_presence_meta(metas: &[Value]) -> Option<PresenceMeta> {
    let meta = metas.first()?;
    serde_json::from_value(meta.clone()).ok()
}
