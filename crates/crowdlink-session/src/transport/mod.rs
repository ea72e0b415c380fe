//! Transport abstraction: one pub/sub channel per session.
//!
//! A [`Transport`] opens channels on named topics. Each open channel is
//! driven through a [`ChannelHandle`] (outbound) and observed through a
//! stream of [`ChannelEvent`]s (inbound). Two implementations: the
//! WebSocket [`PhoenixTransport`] for a relay or hosted deployment, and
//! the in-process [`MemoryHub`] for single-process setups and tests.

pub mod memory;
pub mod phoenix;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crowdlink_common::TransportError;

pub use memory::MemoryHub;
pub use phoenix::{PhoenixConfig, PhoenixTransport};

/// Options for opening a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Presence key identifying this client (its client id).
    pub presence_key: String,
    /// Whether this client receives its own broadcasts back.
    pub self_broadcast: bool,
    /// Whether broadcasts are acknowledged by the server.
    pub ack: bool,
}

/// Events delivered by an open channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Subscription acknowledged. May repeat (replies are not
    /// ref-matched); consumers guard against duplicates.
    Subscribed,
    /// An application broadcast.
    Broadcast { event: String, payload: Value },
    /// Full presence snapshot: presence key → registered metas.
    /// Emitted after every presence change; always authoritative.
    PresenceSync {
        state: HashMap<String, Vec<Value>>,
    },
    /// A client started tracking presence. Informational; the snapshot
    /// in the accompanying sync is what consumers derive state from.
    PresenceJoin { key: String, metas: Vec<Value> },
    /// A client stopped tracking presence. Informational.
    PresenceLeave { key: String, metas: Vec<Value> },
    /// The channel reported an error.
    ChannelError { message: String },
    /// The underlying connection dropped. The transport reconnects,
    /// rejoins, and re-tracks on its own.
    Disconnected,
}

/// Outbound operations on one open channel. All fire-and-forget: an
/// `Err` means the operation could not even be handed to the transport,
/// not that delivery failed.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Request subscription. Acknowledged via [`ChannelEvent::Subscribed`].
    async fn subscribe(&self) -> Result<(), TransportError>;

    /// Leave the channel and release its resources.
    async fn unsubscribe(&self) -> Result<(), TransportError>;

    /// Publish this client's presence record.
    async fn track(&self, meta: Value) -> Result<(), TransportError>;

    /// Withdraw this client's presence record.
    async fn untrack(&self) -> Result<(), TransportError>;

    /// Broadcast an application event to every subscriber of the topic.
    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError>;
}

/// A pub/sub transport that can open channels on named topics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel on `topic`. Returns the outbound handle and the
    /// inbound event stream. The channel is not subscribed yet; call
    /// [`ChannelHandle::subscribe`] once observers are attached.
    async fn open(
        &self,
        topic: &str,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn ChannelHandle>, mpsc::Receiver<ChannelEvent>), TransportError>;

    /// Tear down every open channel. Best-effort and idempotent; used
    /// when no sessions remain so no idle connections linger.
    async fn shutdown(&self);
}
