//! Real-time session synchronization for shared interactive sessions.
//!
//! One *host* device drives shared state, any number of *controller*
//! devices send input, and a *view* device renders, all over a single
//! shared broadcast/presence channel. This crate owns client identity,
//! channel lifecycle (connect/reconnect/disconnect), the message
//! protocol between roles, and the bounded message log consumers read.
//! Rendering, physics and UI live elsewhere and only consume the
//! reactive outputs exposed here.

pub mod config;
pub mod identity;
pub mod log;
pub mod manager;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{LogConfig, SyncConfig};
pub use identity::IdentityStore;
pub use log::{LogCursor, MessageLog};
pub use manager::ConnectionManager;
pub use presence::PresenceRegistry;
pub use protocol::{ButtonConfig, ButtonInput, ConnectedClient, Message, PresenceMeta, Role};
pub use session::ChannelSession;
pub use store::Store;
pub use transport::{
    ChannelEvent, ChannelHandle, ChannelOptions, MemoryHub, PhoenixConfig, PhoenixTransport,
    Transport,
};

pub use crowdlink_common::TransportError;
