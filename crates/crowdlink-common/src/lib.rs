//! Shared building blocks for the crowdlink session layer and relay:
//! the channel wire protocol, presence-map helpers, id generation, and
//! common error types.

pub mod errors;
pub mod id;
pub mod wire;

pub use errors::TransportError;
pub use id::new_client_id;
pub use wire::{BroadcastPayload, JoinConfig, PresenceCommand, WireMessage};
