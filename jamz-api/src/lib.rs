//! Jamz signaling surface
//!
//! The [`SignalingGateway`] validates, rate limits and dispatches client
//! events. The [`http`] module serves it over a WebSocket alongside health,
//! metrics and debug routes.

pub mod context;
pub mod gateway;
pub mod http;
pub mod hub;
pub mod protocol;

pub use context::{SignalingContext, ToggleError};
pub use gateway::{ConnectionHandle, SignalingGateway};
pub use hub::{ConnectionState, SessionHub};
pub use protocol::{InboundEvent, MusicSyncAction, ServerEvent};
