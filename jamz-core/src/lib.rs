//! Jamz core: configuration, logging, metrics and the session-side services
//! (playback state, rate limiting, payload validation).

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
pub use jamz_sfu::{ParticipantId, SessionId};
