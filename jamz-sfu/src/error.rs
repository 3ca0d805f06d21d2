use thiserror::Error;

use crate::rtp::MediaKind;
use crate::types::{ProducerId, RouterId, SessionId, TransportId, WorkerId};

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create worker {index}: {reason}")]
    WorkerCreation { index: usize, reason: String },

    #[error("Worker pool is empty")]
    NoWorkers,

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Worker {0} is not running")]
    WorkerUnavailable(WorkerId),

    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error("Router for session {0} was closed")]
    RouterClosed(SessionId),

    #[error("No transport for participant {participant} in session {session}")]
    TransportNotFound { session: String, participant: String },

    #[error("Worker {0} has no free RTC ports")]
    PortsExhausted(WorkerId),

    #[error("No router for session {0}")]
    NoRouter(SessionId),

    #[error("Transport {0} not found")]
    UnknownTransport(TransportId),

    #[error("Transport {0} is already connected")]
    AlreadyConnected(TransportId),

    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtls(String),

    #[error("Invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    #[error("Router has no {0} codec")]
    UnsupportedKind(MediaKind),

    #[error("Producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("Cannot consume producer {producer}: {reason}")]
    CannotConsume { producer: ProducerId, reason: String },
}

impl MediaError {
    /// Stable code reported to signaling clients
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) | Self::WorkerCreation { .. } => "config",
            Self::NoWorkers | Self::PoolClosed | Self::WorkerUnavailable(_) => "unavailable",
            Self::RouterNotFound(_) | Self::RouterClosed(_) | Self::NoRouter(_) => "no_router",
            Self::TransportNotFound { .. } | Self::UnknownTransport(_) => "unknown_transport",
            Self::PortsExhausted(_) => "ports_exhausted",
            Self::AlreadyConnected(_) => "already_connected",
            Self::InvalidDtls(_) => "invalid_dtls",
            Self::InvalidRtpParameters(_) => "invalid_rtp_parameters",
            Self::UnsupportedKind(_) => "unsupported_kind",
            Self::ProducerNotFound(_) => "unknown_producer",
            Self::CannotConsume { .. } => "cannot_consume",
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
