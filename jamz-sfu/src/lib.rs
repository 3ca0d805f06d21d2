//! Jamz media worker pool
//!
//! Media routing for group audio sessions. Each session gets one router,
//! placed on a worker in strict rotation; each participant gets one transport
//! on that router.
//!
//! ## Architecture
//!
//! - **`MediaWorkerPool`**: Owns the workers and the session -> router map
//! - **`Worker`**: An actor task owning its routers, transports and RTC ports
//! - **`Router`**: Per-session media router bound to one worker
//! - **`TransportParams`**: ICE/DTLS parameters and candidates handed to a client
//! - **`ProducerParams`** / **`ConsumerParams`**: Media sent into and pulled out of a router
//! - **`FatalSignal`**: Reported when a worker dies; the process must exit
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jamz_sfu::{fatal_channel, MediaWorkerPool, PoolConfig};
//!
//! let (fatal_tx, mut fatal_rx) = fatal_channel();
//! let pool = MediaWorkerPool::create_workers(PoolConfig::default(), fatal_tx).await?;
//! let (router, transport) = pool.attach_participant(&session_id, &participant_id).await?;
//! ```

mod config;
mod error;
mod pool;
mod router;
mod rtp;
mod supervisor;
mod transport;
mod types;
mod worker;

pub use config::{BitrateEnvelope, PoolConfig};
pub use error::{MediaError, Result};
pub use pool::{MediaWorkerPool, PoolStats};
pub use router::Router;
pub use rtp::{
    ConsumerParams, ConsumerRtpParameters, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind,
    ProducerParams, RtpCapabilities, RtpCodecCapability, RtpEncoding,
};
pub use supervisor::{await_fatal, fatal_channel, FatalReceiver, FatalSender, FatalSignal};
pub use transport::{IceCandidate, IceParameters, TransportParams, TransportProtocol};
pub use types::{
    ConsumerId, ParticipantId, ProducerId, RouterId, SessionId, TransportId, WorkerId,
};
pub use worker::{Worker, WorkerStats};
