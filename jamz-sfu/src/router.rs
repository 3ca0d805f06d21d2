//! Per-session routers
//!
//! A router is bound to exactly one worker for its whole lifetime. The pool
//! keeps one per active session; participants hang their transports off it.

use crate::error::{MediaError, Result};
use crate::rtp::{ConsumerParams, DtlsParameters, MediaKind, ProducerParams, RtpCapabilities};
use crate::transport::TransportParams;
use crate::types::{ParticipantId, ProducerId, RouterId, SessionId, TransportId, WorkerId};
use crate::worker::Worker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

enum TransportSlot {
    /// Reserved while the worker is allocating
    Pending,
    Ready(TransportParams),
}

#[derive(Default)]
struct RouterInner {
    closed: bool,
    transports: HashMap<ParticipantId, TransportSlot>,
}

pub struct Router {
    pub id: RouterId,
    pub session_id: SessionId,
    worker: Arc<Worker>,
    capabilities: RtpCapabilities,
    inner: Mutex<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("worker_id", self.worker.id())
            .finish()
    }
}

impl Router {
    pub(crate) fn new(
        id: RouterId,
        session_id: SessionId,
        worker: Arc<Worker>,
        capabilities: RtpCapabilities,
    ) -> Self {
        Self {
            id,
            session_id,
            worker,
            capabilities,
            inner: Mutex::new(RouterInner::default()),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        self.worker.id()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Codecs this router can route
    #[must_use]
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    /// Number of transports attached or being attached
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.inner.lock().transports.len()
    }

    #[must_use]
    pub fn transport(&self, participant_id: &ParticipantId) -> Option<TransportParams> {
        match self.inner.lock().transports.get(participant_id) {
            Some(TransportSlot::Ready(params)) => Some(params.clone()),
            _ => None,
        }
    }

    /// Allocate a transport for `participant_id`. Returns the existing one if
    /// the participant already has a transport on this router.
    pub async fn create_transport(&self, participant_id: &ParticipantId) -> Result<TransportParams> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(MediaError::RouterClosed(self.session_id.clone()));
            }
            match inner.transports.get(participant_id) {
                Some(TransportSlot::Ready(params)) => return Ok(params.clone()),
                Some(TransportSlot::Pending) => {
                    return Err(MediaError::TransportNotFound {
                        session: self.session_id.to_string(),
                        participant: participant_id.to_string(),
                    });
                }
                None => {
                    inner
                        .transports
                        .insert(participant_id.clone(), TransportSlot::Pending);
                }
            }
        }

        let created = match self.worker.create_transport(&self.id, participant_id).await {
            Ok(params) => params,
            Err(e) => {
                self.inner.lock().transports.remove(participant_id);
                return Err(e);
            }
        };

        let attached = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.transports.get(participant_id),
                Some(TransportSlot::Pending)
            ) {
                inner
                    .transports
                    .insert(participant_id.clone(), TransportSlot::Ready(created.clone()));
                true
            } else {
                false
            }
        };

        if attached {
            debug!(
                router_id = %self.id,
                participant_id = %participant_id,
                transport_id = %created.id,
                "Transport attached"
            );
            Ok(created)
        } else {
            // Released while the worker was allocating
            let _ = self.worker.close_transport(&self.id, &created.id).await;
            Err(MediaError::TransportNotFound {
                session: self.session_id.to_string(),
                participant: participant_id.to_string(),
            })
        }
    }

    /// The participant may only act on its own, fully attached transport
    fn check_owned(&self, participant_id: &ParticipantId, transport_id: &TransportId) -> Result<()> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(MediaError::RouterClosed(self.session_id.clone()));
        }
        match inner.transports.get(participant_id) {
            Some(TransportSlot::Ready(params)) if &params.id == transport_id => Ok(()),
            _ => Err(MediaError::UnknownTransport(transport_id.clone())),
        }
    }

    /// Complete the DTLS side of the participant's transport
    pub async fn connect_transport(
        &self,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.check_owned(participant_id, transport_id)?;
        self.worker
            .connect_transport(&self.id, transport_id, dtls_parameters)
            .await
    }

    /// Start sending media from the participant's transport
    pub async fn produce(
        &self,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerParams> {
        self.check_owned(participant_id, transport_id)?;
        self.worker
            .produce(&self.id, transport_id, kind, rtp_parameters)
            .await
    }

    /// Receive another participant's producer on the participant's transport
    pub async fn consume(
        &self,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        self.check_owned(participant_id, transport_id)?;
        self.worker
            .consume(&self.id, transport_id, producer_id, rtp_capabilities)
            .await
    }

    /// Every producer currently on this router
    pub async fn producers(&self) -> Result<Vec<ProducerParams>> {
        if self.is_closed() {
            return Err(MediaError::RouterClosed(self.session_id.clone()));
        }
        self.worker.list_producers(&self.id).await
    }

    /// Close the participant's transport. Returns whether one was attached.
    pub async fn close_transport(&self, participant_id: &ParticipantId) -> bool {
        let slot = self.inner.lock().transports.remove(participant_id);
        match slot {
            Some(TransportSlot::Ready(params)) => {
                if let Err(e) = self.worker.close_transport(&self.id, &params.id).await {
                    warn!(
                        router_id = %self.id,
                        transport_id = %params.id,
                        error = %e,
                        "Failed to close transport on worker"
                    );
                }
                true
            }
            Some(TransportSlot::Pending) => true,
            None => false,
        }
    }

    /// Mark the router closed if nothing is attached. Used by the pool while
    /// it holds the session entry, so a concurrent join cannot slip in.
    pub(crate) fn try_close_if_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed || !inner.transports.is_empty() {
            return false;
        }
        inner.closed = true;
        true
    }

    /// Release the router on its worker. Any residual transports go with it.
    pub(crate) async fn release_on_worker(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.transports.clear();
        }
        if let Err(e) = self.worker.close_router(&self.id).await {
            warn!(router_id = %self.id, error = %e, "Failed to close router on worker");
        }
    }
}
