//! Media worker pool
//!
//! This module provides:
//! - A fixed set of worker actors with disjoint RTC port slices
//! - Round-robin placement of new routers
//! - One router per session, created at most once under concurrency
//! - Participant attach/release with idle router teardown

use crate::config::PoolConfig;
use crate::error::{MediaError, Result};
use crate::router::Router;
use crate::rtp::{ConsumerParams, DtlsParameters, MediaKind, ProducerParams, RtpCapabilities};
use crate::supervisor::{monitor_worker, FatalSender};
use crate::transport::TransportParams;
use crate::types::{ParticipantId, ProducerId, SessionId, TransportId};
use crate::worker::{Worker, WorkerStats};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type RouterCell = Arc<OnceCell<Arc<Router>>>;

/// Pool-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub workers_alive: usize,
    pub routers: usize,
    pub transports: usize,
}

#[derive(Debug)]
pub struct MediaWorkerPool {
    config: Arc<PoolConfig>,
    workers: Vec<Arc<Worker>>,
    next_worker: AtomicUsize,

    /// Session -> router. The cell makes concurrent creation for the same
    /// session resolve to a single router.
    routers: DashMap<SessionId, RouterCell>,

    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl MediaWorkerPool {
    /// Spawn `config.worker_count` workers and wait until each one answers.
    ///
    /// Worker deaths after this point are reported on `fatal_tx`.
    pub async fn create_workers(config: PoolConfig, fatal_tx: FatalSender) -> Result<Arc<Self>> {
        if !config.bitrate.is_valid() {
            return Err(MediaError::InvalidConfig(format!(
                "bitrate envelope must satisfy min <= initial <= max, got {}/{}/{}",
                config.bitrate.min, config.bitrate.initial, config.bitrate.max
            )));
        }
        if config.worker_count == 0 {
            return Err(MediaError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        let slices = config.port_slices(config.worker_count).ok_or_else(|| {
            MediaError::InvalidConfig(format!(
                "port range {}-{} cannot be split across {} workers",
                config.rtc_min_port, config.rtc_max_port, config.worker_count
            ))
        })?;

        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(slices.len());
        let mut joins = Vec::with_capacity(slices.len());

        for (index, range) in slices.into_iter().enumerate() {
            let (worker, join) =
                Worker::spawn(index, range, Arc::clone(&config), shutdown.child_token());
            workers.push(Arc::new(worker));
            joins.push(join);
        }

        for worker in &workers {
            if let Err(e) = worker.stats().await {
                shutdown.cancel();
                return Err(MediaError::WorkerCreation {
                    index: worker.index(),
                    reason: e.to_string(),
                });
            }
            info!(
                worker_id = %worker.id(),
                port_min = worker.port_range().0,
                port_max = worker.port_range().1,
                "Media worker started"
            );
        }

        for (worker, join) in workers.iter().zip(joins) {
            monitor_worker(
                worker.id().clone(),
                join,
                worker.cancel_token(),
                worker.alive_flag(),
                fatal_tx.clone(),
            );
        }

        info!(workers = workers.len(), "Media worker pool ready");

        Ok(Arc::new(Self {
            config,
            workers,
            next_worker: AtomicUsize::new(0),
            routers: DashMap::new(),
            shutdown,
            closed: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next worker in strict rotation. The cursor advances whether or not the
    /// caller ends up using the worker.
    fn next_worker(&self) -> Result<Arc<Worker>> {
        if self.workers.is_empty() {
            return Err(MediaError::NoWorkers);
        }
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers
            .get(index)
            .cloned()
            .ok_or(MediaError::NoWorkers)
    }

    /// Return the session's router, creating it on the next worker if absent.
    pub async fn create_router_for(&self, session_id: &SessionId) -> Result<Arc<Router>> {
        if self.is_closed() {
            return Err(MediaError::PoolClosed);
        }

        let cell = Arc::clone(&self.routers.entry(session_id.clone()).or_default());

        let created = cell
            .get_or_try_init(|| async {
                let worker = self.next_worker()?;
                let router_id = worker.create_router(session_id).await?;
                info!(
                    session_id = %session_id,
                    router_id = %router_id,
                    worker_id = %worker.id(),
                    "Router created"
                );
                let capabilities = RtpCapabilities {
                    codecs: self.config.media_codecs.clone(),
                };
                Ok::<_, MediaError>(Arc::new(Router::new(
                    router_id,
                    session_id.clone(),
                    worker,
                    capabilities,
                )))
            })
            .await;

        let router = match created {
            Ok(router) => Arc::clone(router),
            Err(e) => {
                self.routers
                    .remove_if(session_id, |_, c| Arc::ptr_eq(c, &cell) && !c.initialized());
                return Err(e);
            }
        };

        if router.is_closed() {
            self.routers.remove_if(session_id, |_, c| Arc::ptr_eq(c, &cell));
            return Err(MediaError::RouterClosed(session_id.clone()));
        }

        Ok(router)
    }

    /// Create (or return) the participant's transport on `router`
    pub async fn create_transport_for(
        &self,
        router: &Router,
        participant_id: &ParticipantId,
    ) -> Result<TransportParams> {
        if self.is_closed() {
            return Err(MediaError::PoolClosed);
        }
        router.create_transport(participant_id).await
    }

    /// Router plus transport in one step. A router torn down between the two
    /// calls is replaced once.
    pub async fn attach_participant(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> Result<(Arc<Router>, TransportParams)> {
        let mut retried = false;
        loop {
            let attempt = match self.create_router_for(session_id).await {
                Ok(router) => self
                    .create_transport_for(&router, participant_id)
                    .await
                    .map(|transport| (router, transport)),
                Err(e) => Err(e),
            };

            match attempt {
                Err(MediaError::RouterClosed(_)) if !retried => {
                    debug!(
                        session_id = %session_id,
                        participant_id = %participant_id,
                        "Router closed during attach, retrying"
                    );
                    retried = true;
                }
                other => return other,
            }
        }
    }

    /// Close the participant's transport and drop the router once idle.
    ///
    /// Returns `true` when the session's router was destroyed.
    pub async fn release_participant(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> bool {
        let Some(router) = self.router_for(session_id) else {
            return false;
        };

        if router.close_transport(participant_id).await {
            debug!(
                session_id = %session_id,
                participant_id = %participant_id,
                "Transport closed"
            );
        }

        let removed = self.routers.remove_if(session_id, |_, cell| {
            cell.get()
                .is_some_and(|r| Arc::ptr_eq(r, &router) && r.try_close_if_idle())
        });

        if removed.is_none() {
            return false;
        }

        router.release_on_worker().await;
        info!(
            session_id = %session_id,
            router_id = %router.id,
            "Router destroyed, session has no participants"
        );
        true
    }

    #[must_use]
    pub fn router_for(&self, session_id: &SessionId) -> Option<Arc<Router>> {
        self.routers
            .get(session_id)
            .and_then(|cell| cell.get().cloned())
    }

    #[must_use]
    pub fn transport_for(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> Option<TransportParams> {
        self.router_for(session_id)?.transport(participant_id)
    }

    fn existing_router(&self, session_id: &SessionId) -> Result<Arc<Router>> {
        if self.is_closed() {
            return Err(MediaError::PoolClosed);
        }
        self.router_for(session_id)
            .ok_or_else(|| MediaError::NoRouter(session_id.clone()))
    }

    /// Codecs offered by the session's router
    pub fn rtp_capabilities(&self, session_id: &SessionId) -> Result<RtpCapabilities> {
        Ok(self.existing_router(session_id)?.rtp_capabilities().clone())
    }

    pub async fn connect_transport(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.existing_router(session_id)?
            .connect_transport(participant_id, transport_id, dtls_parameters)
            .await
    }

    pub async fn produce(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerParams> {
        self.existing_router(session_id)?
            .produce(participant_id, transport_id, kind, rtp_parameters)
            .await
    }

    pub async fn consume(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        self.existing_router(session_id)?
            .consume(participant_id, transport_id, producer_id, rtp_capabilities)
            .await
    }

    pub async fn producers(&self, session_id: &SessionId) -> Result<Vec<ProducerParams>> {
        self.existing_router(session_id)?.producers().await
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            workers: self.workers.len(),
            workers_alive: self.workers.iter().filter(|w| w.is_alive()).count(),
            ..Default::default()
        };
        for entry in &self.routers {
            if let Some(router) = entry.value().get() {
                stats.routers += 1;
                stats.transports += router.transport_count();
            }
        }
        stats
    }

    /// Ask every live worker for its own view of its load
    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        let mut out = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            if let Ok(stats) = worker.stats().await {
                out.push(stats);
            }
        }
        out
    }

    /// Stop every worker. Orderly stops are not reported as deaths.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.routers.clear();
        self.shutdown.cancel();
        info!("Media worker pool closed");
    }
}

impl Drop for MediaWorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
