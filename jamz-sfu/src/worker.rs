//! Media worker actor
//!
//! Each worker is a task that exclusively owns its routers, transports and a
//! slice of the RTC port range. The pool talks to it over a bounded command
//! channel; every router/transport operation is a request/reply round trip.

use crate::config::PoolConfig;
use crate::error::{MediaError, Result};
use crate::rtp::{
    ConsumerParams, ConsumerRtpParameters, DtlsParameters, MediaKind, ProducerParams,
    RtpCapabilities,
};
use crate::transport::TransportParams;
use crate::types::{
    ConsumerId, ParticipantId, ProducerId, RouterId, SessionId, TransportId, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) enum WorkerCommand {
    CreateRouter {
        session_id: SessionId,
        reply: oneshot::Sender<RouterId>,
    },
    CloseRouter {
        router_id: RouterId,
    },
    CreateTransport {
        router_id: RouterId,
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<TransportParams>>,
    },
    CloseTransport {
        router_id: RouterId,
        transport_id: TransportId,
    },
    ConnectTransport {
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        reply: oneshot::Sender<Result<()>>,
    },
    Produce {
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        reply: oneshot::Sender<Result<ProducerParams>>,
    },
    Consume {
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        reply: oneshot::Sender<Result<ConsumerParams>>,
    },
    ListProducers {
        router_id: RouterId,
        reply: oneshot::Sender<Result<Vec<ProducerParams>>>,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
}

/// Point-in-time view of a worker's load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub worker_id: String,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub ports_in_use: usize,
    pub ports_total: usize,
}

struct TransportEntry {
    port: u16,
    participant_id: ParticipantId,
    connected: bool,
}

struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
}

struct RouterEntry {
    session_id: SessionId,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerParams>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl RouterEntry {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn transport_mut(&mut self, transport_id: &TransportId) -> Result<&mut TransportEntry> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| MediaError::UnknownTransport(transport_id.clone()))
    }

    /// Drop a transport together with everything flowing through it,
    /// including other participants' consumers of its producers.
    fn remove_transport(&mut self, transport_id: &TransportId) -> Option<TransportEntry> {
        let entry = self.transports.remove(transport_id)?;
        self.producers.retain(|_, p| &p.transport_id != transport_id);
        let producers = &self.producers;
        self.consumers.retain(|_, c| {
            &c.transport_id != transport_id && producers.contains_key(&c.producer_id)
        });
        Some(entry)
    }
}

/// State owned by the worker task
struct WorkerState {
    id: WorkerId,
    config: Arc<PoolConfig>,
    port_range: (u16, u16),
    used_ports: BTreeSet<u16>,
    routers: HashMap<RouterId, RouterEntry>,
}

impl WorkerState {
    fn allocate_port(&mut self) -> Result<u16> {
        let (min, max) = self.port_range;
        let port = (min..=max)
            .find(|p| !self.used_ports.contains(p))
            .ok_or_else(|| MediaError::PortsExhausted(self.id.clone()))?;
        self.used_ports.insert(port);
        Ok(port)
    }

    fn router_mut(&mut self, router_id: &RouterId) -> Result<&mut RouterEntry> {
        self.routers
            .get_mut(router_id)
            .ok_or_else(|| MediaError::RouterNotFound(router_id.clone()))
    }

    fn capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.config.media_codecs.clone(),
        }
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::CreateRouter { session_id, reply } => {
                let router_id = RouterId::generate();
                debug!(
                    worker_id = %self.id,
                    router_id = %router_id,
                    session_id = %session_id,
                    "Router created"
                );
                self.routers
                    .insert(router_id.clone(), RouterEntry::new(session_id));
                let _ = reply.send(router_id);
            }
            WorkerCommand::CloseRouter { router_id } => {
                if let Some(entry) = self.routers.remove(&router_id) {
                    // Transports never outlive their router
                    for transport in entry.transports.values() {
                        self.used_ports.remove(&transport.port);
                    }
                    debug!(
                        worker_id = %self.id,
                        router_id = %router_id,
                        session_id = %entry.session_id,
                        dropped_transports = entry.transports.len(),
                        dropped_producers = entry.producers.len(),
                        dropped_consumers = entry.consumers.len(),
                        "Router closed"
                    );
                }
            }
            WorkerCommand::CreateTransport {
                router_id,
                participant_id,
                reply,
            } => {
                let result = self.create_transport(router_id, participant_id);
                let _ = reply.send(result);
            }
            WorkerCommand::CloseTransport {
                router_id,
                transport_id,
            } => {
                let removed = self
                    .routers
                    .get_mut(&router_id)
                    .and_then(|entry| entry.remove_transport(&transport_id));
                if let Some(transport) = removed {
                    self.used_ports.remove(&transport.port);
                    debug!(
                        worker_id = %self.id,
                        router_id = %router_id,
                        transport_id = %transport_id,
                        "Transport closed"
                    );
                }
            }
            WorkerCommand::ConnectTransport {
                router_id,
                transport_id,
                dtls_parameters,
                reply,
            } => {
                let result = self.connect_transport(&router_id, &transport_id, &dtls_parameters);
                let _ = reply.send(result);
            }
            WorkerCommand::Produce {
                router_id,
                transport_id,
                kind,
                rtp_parameters,
                reply,
            } => {
                let result = self.produce(&router_id, transport_id, kind, &rtp_parameters);
                let _ = reply.send(result);
            }
            WorkerCommand::Consume {
                router_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                reply,
            } => {
                let result =
                    self.consume(&router_id, transport_id, &producer_id, &rtp_capabilities);
                let _ = reply.send(result);
            }
            WorkerCommand::ListProducers { router_id, reply } => {
                let result: Result<Vec<ProducerParams>> = self
                    .router_mut(&router_id)
                    .map(|entry| entry.producers.values().cloned().collect());
                let _ = reply.send(result);
            }
            WorkerCommand::Stats { reply } => {
                let (min, max) = self.port_range;
                let routers = self.routers.values();
                let _ = reply.send(WorkerStats {
                    worker_id: self.id.to_string(),
                    routers: self.routers.len(),
                    transports: routers.clone().map(|r| r.transports.len()).sum(),
                    producers: routers.clone().map(|r| r.producers.len()).sum(),
                    consumers: routers.map(|r| r.consumers.len()).sum(),
                    ports_in_use: self.used_ports.len(),
                    ports_total: usize::from(max - min) + 1,
                });
            }
        }
    }

    fn create_transport(
        &mut self,
        router_id: RouterId,
        participant_id: ParticipantId,
    ) -> Result<TransportParams> {
        if !self.routers.contains_key(&router_id) {
            return Err(MediaError::RouterNotFound(router_id));
        }
        let port = self.allocate_port()?;
        let params =
            TransportParams::build(router_id.clone(), participant_id.clone(), port, &self.config);
        if let Some(entry) = self.routers.get_mut(&router_id) {
            entry.transports.insert(
                params.id.clone(),
                TransportEntry {
                    port,
                    participant_id,
                    connected: false,
                },
            );
        }
        Ok(params)
    }

    fn connect_transport(
        &mut self,
        router_id: &RouterId,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        dtls_parameters.validate().map_err(MediaError::InvalidDtls)?;
        let transport = self.router_mut(router_id)?.transport_mut(transport_id)?;
        if transport.connected {
            return Err(MediaError::AlreadyConnected(transport_id.clone()));
        }
        transport.connected = true;
        debug!(
            worker_id = %self.id,
            transport_id = %transport_id,
            role = ?dtls_parameters.role,
            "Transport connected"
        );
        Ok(())
    }

    fn produce(
        &mut self,
        router_id: &RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &serde_json::Value,
    ) -> Result<ProducerParams> {
        if !self.capabilities().supports(kind) {
            return Err(MediaError::UnsupportedKind(kind));
        }
        if !rtp_parameters.is_object() {
            return Err(MediaError::InvalidRtpParameters(
                "expected an object".to_string(),
            ));
        }
        let entry = self.router_mut(router_id)?;
        let participant_id = entry.transport_mut(&transport_id)?.participant_id.clone();
        let params = ProducerParams {
            id: ProducerId::generate(),
            transport_id,
            participant_id,
            kind,
        };
        entry.producers.insert(params.id.clone(), params.clone());
        debug!(
            worker_id = %self.id,
            producer_id = %params.id,
            participant_id = %params.participant_id,
            kind = %kind,
            "Producer created"
        );
        Ok(params)
    }

    fn consume(
        &mut self,
        router_id: &RouterId,
        transport_id: TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerParams> {
        let ours = self.capabilities();
        let entry = self.router_mut(router_id)?;
        let consumer_participant = entry.transport_mut(&transport_id)?.participant_id.clone();
        let producer = entry
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.clone()))?;

        if producer.participant_id == consumer_participant {
            return Err(MediaError::CannotConsume {
                producer: producer_id.clone(),
                reason: "own producer".to_string(),
            });
        }
        let codec = ours
            .negotiate(producer.kind, rtp_capabilities)
            .ok_or_else(|| MediaError::CannotConsume {
                producer: producer_id.clone(),
                reason: "no common codec".to_string(),
            })?;

        let params = ConsumerParams {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            transport_id: transport_id.clone(),
            producer_participant_id: producer.participant_id.clone(),
            kind: producer.kind,
            rtp_parameters: ConsumerRtpParameters::for_codec(codec),
        };
        entry.consumers.insert(
            params.id.clone(),
            ConsumerEntry {
                transport_id,
                producer_id: producer_id.clone(),
            },
        );
        debug!(
            worker_id = %self.id,
            consumer_id = %params.id,
            producer_id = %producer_id,
            "Consumer created"
        );
        Ok(params)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        warn!(worker_id = %self.id, "Worker command channel closed");
                        break;
                    }
                },
            }
        }
    }
}

/// Handle to a running media worker
pub struct Worker {
    id: WorkerId,
    index: usize,
    port_range: (u16, u16),
    commands: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
    abort: AbortHandle,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("port_range", &self.port_range)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Worker {
    /// Spawn the worker task. The returned join handle belongs to the supervisor.
    pub(crate) fn spawn(
        index: usize,
        port_range: (u16, u16),
        config: Arc<PoolConfig>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let id = WorkerId::new(format!("worker-{index}-{}", nanoid::nanoid!(6)));
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let state = WorkerState {
            id: id.clone(),
            config,
            port_range,
            used_ports: BTreeSet::new(),
            routers: HashMap::new(),
        };
        let join = tokio::spawn(state.run(rx, cancel.clone()));
        let worker = Self {
            id,
            index,
            port_range,
            commands: tx,
            cancel,
            abort: join.abort_handle(),
            alive: Arc::new(AtomicBool::new(true)),
        };
        (worker, join)
    }

    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn port_range(&self) -> (u16, u16) {
        self.port_range
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn alive_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Terminate the worker task abruptly, the way a crashed media process
    /// would disappear. The supervisor reports it as a death.
    pub fn kill(&self) {
        self.abort.abort();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| MediaError::WorkerUnavailable(self.id.clone()))?;
        reply_rx
            .await
            .map_err(|_| MediaError::WorkerUnavailable(self.id.clone()))
    }

    pub(crate) async fn create_router(&self, session_id: &SessionId) -> Result<RouterId> {
        let session_id = session_id.clone();
        self.request(|reply| WorkerCommand::CreateRouter { session_id, reply })
            .await
    }

    pub(crate) async fn close_router(&self, router_id: &RouterId) -> Result<()> {
        self.commands
            .send(WorkerCommand::CloseRouter {
                router_id: router_id.clone(),
            })
            .await
            .map_err(|_| MediaError::WorkerUnavailable(self.id.clone()))
    }

    pub(crate) async fn create_transport(
        &self,
        router_id: &RouterId,
        participant_id: &ParticipantId,
    ) -> Result<TransportParams> {
        let router_id = router_id.clone();
        let participant_id = participant_id.clone();
        self.request(|reply| WorkerCommand::CreateTransport {
            router_id,
            participant_id,
            reply,
        })
        .await?
    }

    pub(crate) async fn close_transport(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
    ) -> Result<()> {
        self.commands
            .send(WorkerCommand::CloseTransport {
                router_id: router_id.clone(),
                transport_id: transport_id.clone(),
            })
            .await
            .map_err(|_| MediaError::WorkerUnavailable(self.id.clone()))
    }

    pub(crate) async fn connect_transport(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let router_id = router_id.clone();
        let transport_id = transport_id.clone();
        self.request(|reply| WorkerCommand::ConnectTransport {
            router_id,
            transport_id,
            dtls_parameters,
            reply,
        })
        .await?
    }

    pub(crate) async fn produce(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerParams> {
        let router_id = router_id.clone();
        let transport_id = transport_id.clone();
        self.request(|reply| WorkerCommand::Produce {
            router_id,
            transport_id,
            kind,
            rtp_parameters,
            reply,
        })
        .await?
    }

    pub(crate) async fn consume(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        let router_id = router_id.clone();
        let transport_id = transport_id.clone();
        let producer_id = producer_id.clone();
        self.request(|reply| WorkerCommand::Consume {
            router_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            reply,
        })
        .await?
    }

    pub(crate) async fn list_producers(&self, router_id: &RouterId) -> Result<Vec<ProducerParams>> {
        let router_id = router_id.clone();
        self.request(|reply| WorkerCommand::ListProducers { router_id, reply })
            .await?
    }

    /// Current load, answered by the worker task itself
    pub async fn stats(&self) -> Result<WorkerStats> {
        self.request(|reply| WorkerCommand::Stats { reply }).await
    }
}
