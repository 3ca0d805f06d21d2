//! Signaling gateway
//!
//! Every inbound event goes through the same steps:
//! 1. validation (session id, membership, payload shape); failures are logged
//!    with a truncated preview and dropped
//! 2. rate limiting per (connection, kind); rejections are counted and dropped
//! 3. dispatch: call-setup to the media pool and a relay inside the session,
//!    media handshake requests to the worker pool with a reply to the sender,
//!    playback-sync to the session store and a broadcast of the new state
//!
//! Events from one connection are handled in order. A connection that goes
//! away mid-dispatch still lets the operation finish, but nothing is relayed.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use jamz_core::config::IceServerConfig;
use jamz_core::metrics::{self, media::record_pool_stats};
use jamz_core::models::{PlaybackAction, PlaybackState};
use jamz_core::service::{
    truncate_payload, ConnectionId, RateLimitError, RateLimiter, RejectionCounts,
    SessionStateStore, SignalingValidator, ValidationError,
};
use jamz_core::Config;
use jamz_sfu::{MediaError, MediaWorkerPool, SessionId, TransportParams};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::SignalingContext;
use crate::hub::{ConnectionState, OutboundReceiver, SessionHub};
use crate::protocol::{
    ConnectTransportRequest, ConsumeRequest, ConsumerReply, Frame, Hello, InboundEvent,
    MediaRejected, MusicSyncAction, MusicSyncRejected, NewProducer, ParticipantChange,
    ProduceRequest, ProducerList, ProducerReply, RelayedSignal, RtpCapabilitiesReply,
    ServerEvent, SessionJoined, TransportConnected, TransportReply,
};

/// Longest event name echoed into logs
const EVENT_NAME_PREVIEW: usize = 64;

/// One accepted connection. The transport layer drains `outbound` to the
/// socket and clears `alive` when the socket stops accepting writes.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub alive: Arc<AtomicBool>,
    pub outbound: OutboundReceiver,
}

pub struct SignalingGateway {
    pool: Arc<MediaWorkerPool>,
    store: Arc<SessionStateStore>,
    limiter: RateLimiter,
    validator: SignalingValidator,
    context: Arc<SignalingContext>,
    hub: SessionHub,
    ice_servers: Vec<IceServerConfig>,
    outbound_buffer: usize,
}

impl SignalingGateway {
    pub fn new(
        config: &Config,
        pool: Arc<MediaWorkerPool>,
        store: Arc<SessionStateStore>,
        context: Arc<SignalingContext>,
    ) -> Result<Self, RateLimitError> {
        Ok(Self {
            pool,
            store,
            limiter: RateLimiter::new(&config.rate_limit)?,
            validator: SignalingValidator::new(config.signaling.payload_preview_len),
            context,
            hub: SessionHub::new(),
            ice_servers: config.media.ice_servers.clone(),
            outbound_buffer: config.signaling.outbound_buffer.max(1),
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<SignalingContext> {
        &self.context
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<MediaWorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStateStore> {
        &self.store
    }

    #[must_use]
    pub const fn hub(&self) -> &SessionHub {
        &self.hub
    }

    #[must_use]
    pub fn rejection_counts(&self) -> RejectionCounts {
        self.limiter.rejections()
    }

    #[must_use]
    pub fn connection_state(&self, connection_id: &ConnectionId) -> ConnectionState {
        self.hub.state(connection_id)
    }

    /// Register a new connection and greet it with its id
    pub fn connect(&self) -> ConnectionHandle {
        let id = ConnectionId::new(uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let alive = self.hub.register(id.clone(), tx);

        self.hub.send_to(
            &id,
            ServerEvent::Hello(Hello {
                connection_id: id.clone(),
            }),
        );
        metrics::signaling::ACTIVE_CONNECTIONS.inc();
        info!(connection_id = %id, "Signaling connection opened");

        ConnectionHandle {
            id,
            alive,
            outbound: rx,
        }
    }

    /// Tear down everything the connection holds
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        if self.hub.state(connection_id) == ConnectionState::Terminated {
            return;
        }
        self.leave_session(connection_id).await;
        let buckets = self.limiter.remove_connection(connection_id);
        self.hub.unregister(connection_id);
        metrics::signaling::ACTIVE_CONNECTIONS.dec();
        info!(connection_id = %connection_id, buckets, "Signaling connection closed");
    }

    /// Handle one raw text frame
    pub async fn handle_text(&self, connection_id: &ConnectionId, raw: &str) {
        match serde_json::from_str::<Frame>(raw) {
            Ok(frame) => {
                self.handle_event(connection_id, &frame.event, frame.data)
                    .await;
            }
            Err(e) => {
                self.validator.report_malformed(
                    &Value::String(raw.to_string()),
                    Some(connection_id),
                    &ValidationError::Unparseable(e.to_string()),
                );
                metrics::record_event("unknown", "malformed");
            }
        }
    }

    pub async fn handle_event(&self, connection_id: &ConnectionId, name: &str, data: Value) {
        if !self.hub.is_alive(connection_id) {
            return;
        }

        let Some(event) = InboundEvent::from_name(name) else {
            self.drop_malformed(
                connection_id,
                "unknown",
                &data,
                &ValidationError::UnknownEvent(truncate_payload(name, EVENT_NAME_PREVIEW)),
            );
            return;
        };

        if !self.context.is_enabled() {
            metrics::record_event(event.name(), "disabled");
            debug!(
                connection_id = %connection_id,
                event = event.name(),
                "Audio signaling disabled, dropping event"
            );
            return;
        }

        let Some(session_id) = self.validator.require_session_id(&data, Some(connection_id))
        else {
            metrics::record_event(event.name(), "malformed");
            return;
        };

        if event != InboundEvent::JoinAudioSession
            && self.hub.session_of(connection_id).as_ref() != Some(&session_id)
        {
            self.drop_malformed(
                connection_id,
                event.name(),
                &data,
                &ValidationError::NotJoined(session_id),
            );
            return;
        }

        if let Some(signal_field) = event.signal_field() {
            if let Err(e) = self.validator.require_field(&data, signal_field) {
                self.drop_malformed(connection_id, event.name(), &data, &e);
                return;
            }
        }

        if let Some(field) = event.required_str() {
            if let Err(e) = self.validator.require_str(&data, field) {
                self.drop_malformed(connection_id, event.name(), &data, &e);
                return;
            }
        }

        if let Some(kind) = event.rate_kind() {
            if let Err(e) = self.limiter.check(connection_id, kind) {
                metrics::record_event(event.name(), "rate_limited");
                debug!(
                    connection_id = %connection_id,
                    session_id = %session_id,
                    error = %e,
                    "Signaling event dropped by rate limiter"
                );
                return;
            }
        }

        match event {
            InboundEvent::JoinAudioSession => self.join_session(connection_id, &session_id).await,
            InboundEvent::LeaveAudioSession => {
                self.leave_session(connection_id).await;
                metrics::record_event(event.name(), "accepted");
            }
            InboundEvent::WebrtcOffer
            | InboundEvent::WebrtcAnswer
            | InboundEvent::WebrtcCandidate
            | InboundEvent::WebrtcReady
            | InboundEvent::AudioControl => {
                self.relay_signal(connection_id, event, &session_id, data)
                    .await;
            }
            InboundEvent::MusicSync => {
                self.music_sync(connection_id, &session_id, &data).await;
            }
            InboundEvent::MediaGetRtpCapabilities
            | InboundEvent::MediaCreateTransport
            | InboundEvent::MediaConnectTransport
            | InboundEvent::MediaProduce
            | InboundEvent::MediaConsume
            | InboundEvent::MediaGetProducers => {
                self.media_request(connection_id, event, &session_id, &data)
                    .await;
            }
        }
    }

    fn drop_malformed(
        &self,
        connection_id: &ConnectionId,
        event: &str,
        data: &Value,
        error: &ValidationError,
    ) {
        self.validator
            .report_malformed(data, Some(connection_id), error);
        metrics::record_event(event, "malformed");
    }

    async fn join_session(&self, connection_id: &ConnectionId, session_id: &SessionId) {
        let event = InboundEvent::JoinAudioSession.name();
        let rejoin = match self.hub.session_of(connection_id) {
            Some(current) if &current == session_id => true,
            Some(_) => {
                self.leave_session(connection_id).await;
                false
            }
            None => false,
        };

        let transport = self.attach(connection_id, session_id).await;
        let playback_ready = match self.store.clear_invalid_currently_playing(session_id).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "Playback state unavailable for joining participant"
                );
                false
            }
        };

        if !self.hub.is_alive(connection_id) {
            if !rejoin {
                self.pool.release_participant(session_id, connection_id).await;
                self.evict_if_unused(session_id);
            }
            metrics::record_event(event, "discarded");
            return;
        }

        let participants: Vec<ConnectionId> = if rejoin {
            self.hub
                .participants(session_id)
                .into_iter()
                .filter(|c| c != connection_id)
                .collect()
        } else {
            let Some(existing) = self.hub.join(connection_id, session_id) else {
                self.pool.release_participant(session_id, connection_id).await;
                self.evict_if_unused(session_id);
                metrics::record_event(event, "failed");
                return;
            };
            existing
        };

        let session_joined = |playback: Option<PlaybackState>| {
            ServerEvent::SessionJoined(SessionJoined {
                session_id: session_id.clone(),
                participant_id: connection_id.clone(),
                participants: participants.clone(),
                ice_servers: self.ice_servers.clone(),
                transport: transport.clone(),
                playback,
            })
        };

        // Sent under the session lock so no later broadcast can be overtaken
        let with_state = if playback_ready {
            self.store
                .with_snapshot(session_id, |state| {
                    self.hub.send_to(connection_id, session_joined(Some(state)));
                })
                .await
                .is_ok()
        } else {
            false
        };
        if !with_state {
            self.hub.send_to(connection_id, session_joined(None));
        }

        if !rejoin {
            self.hub.broadcast(
                session_id,
                &ServerEvent::ParticipantJoined(ParticipantChange {
                    session_id: session_id.clone(),
                    participant_id: connection_id.clone(),
                }),
                Some(connection_id),
            );
        }

        record_pool_stats(&self.pool.stats());
        metrics::record_event(event, "accepted");
    }

    /// The participant's transport in the session, created on first use
    async fn ensure_transport(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<TransportParams, MediaError> {
        if let Some(transport) = self.pool.transport_for(session_id, connection_id) {
            return Ok(transport);
        }
        self.pool
            .attach_participant(session_id, connection_id)
            .await
            .map(|(_, transport)| transport)
    }

    async fn attach(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Option<TransportParams> {
        match self.ensure_transport(connection_id, session_id).await {
            Ok(transport) => Some(transport),
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    session_id = %session_id,
                    error = %e,
                    "Failed to attach media transport"
                );
                None
            }
        }
    }

    /// Drop store state loaded for a session nobody ended up joining
    fn evict_if_unused(&self, session_id: &SessionId) {
        if self.hub.participants(session_id).is_empty() {
            self.store.evict(session_id);
        }
    }

    /// Take the connection out of its session and release what it held there
    async fn leave_session(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        let (session_id, remaining) = self.hub.leave(connection_id)?;

        let router_destroyed = self.pool.release_participant(&session_id, connection_id).await;
        record_pool_stats(&self.pool.stats());

        if remaining == 0 {
            self.store.evict(&session_id);
        } else {
            self.hub.broadcast(
                &session_id,
                &ServerEvent::ParticipantLeft(ParticipantChange {
                    session_id: session_id.clone(),
                    participant_id: connection_id.clone(),
                }),
                None,
            );

            if self.store.contains(&session_id) {
                let released = self.store.release_control(&session_id, connection_id).await;
                if matches!(released, Ok(true)) {
                    let _ = self
                        .store
                        .with_snapshot(&session_id, |state| {
                            self.hub
                                .broadcast(&session_id, &ServerEvent::MusicSync(state), None)
                        })
                        .await;
                }
            }
        }

        debug!(
            connection_id = %connection_id,
            session_id = %session_id,
            remaining,
            router_destroyed,
            "Released session resources"
        );
        Some(session_id)
    }

    async fn relay_signal(
        &self,
        connection_id: &ConnectionId,
        event: InboundEvent,
        session_id: &SessionId,
        data: Value,
    ) {
        // Call setup needs the sender's transport in place
        if event.signal_field().is_some() && self.attach(connection_id, session_id).await.is_none() {
            metrics::record_event(event.name(), "failed");
            return;
        }

        if !self.hub.is_alive(connection_id) {
            metrics::record_event(event.name(), "discarded");
            return;
        }

        let mut payload = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let to = match payload.remove("to") {
            Some(Value::String(to)) if !to.is_empty() => Some(ConnectionId::new(to)),
            _ => None,
        };

        let signal = RelayedSignal::new(session_id.clone(), connection_id.clone(), payload);
        let Some(relayed) = ServerEvent::relay(event, signal) else {
            return;
        };

        let delivered = self
            .hub
            .relay(session_id, connection_id, to.as_ref(), &relayed);
        debug!(
            connection_id = %connection_id,
            session_id = %session_id,
            event = event.name(),
            delivered,
            "Relayed call-setup event"
        );
        metrics::record_event(event.name(), "relayed");
    }

    fn parse_request<T: DeserializeOwned>(
        &self,
        connection_id: &ConnectionId,
        event: InboundEvent,
        data: &Value,
    ) -> Option<T> {
        match T::deserialize(data) {
            Ok(request) => Some(request),
            Err(e) => {
                self.drop_malformed(
                    connection_id,
                    event.name(),
                    data,
                    &ValidationError::Unparseable(e.to_string()),
                );
                None
            }
        }
    }

    /// Media handshake: answered to the sender only, except that a new
    /// producer is announced to the rest of the session.
    async fn media_request(
        &self,
        connection_id: &ConnectionId,
        event: InboundEvent,
        session_id: &SessionId,
        data: &Value,
    ) {
        let pool = &self.pool;
        let sid = || session_id.clone();

        let outcome = match event {
            InboundEvent::MediaGetRtpCapabilities => {
                pool.rtp_capabilities(session_id).map(|rtp_capabilities| {
                    ServerEvent::RtpCapabilities(RtpCapabilitiesReply {
                        session_id: sid(),
                        rtp_capabilities,
                    })
                })
            }
            InboundEvent::MediaCreateTransport => self
                .ensure_transport(connection_id, session_id)
                .await
                .map(|transport| {
                    ServerEvent::TransportCreated(TransportReply {
                        session_id: sid(),
                        transport,
                    })
                }),
            InboundEvent::MediaConnectTransport => {
                let Some(request) =
                    self.parse_request::<ConnectTransportRequest>(connection_id, event, data)
                else {
                    return;
                };
                pool.connect_transport(
                    session_id,
                    connection_id,
                    &request.transport_id,
                    request.dtls_parameters,
                )
                .await
                .map(|()| {
                    ServerEvent::TransportConnected(TransportConnected {
                        session_id: sid(),
                        transport_id: request.transport_id,
                    })
                })
            }
            InboundEvent::MediaProduce => {
                let Some(request) = self.parse_request::<ProduceRequest>(connection_id, event, data)
                else {
                    return;
                };
                pool.produce(
                    session_id,
                    connection_id,
                    &request.transport_id,
                    request.kind,
                    request.rtp_parameters,
                )
                .await
                .map(|producer| {
                    ServerEvent::ProducerCreated(ProducerReply {
                        session_id: sid(),
                        producer,
                    })
                })
            }
            InboundEvent::MediaConsume => {
                let Some(request) = self.parse_request::<ConsumeRequest>(connection_id, event, data)
                else {
                    return;
                };
                pool.consume(
                    session_id,
                    connection_id,
                    &request.transport_id,
                    &request.producer_id,
                    request.rtp_capabilities,
                )
                .await
                .map(|consumer| {
                    ServerEvent::ConsumerCreated(ConsumerReply {
                        session_id: sid(),
                        consumer,
                    })
                })
            }
            InboundEvent::MediaGetProducers => pool.producers(session_id).await.map(|producers| {
                ServerEvent::Producers(ProducerList {
                    session_id: sid(),
                    producers,
                })
            }),
            _ => return,
        };

        if !self.hub.is_alive(connection_id) {
            metrics::record_event(event.name(), "discarded");
            return;
        }

        match outcome {
            Ok(reply) => {
                if let ServerEvent::ProducerCreated(created) = &reply {
                    self.hub.broadcast(
                        session_id,
                        &ServerEvent::NewProducer(NewProducer {
                            session_id: sid(),
                            producer_id: created.producer.id.clone(),
                            participant_id: connection_id.clone(),
                            kind: created.producer.kind,
                        }),
                        Some(connection_id),
                    );
                }
                self.hub.send_to(connection_id, reply);
                metrics::record_event(event.name(), "accepted");
            }
            Err(e) => {
                info!(
                    connection_id = %connection_id,
                    session_id = %session_id,
                    event = event.name(),
                    error = %e,
                    "Media request rejected"
                );
                self.hub.send_to(
                    connection_id,
                    ServerEvent::MediaRejected(MediaRejected {
                        session_id: sid(),
                        event: event.name().to_string(),
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    }),
                );
                metrics::record_event(event.name(), "rejected");
            }
        }
    }

    async fn music_sync(&self, connection_id: &ConnectionId, session_id: &SessionId, data: &Value) {
        let event = InboundEvent::MusicSync.name();
        let action = match MusicSyncAction::deserialize(data) {
            Ok(action) => action,
            Err(e) => {
                self.drop_malformed(
                    connection_id,
                    event,
                    data,
                    &ValidationError::Unparseable(e.to_string()),
                );
                return;
            }
        };
        let action_name = action.name();
        let store = &self.store;

        let broadcast = match action {
            MusicSyncAction::AddTrack { track } => store
                .add_track(session_id, track, Some(connection_id.clone()))
                .await
                .map(|_| true),
            MusicSyncAction::RemoveTrack { track_id } => store
                .remove_track(session_id, &track_id)
                .await
                .map(|_| true),
            MusicSyncAction::Play { track_id, position } => store
                .control(
                    session_id,
                    PlaybackAction::Play { track_id, position },
                    connection_id,
                )
                .await
                .map(|_| true),
            MusicSyncAction::Pause { position } => store
                .control(session_id, PlaybackAction::Pause { position }, connection_id)
                .await
                .map(|_| true),
            MusicSyncAction::Seek { position } => store
                .control(session_id, PlaybackAction::Seek { position }, connection_id)
                .await
                .map(|_| true),
            MusicSyncAction::Next => store
                .control(session_id, PlaybackAction::Next, connection_id)
                .await
                .map(|_| true),
            MusicSyncAction::Previous => store
                .control(session_id, PlaybackAction::Previous, connection_id)
                .await
                .map(|_| true),
            MusicSyncAction::TakeControl => store
                .take_control(session_id, connection_id)
                .await
                .map(|_| true),
            MusicSyncAction::ReleaseControl => store
                .release_control(session_id, connection_id)
                .await
                .map(|_| true),
            MusicSyncAction::Deduplicate => store.deduplicate(session_id).await.map(|_| true),
            MusicSyncAction::ResolveUrls => {
                store.resolve_missing_urls(session_id).await.map(|_| true)
            }
            // Read only: answer the requester
            MusicSyncAction::RequestState => Ok(false),
        };

        if !self.hub.is_alive(connection_id) {
            metrics::record_event(event, "discarded");
            return;
        }

        // Published under the session lock so members see versions in order
        let published = match broadcast {
            Ok(broadcast) => {
                store
                    .with_snapshot(session_id, |state| {
                        let update = ServerEvent::MusicSync(state);
                        if broadcast {
                            self.hub.broadcast(session_id, &update, None);
                        } else {
                            self.hub.send_to(connection_id, update);
                        }
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => metrics::record_event(event, "accepted"),
            Err(e) => {
                info!(
                    connection_id = %connection_id,
                    session_id = %session_id,
                    action = action_name,
                    error = %e,
                    "Playback change rejected"
                );
                self.hub.send_to(
                    connection_id,
                    ServerEvent::MusicSyncRejected(MusicSyncRejected {
                        session_id: session_id.clone(),
                        action: action_name.to_string(),
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    }),
                );
                metrics::record_event(event, "rejected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jamz_core::config::BucketConfig;
    use jamz_core::service::{SessionStateLoader, StoredSession};
    use jamz_sfu::fatal_channel;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    async fn gateway_with_store(config: Config, store: SessionStateStore) -> SignalingGateway {
        let (fatal_tx, _fatal_rx) = fatal_channel();
        let pool = MediaWorkerPool::create_workers(config.media.to_pool_config().unwrap(), fatal_tx)
            .await
            .unwrap();
        let context = Arc::new(SignalingContext::from_config(&config));
        SignalingGateway::new(&config, pool, Arc::new(store), context).unwrap()
    }

    async fn gateway_with(config: Config) -> SignalingGateway {
        gateway_with_store(config, SessionStateStore::new()).await
    }

    /// Loader that drops the armed connection while state is being loaded,
    /// the way a socket can close while a request is in flight.
    #[derive(Default)]
    struct DisconnectingLoader {
        armed: std::sync::Mutex<Option<Arc<AtomicBool>>>,
    }

    impl DisconnectingLoader {
        fn arm(&self, alive: &Arc<AtomicBool>) {
            *self.armed.lock().unwrap() = Some(Arc::clone(alive));
        }
    }

    #[async_trait]
    impl SessionStateLoader for DisconnectingLoader {
        async fn load(&self, _session_id: &SessionId) -> jamz_core::Result<Option<StoredSession>> {
            let armed = self.armed.lock().unwrap().take();
            if let Some(alive) = armed {
                alive.store(false, Ordering::Release);
            }
            Ok(None)
        }
    }

    async fn gateway() -> SignalingGateway {
        let mut config = Config::default();
        config.media.worker_count = 2;
        config.server.allow_debug_toggle = true;
        gateway_with(config).await
    }

    fn drain(conn: &mut ConnectionHandle) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = conn.outbound.try_recv() {
            out.push(event);
        }
        out
    }

    async fn join(gw: &SignalingGateway, conn: &mut ConnectionHandle, session: &str) {
        gw.handle_event(&conn.id, "join-audio-session", json!({ "sessionId": session }))
            .await;
        let events = drain(conn);
        assert!(
            events.iter().any(|e| matches!(e, ServerEvent::SessionJoined(_))),
            "join failed: {events:?}"
        );
    }

    #[tokio::test]
    async fn test_connect_sends_hello() {
        let gw = gateway().await;
        let mut conn = gw.connect();
        match drain(&mut conn).as_slice() {
            [ServerEvent::Hello(hello)] => assert_eq!(hello.connection_id, conn.id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(gw.connection_state(&conn.id), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_join_returns_transport_and_state() {
        let gw = gateway().await;
        let mut conn = gw.connect();
        drain(&mut conn);

        gw.handle_event(&conn.id, "join-audio-session", json!({ "session_id": "s1" }))
            .await;
        let events = drain(&mut conn);
        let Some(ServerEvent::SessionJoined(joined)) = events.first() else {
            panic!("expected session-joined, got {events:?}");
        };
        assert_eq!(joined.session_id, SessionId::from("s1"));
        assert!(joined.participants.is_empty());
        assert!(joined.transport.is_some());
        assert!(joined.playback.is_some());
        assert!(!joined.ice_servers.is_empty());
        assert_eq!(
            gw.connection_state(&conn.id),
            ConnectionState::InSession(SessionId::from("s1"))
        );
    }

    #[tokio::test]
    async fn test_events_before_join_are_dropped() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        gw.handle_event(&a.id, "webrtc-offer", json!({"sessionId": "s1", "offer": {"sdp": "x"}}))
            .await;
        assert!(drain(&mut b).is_empty());
        assert!(gw.pool().transport_for(&SessionId::from("s1"), &a.id).is_none());
    }

    #[tokio::test]
    async fn test_missing_session_id_is_dropped() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        gw.handle_event(&b.id, "webrtc-offer", json!({"offer": {"sdp": "x"}}))
            .await;
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_signaling_drops_events() {
        let gw = gateway().await;
        let mut conn = gw.connect();
        drain(&mut conn);

        assert_eq!(gw.context().toggle(), Ok(false));
        gw.handle_event(&conn.id, "join-audio-session", json!({"sessionId": "s1"}))
            .await;
        assert!(drain(&mut conn).is_empty());
        assert_eq!(gw.connection_state(&conn.id), ConnectionState::Connected);

        assert_eq!(gw.context().toggle(), Ok(true));
        join(&gw, &mut conn, "s1").await;
    }

    #[tokio::test]
    async fn test_candidate_flood_is_rate_limited() {
        let mut config = Config::default();
        config.rate_limit.candidate = BucketConfig::new(3, 60_000);
        let gw = gateway_with(config).await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut b);

        for i in 0..5 {
            gw.handle_event(
                &a.id,
                "webrtc-candidate",
                json!({"sessionId": "s1", "candidate": {"candidate": format!("c{i}")}}),
            )
            .await;
        }

        let relayed = drain(&mut b)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::WebrtcCandidate(_)))
            .count();
        assert_eq!(relayed, 3);
        assert_eq!(gw.rejection_counts().candidates, 2);
        // Nothing is sent back to the sender
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_music_sync_broadcasts_to_whole_session() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        let mut c = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        join(&gw, &mut c, "s2").await;
        drain(&mut a);

        gw.handle_event(
            &a.id,
            "music-sync",
            json!({
                "sessionId": "s1",
                "action": "add-track",
                "track": {"title": "A", "artist": "X", "fileUrl": "/a.mp3"}
            }),
        )
        .await;

        for conn in [&mut a, &mut b] {
            let events = drain(conn);
            let Some(ServerEvent::MusicSync(state)) = events.first() else {
                panic!("expected music-sync, got {events:?}");
            };
            assert_eq!(state.playlist.len(), 1);
        }
        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_playback_change_goes_to_sender_only() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;

        gw.handle_event(
            &a.id,
            "music-sync",
            json!({"sessionId": "s1", "action": "add-track", "track": {"title": "A", "artist": "X"}}),
        )
        .await;
        let track_id = match drain(&mut a).first() {
            Some(ServerEvent::MusicSync(state)) => state.playlist[0].id.clone(),
            other => panic!("unexpected {other:?}"),
        };
        drain(&mut b);

        gw.handle_event(
            &a.id,
            "music-sync",
            json!({"sessionId": "s1", "action": "play", "trackId": track_id}),
        )
        .await;

        match drain(&mut a).as_slice() {
            [ServerEvent::MusicSyncRejected(rejected)] => {
                assert_eq!(rejected.code, "invariant_violation");
                assert_eq!(rejected.action, "play");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(drain(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_add_broadcasts_existing_state() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        let add = json!({"sessionId": "s1", "action": "add-track", "track": {"title": "A", "artist": "X"}});
        gw.handle_event(&a.id, "music-sync", add.clone()).await;
        drain(&mut a);
        drain(&mut b);

        gw.handle_event(&b.id, "music-sync", add).await;
        for conn in [&mut a, &mut b] {
            match drain(conn).as_slice() {
                [ServerEvent::MusicSync(state)] => assert_eq!(state.playlist.len(), 1),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_request_state_answers_requester_only() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        gw.handle_event(&b.id, "music-sync", json!({"sessionId": "s1", "action": "request-state"}))
            .await;
        assert!(matches!(drain(&mut b).as_slice(), [ServerEvent::MusicSync(_)]));
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        gw.handle_event(&b.id, "music-sync", json!({"sessionId": "s1", "action": "take-control"}))
            .await;
        gw.handle_event(
            &b.id,
            "webrtc-candidate",
            json!({"sessionId": "s1", "candidate": {}}),
        )
        .await;
        drain(&mut a);

        gw.disconnect(&b.id).await;
        assert_eq!(gw.connection_state(&b.id), ConnectionState::Terminated);

        let events = drain(&mut a);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::ParticipantLeft(change) if change.participant_id == b.id
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::MusicSync(state) if state.controller.is_none()
        )));
        let s1 = SessionId::from("s1");
        assert!(gw.pool().transport_for(&s1, &b.id).is_none());
        assert!(gw.pool().router_for(&s1).is_some());

        gw.disconnect(&a.id).await;
        assert!(gw.pool().router_for(&s1).is_none());
        assert!(!gw.store().contains(&s1));
        assert_eq!(gw.hub().session_count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_dropped() {
        let gw = gateway().await;
        let mut conn = gw.connect();
        drain(&mut conn);

        gw.handle_text(&conn.id, "{not json").await;
        gw.handle_text(&conn.id, r#"{"event": "self-destruct", "data": {}}"#)
            .await;
        assert!(drain(&mut conn).is_empty());
        assert_eq!(gw.connection_state(&conn.id), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_results_for_vanished_connection_are_discarded() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        // Socket writer gave up on b
        b.alive.store(false, Ordering::Release);
        gw.handle_event(&b.id, "webrtc-offer", json!({"sessionId": "s1", "offer": {}}))
            .await;
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_connection_lost_during_join_leaves_nothing_behind() {
        let loader = Arc::new(DisconnectingLoader::default());
        let store = SessionStateStore::with_loader(Arc::clone(&loader) as Arc<dyn SessionStateLoader>);
        let gw = gateway_with_store(Config::default(), store).await;
        let mut a = gw.connect();
        drain(&mut a);

        loader.arm(&a.alive);
        gw.handle_event(&a.id, "join-audio-session", json!({"sessionId": "s1"}))
            .await;

        assert!(drain(&mut a).is_empty());
        let s1 = SessionId::from("s1");
        assert!(gw.pool().router_for(&s1).is_none());
        assert!(!gw.store().contains(&s1));
        assert_eq!(gw.store().session_count(), 0);
        assert_eq!(gw.hub().session_count(), 0);
        assert_eq!(gw.connection_state(&a.id), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connection_lost_during_join_keeps_other_members_state() {
        let loader = Arc::new(DisconnectingLoader::default());
        let store = SessionStateStore::with_loader(Arc::clone(&loader) as Arc<dyn SessionStateLoader>);
        let gw = gateway_with_store(Config::default(), store).await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        drain(&mut b);

        // b's join reloads state while a is still a member
        loader.arm(&b.alive);
        gw.store().evict(&SessionId::from("s1"));
        gw.handle_event(&b.id, "join-audio-session", json!({"sessionId": "s1"}))
            .await;

        let s1 = SessionId::from("s1");
        assert!(drain(&mut b).is_empty());
        assert!(drain(&mut a).is_empty());
        assert_eq!(gw.hub().participants(&s1), vec![a.id.clone()]);
        assert!(gw.store().contains(&s1));
        assert!(gw.pool().transport_for(&s1, &b.id).is_none());
        assert!(gw.pool().transport_for(&s1, &a.id).is_some());
    }

    #[tokio::test]
    async fn test_connection_lost_during_music_sync_is_not_broadcast() {
        let loader = Arc::new(DisconnectingLoader::default());
        let store = SessionStateStore::with_loader(Arc::clone(&loader) as Arc<dyn SessionStateLoader>);
        let gw = gateway_with_store(Config::default(), store).await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        loader.arm(&a.alive);
        gw.store().evict(&SessionId::from("s1"));
        gw.handle_event(
            &a.id,
            "music-sync",
            json!({"sessionId": "s1", "action": "add-track", "track": {"title": "A", "artist": "X"}}),
        )
        .await;

        assert!(!a.alive.load(Ordering::Acquire));
        assert!(drain(&mut b).is_empty());
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_edits_reach_members_in_version_order() {
        let mut config = Config::default();
        config.rate_limit.music_sync = BucketConfig::new(100, 60_000);
        let gw = gateway_with(config).await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        let edits = (0..12).map(|i| {
            let sender = if i % 2 == 0 { &a.id } else { &b.id };
            gw.handle_event(
                sender,
                "music-sync",
                json!({
                    "sessionId": "s1",
                    "action": "add-track",
                    "track": {"title": format!("T{i}"), "artist": "X"}
                }),
            )
        });
        futures::future::join_all(edits).await;

        let last = gw
            .store()
            .with_snapshot(&SessionId::from("s1"), |state| state.version)
            .await
            .unwrap();
        for conn in [&mut a, &mut b] {
            let versions: Vec<u64> = drain(conn)
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::MusicSync(state) => Some(state.version),
                    _ => None,
                })
                .collect();
            assert_eq!(versions.len(), 12);
            assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{versions:?}");
            assert_eq!(versions.last(), Some(&last));
        }
    }

    #[tokio::test]
    async fn test_ready_and_audio_control_are_relayed() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        gw.handle_event(&a.id, "webrtc-ready", json!({"sessionId": "s1", "userId": "u1"}))
            .await;
        gw.handle_event(&a.id, "audio-control", json!({"sessionId": "s1", "action": "mute"}))
            .await;
        // No action, dropped
        gw.handle_event(&a.id, "audio-control", json!({"sessionId": "s1"}))
            .await;

        match drain(&mut b).as_slice() {
            [ServerEvent::WebrtcReady(ready), ServerEvent::AudioControl(control)] => {
                assert_eq!(ready.from, a.id);
                assert_eq!(ready.payload["userId"], "u1");
                assert_eq!(control.payload["action"], "mute");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(drain(&mut a).is_empty());
    }

    fn opus_caps() -> Value {
        json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}]})
    }

    fn dtls() -> Value {
        json!({"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD"}]})
    }

    #[tokio::test]
    async fn test_media_handshake_between_two_participants() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);

        gw.handle_event(&a.id, "mediasoup-get-rtpCapabilities", json!({"sessionId": "s1"}))
            .await;
        match drain(&mut a).as_slice() {
            [ServerEvent::RtpCapabilities(reply)] => {
                assert_eq!(reply.rtp_capabilities.codecs[0].mime_type, "audio/opus");
            }
            other => panic!("unexpected {other:?}"),
        }

        gw.handle_event(&a.id, "mediasoup-create-transport", json!({"sessionId": "s1"}))
            .await;
        let ta = match drain(&mut a).as_slice() {
            [ServerEvent::TransportCreated(reply)] => reply.transport.clone(),
            other => panic!("unexpected {other:?}"),
        };
        // Same transport that came with session-joined
        assert_eq!(
            Some(&ta),
            gw.pool().transport_for(&SessionId::from("s1"), &a.id).as_ref()
        );
        assert!(!ta.dtls_parameters.fingerprints.is_empty());

        gw.handle_event(
            &a.id,
            "mediasoup-connect-transport",
            json!({"sessionId": "s1", "transportId": ta.id.as_str(), "dtlsParameters": dtls()}),
        )
        .await;
        assert!(matches!(
            drain(&mut a).as_slice(),
            [ServerEvent::TransportConnected(reply)] if reply.transport_id == ta.id
        ));

        gw.handle_event(
            &a.id,
            "mediasoup-produce",
            json!({"sessionId": "s1", "transportId": ta.id.as_str(), "kind": "audio", "rtpParameters": {"codecs": []}}),
        )
        .await;
        let producer = match drain(&mut a).as_slice() {
            [ServerEvent::ProducerCreated(reply)] => reply.producer.clone(),
            other => panic!("unexpected {other:?}"),
        };
        match drain(&mut b).as_slice() {
            [ServerEvent::NewProducer(announce)] => {
                assert_eq!(announce.producer_id, producer.id);
                assert_eq!(announce.participant_id, a.id);
            }
            other => panic!("unexpected {other:?}"),
        }

        gw.handle_event(&b.id, "mediasoup-get-producers", json!({"sessionId": "s1"}))
            .await;
        match drain(&mut b).as_slice() {
            [ServerEvent::Producers(list)] => assert_eq!(list.producers, vec![producer.clone()]),
            other => panic!("unexpected {other:?}"),
        }

        let tb = gw
            .pool()
            .transport_for(&SessionId::from("s1"), &b.id)
            .unwrap();
        gw.handle_event(
            &b.id,
            "mediasoup-consume",
            json!({
                "sessionId": "s1",
                "transportId": tb.id.as_str(),
                "producerId": producer.id.as_str(),
                "rtpCapabilities": opus_caps()
            }),
        )
        .await;
        match drain(&mut b).as_slice() {
            [ServerEvent::ConsumerCreated(reply)] => {
                assert_eq!(reply.consumer.producer_id, producer.id);
                assert_eq!(reply.consumer.producer_participant_id, a.id);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_media_failures_answer_sender_only() {
        let gw = gateway().await;
        let mut a = gw.connect();
        let mut b = gw.connect();
        join(&gw, &mut a, "s1").await;
        join(&gw, &mut b, "s1").await;
        drain(&mut a);
        let tb = gw
            .pool()
            .transport_for(&SessionId::from("s1"), &b.id)
            .unwrap();

        // a tries to drive b's transport
        gw.handle_event(
            &a.id,
            "mediasoup-connect-transport",
            json!({"sessionId": "s1", "transportId": tb.id.as_str(), "dtlsParameters": dtls()}),
        )
        .await;
        match drain(&mut a).as_slice() {
            [ServerEvent::MediaRejected(rejected)] => {
                assert_eq!(rejected.code, "unknown_transport");
                assert_eq!(rejected.event, "mediasoup-connect-transport");
            }
            other => panic!("unexpected {other:?}"),
        }

        let ta = gw
            .pool()
            .transport_for(&SessionId::from("s1"), &a.id)
            .unwrap();
        gw.handle_event(
            &a.id,
            "mediasoup-consume",
            json!({
                "sessionId": "s1",
                "transportId": ta.id.as_str(),
                "producerId": "missing",
                "rtpCapabilities": opus_caps()
            }),
        )
        .await;
        assert!(matches!(
            drain(&mut a).as_slice(),
            [ServerEvent::MediaRejected(rejected)] if rejected.code == "unknown_producer"
        ));

        // Shape errors are dropped without a reply
        gw.handle_event(&a.id, "mediasoup-produce", json!({"sessionId": "s1", "rtpParameters": {}}))
            .await;
        gw.handle_event(
            &a.id,
            "mediasoup-connect-transport",
            json!({"sessionId": "s1", "transportId": "t1"}),
        )
        .await;
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());
    }
}
