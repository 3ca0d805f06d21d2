//! Wire protocol
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <object>}`.

use jamz_core::config::IceServerConfig;
use jamz_core::models::{NewTrack, PlaybackState, TrackId};
use jamz_core::service::MessageKind;
use jamz_sfu::{
    ConsumerParams, DtlsParameters, MediaKind, ParticipantId, ProducerId, ProducerParams,
    RtpCapabilities, SessionId, TransportId, TransportParams,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw inbound frame before the event name is interpreted
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEvent {
    JoinAudioSession,
    LeaveAudioSession,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcCandidate,
    WebrtcReady,
    AudioControl,
    MusicSync,
    MediaGetRtpCapabilities,
    MediaCreateTransport,
    MediaConnectTransport,
    MediaProduce,
    MediaConsume,
    MediaGetProducers,
}

impl InboundEvent {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "join-audio-session" => Some(Self::JoinAudioSession),
            "leave-audio-session" => Some(Self::LeaveAudioSession),
            "webrtc-offer" => Some(Self::WebrtcOffer),
            "webrtc-answer" => Some(Self::WebrtcAnswer),
            "webrtc-candidate" => Some(Self::WebrtcCandidate),
            "webrtc-ready" => Some(Self::WebrtcReady),
            "audio-control" => Some(Self::AudioControl),
            "music-sync" => Some(Self::MusicSync),
            "mediasoup-get-rtpCapabilities" => Some(Self::MediaGetRtpCapabilities),
            "mediasoup-create-transport" => Some(Self::MediaCreateTransport),
            "mediasoup-connect-transport" => Some(Self::MediaConnectTransport),
            "mediasoup-produce" => Some(Self::MediaProduce),
            "mediasoup-consume" => Some(Self::MediaConsume),
            "mediasoup-get-producers" => Some(Self::MediaGetProducers),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::JoinAudioSession => "join-audio-session",
            Self::LeaveAudioSession => "leave-audio-session",
            Self::WebrtcOffer => "webrtc-offer",
            Self::WebrtcAnswer => "webrtc-answer",
            Self::WebrtcCandidate => "webrtc-candidate",
            Self::WebrtcReady => "webrtc-ready",
            Self::AudioControl => "audio-control",
            Self::MusicSync => "music-sync",
            Self::MediaGetRtpCapabilities => "mediasoup-get-rtpCapabilities",
            Self::MediaCreateTransport => "mediasoup-create-transport",
            Self::MediaConnectTransport => "mediasoup-connect-transport",
            Self::MediaProduce => "mediasoup-produce",
            Self::MediaConsume => "mediasoup-consume",
            Self::MediaGetProducers => "mediasoup-get-producers",
        }
    }

    /// Bucket the event is charged against. Membership changes are free.
    #[must_use]
    pub const fn rate_kind(self) -> Option<MessageKind> {
        match self {
            Self::WebrtcOffer
            | Self::WebrtcAnswer
            | Self::WebrtcReady
            | Self::MediaGetRtpCapabilities
            | Self::MediaCreateTransport
            | Self::MediaConnectTransport
            | Self::MediaProduce
            | Self::MediaConsume
            | Self::MediaGetProducers => Some(MessageKind::Negotiation),
            Self::WebrtcCandidate => Some(MessageKind::Candidate),
            Self::MusicSync | Self::AudioControl => Some(MessageKind::MusicSync),
            Self::JoinAudioSession | Self::LeaveAudioSession => None,
        }
    }

    /// Payload field a call-setup event must carry
    #[must_use]
    pub const fn signal_field(self) -> Option<&'static str> {
        match self {
            Self::WebrtcOffer => Some("offer"),
            Self::WebrtcAnswer => Some("answer"),
            Self::WebrtcCandidate => Some("candidate"),
            _ => None,
        }
    }

    /// String field the event must carry
    #[must_use]
    pub const fn required_str(self) -> Option<&'static str> {
        match self {
            Self::AudioControl => Some("action"),
            Self::MediaConnectTransport | Self::MediaProduce | Self::MediaConsume => {
                Some("transportId")
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    #[serde(default)]
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

/// `music-sync` request body, selected by `action`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum MusicSyncAction {
    AddTrack {
        track: NewTrack,
    },
    #[serde(rename_all = "camelCase")]
    RemoveTrack {
        track_id: TrackId,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        #[serde(default)]
        track_id: Option<TrackId>,
        #[serde(default)]
        position: Option<f64>,
    },
    Pause {
        #[serde(default)]
        position: Option<f64>,
    },
    Seek {
        position: f64,
    },
    Next,
    Previous,
    TakeControl,
    ReleaseControl,
    Deduplicate,
    ResolveUrls,
    RequestState,
}

impl MusicSyncAction {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddTrack { .. } => "add-track",
            Self::RemoveTrack { .. } => "remove-track",
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Seek { .. } => "seek",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::TakeControl => "take-control",
            Self::ReleaseControl => "release-control",
            Self::Deduplicate => "deduplicate",
            Self::ResolveUrls => "resolve-urls",
            Self::RequestState => "request-state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub connection_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJoined {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    /// Everyone else already in the session
    pub participants: Vec<ParticipantId>,
    pub ice_servers: Vec<IceServerConfig>,
    pub transport: Option<TransportParams>,
    pub playback: Option<PlaybackState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChange {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
}

/// Keys the server sets on a relayed payload; client values are discarded
const RESERVED_SIGNAL_KEYS: [&str; 4] = ["from", "sessionId", "session_id", "to"];

/// Call-setup payload forwarded to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    pub session_id: SessionId,
    pub from: ParticipantId,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RelayedSignal {
    /// Wrap a client payload, dropping any keys that would shadow the
    /// server-assigned sender and session.
    #[must_use]
    pub fn new(session_id: SessionId, from: ParticipantId, mut payload: Map<String, Value>) -> Self {
        for key in RESERVED_SIGNAL_KEYS {
            payload.remove(key);
        }
        Self {
            session_id,
            from,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicSyncRejected {
    pub session_id: SessionId,
    pub action: String,
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesReply {
    pub session_id: SessionId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportReply {
    pub session_id: SessionId,
    pub transport: TransportParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnected {
    pub session_id: SessionId,
    pub transport_id: TransportId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerReply {
    pub session_id: SessionId,
    pub producer: ProducerParams,
}

/// Told to the rest of the session when someone starts sending media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub session_id: SessionId,
    pub producer_id: ProducerId,
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReply {
    pub session_id: SessionId,
    pub consumer: ConsumerParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerList {
    pub session_id: SessionId,
    pub producers: Vec<ProducerParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRejected {
    pub session_id: SessionId,
    pub event: String,
    pub code: String,
    pub reason: String,
}

/// Everything the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Hello(Hello),
    SessionJoined(SessionJoined),
    ParticipantJoined(ParticipantChange),
    ParticipantLeft(ParticipantChange),
    WebrtcOffer(RelayedSignal),
    WebrtcAnswer(RelayedSignal),
    WebrtcCandidate(RelayedSignal),
    WebrtcReady(RelayedSignal),
    AudioControl(RelayedSignal),
    MusicSync(PlaybackState),
    MusicSyncRejected(MusicSyncRejected),
    RtpCapabilities(RtpCapabilitiesReply),
    TransportCreated(TransportReply),
    TransportConnected(TransportConnected),
    ProducerCreated(ProducerReply),
    NewProducer(NewProducer),
    ConsumerCreated(ConsumerReply),
    Producers(ProducerList),
    #[serde(rename = "media-error")]
    MediaRejected(MediaRejected),
}

impl ServerEvent {
    /// Relay variant for a call-setup event
    #[must_use]
    pub fn relay(event: InboundEvent, signal: RelayedSignal) -> Option<Self> {
        match event {
            InboundEvent::WebrtcOffer => Some(Self::WebrtcOffer(signal)),
            InboundEvent::WebrtcAnswer => Some(Self::WebrtcAnswer(signal)),
            InboundEvent::WebrtcCandidate => Some(Self::WebrtcCandidate(signal)),
            InboundEvent::WebrtcReady => Some(Self::WebrtcReady(signal)),
            InboundEvent::AudioControl => Some(Self::AudioControl(signal)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::SessionJoined(_) => "session-joined",
            Self::ParticipantJoined(_) => "participant-joined",
            Self::ParticipantLeft(_) => "participant-left",
            Self::WebrtcOffer(_) => "webrtc-offer",
            Self::WebrtcAnswer(_) => "webrtc-answer",
            Self::WebrtcCandidate(_) => "webrtc-candidate",
            Self::WebrtcReady(_) => "webrtc-ready",
            Self::AudioControl(_) => "audio-control",
            Self::MusicSync(_) => "music-sync",
            Self::MusicSyncRejected(_) => "music-sync-rejected",
            Self::RtpCapabilities(_) => "rtp-capabilities",
            Self::TransportCreated(_) => "transport-created",
            Self::TransportConnected(_) => "transport-connected",
            Self::ProducerCreated(_) => "producer-created",
            Self::NewProducer(_) => "new-producer",
            Self::ConsumerCreated(_) => "consumer-created",
            Self::Producers(_) => "producers",
            Self::MediaRejected(_) => "media-error",
        }
    }
}
