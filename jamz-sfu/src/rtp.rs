//! RTP capabilities, DTLS parameters and producer/consumer records
//!
//! Only the parts of the negotiation the server is authoritative for are
//! typed. Client RTP parameters are carried through opaquely.

use crate::types::{ConsumerId, ParticipantId, ProducerId, TransportId};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

impl RtpCodecCapability {
    /// Stereo Opus at 48 kHz
    #[must_use]
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(100),
            clock_rate: 48_000,
            channels: Some(2),
        }
    }

    /// Same codec, ignoring payload type assignment
    fn matches(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && (self.kind != MediaKind::Audio || self.channels == other.channels)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    #[must_use]
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind)
    }

    /// First of our codecs of `kind` that the remote side can also handle
    #[must_use]
    pub fn negotiate(&self, kind: MediaKind, remote: &Self) -> Option<&RtpCodecCapability> {
        self.codecs
            .iter()
            .filter(|c| c.kind == kind)
            .find(|ours| remote.codecs.iter().any(|theirs| ours.matches(theirs)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

impl DtlsParameters {
    /// Server side parameters with a fresh sha-256 fingerprint
    pub(crate) fn generate() -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());

        let mut value = String::with_capacity(bytes.len() * 3);
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                value.push(':');
            }
            let _ = write!(value, "{byte:02X}");
        }

        Self {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value,
            }],
        }
    }

    /// Remote parameters must carry at least one usable fingerprint
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.fingerprints.is_empty() {
            return Err("no fingerprints".to_string());
        }
        if self
            .fingerprints
            .iter()
            .any(|f| f.algorithm.trim().is_empty() || f.value.trim().is_empty())
        {
            return Err("empty fingerprint".to_string());
        }
        Ok(())
    }
}

/// A media stream sent by a participant into its session's router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerParams {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpEncoding {
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRtpParameters {
    pub codecs: Vec<RtpCodecCapability>,
    pub encodings: Vec<RtpEncoding>,
}

/// A participant's subscription to another participant's producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    /// Participant whose media this consumer carries
    pub producer_participant_id: ParticipantId,
    pub kind: MediaKind,
    pub rtp_parameters: ConsumerRtpParameters,
}

impl ConsumerRtpParameters {
    pub(crate) fn for_codec(codec: &RtpCodecCapability) -> Self {
        let uuid = uuid::Uuid::new_v4();
        let b = uuid.as_bytes();
        Self {
            codecs: vec![codec.clone()],
            encodings: vec![RtpEncoding {
                ssrc: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            }],
        }
    }
}
