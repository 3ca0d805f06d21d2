//! Per-participant media transports
//!
//! A transport is always created on, and owned through, a router. The worker
//! keeps the authoritative record; callers only ever see [`TransportParams`].

use crate::config::{BitrateEnvelope, PoolConfig};
use crate::rtp::DtlsParameters;
use crate::types::{ParticipantId, RouterId, TransportId};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// ICE credentials handed to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

impl IceParameters {
    fn generate() -> Self {
        Self {
            username_fragment: nanoid::nanoid!(16),
            password: nanoid::nanoid!(32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: TransportProtocol,
    pub priority: u32,
}

/// Everything a client needs to connect its side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub router_id: RouterId,
    pub participant_id: ParticipantId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub bitrate: BitrateEnvelope,
    pub max_incoming_bitrate: u32,
}

impl TransportParams {
    pub(crate) fn build(
        router_id: RouterId,
        participant_id: ParticipantId,
        port: u16,
        config: &PoolConfig,
    ) -> Self {
        let ip = config.candidate_ip();
        let (udp_priority, tcp_priority) = if config.prefer_tcp {
            (1_076_302_079, 1_076_558_079)
        } else {
            (1_076_558_079, 1_076_302_079)
        };

        let mut ice_candidates = Vec::with_capacity(2);
        if config.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                ip,
                port,
                protocol: TransportProtocol::Udp,
                priority: udp_priority,
            });
        }
        if config.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                ip,
                port,
                protocol: TransportProtocol::Tcp,
                priority: tcp_priority,
            });
        }
        // Highest priority first
        ice_candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self {
            id: TransportId::generate(),
            router_id,
            participant_id,
            ice_parameters: IceParameters::generate(),
            ice_candidates,
            dtls_parameters: DtlsParameters::generate(),
            bitrate: config.bitrate,
            max_incoming_bitrate: config.max_incoming_bitrate,
        }
    }

    /// Port bound by this transport
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.ice_candidates.first().map(|c| c.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_preferred_orders_tcp_first() {
        let config = PoolConfig {
            prefer_tcp: true,
            ..Default::default()
        };
        let params = TransportParams::build(
            RouterId::from("r1"),
            ParticipantId::from("p1"),
            40001,
            &config,
        );
        assert_eq!(params.ice_candidates.len(), 2);
        assert_eq!(params.ice_candidates[0].protocol, TransportProtocol::Tcp);
        assert_eq!(params.port(), Some(40001));
    }

    #[test]
    fn test_params_serialize_for_client() {
        let params = TransportParams::build(
            RouterId::from("r1"),
            ParticipantId::from("p1"),
            40001,
            &PoolConfig::default(),
        );
        let json = serde_json::to_value(&params).unwrap();
        assert!(json["iceParameters"]["usernameFragment"].is_string());
        assert_eq!(json["dtlsParameters"]["role"], "auto");
        assert_eq!(
            json["dtlsParameters"]["fingerprints"][0]["algorithm"],
            "sha-256"
        );
    }

    #[test]
    fn test_disabled_protocols_are_omitted() {
        let config = PoolConfig {
            enable_tcp: false,
            ..Default::default()
        };
        let params = TransportParams::build(
            RouterId::from("r1"),
            ParticipantId::from("p1"),
            40001,
            &config,
        );
        assert_eq!(params.ice_candidates.len(), 1);
        assert_eq!(params.ice_candidates[0].protocol, TransportProtocol::Udp);
    }

    #[test]
    fn test_candidates_use_announced_ip() {
        let config = PoolConfig {
            announced_ip: Some(IpAddr::from([198, 51, 100, 1])),
            ..Default::default()
        };
        let params = TransportParams::build(
            RouterId::from("r1"),
            ParticipantId::from("p1"),
            40001,
            &config,
        );
        assert!(params
            .ice_candidates
            .iter()
            .all(|c| c.ip.to_string() == "198.51.100.1"));
    }
}
