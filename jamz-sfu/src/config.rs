//! Media worker pool configuration
//!
//! Fixed at startup. Nothing in here is mutable once the pool is running.

use crate::rtp::RtpCodecCapability;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Outgoing bitrate envelope applied to every transport (bits per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateEnvelope {
    pub initial: u32,
    pub min: u32,
    pub max: u32,
}

impl BitrateEnvelope {
    /// `min <= initial <= max`
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.min <= self.initial && self.initial <= self.max
    }
}

impl Default for BitrateEnvelope {
    fn default() -> Self {
        Self {
            initial: 1_000_000,
            min: 600_000,
            max: 1_500_000,
        }
    }
}

/// Media worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers spawned at startup
    pub worker_count: usize,
    /// Address transports listen on
    pub listen_ip: IpAddr,
    /// Address advertised to clients in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<IpAddr>,
    /// RTC port range shared out between workers (inclusive)
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_tcp: bool,
    pub bitrate: BitrateEnvelope,
    pub max_incoming_bitrate: u32,
    /// Delay between a worker death and process shutdown
    pub death_grace_period: Duration,
    /// Capacity of each worker's command queue
    pub command_buffer: usize,
    /// Codecs every router offers
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 40100,
            enable_udp: true,
            enable_tcp: true,
            prefer_tcp: false,
            bitrate: BitrateEnvelope::default(),
            max_incoming_bitrate: 1_500_000,
            death_grace_period: Duration::from_secs(2),
            command_buffer: 256,
            media_codecs: vec![RtpCodecCapability::opus()],
        }
    }
}

impl PoolConfig {
    /// IP placed in ICE candidates
    #[must_use]
    pub fn candidate_ip(&self) -> IpAddr {
        self.announced_ip.unwrap_or(self.listen_ip)
    }

    /// Total number of ports in the configured range
    #[must_use]
    pub fn port_count(&self) -> usize {
        if self.rtc_max_port < self.rtc_min_port {
            return 0;
        }
        usize::from(self.rtc_max_port - self.rtc_min_port) + 1
    }

    /// Split the port range into `n` contiguous, disjoint slices.
    ///
    /// Returns `None` if any worker would end up with zero ports.
    #[must_use]
    pub fn port_slices(&self, n: usize) -> Option<Vec<(u16, u16)>> {
        let total = self.port_count();
        if n == 0 || total < n {
            return None;
        }
        let per_worker = total / n;
        let mut slices = Vec::with_capacity(n);
        let mut start = u32::from(self.rtc_min_port);
        for i in 0..n {
            // Last worker absorbs the remainder
            let len = if i + 1 == n {
                u32::from(self.rtc_max_port) - start + 1
            } else {
                per_worker as u32
            };
            let end = start + len - 1;
            slices.push((u16::try_from(start).ok()?, u16::try_from(end).ok()?));
            start = end + 1;
        }
        Some(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_slices_cover_range_without_overlap() {
        let config = PoolConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40010,
            ..Default::default()
        };
        let slices = config.port_slices(3).unwrap();
        assert_eq!(slices, vec![(40000, 40002), (40003, 40005), (40006, 40010)]);
    }

    #[test]
    fn test_port_slices_reject_too_many_workers() {
        let config = PoolConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
            ..Default::default()
        };
        assert!(config.port_slices(3).is_none());
        assert!(config.port_slices(0).is_none());
    }

    #[test]
    fn test_candidate_ip_prefers_announced() {
        let mut config = PoolConfig::default();
        assert_eq!(config.candidate_ip(), config.listen_ip);
        config.announced_ip = Some(IpAddr::from([203, 0, 113, 7]));
        assert_eq!(config.candidate_ip().to_string(), "203.0.113.7");
    }

    #[test]
    fn test_bitrate_envelope_validation() {
        assert!(BitrateEnvelope::default().is_valid());
        let bad = BitrateEnvelope {
            initial: 100,
            min: 200,
            max: 300,
        };
        assert!(!bad.is_valid());
    }
}
