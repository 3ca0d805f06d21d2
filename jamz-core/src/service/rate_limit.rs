use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use jamz_sfu::ParticipantId;
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{BucketConfig, RateLimitConfig};
use crate::metrics;

/// Signaling connections are keyed by the participant id they join with
pub type ConnectionId = ParticipantId;

/// Message classes with independent buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Candidate,
    MusicSync,
    /// Offers and answers
    Negotiation,
}

impl MessageKind {
    pub const ALL: [Self; 3] = [Self::Candidate, Self::MusicSync, Self::Negotiation];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::MusicSync => "music_sync",
            Self::Negotiation => "negotiation",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Candidate => 0,
            Self::MusicSync => 1,
            Self::Negotiation => 2,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limiting error
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {kind}. Next token in {retry_after_ms}ms")]
    Exceeded { kind: MessageKind, retry_after_ms: u64 },

    #[error("Invalid {kind} bucket: {reason}")]
    InvalidQuota { kind: MessageKind, reason: String },
}

/// Rejection counts served on `/debug/metrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionCounts {
    pub candidates: u64,
    pub music_sync: u64,
    pub negotiation: u64,
}

/// Capacity `N` per window: one token every `window / N`, bursts of up to `N`
fn quota_for(kind: MessageKind, bucket: BucketConfig) -> Result<Quota, RateLimitError> {
    let invalid = |reason: &str| RateLimitError::InvalidQuota {
        kind,
        reason: reason.to_string(),
    };
    let capacity = NonZeroU32::new(bucket.capacity).ok_or_else(|| invalid("zero capacity"))?;
    let period = bucket
        .window()
        .checked_div(bucket.capacity)
        .filter(|p| !p.is_zero())
        .unwrap_or(Duration::from_millis(1));
    let quota = Quota::with_period(period)
        .ok_or_else(|| invalid("zero window"))?
        .allow_burst(capacity);
    Ok(quota)
}

type BucketMap = DashMap<(ConnectionId, MessageKind), Arc<DefaultDirectRateLimiter>>;

/// Per-connection, per-kind token buckets backed by `governor` (GCRA).
///
/// Buckets are created on a connection's first message of a kind and dropped
/// by [`RateLimiter::remove_connection`]. Checks are in-memory arithmetic only.
pub struct RateLimiter {
    quotas: [Quota; 3],
    buckets: BucketMap,
    rejections: [AtomicU64; 3],
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.buckets.len())
            .field("rejections", &self.rejections())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        Ok(Self {
            quotas: [
                quota_for(MessageKind::Candidate, config.candidate)?,
                quota_for(MessageKind::MusicSync, config.music_sync)?,
                quota_for(MessageKind::Negotiation, config.negotiation)?,
            ],
            buckets: DashMap::new(),
            rejections: Default::default(),
        })
    }

    fn bucket(&self, connection_id: &ConnectionId, kind: MessageKind) -> Arc<DefaultDirectRateLimiter> {
        if let Some(bucket) = self.buckets.get(&(connection_id.clone(), kind)) {
            return Arc::clone(bucket.value());
        }
        let quota = self.quotas[kind.index()];
        Arc::clone(
            &self
                .buckets
                .entry((connection_id.clone(), kind))
                .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(quota))),
        )
    }

    /// Consume one token, or report when the next one is due
    pub fn check(&self, connection_id: &ConnectionId, kind: MessageKind) -> Result<(), RateLimitError> {
        match self.bucket(connection_id, kind).check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                self.rejections[kind.index()].fetch_add(1, Ordering::Relaxed);
                metrics::signaling::RATE_LIMITED_TOTAL
                    .with_label_values(&[kind.as_str()])
                    .inc();
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Err(RateLimitError::Exceeded {
                    kind,
                    retry_after_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1),
                })
            }
        }
    }

    /// Drop every bucket the connection owns. Returns how many were removed.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> usize {
        MessageKind::ALL
            .iter()
            .filter(|kind| self.buckets.remove(&(connection_id.clone(), **kind)).is_some())
            .count()
    }

    #[must_use]
    pub fn rejections(&self) -> RejectionCounts {
        let load = |kind: MessageKind| self.rejections[kind.index()].load(Ordering::Relaxed);
        RejectionCounts {
            candidates: load(MessageKind::Candidate),
            music_sync: load(MessageKind::MusicSync),
            negotiation: load(MessageKind::Negotiation),
        }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        let fallback = Quota::per_second(nonzero!(10u32));
        Self::new(&RateLimitConfig::default()).unwrap_or_else(|_| Self {
            quotas: [fallback; 3],
            buckets: DashMap::new(),
            rejections: Default::default(),
        })
    }
}
