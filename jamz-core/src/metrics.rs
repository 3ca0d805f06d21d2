//! Prometheus metrics
//!
//! Collectors register lazily on first use against [`REGISTRY`], which the
//! HTTP layer renders on `/metrics`.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Signaling path
pub mod signaling {
    use super::{
        register_int_counter_vec_with_registry, register_int_counter_with_registry,
        register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, REGISTRY,
    };

    /// Inbound events by name and outcome (accepted, rejected, dropped, ...)
    pub static EVENTS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "jamz_signaling_events_total",
            "Inbound signaling events by event name and outcome",
            &["event", "outcome"],
            REGISTRY.clone()
        )
        .expect("Failed to register EVENTS_TOTAL")
    });

    pub static RATE_LIMITED_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                "jamz_signaling_rate_limited_total",
                "Signaling events dropped by the rate limiter",
                &["kind"],
                REGISTRY.clone()
            )
            .expect("Failed to register RATE_LIMITED_TOTAL")
        });

    pub static MALFORMED_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "jamz_signaling_malformed_total",
            "Signaling events dropped as malformed",
            REGISTRY.clone()
        )
        .expect("Failed to register MALFORMED_TOTAL")
    });

    pub static ACTIVE_CONNECTIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "jamz_active_connections",
            "Open signaling connections",
            REGISTRY.clone()
        )
        .expect("Failed to register ACTIVE_CONNECTIONS")
    });
}

/// Media worker pool
pub mod media {
    use super::{register_int_gauge_with_registry, IntGauge, REGISTRY};

    pub static WORKERS_ALIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "jamz_media_workers_alive",
            "Media workers currently running",
            REGISTRY.clone()
        )
        .expect("Failed to register WORKERS_ALIVE")
    });

    pub static ROUTERS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "jamz_media_routers_active",
            "Session routers currently open",
            REGISTRY.clone()
        )
        .expect("Failed to register ROUTERS_ACTIVE")
    });

    pub static TRANSPORTS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "jamz_media_transports_active",
            "Participant transports currently open",
            REGISTRY.clone()
        )
        .expect("Failed to register TRANSPORTS_ACTIVE")
    });

    /// Copy pool counters into the gauges
    pub fn record_pool_stats(stats: &jamz_sfu::PoolStats) {
        WORKERS_ALIVE.set(i64::try_from(stats.workers_alive).unwrap_or(i64::MAX));
        ROUTERS_ACTIVE.set(i64::try_from(stats.routers).unwrap_or(i64::MAX));
        TRANSPORTS_ACTIVE.set(i64::try_from(stats.transports).unwrap_or(i64::MAX));
    }
}

/// Count one inbound signaling event
pub fn record_event(event: &str, outcome: &str) {
    signaling::EVENTS_TOTAL
        .with_label_values(&[event, outcome])
        .inc();
}

/// Expose metrics in Prometheus format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}
