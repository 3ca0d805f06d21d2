use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use jamz_sfu::{BitrateEnvelope, PoolConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// "development" or "production"
    pub environment: String,
    /// Allow the debug toggle outside development
    pub allow_debug_toggle: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3001,
            environment: "production".to_string(),
            allow_debug_toggle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// ICE relay server handed to clients on join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Media engine settings. Fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub worker_count: usize,
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_tcp: bool,
    pub initial_outgoing_bitrate: u32,
    pub min_outgoing_bitrate: u32,
    pub max_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub worker_death_grace_ms: u64,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            worker_count: pool.worker_count,
            listen_ip: pool.listen_ip.to_string(),
            announced_ip: None,
            rtc_min_port: pool.rtc_min_port,
            rtc_max_port: pool.rtc_max_port,
            enable_udp: pool.enable_udp,
            enable_tcp: pool.enable_tcp,
            prefer_tcp: pool.prefer_tcp,
            initial_outgoing_bitrate: pool.bitrate.initial,
            min_outgoing_bitrate: pool.bitrate.min,
            max_outgoing_bitrate: pool.bitrate.max,
            max_incoming_bitrate: pool.max_incoming_bitrate,
            worker_death_grace_ms: 2000,
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub const fn worker_death_grace(&self) -> Duration {
        Duration::from_millis(self.worker_death_grace_ms)
    }

    /// Build the worker pool settings. Fails on unparseable addresses.
    pub fn to_pool_config(&self) -> Result<PoolConfig, String> {
        let listen_ip: IpAddr = self
            .listen_ip
            .parse()
            .map_err(|e| format!("media.listen_ip '{}': {e}", self.listen_ip))?;
        let announced_ip = match self.announced_ip.as_deref().filter(|s| !s.is_empty()) {
            Some(ip) => Some(
                ip.parse::<IpAddr>()
                    .map_err(|e| format!("media.announced_ip '{ip}': {e}"))?,
            ),
            None => None,
        };

        Ok(PoolConfig {
            worker_count: self.worker_count,
            listen_ip,
            announced_ip,
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_tcp: self.prefer_tcp,
            bitrate: BitrateEnvelope {
                initial: self.initial_outgoing_bitrate,
                min: self.min_outgoing_bitrate,
                max: self.max_outgoing_bitrate,
            },
            max_incoming_bitrate: self.max_incoming_bitrate,
            death_grace_period: self.worker_death_grace(),
            ..PoolConfig::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Initial value of the runtime toggle
    pub enabled: bool,
    /// Characters of a malformed payload kept in logs
    pub payload_preview_len: usize,
    /// Largest accepted WebSocket message in bytes
    pub max_message_size: usize,
    /// Outbound frames queued per connection before it is considered stalled
    pub outbound_buffer: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            payload_preview_len: 200,
            max_message_size: 64 * 1024,
            outbound_buffer: 256,
        }
    }
}

/// One token bucket: `capacity` admissions per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window_ms: u64,
}

impl BucketConfig {
    #[must_use]
    pub const fn new(capacity: u32, window_ms: u64) -> Self {
        Self {
            capacity,
            window_ms,
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub candidate: BucketConfig,
    pub music_sync: BucketConfig,
    /// Offers, answers and media handshake requests
    pub negotiation: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            candidate: BucketConfig::new(50, 5_000),
            music_sync: BucketConfig::new(10, 10_000),
            negotiation: BucketConfig::new(20, 10_000),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // JAMZ__MEDIA__WORKER_COUNT=4 etc.
        builder = builder.add_source(
            Environment::with_prefix("JAMZ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        self.server.environment.eq_ignore_ascii_case("development")
    }

    /// Whether the signaling toggle may be flipped over HTTP
    #[must_use]
    pub fn debug_toggle_allowed(&self) -> bool {
        self.is_development() || self.server.allow_debug_toggle
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        let media = &self.media;
        if media.worker_count == 0 {
            errors.push("media.worker_count must be at least 1".to_string());
        }
        if media.rtc_min_port > media.rtc_max_port {
            errors.push(format!(
                "media.rtc_min_port ({}) exceeds media.rtc_max_port ({})",
                media.rtc_min_port, media.rtc_max_port
            ));
        } else {
            let ports = usize::from(media.rtc_max_port - media.rtc_min_port) + 1;
            if media.worker_count > ports {
                errors.push(format!(
                    "media port range holds {ports} ports, fewer than {} workers",
                    media.worker_count
                ));
            }
        }
        if !media.enable_udp && !media.enable_tcp {
            errors.push("media: at least one of enable_udp/enable_tcp must be set".to_string());
        }
        if !(media.min_outgoing_bitrate <= media.initial_outgoing_bitrate
            && media.initial_outgoing_bitrate <= media.max_outgoing_bitrate)
        {
            errors.push(format!(
                "media bitrate must satisfy min <= initial <= max, got {}/{}/{}",
                media.min_outgoing_bitrate,
                media.initial_outgoing_bitrate,
                media.max_outgoing_bitrate
            ));
        }
        if let Err(e) = media.to_pool_config() {
            errors.push(e);
        }
        for (i, server) in media.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                errors.push(format!("media.ice_servers[{i}] has no urls"));
            }
        }

        if self.signaling.payload_preview_len == 0 {
            errors.push("signaling.payload_preview_len must be non-zero".to_string());
        }
        if self.signaling.max_message_size == 0 {
            errors.push("signaling.max_message_size must be non-zero".to_string());
        }
        if self.signaling.outbound_buffer == 0 {
            errors.push("signaling.outbound_buffer must be non-zero".to_string());
        }

        for (name, bucket) in [
            ("candidate", self.rate_limit.candidate),
            ("music_sync", self.rate_limit.music_sync),
            ("negotiation", self.rate_limit.negotiation),
        ] {
            if bucket.capacity == 0 || bucket.window_ms == 0 {
                errors.push(format!(
                    "rate_limit.{name} needs non-zero capacity and window_ms"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
