use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::hub::{BatchSettings, HubSettings};
use crate::ratelimit::SlidingWindowLimiter;
use crate::ws::ConnectionOptions;

/// Command-line flags. Only flags actually given override lower layers.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "tidings-server", version, about = "Real-time notification delivery server")]
pub struct Cli {
    /// Path to TOML config file
    #[arg(long, env = "TIDINGS_CONFIG", default_value = "./tidings.toml")]
    #[serde(skip)]
    pub config: String,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Enable structured JSON logging
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Id this instance tags its relay publications with
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Redis URL for the cross-instance bus; standalone when unset
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// HS256 secret used to verify access tokens
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Per-connection tuning, loaded from [connection].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Keepalive probes go out at 9/10 of this
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,

    /// How long fan-out waits on a full queue before evicting the connection
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue_size: default_outbound_queue_size(),
            enqueue_timeout_ms: default_enqueue_timeout(),
        }
    }
}

fn default_write_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_max_frame_bytes() -> usize {
    512
}

fn default_outbound_queue_size() -> usize {
    1024
}

fn default_enqueue_timeout() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            ttl_secs: default_dedup_ttl(),
        }
    }
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_dedup_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: default_max_batch_size(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

fn default_max_batch_size() -> usize {
    10
}

fn default_flush_timeout() -> u64 {
    100
}

/// Sliding-window limits, loaded from [rate_limit].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Connection attempts per client IP
    #[serde(default = "default_ip_max")]
    pub ip_max_attempts: usize,
    #[serde(default = "default_window")]
    pub ip_window_secs: u64,

    /// Connection attempts per authenticated user
    #[serde(default = "default_user_max")]
    pub user_max_attempts: usize,
    #[serde(default = "default_window")]
    pub user_window_secs: u64,

    /// Inbound frames per user
    #[serde(default = "default_message_max")]
    pub message_max: usize,
    #[serde(default = "default_message_window")]
    pub message_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_max_attempts: default_ip_max(),
            ip_window_secs: default_window(),
            user_max_attempts: default_user_max(),
            user_window_secs: default_window(),
            message_max: default_message_max(),
            message_window_secs: default_message_window(),
        }
    }
}

fn default_ip_max() -> usize {
    20
}

fn default_user_max() -> usize {
    10
}

fn default_window() -> u64 {
    60
}

fn default_message_max() -> usize {
    30
}

fn default_message_window() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1984,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            instance_id: None,
            redis_url: None,
            jwt_secret: String::new(),
            connection: ConnectionConfig::default(),
            dedup: DedupConfig::default(),
            batcher: BatcherConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Layered sources: built-in defaults < TOML file < env vars (TIDINGS_*) < CLI flags.
    /// Nested env keys use a double underscore, e.g. `TIDINGS_CONNECTION__IDLE_TIMEOUT_SECS`.
    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("TIDINGS_").split("__").ignore(&["config"]))
            .merge(Serialized::defaults(cli))
    }

    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Self::figment(cli).extract()
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let c = &self.connection;
        ConnectionOptions {
            write_timeout: Duration::from_secs(c.write_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(c.idle_timeout_secs.max(1)),
            max_frame_bytes: c.max_frame_bytes,
            queue_size: c.outbound_queue_size.max(1),
            enqueue_timeout: Duration::from_millis(c.enqueue_timeout_ms),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            instance_id: self
                .instance_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            connection: self.connection_options(),
            dedup_capacity: self.dedup.capacity,
            dedup_ttl: Duration::from_secs(self.dedup.ttl_secs),
            batching: self.batcher.enabled.then(|| BatchSettings {
                max_batch_size: self.batcher.max_batch_size,
                flush_timeout: Duration::from_millis(self.batcher.flush_timeout_ms),
            }),
        }
    }

    pub fn ip_limiter(&self) -> SlidingWindowLimiter {
        let r = &self.rate_limit;
        SlidingWindowLimiter::new(r.ip_max_attempts, Duration::from_secs(r.ip_window_secs))
    }

    pub fn user_limiter(&self) -> SlidingWindowLimiter {
        let r = &self.rate_limit;
        SlidingWindowLimiter::new(r.user_max_attempts, Duration::from_secs(r.user_window_secs))
    }

    pub fn message_limiter(&self) -> SlidingWindowLimiter {
        let r = &self.rate_limit;
        SlidingWindowLimiter::new(r.message_max, Duration::from_secs(r.message_window_secs))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Tidings Server Configuration
# Place this file at ./tidings.toml or specify with --config <path>
# All settings can be overridden via environment variables (TIDINGS_PORT,
# TIDINGS_CONNECTION__IDLE_TIMEOUT_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 1984)
# port = 1984

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Id this instance tags relay publications with (default: random per start)
# instance_id = "tidings-1"

# Redis pub/sub for multi-instance deployments. Unset runs standalone.
# redis_url = "redis://127.0.0.1:6379"

# HS256 secret used to verify access tokens (required)
# jwt_secret = ""

# ---- Connections ----
# [connection]
# write_timeout_secs = 10
# idle_timeout_secs = 60       # keepalive probes at 9/10 of this
# max_frame_bytes = 512        # larger inbound frames drop the connection
# outbound_queue_size = 1024
# enqueue_timeout_ms = 100     # wait on a full queue before evicting

# ---- Relay deduplication ----
# [dedup]
# capacity = 10000
# ttl_secs = 300

# ---- Notification batching ----
# [batcher]
# enabled = false
# max_batch_size = 10
# flush_timeout_ms = 100

# ---- Rate limits (sliding window) ----
# [rate_limit]
# ip_max_attempts = 20
# ip_window_secs = 60
# user_max_attempts = 10
# user_window_secs = 60
# message_max = 30
# message_window_secs = 10
"#
    .to_string()
}
