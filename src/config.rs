use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Plaza real-time delivery service
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    name = "plaza-realtime",
    version,
    about = "Real-time conversation delivery service for the Plaza marketplace"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PLAZA_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PLAZA_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./plaza-realtime.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PLAZA_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Redis URL of the publish bridge broker
    #[arg(long, env = "PLAZA_REDIS_URL", default_value = "redis://localhost:6379/1")]
    pub redis_url: String,

    /// Base URL of the marketplace API (conversation participant lookups)
    #[arg(long, env = "PLAZA_API_BASE_URL", default_value = "http://localhost:3000")]
    pub api_base_url: String,

    /// Delivery tuning (loaded from [delivery] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub delivery: Option<DeliverySettings>,
}

/// Tunables for the dispatcher, presence tracker and connection actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Milliseconds before an unacknowledged delivery is resent (default: 5000)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Total sends per message before it is dropped (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Milliseconds a disconnect stays invisible to peers, so a quick
    /// reconnect produces no presence flicker (default: 3000)
    #[serde(default = "default_presence_grace_ms")]
    pub presence_grace_ms: u64,

    /// Per-connection outbound buffer, in frames. A client that falls this
    /// far behind is disconnected (default: 256)
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5000,
            max_attempts: 3,
            presence_grace_ms: 3000,
            outbound_buffer: 256,
        }
    }
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_presence_grace_ms() -> u64 {
    3000
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./plaza-realtime.toml".to_string(),
            json_logs: false,
            generate_config: false,
            redis_url: "redis://localhost:6379/1".to_string(),
            api_base_url: "http://localhost:3000".to_string(),
            delivery: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PLAZA_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PLAZA_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Plaza real-time delivery service configuration
# Place this file at ./plaza-realtime.toml or specify with --config <path>
# All settings can be overridden via environment variables (PLAZA_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Redis URL of the publish bridge broker. The marketplace API publishes one
# event per persisted message on the "new_message" channel.
# redis_url = "redis://localhost:6379/1"

# Base URL of the marketplace API, used for read-only conversation
# participant lookups.
# api_base_url = "http://localhost:3000"

# ---- Delivery tuning ----
# [delivery]

# Milliseconds before an unacknowledged delivery is resent
# ack_timeout_ms = 5000

# Total sends per message before the dispatcher drops it (the store stays
# authoritative; this is not data loss)
# max_attempts = 3

# Milliseconds a disconnect stays invisible to peers (reconnect grace window)
# presence_grace_ms = 3000

# Per-connection outbound buffer in frames; overflow disconnects the client
# outbound_buffer = 256
"#
    .to_string()
}
