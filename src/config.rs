use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

#[derive(Parser, Debug, Clone)]
#[command(name = "room_dialogue", about = "Multi-party dialogue room server")]
pub struct ServerConfig {
    #[arg(long, env = "ROOM_DIALOGUE_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(long, env = "ROOM_DIALOGUE_PORT", default_value_t = 2052)]
    pub port: u16,

    /// Directory for room documents. Rooms live only in memory when unset.
    #[arg(long, env = "ROOM_DIALOGUE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Content-generation endpoint. Automated replies are skipped when unset.
    #[arg(long, env = "ROOM_DIALOGUE_GENERATOR_URL")]
    pub generator_url: Option<String>,

    #[arg(long, env = "ROOM_DIALOGUE_HISTORY_WINDOW", default_value_t = DEFAULT_HISTORY_WINDOW)]
    pub history_window: usize,

    #[arg(long, env = "ROOM_DIALOGUE_GENERATION_ATTEMPTS", default_value_t = 3)]
    pub generation_attempts: u32,

    #[arg(long, env = "ROOM_DIALOGUE_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "ROOM_DIALOGUE_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "ROOM_DIALOGUE_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,
}

/// Transport lifecycle settings for [`crate::client::ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    /// Jitter applied to each reconnect delay, as a fraction of it.
    pub randomization: f64,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(5),
            randomization: 0.5,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}
