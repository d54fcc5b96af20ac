//! Server configuration loaded from environment variables.

use serde::Deserialize;

use crate::http::DEFAULT_BODY_LIMIT;

#[derive(Debug, Clone, Deserialize)]
pub struct PgSettings {
    /// Empty host disables the SQL pool entirely.
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_size: usize,
}

impl PgSettings {
    pub fn enabled(&self) -> bool {
        !self.host.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen host (default 0.0.0.0).
    pub host: String,

    /// Listen port (default 8080).
    pub port: u16,

    /// Edge/level trigger selection: 0 = both level, 1 = connections edge,
    /// 2 = listener edge, 3 = both edge (default).
    pub trig_mode: u8,

    /// Per-connection inactivity deadline in milliseconds; 0 disables
    /// eviction (default 60000).
    pub timeout_ms: u64,

    /// SO_LINGER on the listening socket (default off).
    pub opt_linger: bool,

    /// Static file root (default ./www).
    pub doc_root: String,

    /// Worker thread count; 0 means one per core (default 8).
    pub thread_num: usize,

    /// Request body cap in bytes (default 1 MiB).
    pub body_limit: usize,

    /// File logging on/off; off logs to stdout (default on).
    pub open_log: bool,

    /// Log level when RUST_LOG is unset: trace|debug|info|warn|error.
    pub log_level: String,

    /// Directory for yyyy_mm_dd.log files (default ./log).
    pub log_dir: String,

    /// Async log queue capacity; 0 writes synchronously (default 1024).
    pub log_queue: usize,

    pub pg: PgSettings,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load from environment variables, with .env support.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let thread_num: usize = parse_or("SATIE_THREADS", 8);
        Config {
            host: env_or("SATIE_HOST", "0.0.0.0"),
            port: parse_or("SATIE_PORT", 8080),
            trig_mode: parse_or("SATIE_TRIG_MODE", 3),
            timeout_ms: parse_or("SATIE_TIMEOUT_MS", 60_000),
            opt_linger: parse_or("SATIE_OPT_LINGER", false),
            doc_root: env_or("SATIE_DOC_ROOT", "./www"),
            thread_num: if thread_num == 0 {
                num_cpus::get()
            } else {
                thread_num
            },
            body_limit: parse_or("SATIE_BODY_LIMIT", DEFAULT_BODY_LIMIT),
            open_log: parse_or("SATIE_OPEN_LOG", true),
            log_level: env_or("SATIE_LOG_LEVEL", "info"),
            log_dir: env_or("SATIE_LOG_DIR", "./log"),
            log_queue: parse_or("SATIE_LOG_QUEUE", 1024),
            pg: PgSettings {
                host: env_or("SATIE_PG_HOST", ""),
                port: parse_or("SATIE_PG_PORT", 5432),
                user: env_or("SATIE_PG_USER", "satie"),
                password: env_or("SATIE_PG_PASSWORD", ""),
                database: env_or("SATIE_PG_DATABASE", "satie"),
                pool_size: parse_or("SATIE_PG_POOL", 8),
            },
        }
    }

    pub fn listener_edge_triggered(&self) -> bool {
        self.trig_mode & 0x2 != 0
    }

    pub fn conn_edge_triggered(&self) -> bool {
        self.trig_mode & 0x1 != 0
    }
}
