//! Environment-driven configuration.
//!
//! Every knob comes from an `SE_*` environment variable; a small clap CLI
//! in the binary can override the common ones. Anything mandatory that is
//! missing or unparseable is fatal before the listener binds.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::mode::StorageMode;

/// Valid listener port window for storage elements.
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 8010..=8019;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaMode {
    Standalone,
    Replicated,
}

impl std::str::FromStr for ReplicaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(ReplicaMode::Standalone),
            "replicated" => Ok(ReplicaMode::Replicated),
            other => Err(format!("unknown replica mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// How request identities are established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No token required; requests run as an anonymous admin. Development
    /// and test deployments only.
    Open,
    /// Bearer token claims are required on every API call.
    Bearer,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AuthMode::Open),
            "bearer" => Ok(AuthMode::Bearer),
            other => Err(format!("unknown auth mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_id: String,
    pub data_dir: PathBuf,
    pub wal_dir: PathBuf,
    pub mode: StorageMode,
    pub max_file_size: u64,
    pub max_capacity: u64,
    pub gc_interval: Duration,
    pub reconcile_interval: Duration,
    pub replica_mode: ReplicaMode,
    pub index_refresh_interval: Duration,
    pub election_retry_interval: Duration,
    pub shutdown_timeout: Duration,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub jwks_url: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub http_timeout: Duration,
    pub client_timeout: Duration,
    pub jwt_leeway: Duration,
    pub auth_mode: AuthMode,
    /// `host:port` peers should use to reach this node; written to
    /// `.leader.info` when this node wins the election.
    pub advertise_addr: String,
    pub proxy_tls_verify: bool,
}

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_env(name, default_secs)?))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = parse_env("SE_PORT", 8010)?;
        if !PORT_RANGE.contains(&port) {
            return Err(ConfigError::Invalid {
                name: "SE_PORT",
                value: port.to_string(),
                reason: format!(
                    "storage element ports must fall in {}..={}",
                    PORT_RANGE.start(),
                    PORT_RANGE.end()
                ),
            });
        }

        let data_dir = env_var("SE_DATA_DIR")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("SE_DATA_DIR"))?;
        let wal_dir = env_var("SE_WAL_DIR")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("SE_WAL_DIR"))?;

        let advertise_addr =
            env_var("SE_ADVERTISE_ADDR").unwrap_or_else(|| format!("127.0.0.1:{port}"));

        Ok(Config {
            port,
            storage_id: env_var("SE_STORAGE_ID").unwrap_or_else(|| format!("se-{port}")),
            data_dir,
            wal_dir,
            mode: parse_env("SE_MODE", StorageMode::Rw)?,
            max_file_size: parse_env("SE_MAX_FILE_SIZE", 1024 * 1024 * 1024)?,
            max_capacity: parse_env("SE_MAX_CAPACITY", 100 * 1024 * 1024 * 1024)?,
            gc_interval: parse_secs("SE_GC_INTERVAL_SECS", 300)?,
            reconcile_interval: parse_secs("SE_RECONCILE_INTERVAL_SECS", 3600)?,
            replica_mode: parse_env("SE_REPLICA_MODE", ReplicaMode::Standalone)?,
            index_refresh_interval: parse_secs("SE_INDEX_REFRESH_INTERVAL_SECS", 30)?,
            election_retry_interval: parse_secs("SE_ELECTION_RETRY_INTERVAL_SECS", 5)?,
            shutdown_timeout: parse_secs("SE_SHUTDOWN_TIMEOUT_SECS", 30)?,
            tls_cert: env_var("SE_TLS_CERT").map(PathBuf::from),
            tls_key: env_var("SE_TLS_KEY").map(PathBuf::from),
            jwks_url: env_var("SE_JWKS_URL"),
            ca_cert: env_var("SE_CA_CERT").map(PathBuf::from),
            log_level: env_var("SE_LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_format: parse_env("SE_LOG_FORMAT", LogFormat::Text)?,
            http_timeout: parse_secs("SE_HTTP_TIMEOUT_SECS", 60)?,
            client_timeout: parse_secs("SE_CLIENT_TIMEOUT_SECS", 30)?,
            jwt_leeway: parse_secs("SE_JWT_LEEWAY_SECS", 30)?,
            auth_mode: parse_env("SE_AUTH_MODE", AuthMode::Bearer)?,
            advertise_addr,
            proxy_tls_verify: parse_env("SE_PROXY_TLS_VERIFY", true)?,
        })
    }

    /// Scheme the follower proxy uses to reach the leader.
    pub fn proxy_scheme(&self) -> &'static str {
        if self.tls_cert.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Path of the shared `mode.json`, meaningful in replicated mode.
    pub fn mode_file_path(&self) -> PathBuf {
        self.data_dir.join("mode.json")
    }
}
