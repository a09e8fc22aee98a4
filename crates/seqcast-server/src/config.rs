// ABOUTME: Configuration loading and validation for the seqcast server.
// ABOUTME: Reads SEQCAST_* environment variables, applies defaults, and rejects inconsistent settings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use seqcast_core::ReplayPolicy;
use seqcast_store::RetentionPolicy;
use thiserror::Error;

use crate::connection::ConnectionSettings;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SEQCAST_BIND is not a valid socket address: {0}")]
    InvalidBind(String),

    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("SEQCAST_AUTH_TOKENS entry {0:?} is not of the form identity:token")]
    InvalidToken(String),

    #[error("SEQCAST_HEARTBEAT_TIMEOUT_MS ({timeout_ms}) must exceed SEQCAST_HEARTBEAT_INTERVAL_MS ({interval_ms})")]
    HeartbeatOrder { interval_ms: u64, timeout_ms: u64 },
}

/// One `identity:token` pair accepted by the static authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub identity: String,
    pub token: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SeqcastConfig {
    pub home: PathBuf,
    pub bind: SocketAddr,
    pub retention: u64,
    pub max_incremental: u64,
    pub queue_capacity: usize,
    pub replay_batch: usize,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub prune_every: u64,
    pub auth_tokens: Vec<TokenGrant>,
    pub snapshot_url: String,
    pub source: PathBuf,
}

impl SeqcastConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - SEQCAST_HOME: data directory (default: ~/.seqcast)
    /// - SEQCAST_BIND: socket address to bind (default: 127.0.0.1:7440)
    /// - SEQCAST_RETENTION: events kept in the log (default: 100000)
    /// - SEQCAST_MAX_INCREMENTAL: largest gap replayed from the log (default: retention)
    /// - SEQCAST_QUEUE_CAPACITY: outbound messages buffered per connection (default: 1024)
    /// - SEQCAST_REPLAY_BATCH: events per replay-batch message (default: 500)
    /// - SEQCAST_AUTH_TIMEOUT_MS (default: 10000)
    /// - SEQCAST_HEARTBEAT_INTERVAL_MS (default: 15000)
    /// - SEQCAST_HEARTBEAT_TIMEOUT_MS (default: 30000)
    /// - SEQCAST_SNAPSHOT_TIMEOUT_MS (default: 5000)
    /// - SEQCAST_PRUNE_EVERY: commits between retention passes (default: 256)
    /// - SEQCAST_AUTH_TOKENS: comma-separated identity:token pairs (required)
    /// - SEQCAST_SNAPSHOT_URL: base URL of the snapshot service (required)
    /// - SEQCAST_SOURCE: JSONL source file (default: $SEQCAST_HOME/source.jsonl)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup. Empty values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let home = var("SEQCAST_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(default_home);

        let bind_str = var("SEQCAST_BIND").unwrap_or_else(|| "127.0.0.1:7440".to_string());
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|_| ConfigError::InvalidBind(bind_str))?;

        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match var(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { var: key, value }),
                None => Ok(default),
            }
        };

        let retention = number("SEQCAST_RETENTION", 100_000)?;
        if retention == 0 {
            return Err(ConfigError::Zero("SEQCAST_RETENTION"));
        }
        let max_incremental = number("SEQCAST_MAX_INCREMENTAL", retention)?;
        let queue_capacity = number("SEQCAST_QUEUE_CAPACITY", 1024)?;
        if queue_capacity == 0 {
            return Err(ConfigError::Zero("SEQCAST_QUEUE_CAPACITY"));
        }
        let replay_batch = number("SEQCAST_REPLAY_BATCH", 500)?;
        if replay_batch == 0 {
            return Err(ConfigError::Zero("SEQCAST_REPLAY_BATCH"));
        }

        let auth_timeout_ms = number("SEQCAST_AUTH_TIMEOUT_MS", 10_000)?;
        let interval_ms = number("SEQCAST_HEARTBEAT_INTERVAL_MS", 15_000)?;
        let timeout_ms = number("SEQCAST_HEARTBEAT_TIMEOUT_MS", 30_000)?;
        if interval_ms == 0 {
            return Err(ConfigError::Zero("SEQCAST_HEARTBEAT_INTERVAL_MS"));
        }
        if timeout_ms <= interval_ms {
            return Err(ConfigError::HeartbeatOrder {
                interval_ms,
                timeout_ms,
            });
        }
        let snapshot_timeout_ms = number("SEQCAST_SNAPSHOT_TIMEOUT_MS", 5_000)?;
        let prune_every = number("SEQCAST_PRUNE_EVERY", 256)?.max(1);

        let auth_tokens = parse_tokens(
            &var("SEQCAST_AUTH_TOKENS").ok_or(ConfigError::Missing("SEQCAST_AUTH_TOKENS"))?,
        )?;
        if auth_tokens.is_empty() {
            return Err(ConfigError::Missing("SEQCAST_AUTH_TOKENS"));
        }
        let snapshot_url = var("SEQCAST_SNAPSHOT_URL")
            .ok_or(ConfigError::Missing("SEQCAST_SNAPSHOT_URL"))?
            .trim_end_matches('/')
            .to_string();

        let source = var("SEQCAST_SOURCE")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("source.jsonl"));

        Ok(Self {
            home,
            bind,
            retention,
            max_incremental,
            queue_capacity: queue_capacity as usize,
            replay_batch: replay_batch as usize,
            auth_timeout: Duration::from_millis(auth_timeout_ms),
            heartbeat_interval: Duration::from_millis(interval_ms),
            heartbeat_timeout: Duration::from_millis(timeout_ms),
            snapshot_timeout: Duration::from_millis(snapshot_timeout_ms),
            prune_every,
            auth_tokens,
            snapshot_url,
            source,
        })
    }

    /// Location of the SQLite event log.
    pub fn log_path(&self) -> PathBuf {
        self.home.join("events.db")
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.retention)
    }

    pub fn replay_policy(&self) -> ReplayPolicy {
        ReplayPolicy::new(self.max_incremental)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            auth_timeout: self.auth_timeout,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            queue_capacity: self.queue_capacity,
            replay_batch: self.replay_batch,
        }
    }
}

/// `$HOME/.seqcast`, falling back to `/tmp/.seqcast` when HOME is unset.
pub fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".seqcast")
}

fn parse_tokens(raw: &str) -> Result<Vec<TokenGrant>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((identity, token)) if !identity.is_empty() && !token.is_empty() => Ok(TokenGrant {
                identity: identity.to_string(),
                token: token.to_string(),
            }),
            _ => Err(ConfigError::InvalidToken(entry.to_string())),
        })
        .collect()
}
