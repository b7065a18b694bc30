use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

/// Knobs the engine itself needs. Passed to `Engine::new`, never global.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long a hold blocks its interval without being confirmed.
    pub hold_ttl: Duration,
    /// Longest wait for a resource lock before answering `Busy`.
    pub lock_timeout: Duration,
    /// Offset used to turn calendar dates and times of day into instants.
    pub utc_offset: FixedOffset,
    /// How long cancelled and no-show records outlive their interval before
    /// compaction drops them.
    pub retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(600),
            lock_timeout: Duration::from_millis(2000),
            utc_offset: Utc.fix(),
            retention: Duration::from_secs(90 * 86_400),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Process configuration loaded from environment variables.
///
/// | Env Var                         | Default   |
/// |---------------------------------|-----------|
/// | `DESKBOOK_BIND`                 | `0.0.0.0` |
/// | `DESKBOOK_PORT`                 | `7433`    |
/// | `DESKBOOK_DATA_DIR`             | `./data`  |
/// | `DESKBOOK_MAX_CONNECTIONS`      | `256`     |
/// | `DESKBOOK_COMPACT_THRESHOLD`    | `1000`    |
/// | `DESKBOOK_METRICS_PORT`         | unset     |
/// | `DESKBOOK_HOLD_TTL_SECS`        | `600`     |
/// | `DESKBOOK_SWEEP_INTERVAL_SECS`  | `60`      |
/// | `DESKBOOK_LOCK_TIMEOUT_MS`      | `2000`    |
/// | `DESKBOOK_UTC_OFFSET_MINUTES`   | `0`       |
/// | `DESKBOOK_RETENTION_DAYS`       | `90`      |
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &'static str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let offset_minutes: i32 = parse("DESKBOOK_UTC_OFFSET_MINUTES", get("DESKBOOK_UTC_OFFSET_MINUTES", "0"))?;
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| ConfigError {
            key: "DESKBOOK_UTC_OFFSET_MINUTES",
            value: offset_minutes.to_string(),
        })?;

        let hold_ttl_secs: u64 = parse("DESKBOOK_HOLD_TTL_SECS", get("DESKBOOK_HOLD_TTL_SECS", "600"))?;
        if hold_ttl_secs == 0 {
            return Err(ConfigError {
                key: "DESKBOOK_HOLD_TTL_SECS",
                value: "0".into(),
            });
        }

        let sweep_interval_secs: u64 = parse(
            "DESKBOOK_SWEEP_INTERVAL_SECS",
            get("DESKBOOK_SWEEP_INTERVAL_SECS", "60"),
        )?;
        if sweep_interval_secs == 0 {
            return Err(ConfigError {
                key: "DESKBOOK_SWEEP_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        let retention_days: u64 = parse("DESKBOOK_RETENTION_DAYS", get("DESKBOOK_RETENTION_DAYS", "90"))?;
        let retention_secs = retention_days.checked_mul(86_400).ok_or_else(|| ConfigError {
            key: "DESKBOOK_RETENTION_DAYS",
            value: retention_days.to_string(),
        })?;

        let metrics_port = match lookup("DESKBOOK_METRICS_PORT") {
            Some(v) => Some(parse("DESKBOOK_METRICS_PORT", v)?),
            None => None,
        };

        Ok(Self {
            bind: get("DESKBOOK_BIND", "0.0.0.0"),
            port: parse("DESKBOOK_PORT", get("DESKBOOK_PORT", "7433"))?,
            data_dir: PathBuf::from(get("DESKBOOK_DATA_DIR", "./data")),
            max_connections: parse("DESKBOOK_MAX_CONNECTIONS", get("DESKBOOK_MAX_CONNECTIONS", "256"))?,
            compact_threshold: parse("DESKBOOK_COMPACT_THRESHOLD", get("DESKBOOK_COMPACT_THRESHOLD", "1000"))?,
            metrics_port,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            engine: EngineSettings {
                hold_ttl: Duration::from_secs(hold_ttl_secs),
                lock_timeout: Duration::from_millis(parse(
                    "DESKBOOK_LOCK_TIMEOUT_MS",
                    get("DESKBOOK_LOCK_TIMEOUT_MS", "2000"),
                )?),
                utc_offset,
                retention: Duration::from_secs(retention_secs),
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("deskbook.wal")
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { key, value })
}
