use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{EngineSettings, ReservePolicy};
use crate::model::Ms;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both RESERVD_TLS_CERT and RESERVD_TLS_KEY must be set, or neither")]
    TlsPairing,
    #[error("RESERVD_USERS: {0}")]
    Users(String),
}

/// Which `IntervalStore` backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Wal,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wal" => Ok(StoreKind::Wal),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store kind {other:?} (expected wal or memory)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub store: StoreKind,
    /// `(user, password)` pairs accepted at startup.
    pub users: Vec<(String, String)>,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind = lookup("RESERVD_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_or(&lookup, "RESERVD_PORT", 5433u16)?;
        let data_dir = PathBuf::from(lookup("RESERVD_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let store = parse_or(&lookup, "RESERVD_STORE", StoreKind::Wal)?;
        let users = parse_users(&lookup("RESERVD_USERS").unwrap_or_else(|| "reservd:reservd".into()))?;

        let max_connections = parse_or(&lookup, "RESERVD_MAX_CONNECTIONS", 256usize)?;
        if max_connections == 0 {
            return Err(invalid("RESERVD_MAX_CONNECTIONS", "0", "must be positive"));
        }
        let metrics_port = parse_opt::<u16>(&lookup, "RESERVD_METRICS_PORT")?;

        let tls = match (lookup("RESERVD_TLS_CERT"), lookup("RESERVD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPairing),
        };

        let scope_timeout_ms = positive(&lookup, "RESERVD_SCOPE_TIMEOUT_MS", 5000)?;
        let min_duration_ms = positive(&lookup, "RESERVD_MIN_DURATION_MS", 1)?;
        let granularity_ms = match parse_opt::<Ms>(&lookup, "RESERVD_GRANULARITY_MS")? {
            Some(g) if g <= 0 => return Err(invalid("RESERVD_GRANULARITY_MS", &g.to_string(), "must be positive")),
            g => g,
        };
        let reject_past = parse_or(&lookup, "RESERVD_REJECT_PAST", false)?;

        Ok(Config {
            bind,
            port,
            data_dir,
            store,
            users,
            max_connections,
            metrics_port,
            tls,
            engine: EngineSettings {
                policy: ReservePolicy {
                    min_duration_ms,
                    granularity_ms,
                    reject_past,
                },
                scope_timeout: Duration::from_millis(scope_timeout_ms as u64),
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: Ms) -> Result<Ms, ConfigError> {
    let value = parse_or(lookup, var, default)?;
    if value <= 0 {
        return Err(invalid(var, &value.to_string(), "must be positive"));
    }
    Ok(value)
}

/// `alice:secret,bob:hunter2`. Passwords may contain `:`; user names may not.
fn parse_users(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut users = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((user, password)) = entry.split_once(':') else {
            return Err(ConfigError::Users(format!("entry {entry:?} is not user:password")));
        };
        if user.is_empty() || password.is_empty() {
            return Err(ConfigError::Users(format!("entry {entry:?} has an empty user or password")));
        }
        if users.iter().any(|(u, _)| u == user) {
            return Err(ConfigError::Users(format!("user {user:?} listed twice")));
        }
        users.push((user.to_string(), password.to_string()));
    }
    if users.is_empty() {
        return Err(ConfigError::Users("no users configured".into()));
    }
    Ok(users)
}
