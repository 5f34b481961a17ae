use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::identity::RetryPolicy;
use crate::locale::Locale;

/// Server settings, read from `RESERVA_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub locale: Locale,
    pub profile_retry: RetryPolicy,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset variables take their defaults;
    /// set but malformed ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let utc_offset: i32 = parse_var(&lookup, "RESERVA_UTC_OFFSET_MINUTES")?.unwrap_or(0);
        let locale = Locale::from_offset_minutes(utc_offset).ok_or_else(|| ConfigError {
            var: "RESERVA_UTC_OFFSET_MINUTES",
            value: utc_offset.to_string(),
        })?;
        let defaults = RetryPolicy::default();

        Ok(Self {
            port: parse_var(&lookup, "RESERVA_PORT")?.unwrap_or(5433),
            bind: lookup("RESERVA_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("RESERVA_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("RESERVA_PASSWORD").unwrap_or_else(|| "reserva".into()),
            max_connections: parse_var(&lookup, "RESERVA_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse_var(&lookup, "RESERVA_COMPACT_THRESHOLD")?.unwrap_or(1000),
            locale,
            profile_retry: RetryPolicy {
                attempts: parse_var(&lookup, "RESERVA_PROFILE_RETRY_ATTEMPTS")?.unwrap_or(defaults.attempts),
                delay: parse_var(&lookup, "RESERVA_PROFILE_RETRY_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.delay),
            },
            tls_cert: lookup("RESERVA_TLS_CERT"),
            tls_key: lookup("RESERVA_TLS_KEY"),
            metrics_port: parse_var(&lookup, "RESERVA_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}
