use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use thiserror::Error;

pub const HOST_VAR: &str = "KIBUTSU_HOST";
pub const PORT_VAR: &str = "KIBUTSU_PORT";
pub const REQUEST_TIMEOUT_VAR: &str = "KIBUTSU_REQUEST_TIMEOUT_SECS";
pub const ENGINE_TIMEOUT_VAR: &str = "KIBUTSU_ENGINE_TIMEOUT_SECS";
pub const CREATE_CONCURRENCY_VAR: &str = "KIBUTSU_CREATE_CONCURRENCY";
pub const STOP_TIMEOUT_VAR: &str = "KIBUTSU_STOP_TIMEOUT_SECS";
pub const CORS_ORIGIN_VAR: &str = "KIBUTSU_CORS_ORIGIN";

pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub request_timeout: Duration,
    pub engine_timeout: Duration,
    pub create_concurrency: usize,
    pub stop_timeout_secs: i64,
    pub cors_origin: HeaderValue,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            engine_timeout: Duration::from_secs(60),
            create_concurrency: 4,
            stop_timeout_secs: 10,
            cors_origin: HeaderValue::from_static(DEFAULT_CORS_ORIGIN),
        }
    }
}

impl ServerConfig {
    /// Reads `KIBUTSU_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from any variable source. Unset variables keep their defaults;
    /// set but malformed ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_var::<u64>(&lookup, var)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        let create_concurrency =
            parse_var::<usize>(&lookup, CREATE_CONCURRENCY_VAR)?.unwrap_or(defaults.create_concurrency);
        if create_concurrency == 0 {
            return Err(invalid(CREATE_CONCURRENCY_VAR, "0", "must be at least 1"));
        }

        let cors_origin = match lookup(CORS_ORIGIN_VAR) {
            Some(value) => HeaderValue::from_str(value.trim())
                .map_err(|e| invalid(CORS_ORIGIN_VAR, &value, e))?,
            None => defaults.cors_origin,
        };

        Ok(Self {
            host: parse_var(&lookup, HOST_VAR)?.unwrap_or(defaults.host),
            port: parse_var(&lookup, PORT_VAR)?.unwrap_or(defaults.port),
            request_timeout: secs(REQUEST_TIMEOUT_VAR, defaults.request_timeout)?,
            engine_timeout: secs(ENGINE_TIMEOUT_VAR, defaults.engine_timeout)?,
            create_concurrency,
            stop_timeout_secs: parse_var(&lookup, STOP_TIMEOUT_VAR)?
                .unwrap_or(defaults.stop_timeout_secs),
            cors_origin,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(var, &value, e)),
        None => Ok(None),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
