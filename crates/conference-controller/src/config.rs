//! Conference Controller configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; `from_vars` takes a plain map for tests.

use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use thiserror::Error;

/// Default WebSocket/HTTP gateway bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4443";

/// Default IP announced in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default timeout after which an unconnected transport is reclaimed.
pub const DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECS: u64 = 1800;

/// Default interval between reaper sweeps.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;

/// Conference Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway bind address (default: "0.0.0.0:4443").
    pub bind_address: String,

    /// IP announced in ICE candidates (default: loopback).
    pub announced_ip: IpAddr,

    /// Lowest RTC port handed out to transports.
    pub rtc_min_port: u16,

    /// Highest RTC port handed out to transports.
    pub rtc_max_port: u16,

    /// Seconds an unconnected transport may exist before the reaper closes
    /// it (default: 1800).
    pub transport_connect_timeout_secs: u64,

    /// Seconds between reaper sweeps (default: 30).
    pub reaper_interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            announced_ip: DEFAULT_ANNOUNCED_IP
                .parse()
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            transport_connect_timeout_secs: DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECS,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("CC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let announced_ip = match vars.get("CC_ANNOUNCED_IP") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CC_ANNOUNCED_IP", raw.clone()))?,
            None => DEFAULT_ANNOUNCED_IP
                .parse()
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        };

        let rtc_min_port = parse_or(vars, "CC_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_or(vars, "CC_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(
                "CC_RTC_MIN_PORT",
                format!("{rtc_min_port} exceeds CC_RTC_MAX_PORT {rtc_max_port}"),
            ));
        }

        let transport_connect_timeout_secs = parse_or(
            vars,
            "CC_TRANSPORT_CONNECT_TIMEOUT_SECS",
            DEFAULT_TRANSPORT_CONNECT_TIMEOUT_SECS,
        )?;
        let reaper_interval_secs =
            parse_or(vars, "CC_REAPER_INTERVAL_SECS", DEFAULT_REAPER_INTERVAL_SECS)?;

        Ok(Config {
            bind_address,
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            transport_connect_timeout_secs,
            reaper_interval_secs,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, raw.clone())),
        None => Ok(default),
    }
}
