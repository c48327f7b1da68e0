//! Application configuration.
//!
//! Every key is an environment variable of the same name: `LISTEN`, `DIAG`,
//! `API`, `API_TOKEN`, `STORE_PATH`, `BLOCKSTORE_BASEURL`,
//! `API_CONCURRENCY`, `API_ERRORS`, `DISCONNECT_TIMEOUT`, `LOG_LEVEL`.
//! Defaults are compiled in; validation happens at load time so a
//! misconfigured process fails before it binds anything.

use std::{net::SocketAddr, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::upstream::BreakerConfig;

pub const LOG_LEVEL_OFF: u8 = 0;
pub const LOG_LEVEL_INFO: u8 = 1;
pub const LOG_LEVEL_DIAGNOSTICS: u8 = 2;
pub const LOG_LEVEL_TRACE: u8 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Bind address for the JSON-RPC server. A leading `:` means all
    /// interfaces.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Bind address for the Prometheus metrics server; empty disables it.
    #[serde(default)]
    pub diag: String,

    /// Multiaddress (or URL) of the upstream node.
    #[serde(default)]
    pub api: String,

    /// Bearer token for upstream auth; empty sends no Authorization header.
    #[serde(default)]
    pub api_token: String,

    /// Directory for the persistent store; empty disables the local tier.
    #[serde(default)]
    pub store_path: String,

    /// Base URL of the HTTP block host; empty disables the HTTP tier.
    #[serde(default)]
    pub blockstore_baseurl: String,

    /// Breaker concurrency limit.
    #[serde(default = "default_api_concurrency")]
    pub api_concurrency: u32,

    /// Breaker consecutive-error threshold.
    #[serde(default = "default_api_errors")]
    pub api_errors: u32,

    /// Breaker reset timeout in seconds.
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: u64,

    /// 0 off, 1 info, 2 diagnostics, 3 trace.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
}

fn default_listen() -> String {
    ":33111".to_string()
}

fn default_api_concurrency() -> u32 {
    2000
}

fn default_api_errors() -> u32 {
    8
}

fn default_disconnect_timeout() -> u64 {
    30
}

fn default_log_level() -> u8 {
    LOG_LEVEL_INFO
}

impl AppConfig {
    /// Loads the configuration from the environment and validates it.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.api.is_empty() {
            return Err(ConfigError::Message("API is required".to_string()));
        }
        if self.api_concurrency == 0 {
            return Err(ConfigError::Message("API_CONCURRENCY must be positive".to_string()));
        }
        if self.api_errors == 0 {
            return Err(ConfigError::Message("API_ERRORS must be positive".to_string()));
        }
        self.listen_addr()?;
        self.diag_addr()?;
        self.api_endpoint()?;
        Ok(self)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind_addr(&self.listen)
            .ok_or_else(|| ConfigError::Message(format!("invalid LISTEN address {:?}", self.listen)))
    }

    pub fn diag_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.diag.is_empty() {
            return Ok(None);
        }
        parse_bind_addr(&self.diag)
            .map(Some)
            .ok_or_else(|| ConfigError::Message(format!("invalid DIAG address {:?}", self.diag)))
    }

    /// The node's JSON-RPC endpoint derived from `API`.
    pub fn api_endpoint(&self) -> Result<String, ConfigError> {
        if self.api.starts_with("http://") || self.api.starts_with("https://") {
            return Ok(self.api.clone());
        }
        multiaddr_to_endpoint(&self.api)
    }

    #[must_use]
    pub fn api_token(&self) -> Option<String> {
        if self.api_token.is_empty() {
            None
        } else {
            Some(self.api_token.clone())
        }
    }

    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            error_threshold: self.api_errors,
            concurrency: self.api_concurrency,
            reset_timeout: Duration::from_secs(self.disconnect_timeout),
        }
    }

    #[must_use]
    pub fn store_path(&self) -> Option<&str> {
        if self.store_path.is_empty() {
            None
        } else {
            Some(&self.store_path)
        }
    }

    #[must_use]
    pub fn blockstore_baseurl(&self) -> Option<&str> {
        if self.blockstore_baseurl.is_empty() {
            None
        } else {
            Some(&self.blockstore_baseurl)
        }
    }
}

fn parse_bind_addr(s: &str) -> Option<SocketAddr> {
    let normalized =
        if s.starts_with(':') { format!("0.0.0.0{s}") } else { s.to_string() };
    normalized.parse().ok()
}

/// Converts the multiaddress forms the node advertises
/// (`/ip4/127.0.0.1/tcp/1234/http`, `/dns4/node.example/tcp/443/https`, …)
/// into the node's HTTP JSON-RPC endpoint.
pub fn multiaddr_to_endpoint(maddr: &str) -> Result<String, ConfigError> {
    let err = |detail: &str| {
        ConfigError::Message(format!("invalid API multiaddress {maddr:?}: {detail}"))
    };
    let mut parts = maddr.split('/');
    if parts.next() != Some("") {
        return Err(err("must start with /"));
    }

    let host = match (parts.next(), parts.next()) {
        (Some("ip4" | "dns" | "dns4" | "dns6"), Some(host)) if !host.is_empty() => {
            host.to_string()
        }
        (Some("ip6"), Some(host)) if !host.is_empty() => format!("[{host}]"),
        _ => return Err(err("expected /ip4|ip6|dns|dns4|dns6/<host>")),
    };

    let port: u16 = match (parts.next(), parts.next()) {
        (Some("tcp"), Some(port)) => {
            port.parse().map_err(|_| err("port is not a number"))?
        }
        _ => return Err(err("expected /tcp/<port>")),
    };

    let scheme = match parts.next() {
        None | Some("") | Some("http") | Some("ws") => "http",
        Some("https") | Some("wss") => "https",
        Some(other) => return Err(err(&format!("unsupported transport {other:?}"))),
    };

    Ok(format!("{scheme}://{host}:{port}/rpc/v0"))
}
