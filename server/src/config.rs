//! Signaling service configuration and origin policy

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),
    #[error("at least one allowed origin is required")]
    NoOrigins,
    #[error("max peers must be at least 1")]
    NoCapacity,
}

/// Which `Origin` header values may open a signaling connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Builds the policy from configured values; a lone `*` allows any origin.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, ConfigError> {
        let origins: Vec<String> = values
            .iter()
            .map(|value| value.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .collect();

        if origins.is_empty() {
            return Err(ConfigError::NoOrigins);
        }
        if origins.iter().any(|origin| origin == "*") {
            return Ok(AllowedOrigins::Any);
        }
        Ok(AllowedOrigins::List(origins))
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are accepted.
    pub fn permits(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (AllowedOrigins::Any, _) | (_, None) => true,
            (AllowedOrigins::List(origins), Some(origin)) => {
                let origin = origin.trim_end_matches('/');
                origins.iter().any(|allowed| allowed == origin)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub allowed_origins: AllowedOrigins,
    pub max_peers: usize,
}

impl ServerConfig {
    pub fn new<S: AsRef<str>>(
        host: &str,
        port: u16,
        allowed_origins: &[S],
        max_peers: usize,
    ) -> Result<Self, ConfigError> {
        let address = format!("{}:{}", host, port);
        let bind_addr = address
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidAddress(address))?;

        if max_peers == 0 {
            return Err(ConfigError::NoCapacity);
        }

        Ok(Self {
            bind_addr,
            allowed_origins: AllowedOrigins::parse(allowed_origins)?,
            max_peers,
        })
    }
}
