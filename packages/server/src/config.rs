// ABOUTME: Listener and flood-guard settings for the HTTP server
// ABOUTME: Read from the environment; gateway limits live in GatewayConfig

use codegate_config::constants as env_vars;
use codegate_config::env::{parse_env_or_default, parse_env_with_fallback};
use std::env;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid host address: {0}")]
    InvalidHost(String),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Flood guard rate must be positive")]
    InvalidRate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Requests per minute allowed from one client address
    pub http_rpm: u32,
    pub http_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            http_rpm: 120,
            http_burst: 20,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = match env::var(env_vars::CODEGATE_HOST) {
            Ok(raw) => raw
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidHost(raw.clone()))?,
            Err(_) => defaults.host,
        };

        let port = parse_env_with_fallback(env_vars::CODEGATE_PORT, env_vars::PORT, defaults.port);
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let http_rpm = parse_env_or_default(env_vars::CODEGATE_HTTP_RPM, defaults.http_rpm);
        let http_burst = parse_env_or_default(env_vars::CODEGATE_HTTP_BURST, defaults.http_burst);
        if http_rpm == 0 || http_burst == 0 {
            return Err(ConfigError::InvalidRate);
        }

        Ok(Self {
            host,
            port,
            http_rpm,
            http_burst,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
