use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_derive::Deserialize;

pub const DEFAULT_STATUS_PORT: u16 = 8080;
pub const DEFAULT_NAME_FILTER: &str = "Polar Sense";
pub const DEFAULT_SCAN_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_OSC_HOST: &str = "127.0.0.1";
pub const DEFAULT_OSC_PORT: u16 = 8000;
pub const DEFAULT_OSC_ADDRESS: &str = "/polar/hr";

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub osc: OscConfig,
}

/// Inbound presence channel.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct StatusConfig {
    pub port: Option<u16>,
    pub bind_address: Option<IpAddr>,
}

impl StatusConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.bind_address
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port.unwrap_or(DEFAULT_STATUS_PORT),
        )
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SensorConfig {
    /// Substring matched against the advertised local name.
    pub name_filter: Option<String>,
    pub scan_timeout_seconds: Option<u64>,
}

impl SensorConfig {
    pub fn name_filter(&self) -> &str {
        self.name_filter.as_deref().unwrap_or(DEFAULT_NAME_FILTER)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(
            self.scan_timeout_seconds
                .unwrap_or(DEFAULT_SCAN_TIMEOUT_SECONDS),
        )
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct OscConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub address: Option<String>,
}

impl OscConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_OSC_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_OSC_PORT)
    }

    pub fn address(&self) -> String {
        normalize_address(self.address.as_deref().unwrap_or(DEFAULT_OSC_ADDRESS))
    }
}

/// OSC addresses must begin with `/`; surrounding whitespace is dropped.
fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
