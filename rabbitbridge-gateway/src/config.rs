use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: Server,
    pub gateway: Gateway,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gateway {
    /// Client name used for the reply queue consumer tag
    pub name: String,
    /// Deadline of every RPC call, in seconds
    pub request_timeout_secs: f64,
    pub cors_origins: Vec<String>,
}

impl Gateway {
    /// `request_timeout_secs` as a non-zero duration
    pub fn request_timeout(&self) -> Result<Duration, ConfigError> {
        match Duration::try_from_secs_f64(self.request_timeout_secs) {
            Ok(timeout) if !timeout.is_zero() => Ok(timeout),
            _ => Err(ConfigError::Message(format!(
                "gateway.request_timeout_secs must be a positive number of seconds, got {}",
                self.request_timeout_secs
            ))),
        }
    }
}

impl Settings {
    /// Defaults, then `gateway.toml` when present, then `GATEWAY_*` variables
    /// (`GATEWAY_SERVER__BIND_ADDRESS`, `GATEWAY_GATEWAY__REQUEST_TIMEOUT_SECS`, ...)
    pub fn new() -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::with_name("gateway").required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("gateway.cors_origins")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server.bind_address", "0.0.0.0:3000")?
            .set_default("gateway.name", "api-gateway")?
            .set_default("gateway.request_timeout_secs", 30.0)?
            .set_default("gateway.cors_origins", vec!["*".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize() {
        let settings: Settings = Settings::defaults().unwrap().build().unwrap().try_deserialize().unwrap();
        assert_eq!(settings.server.bind_address, "0.0.0.0:3000");
        assert_eq!(settings.gateway.name, "api-gateway");
        assert_eq!(settings.gateway.request_timeout_secs, 30.0);
        assert_eq!(settings.gateway.cors_origins, vec!["*".to_string()]);
    }

    #[test]
    fn request_timeout_must_be_positive() {
        let mut gateway = Settings::defaults()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<Settings>()
            .unwrap()
            .gateway;
        assert_eq!(gateway.request_timeout().unwrap(), Duration::from_secs(30));

        gateway.request_timeout_secs = 2.5;
        assert_eq!(gateway.request_timeout().unwrap(), Duration::from_millis(2500));

        for invalid in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            gateway.request_timeout_secs = invalid;
            assert!(gateway.request_timeout().is_err(), "{invalid} accepted");
        }
    }
}
