//! Gateway configuration: UART port, BLE scan tuning, and storage paths,
//! loaded from a TOML file with environment-variable overrides (mirroring
//! how the core's session/codec stack is parameterized by compile-time
//! associated types, generalized here to runtime values since this is a
//! std binary rather than a `no_std` generic stack).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub uart_port: String,
    pub uart_baud: u32,
    pub scan_timeout_secs: u64,
    pub pairing_store_path: PathBuf,
    pub ota_staging_path: PathBuf,
    pub log_filter: String,
    /// Account identifier hashed into the auth-status challenge response
    /// (`MD5(userId ‖ deviceSn)`). Supplied by the web/touchscreen UI's
    /// login flow in a real deployment; defaults to an empty string so a
    /// fresh install can still reach the device's auth-status challenge.
    pub pairing_user_id: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            uart_port: "/dev/ttyUSB0".to_string(),
            uart_baud: 115_200,
            scan_timeout_secs: 10,
            pairing_store_path: PathBuf::from("gateway_pairing.toml"),
            ota_staging_path: PathBuf::from("stm32_update.bin"),
            log_filter: "info".to_string(),
            pairing_user_id: String::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from `path` (if it exists) layered under the
    /// defaults, then applies `GW_`-prefixed environment variable
    /// overrides (e.g. `GW_UART_BAUD=9600`).
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&GatewayConfig::default())?);
        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }
        builder = builder.add_source(config::Environment::with_prefix("GW"));
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let config = GatewayConfig::load(None).unwrap();
        assert_eq!(config.uart_baud, 115_200);
    }
}
