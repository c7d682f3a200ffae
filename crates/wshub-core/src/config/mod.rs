//! Process configuration schemas.
//!
//! Settings are deserialized from TOML files via the `config` crate, with
//! environment variables layered on top. Each sub-module represents a
//! logical configuration section.

pub mod heartbeat;
pub mod logging;
pub mod server;

use serde::{Deserialize, Serialize};

use self::heartbeat::HeartbeatConfig;
use self::logging::LoggingConfig;
use self::server::ListenerConfig;
use crate::error::HubError;

/// Root configuration.
///
/// Top-level deserialization target for the merged configuration
/// (`config/default.toml` + environment overlay + `WSHUB__*` variables).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ListenerConfig,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from TOML files and the environment.
    ///
    /// Merges `config/default.toml` with `config/{env}.toml` and environment
    /// variables prefixed with `WSHUB` (nested keys separated by `__`, e.g.
    /// `WSHUB__HEARTBEAT__INTERVAL_MS=5000`). Missing files are skipped.
    pub fn load(env: &str) -> Result<Self, HubError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("WSHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| HubError::configuration(format!("Failed to build config: {e}")))?;

        config
            .try_deserialize()
            .map_err(|e| HubError::configuration(format!("Failed to deserialize config: {e}")))
    }
}
