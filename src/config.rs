//! Process-wide Mux configuration (SPEC_FULL §4.9, ambient). Grounded on
//! the teacher's `config/mod.rs::GatewayConfig::load/apply_env_overrides/
//! validate`: read a TOML/JSON file if present (selected by extension),
//! fall back to `Default`, apply `MUX_*` environment overrides, then
//! validate. Unlike the teacher, business config (hosts/backends/
//! frontends/...) never lives here — it arrives exclusively through the
//! Mux's mutator API (spec §1 Out of scope: "the configuration store");
//! this type only holds the process-wide defaults spec §4.4/§4.9 name.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::TransportDefaults;
use crate::error::{MuxError, MuxResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Inherited by Backends that don't set their own dial/read timeout
    /// (spec §4.4 "Timeouts default").
    #[serde(default = "default_dial_timeout_secs")]
    pub default_dial_timeout_secs: f64,
    #[serde(default = "default_read_timeout_secs")]
    pub default_read_timeout_secs: f64,
    /// Grace period `Server::shutdown` waits for in-flight requests to
    /// drain before closing (spec §4.2).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,
    /// Admin HTTP surface listen address (SPEC_FULL §4.11).
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    /// Bounded channel capacity between the staple source and the Mux's
    /// consumer task (SPEC_FULL §4.9).
    #[serde(default = "default_staple_channel_capacity")]
    pub staple_channel_capacity: usize,
    /// Interval between metrics-emitter background ticks (spec §5
    /// "short sleep between metric emissions").
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

fn default_dial_timeout_secs() -> f64 { 5.0 }
fn default_read_timeout_secs() -> f64 { 30.0 }
fn default_shutdown_grace_secs() -> f64 { 30.0 }
fn default_admin_listen() -> String { "0.0.0.0:9091".to_string() }
fn default_staple_channel_capacity() -> usize { 1024 }
fn default_metrics_interval_secs() -> u64 { 15 }

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            default_dial_timeout_secs: default_dial_timeout_secs(),
            default_read_timeout_secs: default_read_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            admin_listen: default_admin_listen(),
            staple_channel_capacity: default_staple_channel_capacity(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl MuxConfig {
    /// Load configuration from a file (if it exists) and apply `MUX_*`
    /// environment variable overrides. When the file does not exist,
    /// built-in defaults are used, mirroring the teacher's
    /// zero-configuration local-development fallback.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: MuxConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            MuxConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MUX_DEFAULT_DIAL_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.default_dial_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MUX_DEFAULT_READ_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.default_read_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MUX_SHUTDOWN_GRACE_SECS") {
            if let Ok(n) = v.parse() {
                self.shutdown_grace_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MUX_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
        if let Ok(v) = std::env::var("MUX_STAPLE_CHANNEL_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.staple_channel_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("MUX_METRICS_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.metrics_interval_secs = n;
            }
        }
    }

    fn validate(&self) -> MuxResult<()> {
        if self.default_dial_timeout_secs <= 0.0 {
            return Err(MuxError::invalid_argument("default_dial_timeout_secs must be positive"));
        }
        if self.default_read_timeout_secs <= 0.0 {
            return Err(MuxError::invalid_argument("default_read_timeout_secs must be positive"));
        }
        if self.admin_listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(MuxError::invalid_argument(format!("invalid admin_listen address: {:?}", self.admin_listen)));
        }
        Ok(())
    }

    pub fn transport_defaults(&self) -> TransportDefaults {
        TransportDefaults {
            dial_timeout_secs: self.default_dial_timeout_secs,
            read_timeout_secs: self.default_read_timeout_secs,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(MuxConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_admin_listen_is_invalid_argument() {
        let mut cfg = MuxConfig::default();
        cfg.admin_listen = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let cfg = MuxConfig::load(Path::new("/nonexistent/mux-config-test.toml")).unwrap();
        assert_eq!(cfg.admin_listen, default_admin_listen());
    }
}
