//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the metering runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::time::ReportZone;

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "Compute_Usage".to_owned()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(10)
}

fn default_subscription() -> String {
    "emon/emonesp/#".to_owned()
}

fn default_power_topic() -> String {
    "emon/emonesp/W".to_owned()
}

fn default_output_prefix() -> PathBuf {
    PathBuf::from("./watts")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

/// Primary configuration object for the metering daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "EMETER_CONFIG";

    /// Load configuration from disk, respecting the `EMETER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Unlike a hard requirement on a file, a missing configuration yields the
    /// defaults: every setting can also be supplied on the command line.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Validate structural invariants that hold regardless of the event source.
    pub fn validate(&self) -> Result<()> {
        self.meter.validate()?;
        self.broker.validate_shape()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection settings for the MQTT broker publishing power readings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_subscription")]
    pub subscription: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_broker_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            subscription: default_subscription(),
        }
    }
}

impl BrokerConfig {
    fn validate_shape(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(anyhow!("broker client_id must not be empty"));
        }
        if self.subscription.trim().is_empty() {
            return Err(anyhow!("broker subscription filter must not be empty"));
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(anyhow!("broker keep_alive must be at least one second"));
        }
        Ok(())
    }

    /// Ensure everything needed to open an authenticated session is present.
    pub fn require_session(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("host", self.host.as_deref()),
            ("username", self.username.as_deref()),
            ("password", self.password.as_deref()),
        ]
        .into_iter()
        .filter(|(_, value)| value.map_or(true, |v| v.trim().is_empty()))
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "broker settings missing: {} (required flags -b broker, -u user, -P password)",
                missing.join(", ")
            ))
        }
    }
}

/// Settings for the integration engine and its report log.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_power_topic")]
    pub power_topic: String,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: PathBuf,
    #[serde(default)]
    #[serde_as(as = "DisplayFromStr")]
    pub timezone: ReportZone,
    /// Trace messages on topics other than the power topic.
    #[serde(default)]
    pub verbose: bool,
    /// Trace every integrated sample.
    #[serde(default)]
    pub debug: bool,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            power_topic: default_power_topic(),
            output_prefix: default_output_prefix(),
            timezone: ReportZone::default(),
            verbose: false,
            debug: false,
        }
    }
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.power_topic.trim().is_empty() {
            return Err(anyhow!("meter power_topic must not be empty"));
        }
        if self.power_topic.contains(['#', '+']) {
            return Err(anyhow!(
                "meter power_topic '{}' must be a concrete topic, not a filter",
                self.power_topic
            ));
        }
        if self.output_prefix.as_os_str().is_empty() {
            return Err(anyhow!("meter output_prefix must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
