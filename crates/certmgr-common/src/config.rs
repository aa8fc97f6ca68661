//! ---
//! certmgr_section: "01-core-functionality"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Shared primitives and utilities for the controller runtime."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use uuid::Uuid;

use crate::logging::LogFormat;

fn default_request_topic() -> String {
    "v2c.ssl".to_owned()
}

fn default_response_topic() -> String {
    "c2v.sslResp".to_owned()
}

fn default_config_topic() -> String {
    "c2v.sslVizierConfigResp".to_owned()
}

fn default_bus_capacity() -> usize {
    64
}

fn default_active_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_passthrough_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_installed_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_secret_name() -> String {
    "proxy-tls-certs".to_owned()
}

fn default_service_name() -> String {
    "vizier-proxy-service".to_owned()
}

fn default_namespace() -> String {
    "pl".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

// Unauthenticated; stays on loopback unless configured otherwise.
fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50900))
}

/// Primary configuration object for the certmgr daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity of the cluster this controller provisions certificates for.
    #[serde(default)]
    pub cluster_id: Option<Uuid>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub requester: RequesterConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "CERTMGR_CONFIG";

    /// Load configuration from disk, respecting the `CERTMGR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Load and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the cluster identity, failing when none has been configured.
    pub fn require_cluster_id(&self) -> Result<Uuid> {
        self.cluster_id.ok_or_else(|| {
            anyhow!("cluster_id must be set in the configuration or via CERTMGR_CLUSTER_ID")
        })
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        self.requester.validate()?;
        self.install.validate()?;
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

/// Topic layout and buffering for the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Topic certificate requests are published on.
    #[serde(default = "default_request_topic")]
    pub request_topic: String,
    /// Topic certificate responses arrive on.
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
    /// Topic cluster configuration changes arrive on.
    #[serde(default = "default_config_topic")]
    pub config_topic: String,
    /// Per-subscription delivery buffer.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_topic: default_request_topic(),
            response_topic: default_response_topic(),
            config_topic: default_config_topic(),
            capacity: default_bus_capacity(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, topic) in [
            ("request_topic", &self.request_topic),
            ("response_topic", &self.response_topic),
            ("config_topic", &self.config_topic),
        ] {
            if topic.trim().is_empty() {
                return Err(anyhow!("bus.{} must not be empty", field));
            }
        }
        if self.response_topic == self.config_topic {
            return Err(anyhow!(
                "bus.response_topic and bus.config_topic must differ (both '{}')",
                self.response_topic
            ));
        }
        if self.capacity == 0 {
            return Err(anyhow!("bus.capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// Re-arm cadence of the certificate request loop.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterConfig {
    /// Interval while a certificate is still being requested.
    #[serde(default = "default_active_interval", rename = "active_interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub active_interval: Duration,
    /// Interval while the cluster runs in passthrough mode.
    #[serde(
        default = "default_passthrough_interval",
        rename = "passthrough_interval_secs"
    )]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub passthrough_interval: Duration,
    /// Interval after a certificate was installed successfully.
    #[serde(
        default = "default_installed_interval",
        rename = "installed_interval_secs"
    )]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub installed_interval: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            active_interval: default_active_interval(),
            passthrough_interval: default_passthrough_interval(),
            installed_interval: default_installed_interval(),
        }
    }
}

impl RequesterConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("active_interval_secs", self.active_interval),
            ("passthrough_interval_secs", self.passthrough_interval),
            ("installed_interval_secs", self.installed_interval),
        ] {
            if value.is_zero() {
                return Err(anyhow!("requester.{} must be greater than zero", field));
            }
        }
        Ok(())
    }
}

/// Where certificates are stored and which component is bounced afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Name of the TLS secret holding the serving certificate.
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    /// Service whose instances serve with the certificate.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Namespace the secret and service live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            secret_name: default_secret_name(),
            service_name: default_service_name(),
            namespace: default_namespace(),
        }
    }
}

impl InstallConfig {
    pub fn validate(&self) -> Result<()> {
        if self.secret_name.trim().is_empty() {
            return Err(anyhow!("install.secret_name must not be empty"));
        }
        if self.service_name.trim().is_empty() {
            return Err(anyhow!("install.service_name must not be empty"));
        }
        if self.namespace.trim().is_empty() {
            return Err(anyhow!("install.namespace must not be empty"));
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
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}
