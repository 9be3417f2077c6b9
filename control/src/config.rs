//! Configuration for the tunnel gateway controller
//!
//! Every setting has a default and can be overridden through a `TUNNEL_*`
//! environment variable.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ControllerError;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Controller name (GatewayClass `spec.controllerName`)
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// GatewayClass whose Gateways this controller programs
    #[serde(default = "default_gateway_class_name")]
    pub gateway_class_name: String,

    /// DNS suffix used in backend service URLs
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    /// Remote tunnel API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Sync loop timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Address of the metrics and health endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Bounded retries for conflicting status writes
    #[serde(default = "default_status_retries")]
    pub status_retries: u32,
}

/// Remote tunnel API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Base URL, without trailing slash
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds (default: 30s)
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout(),
        }
    }
}

/// Sync loop timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Deferral applied to triggers before the startup sync completes (default: 500ms)
    #[serde(default = "default_startup_backoff")]
    pub startup_backoff_ms: u64,

    /// Fixed delay before retrying a failed pass (default: 30s)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Periodic full resync (default: 300s)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

fn default_startup_backoff() -> u64 {
    500
}

fn default_retry_delay() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    300
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_backoff_ms: default_startup_backoff(),
            retry_delay_secs: default_retry_delay(),
            resync_interval_secs: default_resync_interval(),
        }
    }
}

impl TimingConfig {
    pub fn startup_backoff(&self) -> Duration {
        Duration::from_millis(self.startup_backoff_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

fn default_controller_name() -> String {
    tunnel_common::plan::DEFAULT_CONTROLLER_NAME.to_string()
}

fn default_gateway_class_name() -> String {
    "tunnel".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_status_retries() -> u32 {
    5
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            gateway_class_name: default_gateway_class_name(),
            cluster_domain: default_cluster_domain(),
            api: ApiConfig::default(),
            timing: TimingConfig::default(),
            metrics_addr: default_metrics_addr(),
            status_retries: default_status_retries(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("TUNNEL_CONTROLLER_NAME") {
            config.controller_name = val;
        }
        if let Some(val) = lookup("TUNNEL_GATEWAY_CLASS") {
            config.gateway_class_name = val;
        }
        if let Some(val) = lookup("TUNNEL_CLUSTER_DOMAIN") {
            config.cluster_domain = val;
        }
        if let Some(val) = lookup("TUNNEL_API_BASE_URL") {
            config.api.base_url = val.trim_end_matches('/').to_string();
        }
        if let Some(val) = lookup("TUNNEL_API_TIMEOUT_SECS") {
            config.api.timeout_secs = parse("TUNNEL_API_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = lookup("TUNNEL_STARTUP_BACKOFF_MS") {
            config.timing.startup_backoff_ms = parse("TUNNEL_STARTUP_BACKOFF_MS", &val)?;
        }
        if let Some(val) = lookup("TUNNEL_RETRY_DELAY_SECS") {
            config.timing.retry_delay_secs = parse("TUNNEL_RETRY_DELAY_SECS", &val)?;
        }
        if let Some(val) = lookup("TUNNEL_RESYNC_INTERVAL_SECS") {
            config.timing.resync_interval_secs = parse("TUNNEL_RESYNC_INTERVAL_SECS", &val)?;
        }
        if let Some(val) = lookup("TUNNEL_METRICS_ADDR") {
            config.metrics_addr = parse("TUNNEL_METRICS_ADDR", &val)?;
        }
        if let Some(val) = lookup("TUNNEL_STATUS_RETRIES") {
            config.status_retries = parse("TUNNEL_STATUS_RETRIES", &val)?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ControllerError::Config(format!("Invalid {} '{}': {}", key, value, e)))
}
