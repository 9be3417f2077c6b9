//! Remote tunnel API
//!
//! The tunnel holds a single flat ingress list. A write replaces the whole
//! configuration; there is no partial update.

pub mod client;

pub use client::CloudflareTunnelClient;

use crate::credentials::ResolvedConfig;
use crate::error::TunnelApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tunnel_common::IngressRule;

/// Remote tunnel configuration
///
/// Fields other than `ingress` are carried through unchanged on write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TunnelConfiguration {
    /// Same configuration with a new ingress list
    pub fn with_ingress(&self, ingress: Vec<IngressRule>) -> Self {
        Self {
            ingress,
            extra: self.extra.clone(),
        }
    }
}

/// Operations on the remote tunnel configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelApi: Send + Sync {
    /// Fetch the active configuration
    async fn get_configuration(
        &self,
        creds: &ResolvedConfig,
    ) -> Result<TunnelConfiguration, TunnelApiError>;

    /// Replace the active configuration
    async fn update_configuration(
        &self,
        creds: &ResolvedConfig,
        config: &TunnelConfiguration,
    ) -> Result<(), TunnelApiError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let remote = json!({
            "ingress": [
                {"hostname": "app.example.com", "service": "http://svc.ns.svc.cluster.local:80"},
                {"service": "http_status:404"}
            ],
            "warp-routing": {"enabled": true},
            "originRequest": {"connectTimeout": 10}
        });

        let config: TunnelConfiguration = serde_json::from_value(remote.clone()).unwrap();
        assert_eq!(config.ingress.len(), 2);
        assert!(config.ingress[1].is_catch_all());

        let replaced = config.with_ingress(vec![IngressRule::catch_all()]);
        let out = serde_json::to_value(&replaced).unwrap();
        assert_eq!(out["warp-routing"], json!({"enabled": true}));
        assert_eq!(out["originRequest"], json!({"connectTimeout": 10}));
        assert_eq!(out["ingress"], json!([{"service": "http_status:404"}]));
    }

    #[test]
    fn test_missing_ingress_defaults_to_empty() {
        let config: TunnelConfiguration = serde_json::from_value(json!({})).unwrap();
        assert!(config.ingress.is_empty());
    }
}
