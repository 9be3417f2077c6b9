//! Credential and tunnel identity resolution
//!
//! A GatewayClass points at a cluster-scoped `GatewayClassConfig` through its
//! `parametersRef`; the config names a Secret holding the API token. Resolution
//! walks GatewayClass -> GatewayClassConfig -> Secret and validates the result.
//!
//! ```yaml
//! apiVersion: tunnel.gateway.io/v1alpha1
//! kind: GatewayClassConfig
//! metadata:
//!   name: tunnel
//! spec:
//!   secretRef:
//!     name: tunnel-credentials
//!     namespace: tunnel-system
//!   tunnelId: 6ff42ae2-765d-4adf-8112-31c55c1551ef
//! ```

use crate::apis::gateway::secret_watcher::WatchedSecrets;
use crate::error::ConfigError;
use async_trait::async_trait;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// API group of the configuration CRD
pub const CONFIG_GROUP: &str = "tunnel.gateway.io";

/// Kind of the configuration CRD
pub const CONFIG_KIND: &str = "GatewayClassConfig";

/// Secret keys
pub mod keys {
    pub const API_TOKEN: &str = "api-token";
    pub const ACCOUNT_ID: &str = "account-id";
    pub const TUNNEL_ID: &str = "tunnel-id";
    pub const TUNNEL_TOKEN: &str = "tunnel-token";
}

/// Reference to a Kubernetes Secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Feature toggles applied to generated rules
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// Ask the tunnel to speak HTTP/2 to gRPC origins
    #[serde(default = "default_true")]
    pub grpc_http2_origin: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            grpc_http2_origin: default_true(),
        }
    }
}

/// GatewayClassConfig spec
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tunnel.gateway.io",
    version = "v1alpha1",
    kind = "GatewayClassConfig",
    plural = "gatewayclassconfigs",
    shortname = "gcc",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayClassConfigSpec {
    /// Secret with the API token (and optionally account/tunnel ids)
    pub secret_ref: SecretReference,
    /// Account id; overrides the Secret's `account-id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Tunnel id; overrides the Secret's `tunnel-id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default)]
    pub flags: FeatureFlags,
}

/// Everything a sync pass needs from the configuration
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub api_token: String,
    pub account_id: String,
    pub tunnel_id: String,
    pub tunnel_token: Option<String>,
    pub flags: FeatureFlags,
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("api_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("tunnel_id", &self.tunnel_id)
            .field("tunnel_token", &self.tunnel_token.as_ref().map(|_| "<redacted>"))
            .field("flags", &self.flags)
            .finish()
    }
}

/// Supplies the configuration of a GatewayClass
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, class_name: &str) -> Result<ResolvedConfig, ConfigError>;
}

/// Validate a config and its Secret into a `ResolvedConfig`
pub fn resolve_from_parts(
    config: &GatewayClassConfigSpec,
    secret: &Secret,
) -> Result<ResolvedConfig, ConfigError> {
    let secret_name = format!("{}/{}", config.secret_ref.namespace, config.secret_ref.name);

    let read = |key: &'static str| -> Result<Option<String>, ConfigError> {
        let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) else {
            return Ok(None);
        };
        let value = String::from_utf8(bytes.0.clone()).map_err(|_| {
            ConfigError::InvalidSecretValue {
                secret: secret_name.clone(),
                key,
            }
        })?;
        let value = value.trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    };

    let api_token = read(keys::API_TOKEN)?.ok_or_else(|| ConfigError::MissingSecretKey {
        secret: secret_name.clone(),
        key: keys::API_TOKEN,
    })?;

    let account_id = match config.account_id.clone().filter(|s| !s.is_empty()) {
        Some(id) => id,
        None => read(keys::ACCOUNT_ID)?.ok_or(ConfigError::MissingAccountId)?,
    };

    let tunnel_id = match config.tunnel_id.clone().filter(|s| !s.is_empty()) {
        Some(id) => id,
        None => read(keys::TUNNEL_ID)?.ok_or(ConfigError::MissingTunnelId)?,
    };

    Ok(ResolvedConfig {
        api_token,
        account_id,
        tunnel_id,
        tunnel_token: read(keys::TUNNEL_TOKEN)?,
        flags: config.flags.clone(),
    })
}

/// Resolves configuration from the cluster
pub struct KubeConfigResolver {
    client: Client,
    watched_secrets: Arc<WatchedSecrets>,
}

impl KubeConfigResolver {
    pub fn new(client: Client, watched_secrets: Arc<WatchedSecrets>) -> Self {
        Self {
            client,
            watched_secrets,
        }
    }
}

#[async_trait]
impl ConfigResolver for KubeConfigResolver {
    async fn resolve(&self, class_name: &str) -> Result<ResolvedConfig, ConfigError> {
        let classes: Api<GatewayClass> = Api::all(self.client.clone());
        let class = classes
            .get_opt(class_name)
            .await?
            .ok_or_else(|| ConfigError::GatewayClassNotFound(class_name.to_string()))?;

        let params = class
            .spec
            .parameters_ref
            .as_ref()
            .ok_or_else(|| ConfigError::MissingParametersRef(class_name.to_string()))?;
        if params.group != CONFIG_GROUP || params.kind != CONFIG_KIND {
            return Err(ConfigError::UnsupportedParametersRef {
                group: params.group.clone(),
                kind: params.kind.clone(),
            });
        }

        let configs: Api<GatewayClassConfig> = Api::all(self.client.clone());
        let config = configs
            .get_opt(&params.name)
            .await?
            .ok_or_else(|| ConfigError::ConfigNotFound(params.name.clone()))?;

        let secret_ref = &config.spec.secret_ref;
        // Track before fetching so a Secret created later still triggers a resync
        self.watched_secrets
            .insert(&secret_ref.namespace, &secret_ref.name);

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = secrets
            .get_opt(&secret_ref.name)
            .await?
            .ok_or_else(|| ConfigError::SecretNotFound {
                namespace: secret_ref.namespace.clone(),
                name: secret_ref.name.clone(),
            })?;

        let resolved = resolve_from_parts(&config.spec, &secret)?;
        debug!(
            gateway_class = class_name,
            config = %params.name,
            tunnel_id = %resolved.tunnel_id,
            "Resolved tunnel configuration"
        );
        Ok(resolved)
    }
}
