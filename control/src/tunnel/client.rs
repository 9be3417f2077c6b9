//! Cloudflare tunnel configuration client
//!
//! `GET`/`PUT {base}/accounts/{account}/cfd_tunnel/{tunnel}/configurations`,
//! authenticated with a bearer token. Responses use the v4 envelope
//! `{success, errors, result}`.

use super::{TunnelApi, TunnelConfiguration};
use crate::apis::metrics::record_api_error;
use crate::credentials::ResolvedConfig;
use crate::error::{ApiErrorClass, TunnelApiError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const OP_GET: &str = "get_configuration";
const OP_UPDATE: &str = "update_configuration";

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ConfigurationResult {
    #[serde(default)]
    config: Option<TunnelConfiguration>,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    config: &'a TunnelConfiguration,
}

/// REST client for the tunnel configuration endpoint
#[derive(Debug, Clone)]
pub struct CloudflareTunnelClient {
    client: reqwest::Client,
    base_url: String,
}

impl CloudflareTunnelClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TunnelApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                TunnelApiError::new("build_client", ApiErrorClass::Network, e.to_string())
            })?;

        Ok(Self::with_client(client, base_url))
    }

    /// Create a client with a custom HTTP client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn configurations_url(&self, creds: &ResolvedConfig) -> String {
        format!(
            "{}/accounts/{}/cfd_tunnel/{}/configurations",
            self.base_url, creds.account_id, creds.tunnel_id
        )
    }
}

/// Map a transport failure to an error class
fn classify_transport(operation: &'static str, err: &reqwest::Error) -> TunnelApiError {
    let class = if err.is_timeout() {
        ApiErrorClass::Timeout
    } else if err.is_decode() {
        ApiErrorClass::Decode
    } else {
        ApiErrorClass::Network
    };
    TunnelApiError::new(operation, class, err.to_string())
}

/// Interpret a response body according to its HTTP status
fn decode_envelope<T: DeserializeOwned>(
    operation: &'static str,
    status: u16,
    body: &[u8],
) -> Result<Option<T>, TunnelApiError> {
    let envelope: Result<ApiEnvelope<T>, _> = serde_json::from_slice(body);

    if !(200..300).contains(&status) {
        let message = match &envelope {
            Ok(env) if !env.errors.is_empty() => join_messages(&env.errors),
            _ => format!("HTTP {}", status),
        };
        return Err(
            TunnelApiError::new(operation, ApiErrorClass::from_status(status), message)
                .with_status(status),
        );
    }

    let envelope = envelope.map_err(|e| {
        TunnelApiError::new(operation, ApiErrorClass::Decode, format!("invalid JSON: {}", e))
            .with_status(status)
    })?;

    if !envelope.success {
        return Err(TunnelApiError::new(
            operation,
            ApiErrorClass::Decode,
            format!("request unsuccessful: {}", join_messages(&envelope.errors)),
        )
        .with_status(status));
    }

    Ok(envelope.result)
}

fn join_messages(messages: &[ApiMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.code, m.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn observe<T>(result: Result<T, TunnelApiError>) -> Result<T, TunnelApiError> {
    if let Err(e) = &result {
        record_api_error(e.operation, e.class.as_str());
        warn!(operation = e.operation, class = %e.class, status = ?e.status, "Tunnel API call failed: {}", e.message);
    }
    result
}

#[async_trait]
impl TunnelApi for CloudflareTunnelClient {
    #[instrument(skip(self, creds), fields(tunnel_id = %creds.tunnel_id))]
    async fn get_configuration(
        &self,
        creds: &ResolvedConfig,
    ) -> Result<TunnelConfiguration, TunnelApiError> {
        let url = self.configurations_url(creds);

        let result = async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&creds.api_token)
                .send()
                .await
                .map_err(|e| classify_transport(OP_GET, &e))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| classify_transport(OP_GET, &e))?;

            let result: Option<ConfigurationResult> = decode_envelope(OP_GET, status, &body)?;
            Ok::<_, TunnelApiError>(result.and_then(|r| r.config).unwrap_or_default())
        }
        .await;

        let config = observe(result)?;
        debug!(rules = config.ingress.len(), "Fetched tunnel configuration");
        Ok(config)
    }

    #[instrument(skip(self, creds, config), fields(tunnel_id = %creds.tunnel_id, rules = config.ingress.len()))]
    async fn update_configuration(
        &self,
        creds: &ResolvedConfig,
        config: &TunnelConfiguration,
    ) -> Result<(), TunnelApiError> {
        let url = self.configurations_url(creds);

        let result = async {
            let response = self
                .client
                .put(&url)
                .bearer_auth(&creds.api_token)
                .json(&UpdateRequest { config })
                .send()
                .await
                .map_err(|e| classify_transport(OP_UPDATE, &e))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| classify_transport(OP_UPDATE, &e))?;

            decode_envelope::<serde_json::Value>(OP_UPDATE, status, &body)?;
            Ok::<_, TunnelApiError>(())
        }
        .await;

        observe(result)?;
        debug!("Updated tunnel configuration");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credentials::FeatureFlags;
    use serde_json::json;

    fn creds() -> ResolvedConfig {
        ResolvedConfig {
            api_token: "tok".to_string(),
            account_id: "acc".to_string(),
            tunnel_id: "tun".to_string(),
            tunnel_token: None,
            flags: FeatureFlags::default(),
        }
    }

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_configurations_url() {
        let client = CloudflareTunnelClient::with_client(
            reqwest::Client::new(),
            "https://api.example.com/client/v4/",
        );
        assert_eq!(
            client.configurations_url(&creds()),
            "https://api.example.com/client/v4/accounts/acc/cfd_tunnel/tun/configurations"
        );
    }

    #[test]
    fn test_decode_success() {
        let body = bytes(json!({
            "success": true,
            "errors": [],
            "result": {
                "tunnel_id": "tun",
                "version": 3,
                "config": {
                    "ingress": [{"service": "http_status:404"}]
                }
            }
        }));
        let result: Option<ConfigurationResult> = decode_envelope(OP_GET, 200, &body).unwrap();
        let config = result.and_then(|r| r.config).unwrap();
        assert_eq!(config.ingress.len(), 1);
    }

    #[test]
    fn test_decode_null_config() {
        let body = bytes(json!({"success": true, "errors": [], "result": {"config": null}}));
        let result: Option<ConfigurationResult> = decode_envelope(OP_GET, 200, &body).unwrap();
        assert!(result.and_then(|r| r.config).is_none());
    }

    #[test]
    fn test_decode_http_errors_are_classified() {
        let body = bytes(json!({
            "success": false,
            "errors": [{"code": 10000, "message": "Authentication error"}],
            "result": null
        }));
        let err = decode_envelope::<serde_json::Value>(OP_GET, 403, &body).unwrap_err();
        assert_eq!(err.class, ApiErrorClass::Auth);
        assert_eq!(err.status, Some(403));
        assert!(err.message.contains("Authentication error"));

        let err = decode_envelope::<serde_json::Value>(OP_UPDATE, 429, b"slow down").unwrap_err();
        assert_eq!(err.class, ApiErrorClass::RateLimit);
        assert_eq!(err.message, "HTTP 429");

        let err = decode_envelope::<serde_json::Value>(OP_UPDATE, 502, b"").unwrap_err();
        assert_eq!(err.class, ApiErrorClass::Server);
    }

    #[test]
    fn test_decode_unsuccessful_envelope() {
        let body = bytes(json!({
            "success": false,
            "errors": [{"code": 1, "message": "bad config"}]
        }));
        let err = decode_envelope::<serde_json::Value>(OP_UPDATE, 200, &body).unwrap_err();
        assert_eq!(err.class, ApiErrorClass::Decode);
        assert!(err.message.contains("bad config"));
    }

    #[test]
    fn test_decode_garbage_body() {
        let err = decode_envelope::<serde_json::Value>(OP_GET, 200, b"<html>").unwrap_err();
        assert_eq!(err.class, ApiErrorClass::Decode);
    }

    #[test]
    fn test_update_request_shape() {
        let config = TunnelConfiguration {
            ingress: vec![tunnel_common::IngressRule::catch_all()],
            extra: Default::default(),
        };
        let body = serde_json::to_value(UpdateRequest { config: &config }).unwrap();
        assert_eq!(
            body,
            json!({"config": {"ingress": [{"service": "http_status:404"}]}})
        );
    }
}
