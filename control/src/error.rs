use std::fmt;
use thiserror::Error;
use tunnel_common::LimitExceeded;

/// Errors surfaced by reconcilers
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential and tunnel identity resolution failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("GatewayClass {0} not found")]
    GatewayClassNotFound(String),

    #[error("GatewayClass {0} has no parametersRef")]
    MissingParametersRef(String),

    #[error("parametersRef {group}/{kind} is not supported")]
    UnsupportedParametersRef { group: String, kind: String },

    #[error("GatewayClassConfig {0} not found")]
    ConfigNotFound(String),

    #[error("Secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("Secret {secret} is missing key '{key}'")]
    MissingSecretKey { secret: String, key: &'static str },

    #[error("Secret {secret} key '{key}' is not valid UTF-8")]
    InvalidSecretValue { secret: String, key: &'static str },

    #[error("no account id in GatewayClassConfig or Secret")]
    MissingAccountId,

    #[error("no tunnel id in GatewayClassConfig or Secret")]
    MissingTunnelId,

    #[error("Kubernetes error while resolving configuration: {0}")]
    Kube(#[from] kube::Error),
}

/// Classification of remote API failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorClass {
    /// 401/403
    Auth,
    /// 429
    RateLimit,
    /// 5xx
    Server,
    /// Other 4xx
    Client,
    /// Connection-level failure
    Network,
    Timeout,
    /// Response body not understood, or `success: false` without a status
    Decode,
}

impl ApiErrorClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ApiErrorClass::Auth,
            429 => ApiErrorClass::RateLimit,
            500..=599 => ApiErrorClass::Server,
            _ => ApiErrorClass::Client,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ApiErrorClass::Auth => "auth",
            ApiErrorClass::RateLimit => "rate_limit",
            ApiErrorClass::Server => "server",
            ApiErrorClass::Client => "client",
            ApiErrorClass::Network => "network",
            ApiErrorClass::Timeout => "timeout",
            ApiErrorClass::Decode => "decode",
        }
    }
}

impl fmt::Display for ApiErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to the remote tunnel API
#[derive(Error, Debug, Clone)]
#[error("tunnel API {operation} failed ({class}): {message}")]
pub struct TunnelApiError {
    pub operation: &'static str,
    pub class: ApiErrorClass,
    pub status: Option<u16>,
    pub message: String,
}

impl TunnelApiError {
    pub fn new(operation: &'static str, class: ApiErrorClass, message: impl Into<String>) -> Self {
        Self {
            operation,
            class,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Failure of a whole sync pass
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] TunnelApiError),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiErrorClass::from_status(401), ApiErrorClass::Auth);
        assert_eq!(ApiErrorClass::from_status(403), ApiErrorClass::Auth);
        assert_eq!(ApiErrorClass::from_status(429), ApiErrorClass::RateLimit);
        assert_eq!(ApiErrorClass::from_status(503), ApiErrorClass::Server);
        assert_eq!(ApiErrorClass::from_status(404), ApiErrorClass::Client);
    }

    #[test]
    fn test_error_messages() {
        let err = TunnelApiError::new("update_configuration", ApiErrorClass::Server, "bad gateway")
            .with_status(502);
        assert_eq!(
            err.to_string(),
            "tunnel API update_configuration failed (server): bad gateway"
        );

        let err: SyncError = ConfigError::MissingSecretKey {
            secret: "ns/creds".to_string(),
            key: "api-token",
        }
        .into();
        assert_eq!(err.to_string(), "Secret ns/creds is missing key 'api-token'");
    }
}
