//! Kind-neutral model of Gateways and routes
//!
//! HTTPRoute and GRPCRoute share one shape here so that binding, authorization and
//! rule building are written once. Adapters in the control plane convert the
//! Kubernetes objects into these types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// API group of all Gateway API resources
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

/// Kind of the parent resource routes attach to
pub const GATEWAY_KIND: &str = "Gateway";

/// Kind of the only backend type this controller resolves
pub const SERVICE_KIND: &str = "Service";

/// Route kinds this controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RouteKind {
    #[serde(rename = "HTTPRoute")]
    Http,
    #[serde(rename = "GRPCRoute")]
    Grpc,
}

impl RouteKind {
    /// All supported kinds, in rule merge order
    pub const ALL: [RouteKind; 2] = [RouteKind::Http, RouteKind::Grpc];

    /// Kubernetes kind name
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Http => "HTTPRoute",
            RouteKind::Grpc => "GRPCRoute",
        }
    }

    /// Parse a Kubernetes kind name (case-sensitive, as in the API)
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "HTTPRoute" => Some(RouteKind::Http),
            "GRPCRoute" => Some(RouteKind::Grpc),
            _ => None,
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a route: (kind, namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub kind: RouteKind,
    pub namespace: String,
    pub name: String,
}

impl RouteKey {
    pub fn new(kind: RouteKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Identity of a Gateway: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewayKey {
    pub namespace: String,
    pub name: String,
}

impl GatewayKey {
    #[inline]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GatewayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A route's reference to its parent Gateway (optionally a single listener)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl ParentRef {
    /// Reference to a Gateway by name in the route's own namespace
    pub fn gateway(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether this reference names a Gateway (group and kind default to Gateway)
    pub fn is_gateway(&self) -> bool {
        let group_ok = self
            .group
            .as_deref()
            .map_or(true, |g| g == GATEWAY_API_GROUP);
        let kind_ok = self.kind.as_deref().map_or(true, |k| k == GATEWAY_KIND);
        group_ok && kind_ok
    }

    /// Gateway this reference resolves to, given the referencing route's namespace
    pub fn gateway_key(&self, route_namespace: &str) -> GatewayKey {
        GatewayKey::new(
            self.namespace.as_deref().unwrap_or(route_namespace),
            self.name.clone(),
        )
    }
}

/// A route rule's reference to a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl BackendRef {
    /// Reference to a Service in the route's namespace
    pub fn service(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    /// Whether this reference targets a core Service (the only supported backend)
    pub fn is_service(&self) -> bool {
        let group_ok = self
            .group
            .as_deref()
            .map_or(true, |g| g.is_empty() || g == "core");
        let kind_ok = self.kind.as_deref().map_or(true, |k| k == SERVICE_KIND);
        group_ok && kind_ok
    }

    /// Namespace of the backend, defaulting to the route's namespace
    pub fn namespace_or<'a>(&'a self, route_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(route_namespace)
    }
}

/// Request matching translated to the remote rule's path regex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathMatch {
    /// HTTP path prefix (element-wise, as in the Gateway API)
    Prefix(String),
    /// HTTP exact path
    Exact(String),
    /// HTTP regular expression, passed through verbatim
    Regex(String),
    /// gRPC service/method; missing parts match any value
    GrpcMethod {
        service: Option<String>,
        method: Option<String>,
    },
}

/// One route rule: how requests match, and where they go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub matches: Vec<PathMatch>,
    pub backend_refs: Vec<BackendRef>,
}

/// Route as seen by the synchronization engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub key: RouteKey,
    /// metadata.generation, echoed as observedGeneration on status
    pub generation: Option<i64>,
    pub hostnames: Vec<String>,
    pub parent_refs: Vec<ParentRef>,
    pub rules: Vec<RouteRule>,
    /// `controllerName` of every current `status.parents` entry
    #[serde(default)]
    pub status_controllers: Vec<String>,
}

impl RouteInfo {
    pub fn new(key: RouteKey) -> Self {
        Self {
            key,
            generation: None,
            hostnames: Vec::new(),
            parent_refs: Vec::new(),
            rules: Vec::new(),
            status_controllers: Vec::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> RouteKind {
        self.key.kind
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Whether `controller_name` wrote any entry of this route's `status.parents`
    pub fn has_status_from(&self, controller_name: &str) -> bool {
        self.status_controllers.iter().any(|c| c == controller_name)
    }
}

/// `allowedRoutes.namespaces.from` of a listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespacePolicy {
    All,
    /// Gateway API default
    #[default]
    Same,
    /// Label selectors are not evaluated; behaves like `Same`
    Selector,
}

/// An entry of `allowedRoutes.kinds`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteGroupKind {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub kind: String,
}

impl RouteGroupKind {
    /// Resolve to a supported route kind, if this entry names one
    pub fn supported_kind(&self) -> Option<RouteKind> {
        let group_ok = self
            .group
            .as_deref()
            .map_or(true, |g| g == GATEWAY_API_GROUP);
        if !group_ok {
            return None;
        }
        RouteKind::from_kind(&self.kind)
    }
}

/// `allowedRoutes` of a listener
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedRoutes {
    pub namespaces: NamespacePolicy,
    /// Explicit kind allow-list; `None` derives kinds from the protocol
    pub kinds: Option<Vec<RouteGroupKind>>,
}

/// A Gateway listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub name: String,
    pub protocol: String,
    pub port: i32,
    pub hostname: Option<String>,
    pub allowed_routes: AllowedRoutes,
}

impl ListenerInfo {
    /// Listener with default allowedRoutes
    pub fn new(name: impl Into<String>, protocol: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            port,
            hostname: None,
            allowed_routes: AllowedRoutes::default(),
        }
    }
}

/// A Gateway of this controller's class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub key: GatewayKey,
    pub class_name: String,
    pub generation: Option<i64>,
    pub listeners: Vec<ListenerInfo>,
}

impl GatewayInfo {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            key: GatewayKey::new(namespace, name),
            class_name: class_name.into(),
            generation: None,
            listeners: Vec::new(),
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_kind_names() {
        assert_eq!(RouteKind::Http.as_str(), "HTTPRoute");
        assert_eq!(RouteKind::from_kind("GRPCRoute"), Some(RouteKind::Grpc));
        assert_eq!(RouteKind::from_kind("TCPRoute"), None);
        assert_eq!(RouteKind::from_kind("httproute"), None);
    }

    #[test]
    fn test_parent_ref_defaults_to_gateway_in_route_namespace() {
        let parent = ParentRef::gateway("gw");
        assert!(parent.is_gateway());
        assert_eq!(parent.gateway_key("apps"), GatewayKey::new("apps", "gw"));

        let other = ParentRef {
            kind: Some("Service".to_string()),
            group: Some(String::new()),
            ..ParentRef::gateway("svc")
        };
        assert!(!other.is_gateway());
    }

    #[test]
    fn test_backend_ref_kind() {
        assert!(BackendRef::service("svc", 80).is_service());

        let core = BackendRef {
            group: Some(String::new()),
            kind: Some("Service".to_string()),
            ..BackendRef::service("svc", 80)
        };
        assert!(core.is_service());

        let bucket = BackendRef {
            group: Some("storage.example.com".to_string()),
            kind: Some("Bucket".to_string()),
            ..BackendRef::service("b", 80)
        };
        assert!(!bucket.is_service());
    }

    #[test]
    fn test_status_ownership() {
        let mut route = RouteInfo::new(RouteKey::new(RouteKind::Http, "apps", "r"));
        assert!(!route.has_status_from("tunnel.gateway.io/controller"));

        route.status_controllers = vec!["example.com/mesh".to_string()];
        assert!(!route.has_status_from("tunnel.gateway.io/controller"));

        route.status_controllers.push("tunnel.gateway.io/controller".to_string());
        assert!(route.has_status_from("tunnel.gateway.io/controller"));
    }
}
