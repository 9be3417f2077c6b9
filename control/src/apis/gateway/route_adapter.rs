//! Adapters from Gateway API objects to the kind-neutral core model
//!
//! HTTPRoute and GRPCRoute share one adapter through [`RouteObject`]; each kind
//! only supplies the walk over its own generated spec types.

use gateway_api::apis::standard::gateways::{Gateway, GatewayListeners, GatewayListenersAllowedRoutesNamespacesFrom};
use gateway_api::apis::experimental::grpcroutes::{
    GRPCRoute, GRPCRouteRulesMatches, GRPCRouteRulesMatchesMethodType,
};
use gateway_api::apis::standard::httproutes::{
    HTTPRoute, HTTPRouteRulesMatches, HTTPRouteRulesMatchesPathType,
};
use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tunnel_common::grant::{GrantFrom, GrantTo};
use tunnel_common::route::{AllowedRoutes, RouteGroupKind};
use tunnel_common::{
    BackendRef, GatewayInfo, ListenerInfo, NamespacePolicy, ParentRef, PathMatch,
    ReferenceGrantInfo, RouteInfo, RouteKey, RouteKind, RouteRule,
};

// The generated parentRef and backendRef types differ per route kind but share
// their field layout.
macro_rules! parent_ref {
    ($r:expr) => {
        ParentRef {
            group: $r.group.clone(),
            kind: $r.kind.clone(),
            namespace: $r.namespace.clone(),
            name: $r.name.clone(),
            section_name: $r.section_name.clone(),
            port: $r.port,
        }
    };
}

macro_rules! backend_ref {
    ($b:expr) => {
        BackendRef {
            group: $b.group.clone(),
            kind: $b.kind.clone(),
            name: $b.name.clone(),
            namespace: $b.namespace.clone(),
            port: $b.port.and_then(|p| u16::try_from(p).ok()),
        }
    };
}

/// A route resource this controller programs
pub trait RouteObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: RouteKind;

    fn hostnames(&self) -> Vec<String>;

    fn parent_refs(&self) -> Vec<ParentRef>;

    fn route_rules(&self) -> Vec<RouteRule>;

    /// `controllerName` of each `status.parents` entry
    fn status_controllers(&self) -> Vec<String>;

    /// Convert to the core route model
    fn to_route_info(&self) -> RouteInfo {
        let mut route = RouteInfo::new(RouteKey::new(
            Self::KIND,
            self.namespace().unwrap_or_default(),
            self.name_any(),
        ));
        route.generation = self.meta().generation;
        route.hostnames = self.hostnames();
        route.parent_refs = self.parent_refs();
        route.rules = self.route_rules();
        route.status_controllers = self.status_controllers();
        route
    }

    /// Whether any parentRef names a Gateway (of any class)
    fn references_gateway(&self) -> bool {
        self.parent_refs().iter().any(ParentRef::is_gateway)
    }

    /// Whether some controller reported status for this route
    fn has_parent_status(&self) -> bool {
        !self.status_controllers().is_empty()
    }
}

/// A match without a path matches every path (`PathPrefix /`)
fn http_path(m: &HTTPRouteRulesMatches) -> PathMatch {
    let Some(path) = &m.path else {
        return PathMatch::Prefix("/".to_string());
    };
    let value = path.value.clone().unwrap_or_else(|| "/".to_string());
    match &path.r#type {
        Some(HTTPRouteRulesMatchesPathType::Exact) => PathMatch::Exact(value),
        Some(HTTPRouteRulesMatchesPathType::RegularExpression) => PathMatch::Regex(value),
        Some(HTTPRouteRulesMatchesPathType::PathPrefix) | None => PathMatch::Prefix(value),
    }
}

fn grpc_method(m: &GRPCRouteRulesMatches) -> PathMatch {
    let Some(method) = &m.method else {
        return PathMatch::GrpcMethod {
            service: None,
            method: None,
        };
    };
    match &method.r#type {
        Some(GRPCRouteRulesMatchesMethodType::RegularExpression) => PathMatch::Regex(format!(
            "^/{}/{}",
            method.service.as_deref().unwrap_or("[^/]+"),
            method.method.as_deref().unwrap_or("[^/]+")
        )),
        Some(GRPCRouteRulesMatchesMethodType::Exact) | None => PathMatch::GrpcMethod {
            service: method.service.clone(),
            method: method.method.clone(),
        },
    }
}

impl RouteObject for HTTPRoute {
    const KIND: RouteKind = RouteKind::Http;

    fn hostnames(&self) -> Vec<String> {
        self.spec.hostnames.clone().unwrap_or_default()
    }

    fn parent_refs(&self) -> Vec<ParentRef> {
        self.spec
            .parent_refs
            .iter()
            .flatten()
            .map(|r| parent_ref!(r))
            .collect()
    }

    fn route_rules(&self) -> Vec<RouteRule> {
        self.spec
            .rules
            .iter()
            .flatten()
            .map(|rule| RouteRule {
                matches: rule.matches.iter().flatten().map(http_path).collect(),
                backend_refs: rule.backend_refs.iter().flatten().map(|b| backend_ref!(b)).collect(),
            })
            .collect()
    }

    fn status_controllers(&self) -> Vec<String> {
        self.status
            .iter()
            .flat_map(|s| s.parents.iter())
            .map(|p| p.controller_name.clone())
            .collect()
    }
}

impl RouteObject for GRPCRoute {
    const KIND: RouteKind = RouteKind::Grpc;

    fn hostnames(&self) -> Vec<String> {
        self.spec.hostnames.clone().unwrap_or_default()
    }

    fn parent_refs(&self) -> Vec<ParentRef> {
        self.spec
            .parent_refs
            .iter()
            .flatten()
            .map(|r| parent_ref!(r))
            .collect()
    }

    fn route_rules(&self) -> Vec<RouteRule> {
        self.spec
            .rules
            .iter()
            .flatten()
            .map(|rule| RouteRule {
                matches: rule.matches.iter().flatten().map(grpc_method).collect(),
                backend_refs: rule.backend_refs.iter().flatten().map(|b| backend_ref!(b)).collect(),
            })
            .collect()
    }

    fn status_controllers(&self) -> Vec<String> {
        self.status
            .iter()
            .flat_map(|s| s.parents.iter())
            .map(|p| p.controller_name.clone())
            .collect()
    }
}

fn listener_info(listener: &GatewayListeners) -> ListenerInfo {
    let allowed = listener.allowed_routes.as_ref();
    let namespaces = match allowed
        .and_then(|a| a.namespaces.as_ref())
        .and_then(|n| n.from.as_ref())
    {
        Some(GatewayListenersAllowedRoutesNamespacesFrom::All) => NamespacePolicy::All,
        Some(GatewayListenersAllowedRoutesNamespacesFrom::Selector) => NamespacePolicy::Selector,
        Some(GatewayListenersAllowedRoutesNamespacesFrom::Same) | None => NamespacePolicy::Same,
    };
    let kinds = allowed.and_then(|a| a.kinds.as_ref()).map(|kinds| {
        kinds
            .iter()
            .map(|k| RouteGroupKind {
                group: k.group.clone(),
                kind: k.kind.clone(),
            })
            .collect()
    });

    ListenerInfo {
        name: listener.name.clone(),
        protocol: listener.protocol.clone(),
        port: listener.port,
        hostname: listener.hostname.clone().filter(|h| !h.is_empty()),
        allowed_routes: AllowedRoutes { namespaces, kinds },
    }
}

/// Convert a Gateway to the core model
pub fn gateway_info(gateway: &Gateway) -> GatewayInfo {
    let mut info = GatewayInfo::new(
        gateway.namespace().unwrap_or_default(),
        gateway.name_any(),
        gateway.spec.gateway_class_name.clone(),
    );
    info.generation = gateway.meta().generation;
    info.listeners = gateway.spec.listeners.iter().map(listener_info).collect();
    info
}

/// Class name of a Gateway, without a full conversion
pub fn gateway_class_of(gateway: &Gateway) -> &str {
    &gateway.spec.gateway_class_name
}

/// Convert a ReferenceGrant to the core model
pub fn grant_info(grant: &ReferenceGrant) -> ReferenceGrantInfo {
    ReferenceGrantInfo {
        namespace: grant.namespace().unwrap_or_default(),
        name: grant.name_any(),
        from: grant
            .spec
            .from
            .iter()
            .map(|f| GrantFrom {
                group: f.group.clone(),
                kind: f.kind.clone(),
                namespace: f.namespace.clone(),
            })
            .collect(),
        to: grant
            .spec
            .to
            .iter()
            .map(|t| GrantTo {
                group: t.group.clone(),
                kind: t.kind.clone(),
                name: t.name.clone().filter(|n| !n.is_empty()),
            })
            .collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_route(spec: serde_json::Value) -> HTTPRoute {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": {"name": "r1", "namespace": "ns", "generation": 3},
            "spec": spec
        }))
        .expect("valid HTTPRoute")
    }

    #[test]
    fn test_http_route_conversion() {
        let route = http_route(json!({
            "parentRefs": [{"name": "gw", "sectionName": "http"}],
            "hostnames": ["app.example.com"],
            "rules": [{
                "matches": [
                    {"path": {"type": "PathPrefix", "value": "/api"}},
                    {"path": {"type": "Exact", "value": "/health"}},
                    {"headers": [{"name": "x-env", "value": "dev"}]}
                ],
                "backendRefs": [{"name": "svc", "port": 8080}]
            }]
        }));

        let info = route.to_route_info();
        assert_eq!(info.key, RouteKey::new(RouteKind::Http, "ns", "r1"));
        assert_eq!(info.generation, Some(3));
        assert_eq!(info.hostnames, vec!["app.example.com".to_string()]);
        assert_eq!(info.parent_refs[0].section_name.as_deref(), Some("http"));
        assert_eq!(
            info.rules[0].matches,
            vec![
                PathMatch::Prefix("/api".to_string()),
                PathMatch::Exact("/health".to_string()),
                PathMatch::Prefix("/".to_string()),
            ]
        );
        assert_eq!(info.rules[0].backend_refs[0], BackendRef::service("svc", 8080));
        assert!(route.references_gateway());
    }

    #[test]
    fn test_grpc_route_conversion() {
        let route: GRPCRoute = serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "GRPCRoute",
            "metadata": {"name": "g1", "namespace": "ns"},
            "spec": {
                "parentRefs": [{"name": "gw"}],
                "rules": [{
                    "matches": [
                        {"method": {"service": "echo.Echo", "method": "Say"}},
                        {"method": {"type": "RegularExpression", "service": "echo\\..*"}}
                    ],
                    "backendRefs": [{"name": "grpc", "namespace": "shared", "port": 9000}]
                }]
            }
        }))
        .expect("valid GRPCRoute");

        let info = route.to_route_info();
        assert_eq!(info.kind(), RouteKind::Grpc);
        assert_eq!(
            info.rules[0].matches,
            vec![
                PathMatch::GrpcMethod {
                    service: Some("echo.Echo".to_string()),
                    method: Some("Say".to_string()),
                },
                PathMatch::Regex("^/echo\\..*/[^/]+".to_string()),
            ]
        );
        assert_eq!(
            info.rules[0].backend_refs[0].namespace.as_deref(),
            Some("shared")
        );
        assert!(info.status_controllers.is_empty());
    }

    #[test]
    fn test_route_without_gateway_parent() {
        let route = http_route(json!({
            "parentRefs": [{"group": "", "kind": "Service", "name": "mesh-svc"}]
        }));
        assert!(!route.references_gateway());
    }

    #[test]
    fn test_status_controllers() {
        let route: HTTPRoute = serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": {"name": "r1", "namespace": "ns"},
            "spec": {},
            "status": {
                "parents": [
                    {
                        "parentRef": {"name": "deleted-gw"},
                        "controllerName": "tunnel.gateway.io/controller",
                        "conditions": []
                    },
                    {
                        "parentRef": {"name": "mesh"},
                        "controllerName": "example.com/mesh",
                        "conditions": []
                    }
                ]
            }
        }))
        .expect("valid HTTPRoute");

        assert!(!route.references_gateway());
        assert!(route.has_parent_status());
        let info = route.to_route_info();
        assert!(info.has_status_from("tunnel.gateway.io/controller"));
        assert!(info.parent_refs.is_empty());
    }

    #[test]
    fn test_gateway_conversion() {
        let gateway: Gateway = serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": {"name": "gw", "namespace": "infra", "generation": 2},
            "spec": {
                "gatewayClassName": "tunnel",
                "listeners": [
                    {"name": "http", "protocol": "HTTP", "port": 80},
                    {
                        "name": "apps",
                        "protocol": "HTTPS",
                        "port": 443,
                        "hostname": "*.example.com",
                        "allowedRoutes": {
                            "namespaces": {"from": "All"},
                            "kinds": [{"kind": "GRPCRoute"}]
                        }
                    }
                ]
            }
        }))
        .expect("valid Gateway");

        let info = gateway_info(&gateway);
        assert_eq!(info.class_name, "tunnel");
        assert_eq!(gateway_class_of(&gateway), "tunnel");
        assert_eq!(info.generation, Some(2));
        assert_eq!(info.listeners[0].allowed_routes.namespaces, NamespacePolicy::Same);
        assert_eq!(info.listeners[1].allowed_routes.namespaces, NamespacePolicy::All);
        assert_eq!(info.listeners[1].hostname.as_deref(), Some("*.example.com"));
        assert_eq!(
            info.listeners[1].allowed_routes.kinds.as_ref().unwrap()[0].kind,
            "GRPCRoute"
        );
    }

    #[test]
    fn test_reference_grant_conversion() {
        let grant: ReferenceGrant = serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1beta1",
            "kind": "ReferenceGrant",
            "metadata": {"name": "allow", "namespace": "backends"},
            "spec": {
                "from": [{"group": "gateway.networking.k8s.io", "kind": "HTTPRoute", "namespace": "apps"}],
                "to": [{"group": "", "kind": "Service"}]
            }
        }))
        .expect("valid ReferenceGrant");

        let info = grant_info(&grant);
        assert_eq!(info.namespace, "backends");
        assert_eq!(info.from[0].namespace, "apps");
        assert_eq!(info.to[0].kind, "Service");
        assert_eq!(info.to[0].name, None);
    }
}
