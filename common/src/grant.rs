//! Cross-namespace reference authorization
//!
//! A backend reference that leaves the route's namespace is allowed only when a
//! ReferenceGrant in the *target* namespace says so. There is no implicit trust,
//! and the existence of the referenced object plays no part in the decision.

use crate::route::{BackendRef, RouteInfo, GATEWAY_API_GROUP, SERVICE_KIND};
use serde::{Deserialize, Serialize};

/// `spec.from[]` entry of a ReferenceGrant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

/// `spec.to[]` entry of a ReferenceGrant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTo {
    pub group: String,
    pub kind: String,
    /// Exact object name; `None` grants every object of the kind
    pub name: Option<String>,
}

/// A ReferenceGrant, identified by the namespace it lives in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGrantInfo {
    pub namespace: String,
    pub name: String,
    pub from: Vec<GrantFrom>,
    pub to: Vec<GrantTo>,
}

/// One side of a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

impl<'a> ObjectRef<'a> {
    /// The route as the origin of a reference
    pub fn route(route: &'a RouteInfo) -> Self {
        Self {
            group: GATEWAY_API_GROUP,
            kind: route.kind().as_str(),
            namespace: route.namespace(),
            name: route.name(),
        }
    }

    /// A backend as the target of a reference from `route_namespace`
    pub fn backend(backend: &'a BackendRef, route_namespace: &'a str) -> Self {
        Self {
            group: normalize_core_group(backend.group.as_deref().unwrap_or("")),
            kind: backend.kind.as_deref().unwrap_or(SERVICE_KIND),
            namespace: backend.namespace_or(route_namespace),
            name: &backend.name,
        }
    }
}

/// The core API group is spelled "" in Gateway API objects; "core" is accepted too
fn normalize_core_group(group: &str) -> &str {
    if group == "core" {
        ""
    } else {
        group
    }
}

/// Evaluates references against the ReferenceGrants of one snapshot
#[derive(Debug, Clone, Default)]
pub struct ReferenceAuthorizer {
    grants: Vec<ReferenceGrantInfo>,
}

impl ReferenceAuthorizer {
    pub fn new(grants: Vec<ReferenceGrantInfo>) -> Self {
        Self { grants }
    }

    /// Whether `from` may reference `to`
    pub fn is_allowed(&self, from: &ObjectRef<'_>, to: &ObjectRef<'_>) -> bool {
        if from.namespace == to.namespace {
            return true;
        }

        let from_group = normalize_core_group(from.group);
        let to_group = normalize_core_group(to.group);

        self.grants
            .iter()
            .filter(|grant| grant.namespace == to.namespace)
            .any(|grant| {
                let from_ok = grant.from.iter().any(|f| {
                    normalize_core_group(&f.group) == from_group
                        && f.kind == from.kind
                        && f.namespace == from.namespace
                });
                let to_ok = grant.to.iter().any(|t| {
                    normalize_core_group(&t.group) == to_group
                        && t.kind == to.kind
                        && t.name.as_deref().map_or(true, |n| n == to.name)
                });
                from_ok && to_ok
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{RouteKey, RouteKind};

    fn grant(to_name: Option<&str>) -> ReferenceGrantInfo {
        ReferenceGrantInfo {
            namespace: "backend-ns".to_string(),
            name: "allow-apps".to_string(),
            from: vec![GrantFrom {
                group: GATEWAY_API_GROUP.to_string(),
                kind: "HTTPRoute".to_string(),
                namespace: "apps".to_string(),
            }],
            to: vec![GrantTo {
                group: String::new(),
                kind: "Service".to_string(),
                name: to_name.map(str::to_string),
            }],
        }
    }

    fn route(kind: RouteKind) -> RouteInfo {
        RouteInfo::new(RouteKey::new(kind, "apps", "r1"))
    }

    fn remote(name: &str) -> BackendRef {
        BackendRef {
            namespace: Some("backend-ns".to_string()),
            ..BackendRef::service(name, 8080)
        }
    }

    #[test]
    fn test_same_namespace_needs_no_grant() {
        let authz = ReferenceAuthorizer::default();
        let route = route(RouteKind::Http);
        let backend = BackendRef::service("svc", 80);
        assert!(authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&backend, route.namespace())
        ));
    }

    #[test]
    fn test_cross_namespace_denied_without_grant() {
        let authz = ReferenceAuthorizer::default();
        let route = route(RouteKind::Http);
        let backend = remote("svc");
        assert!(!authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&backend, route.namespace())
        ));
    }

    #[test]
    fn test_grant_allows_matching_reference() {
        let authz = ReferenceAuthorizer::new(vec![grant(None)]);
        let route = route(RouteKind::Http);
        let backend = remote("svc");
        assert!(authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&backend, route.namespace())
        ));
    }

    #[test]
    fn test_grant_name_constraint() {
        let authz = ReferenceAuthorizer::new(vec![grant(Some("only-this"))]);
        let route = route(RouteKind::Http);

        let allowed = remote("only-this");
        let denied = remote("other");
        assert!(authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&allowed, route.namespace())
        ));
        assert!(!authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&denied, route.namespace())
        ));
    }

    #[test]
    fn test_grant_is_kind_specific() {
        // Grant names HTTPRoute; a GRPCRoute from the same namespace is not covered
        let authz = ReferenceAuthorizer::new(vec![grant(None)]);
        let route = route(RouteKind::Grpc);
        let backend = remote("svc");
        assert!(!authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&backend, route.namespace())
        ));
    }

    #[test]
    fn test_grant_must_live_in_target_namespace() {
        let mut misplaced = grant(None);
        misplaced.namespace = "apps".to_string();
        let authz = ReferenceAuthorizer::new(vec![misplaced]);
        let route = route(RouteKind::Http);
        let backend = remote("svc");
        assert!(!authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&backend, route.namespace())
        ));
    }

    #[test]
    fn test_core_group_spellings_are_equivalent() {
        let mut core = grant(None);
        core.to[0].group = "core".to_string();
        let authz = ReferenceAuthorizer::new(vec![core]);
        let route = route(RouteKind::Http);
        let backend = remote("svc");
        assert!(authz.is_allowed(
            &ObjectRef::route(&route),
            &ObjectRef::backend(&backend, route.namespace())
        ));
    }
}
