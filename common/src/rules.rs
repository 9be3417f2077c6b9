//! Rule Builder
//!
//! Converts accepted routes into the flat, ordered ingress rule list of the
//! remote tunnel. The remote side evaluates rules first-match, so the list is
//! ordered most-specific first and always terminated by exactly one catch-all.

use crate::grant::{ObjectRef, ReferenceAuthorizer};
use crate::hostname::is_wildcard;
use crate::route::{BackendRef, PathMatch, RouteInfo, RouteKey, RouteKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Service of the terminal rule: reject everything no other rule matched
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// Port used when a backendRef omits one
pub const DEFAULT_BACKEND_PORT: u16 = 80;

/// Per-rule origin settings understood by the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_origin: Option<bool>,
}

impl OriginRequest {
    pub fn is_empty(&self) -> bool {
        self.http2_origin.is_none()
    }
}

/// One entry of the tunnel's ingress list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,
}

impl IngressRule {
    pub fn new(hostname: Option<String>, path: Option<String>, service: impl Into<String>) -> Self {
        Self {
            hostname,
            path,
            service: service.into(),
            origin_request: None,
        }
    }

    /// The terminal reject-everything rule
    pub fn catch_all() -> Self {
        Self::new(None, None, CATCH_ALL_SERVICE)
    }

    pub fn is_catch_all(&self) -> bool {
        self.matches_everything() && self.service == CATCH_ALL_SERVICE
    }

    /// No hostname and no path: the rule matches every request
    pub fn matches_everything(&self) -> bool {
        self.hostname.is_none() && self.path.is_none()
    }

    /// Drop an empty `originRequest` so remote and desired rules compare equal
    pub fn normalized(mut self) -> Self {
        if self.origin_request.as_ref().is_some_and(OriginRequest::is_empty) {
            self.origin_request = None;
        }
        self
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.hostname.as_deref().unwrap_or("*"),
            self.path.as_deref().unwrap_or(""),
            self.service
        )
    }
}

/// Why a backendRef produced no rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendRefReason {
    /// Cross-namespace reference without a matching ReferenceGrant
    RefNotPermitted,
    /// Backend is not a core Service
    InvalidKind,
}

impl BackendRefReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BackendRefReason::RefNotPermitted => "RefNotPermitted",
            BackendRefReason::InvalidKind => "InvalidKind",
        }
    }
}

impl fmt::Display for BackendRefReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected backend reference, reported on the owning route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRefError {
    pub route: RouteKey,
    /// `namespace/name` of the backend
    pub backend: String,
    pub reason: BackendRefReason,
    pub message: String,
}

/// An accepted route together with the hostnames it is served on
///
/// `hostnames` holds the effective hostnames (route ∩ bound listeners); `None`
/// means the rule carries no hostname.
#[derive(Debug, Clone)]
pub struct BoundRoute<'a> {
    pub route: &'a RouteInfo,
    pub hostnames: Vec<Option<String>>,
}

/// Result of building rules for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Ordered rules, catch-all last
    pub rules: Vec<IngressRule>,
    pub failed_refs: Vec<BackendRefError>,
}

impl BuildOutput {
    /// Failures recorded against one route
    pub fn failures_for<'a>(&'a self, route: &'a RouteKey) -> impl Iterator<Item = &'a BackendRefError> {
        self.failed_refs.iter().filter(move |e| &e.route == route)
    }
}

/// Builds the ordered ingress rule list
pub struct RuleBuilder<'a> {
    authorizer: &'a ReferenceAuthorizer,
    cluster_domain: &'a str,
    grpc_http2_origin: bool,
}

impl<'a> RuleBuilder<'a> {
    pub fn new(authorizer: &'a ReferenceAuthorizer, cluster_domain: &'a str) -> Self {
        Self {
            authorizer,
            cluster_domain,
            grpc_http2_origin: true,
        }
    }

    /// Whether gRPC rules ask the tunnel to speak HTTP/2 to the origin
    pub fn grpc_http2_origin(mut self, enabled: bool) -> Self {
        self.grpc_http2_origin = enabled;
        self
    }

    /// Cluster-internal URL of a Service backend
    pub fn service_url(&self, name: &str, namespace: &str, port: u16) -> String {
        format!(
            "http://{}.{}.svc.{}:{}",
            name, namespace, self.cluster_domain, port
        )
    }

    /// Build rules for all accepted routes
    ///
    /// HTTPRoutes are emitted before GRPCRoutes; within a kind, routes appear in
    /// input order. The merged list is then sorted and terminated.
    pub fn build(&self, routes: &[BoundRoute<'_>]) -> BuildOutput {
        let mut output = BuildOutput::default();
        let mut rules = Vec::new();

        for kind in RouteKind::ALL {
            for bound in routes.iter().filter(|b| b.route.kind() == kind) {
                self.build_route(bound, &mut rules, &mut output.failed_refs);
            }
        }

        output.rules = finalize(rules);
        output
    }

    fn build_route(
        &self,
        bound: &BoundRoute<'_>,
        rules: &mut Vec<IngressRule>,
        failed: &mut Vec<BackendRefError>,
    ) {
        let route = bound.route;
        let origin = ObjectRef::route(route);

        for rule in &route.rules {
            let mut target: Option<&BackendRef> = None;

            for backend in &rule.backend_refs {
                let namespace = backend.namespace_or(route.namespace());

                if !backend.is_service() {
                    failed.push(BackendRefError {
                        route: route.key.clone(),
                        backend: format!("{}/{}", namespace, backend.name),
                        reason: BackendRefReason::InvalidKind,
                        message: format!(
                            "Backend kind {} is not supported",
                            backend.kind.as_deref().unwrap_or("Service")
                        ),
                    });
                    continue;
                }

                if !self
                    .authorizer
                    .is_allowed(&origin, &ObjectRef::backend(backend, route.namespace()))
                {
                    failed.push(BackendRefError {
                        route: route.key.clone(),
                        backend: format!("{}/{}", namespace, backend.name),
                        reason: BackendRefReason::RefNotPermitted,
                        message: format!(
                            "Reference to Service {}/{} not permitted by any ReferenceGrant",
                            namespace, backend.name
                        ),
                    });
                    continue;
                }

                // Weighted splitting is delegated to the tunnel; first permitted backend wins
                if target.is_none() {
                    target = Some(backend);
                }
            }

            let Some(backend) = target else {
                continue;
            };

            let service = self.service_url(
                &backend.name,
                backend.namespace_or(route.namespace()),
                backend.port.unwrap_or(DEFAULT_BACKEND_PORT),
            );
            let origin_request = (route.kind() == RouteKind::Grpc && self.grpc_http2_origin)
                .then(|| OriginRequest {
                    http2_origin: Some(true),
                });

            let paths: Vec<Option<String>> = if rule.matches.is_empty() {
                vec![None]
            } else {
                rule.matches.iter().map(path_regex).collect()
            };

            for hostname in &bound.hostnames {
                for path in &paths {
                    rules.push(IngressRule {
                        hostname: hostname.clone(),
                        path: path.clone(),
                        service: service.clone(),
                        origin_request: origin_request.clone(),
                    });
                }
            }
        }
    }
}

/// Translate a route match into the tunnel's path regex
///
/// `None` means "any path".
pub fn path_regex(path: &PathMatch) -> Option<String> {
    match path {
        PathMatch::Prefix(prefix) => {
            let trimmed = prefix.trim_end_matches('/');
            if trimmed.is_empty() {
                None
            } else {
                Some(format!("^{}(/.*)?$", regex::escape(trimmed)))
            }
        }
        PathMatch::Exact(exact) => Some(format!("^{}$", regex::escape(exact))),
        PathMatch::Regex(expr) => Some(expr.clone()),
        PathMatch::GrpcMethod { service, method } => {
            if service.is_none() && method.is_none() {
                return None;
            }
            let service = service
                .as_deref()
                .map_or_else(|| "[^/]+".to_string(), regex::escape);
            let method = method
                .as_deref()
                .map_or_else(|| "[^/]+".to_string(), regex::escape);
            Some(format!("^/{}/{}", service, method))
        }
    }
}

fn hostname_rank(hostname: Option<&str>) -> u8 {
    match hostname {
        Some(h) if !is_wildcard(h) => 0,
        Some(_) => 1,
        None => 2,
    }
}

/// Sort, de-duplicate and terminate a rule list
///
/// Ordering: exact hostnames, then wildcards, then hostless rules; hostnames
/// ascending; longer paths first. The sort is stable so equal keys keep build
/// order, and the first rule for a (hostname, path) pair wins.
///
/// Only the terminal catch-all may match every request. Any other rule without
/// hostname and path would make it unreachable, and the tunnel rejects such a
/// list, so those rules are dropped.
pub fn finalize(rules: Vec<IngressRule>) -> Vec<IngressRule> {
    let mut rules: Vec<IngressRule> = rules
        .into_iter()
        .filter(|r| {
            if r.matches_everything() && !r.is_catch_all() {
                warn!(service = %r.service, "Dropping rule that would shadow the catch-all");
                return false;
            }
            !r.is_catch_all()
        })
        .collect();

    rules.sort_by(|a, b| {
        hostname_rank(a.hostname.as_deref())
            .cmp(&hostname_rank(b.hostname.as_deref()))
            .then_with(|| a.hostname.cmp(&b.hostname))
            .then_with(|| {
                let a_len = a.path.as_deref().map_or(0, str::len);
                let b_len = b.path.as_deref().map_or(0, str::len);
                b_len.cmp(&a_len)
            })
    });

    let mut seen: HashSet<(Option<String>, Option<String>)> = HashSet::new();
    rules.retain(|r| seen.insert((r.hostname.clone(), r.path.clone())));

    rules.push(IngressRule::catch_all());
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::{GrantFrom, GrantTo, ReferenceGrantInfo};
    use crate::route::{RouteRule, GATEWAY_API_GROUP};

    fn http_route(name: &str, rules: Vec<RouteRule>) -> RouteInfo {
        let mut route = RouteInfo::new(RouteKey::new(RouteKind::Http, "ns", name));
        route.rules = rules;
        route
    }

    fn rule(matches: Vec<PathMatch>, backends: Vec<BackendRef>) -> RouteRule {
        RouteRule {
            matches,
            backend_refs: backends,
        }
    }

    fn host(h: &str) -> Vec<Option<String>> {
        vec![Some(h.to_string())]
    }

    #[test]
    fn test_single_route_rule() {
        let authz = ReferenceAuthorizer::default();
        let route = http_route("r1", vec![rule(vec![], vec![BackendRef::service("svc", 80)])]);

        let out = RuleBuilder::new(&authz, "cluster.local").build(&[BoundRoute {
            route: &route,
            hostnames: host("app.example.com"),
        }]);

        assert_eq!(
            out.rules,
            vec![
                IngressRule::new(
                    Some("app.example.com".to_string()),
                    None,
                    "http://svc.ns.svc.cluster.local:80"
                ),
                IngressRule::catch_all(),
            ]
        );
        assert!(out.failed_refs.is_empty());
    }

    #[test]
    fn test_empty_input_yields_only_catch_all() {
        let authz = ReferenceAuthorizer::default();
        let out = RuleBuilder::new(&authz, "cluster.local").build(&[]);
        assert_eq!(out.rules, vec![IngressRule::catch_all()]);
    }

    #[test]
    fn test_path_translation() {
        assert_eq!(path_regex(&PathMatch::Prefix("/".to_string())), None);
        assert_eq!(
            path_regex(&PathMatch::Prefix("/api".to_string())).as_deref(),
            Some("^/api(/.*)?$")
        );
        assert_eq!(
            path_regex(&PathMatch::Prefix("/api/".to_string())).as_deref(),
            Some("^/api(/.*)?$")
        );
        assert_eq!(
            path_regex(&PathMatch::Exact("/v1.0/health".to_string())).as_deref(),
            Some(r"^/v1\.0/health$")
        );
        assert_eq!(
            path_regex(&PathMatch::Regex("^/img/.*\\.png$".to_string())).as_deref(),
            Some("^/img/.*\\.png$")
        );
        assert_eq!(
            path_regex(&PathMatch::GrpcMethod {
                service: Some("pkg.Echo".to_string()),
                method: None,
            })
            .as_deref(),
            Some(r"^/pkg\.Echo/[^/]+")
        );
        assert_eq!(
            path_regex(&PathMatch::GrpcMethod {
                service: None,
                method: None,
            }),
            None
        );
    }

    #[test]
    fn test_ordering_is_most_specific_first() {
        let rules = vec![
            IngressRule::new(None, Some("^/x$".to_string()), "a"),
            IngressRule::new(Some("*.example.com".to_string()), None, "b"),
            IngressRule::new(Some("b.example.com".to_string()), None, "c"),
            IngressRule::new(Some("a.example.com".to_string()), None, "d"),
            IngressRule::new(
                Some("a.example.com".to_string()),
                Some("^/long/path$".to_string()),
                "e",
            ),
        ];

        let services: Vec<String> = finalize(rules).into_iter().map(|r| r.service).collect();
        assert_eq!(services, vec!["e", "d", "c", "b", "a", CATCH_ALL_SERVICE]);
    }

    #[test]
    fn test_catch_all_never_duplicated() {
        let rules = vec![
            IngressRule::catch_all(),
            IngressRule::new(Some("a.example.com".to_string()), None, "svc"),
            IngressRule::catch_all(),
        ];
        let out = finalize(rules);
        assert_eq!(out.iter().filter(|r| r.is_catch_all()).count(), 1);
        assert!(out.last().is_some_and(IngressRule::is_catch_all));
    }

    #[test]
    fn test_match_everything_rule_is_dropped_before_catch_all() {
        let rules = vec![
            IngressRule::new(Some("a.example.com".to_string()), None, "svc"),
            IngressRule::new(None, None, "http://other.ns.svc.cluster.local:80"),
            IngressRule::new(None, Some("^/api(/.*)?$".to_string()), "api"),
        ];
        let out = finalize(rules);

        assert_eq!(out.iter().filter(|r| r.matches_everything()).count(), 1);
        assert!(out.last().is_some_and(IngressRule::is_catch_all));
        let services: Vec<&str> = out.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(services, vec!["svc", "api", CATCH_ALL_SERVICE]);
    }

    #[test]
    fn test_duplicate_host_path_keeps_first() {
        let rules = vec![
            IngressRule::new(Some("a.example.com".to_string()), None, "first"),
            IngressRule::new(Some("a.example.com".to_string()), None, "second"),
        ];
        let out = finalize(rules);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].service, "first");
    }

    #[test]
    fn test_denied_cross_namespace_ref_omits_only_that_rule() {
        let authz = ReferenceAuthorizer::default();
        let route = http_route(
            "r1",
            vec![
                rule(
                    vec![PathMatch::Prefix("/local".to_string())],
                    vec![BackendRef::service("local", 80)],
                ),
                rule(
                    vec![PathMatch::Prefix("/remote".to_string())],
                    vec![BackendRef {
                        namespace: Some("other".to_string()),
                        ..BackendRef::service("remote", 80)
                    }],
                ),
            ],
        );

        let out = RuleBuilder::new(&authz, "cluster.local").build(&[BoundRoute {
            route: &route,
            hostnames: host("app.example.com"),
        }]);

        assert_eq!(out.rules.len(), 2);
        assert_eq!(out.rules[0].service, "http://local.ns.svc.cluster.local:80");
        assert_eq!(out.failed_refs.len(), 1);
        assert_eq!(out.failed_refs[0].reason, BackendRefReason::RefNotPermitted);
        assert_eq!(out.failed_refs[0].backend, "other/remote");
        assert_eq!(out.failures_for(&route.key).count(), 1);
    }

    #[test]
    fn test_granted_cross_namespace_ref() {
        let authz = ReferenceAuthorizer::new(vec![ReferenceGrantInfo {
            namespace: "other".to_string(),
            name: "g".to_string(),
            from: vec![GrantFrom {
                group: GATEWAY_API_GROUP.to_string(),
                kind: "HTTPRoute".to_string(),
                namespace: "ns".to_string(),
            }],
            to: vec![GrantTo {
                group: String::new(),
                kind: "Service".to_string(),
                name: None,
            }],
        }]);
        let route = http_route(
            "r1",
            vec![rule(
                vec![],
                vec![BackendRef {
                    namespace: Some("other".to_string()),
                    ..BackendRef::service("remote", 8080)
                }],
            )],
        );

        let out = RuleBuilder::new(&authz, "cluster.local").build(&[BoundRoute {
            route: &route,
            hostnames: host("app.example.com"),
        }]);
        assert_eq!(out.rules[0].service, "http://remote.other.svc.cluster.local:8080");
        assert!(out.failed_refs.is_empty());
    }

    #[test]
    fn test_non_service_backend_is_invalid_kind() {
        let authz = ReferenceAuthorizer::default();
        let route = http_route(
            "r1",
            vec![rule(
                vec![],
                vec![
                    BackendRef {
                        group: Some("storage.example.com".to_string()),
                        kind: Some("Bucket".to_string()),
                        ..BackendRef::service("bucket", 80)
                    },
                    BackendRef::service("fallback", 80),
                ],
            )],
        );

        let out = RuleBuilder::new(&authz, "cluster.local").build(&[BoundRoute {
            route: &route,
            hostnames: host("app.example.com"),
        }]);
        assert_eq!(out.failed_refs[0].reason, BackendRefReason::InvalidKind);
        assert_eq!(out.rules[0].service, "http://fallback.ns.svc.cluster.local:80");
    }

    #[test]
    fn test_grpc_rules_request_http2() {
        let authz = ReferenceAuthorizer::default();
        let mut grpc = RouteInfo::new(RouteKey::new(RouteKind::Grpc, "ns", "g1"));
        grpc.rules = vec![rule(
            vec![PathMatch::GrpcMethod {
                service: Some("echo.Echo".to_string()),
                method: Some("Say".to_string()),
            }],
            vec![BackendRef::service("grpc", 9000)],
        )];
        let http = http_route("h1", vec![rule(vec![], vec![BackendRef::service("web", 80)])]);

        let bound = [
            BoundRoute {
                route: &grpc,
                hostnames: vec![None],
            },
            BoundRoute {
                route: &http,
                hostnames: host("web.example.com"),
            },
        ];
        let out = RuleBuilder::new(&authz, "cluster.local").build(&bound);

        // Hostname beats kind: the hostless gRPC rule sorts after web.example.com
        assert_eq!(out.rules[0].service, "http://web.ns.svc.cluster.local:80");
        assert_eq!(out.rules[0].origin_request, None);
        let grpc_rule = &out.rules[1];
        assert_eq!(grpc_rule.path.as_deref(), Some(r"^/echo\.Echo/Say"));
        assert_eq!(
            grpc_rule.origin_request,
            Some(OriginRequest {
                http2_origin: Some(true)
            })
        );

        let plain = RuleBuilder::new(&authz, "cluster.local")
            .grpc_http2_origin(false)
            .build(&bound);
        assert_eq!(plain.rules[1].origin_request, None);
    }

    #[test]
    fn test_missing_port_defaults() {
        let authz = ReferenceAuthorizer::default();
        let route = http_route(
            "r1",
            vec![rule(
                vec![],
                vec![BackendRef {
                    port: None,
                    ..BackendRef::service("svc", 1)
                }],
            )],
        );
        let out = RuleBuilder::new(&authz, "cluster.local").build(&[BoundRoute {
            route: &route,
            hostnames: host("app.example.com"),
        }]);
        assert_eq!(out.rules[0].service, "http://svc.ns.svc.cluster.local:80");
    }

    #[test]
    fn test_normalized_drops_empty_origin_request() {
        let rule = IngressRule {
            origin_request: Some(OriginRequest::default()),
            ..IngressRule::new(None, None, "svc")
        };
        assert_eq!(rule.normalized().origin_request, None);
    }
}
