//! Pass planning
//!
//! Joins binding, authorization and rule building over one snapshot of the
//! cluster, and derives the status every Gateway and route should carry once the
//! pass outcome is known. Everything here is a pure function of its inputs, which
//! is what makes repeated passes idempotent.

use crate::binding::{allowed_kinds, bind_route, AllowedKinds, BindingReason, BindingResult, RouteBinding};
use crate::grant::{ReferenceAuthorizer, ReferenceGrantInfo};
use crate::hostname::effective_hostnames;
use crate::route::{GatewayInfo, GatewayKey, ParentRef, RouteInfo, RouteKey, RouteKind};
use crate::rules::{path_regex, BoundRoute, BuildOutput, RuleBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Suffix of the hostname a tunnel is reachable at
pub const TUNNEL_ADDRESS_SUFFIX: &str = "cfargotunnel.com";

/// `controllerName` this controller answers to unless configured otherwise
pub const DEFAULT_CONTROLLER_NAME: &str = "tunnel.gateway.io/controller";

/// Cluster objects one pass works from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Gateways of this controller's class only
    pub gateways: Vec<GatewayInfo>,
    /// HTTPRoutes and GRPCRoutes from all namespaces
    pub routes: Vec<RouteInfo>,
    pub grants: Vec<ReferenceGrantInfo>,
}

/// Inputs of a pass that do not come from the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    /// Owner of the route status entries this pass rewrites
    pub controller_name: String,
    pub cluster_domain: String,
    pub grpc_http2_origin: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            cluster_domain: "cluster.local".to_string(),
            grpc_http2_origin: true,
        }
    }
}

/// Desired state computed from a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassPlan {
    /// One entry per route that references one of our Gateways or still carries
    /// status from this controller, sorted by key. The latter have no parents.
    pub bindings: Vec<RouteBinding>,
    pub build: BuildOutput,
    /// Routes attached per (gateway, listener name)
    pub attached_routes: BTreeMap<(GatewayKey, String), i32>,
}

impl PassPlan {
    pub fn accepted_routes(&self) -> impl Iterator<Item = &RouteBinding> {
        self.bindings.iter().filter(|b| b.is_accepted())
    }

    pub fn attached_routes_for(&self, gateway: &GatewayKey, listener: &str) -> i32 {
        self.attached_routes
            .get(&(gateway.clone(), listener.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Hostnames an accepted route is served on, across the listeners it bound to
fn served_hostnames(gateways: &[GatewayInfo], binding: &RouteBinding) -> Vec<Option<String>> {
    let mut listener_hostnames: Vec<Option<String>> = Vec::new();
    for (gateway_key, listener_name) in binding.accepted_listeners() {
        let hostname = gateways
            .iter()
            .find(|g| &g.key == gateway_key)
            .and_then(|g| g.listeners.iter().find(|l| l.name == listener_name))
            .and_then(|l| l.hostname.clone());
        if !listener_hostnames.contains(&hostname) {
            listener_hostnames.push(hostname);
        }
    }
    effective_hostnames(&binding.hostnames, &listener_hostnames)
}

/// Whether a route would emit a rule with neither hostname nor path
///
/// Such a rule matches every request, so it would sit in front of the catch-all
/// and hide it.
fn matches_every_request(route: &RouteInfo, hostnames: &[Option<String>]) -> bool {
    hostnames.contains(&None)
        && route
            .rules
            .iter()
            .any(|rule| rule.matches.is_empty() || rule.matches.iter().any(|m| path_regex(m).is_none()))
}

/// Compute bindings and the desired rule list
pub fn plan_pass(snapshot: &ClusterSnapshot, options: &PlanOptions) -> PassPlan {
    let mut routes: Vec<&RouteInfo> = snapshot.routes.iter().collect();
    routes.sort_by(|a, b| a.key.cmp(&b.key));

    let mut bindings: Vec<RouteBinding> = routes
        .into_iter()
        .map(|route| bind_route(&snapshot.gateways, route))
        .filter(|binding| {
            !binding.parents.is_empty() || binding.route.has_status_from(&options.controller_name)
        })
        .collect();

    let mut served: Vec<Vec<Option<String>>> = Vec::with_capacity(bindings.len());
    for binding in &mut bindings {
        let hostnames = if binding.is_accepted() {
            served_hostnames(&snapshot.gateways, binding)
        } else {
            Vec::new()
        };

        if matches_every_request(&binding.route, &hostnames) {
            for parent in binding.parents.iter_mut().filter(|p| p.result.accepted) {
                parent.result = BindingResult::rejected(
                    BindingReason::UnsupportedValue,
                    "Neither the route nor its listener sets a hostname; a rule matching every request would hide the catch-all",
                );
            }
            served.push(Vec::new());
        } else {
            served.push(hostnames);
        }
    }

    for binding in &bindings {
        for parent in binding.parents.iter().filter(|p| !p.result.accepted) {
            debug!(
                route = %binding.route.key,
                gateway = %parent.gateway,
                reason = %parent.result.reason,
                "Route not bound"
            );
        }
    }

    let mut attached: BTreeMap<(GatewayKey, String), BTreeSet<&RouteKey>> = BTreeMap::new();
    let mut bound_routes = Vec::new();

    for (binding, hostnames) in bindings.iter().zip(served) {
        if !binding.is_accepted() {
            continue;
        }

        for (gateway_key, listener_name) in binding.accepted_listeners() {
            attached
                .entry((gateway_key.clone(), listener_name.to_string()))
                .or_default()
                .insert(&binding.route.key);
        }

        if !hostnames.is_empty() {
            bound_routes.push(BoundRoute {
                route: &binding.route,
                hostnames,
            });
        }
    }

    let authorizer = ReferenceAuthorizer::new(snapshot.grants.clone());
    let build = RuleBuilder::new(&authorizer, &options.cluster_domain)
        .grpc_http2_origin(options.grpc_http2_origin)
        .build(&bound_routes);

    let attached_routes = attached
        .into_iter()
        .map(|(key, routes)| (key, i32::try_from(routes.len()).unwrap_or(i32::MAX)))
        .collect();

    PassPlan {
        bindings,
        build,
        attached_routes,
    }
}

/// How a pass ended, as far as status reporting is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Rules written to the tunnel
    Applied,
    /// Remote already matched; no write
    Unchanged,
    /// Credentials or tunnel identity could not be resolved
    ConfigFailed { message: String },
    /// Remote fetch or write failed
    RemoteFailed { message: String },
    /// Too many rules; nothing written
    LimitExceeded { count: usize, limit: usize },
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PassOutcome::Applied | PassOutcome::Unchanged)
    }

    pub const fn label(&self) -> &'static str {
        match self {
            PassOutcome::Applied => "applied",
            PassOutcome::Unchanged => "unchanged",
            PassOutcome::ConfigFailed { .. } => "config_error",
            PassOutcome::RemoteFailed { .. } => "remote_error",
            PassOutcome::LimitExceeded { .. } => "limit_exceeded",
        }
    }
}

/// A status condition, before timestamps are attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionIntent {
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

impl ConditionIntent {
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn status_str(&self) -> &'static str {
        if self.status {
            "True"
        } else {
            "False"
        }
    }
}

/// Status of one parentRef of a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteParentStatusIntent {
    pub parent_ref: ParentRef,
    pub conditions: Vec<ConditionIntent>,
}

/// Desired status of one route, limited to the parents this controller owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStatusIntent {
    pub route: RouteKey,
    pub generation: Option<i64>,
    pub parents: Vec<RouteParentStatusIntent>,
}

/// Route status for every binding of the plan
///
/// A binding without parents yields an intent without parents, which clears the
/// entries this controller left on a route that no longer references it.
pub fn route_status(plan: &PassPlan, outcome: &PassOutcome) -> Vec<RouteStatusIntent> {
    plan.bindings
        .iter()
        .map(|binding| {
            let failures: Vec<_> = plan.build.failures_for(&binding.route.key).collect();
            let resolved = match failures.first() {
                None => ConditionIntent::new("ResolvedRefs", true, "ResolvedRefs", "All references resolved"),
                Some(first) => ConditionIntent::new(
                    "ResolvedRefs",
                    false,
                    first.reason.as_str(),
                    failures
                        .iter()
                        .map(|f| f.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
            };

            let parents = binding
                .parents
                .iter()
                .map(|parent| {
                    let accepted = if !parent.result.accepted {
                        ConditionIntent::new(
                            "Accepted",
                            false,
                            parent.result.reason.as_str(),
                            parent.result.message.clone(),
                        )
                    } else {
                        match outcome {
                            PassOutcome::Applied | PassOutcome::Unchanged => ConditionIntent::new(
                                "Accepted",
                                true,
                                "Accepted",
                                parent.result.message.clone(),
                            ),
                            PassOutcome::LimitExceeded { count, limit } => ConditionIntent::new(
                                "Accepted",
                                false,
                                "RuleLimitExceeded",
                                format!(
                                    "Tunnel ingress would hold {} rules, limit is {}; no rules were written",
                                    count, limit
                                ),
                            ),
                            PassOutcome::ConfigFailed { message }
                            | PassOutcome::RemoteFailed { message } => ConditionIntent::new(
                                "Accepted",
                                false,
                                "Pending",
                                format!("Tunnel not updated: {}", message),
                            ),
                        }
                    };

                    RouteParentStatusIntent {
                        parent_ref: parent.parent_ref.clone(),
                        conditions: vec![accepted, resolved.clone()],
                    }
                })
                .collect();

            RouteStatusIntent {
                route: binding.route.key.clone(),
                generation: binding.route.generation,
                parents,
            }
        })
        .collect()
}

/// Desired status of one listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStatusIntent {
    pub name: String,
    pub attached_routes: i32,
    pub supported_kinds: Vec<RouteKind>,
    pub conditions: Vec<ConditionIntent>,
}

/// Desired status of one Gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatusIntent {
    pub gateway: GatewayKey,
    pub generation: Option<i64>,
    /// Advertised hostname, once the tunnel is known
    pub address: Option<String>,
    pub conditions: Vec<ConditionIntent>,
    pub listeners: Vec<ListenerStatusIntent>,
}

/// Gateway status for every Gateway of the snapshot
pub fn gateway_status(
    snapshot: &ClusterSnapshot,
    plan: &PassPlan,
    outcome: &PassOutcome,
    tunnel_id: Option<&str>,
) -> Vec<GatewayStatusIntent> {
    let programmed = match outcome {
        PassOutcome::Applied | PassOutcome::Unchanged => {
            ConditionIntent::new("Programmed", true, "Programmed", "Tunnel ingress is up to date")
        }
        PassOutcome::ConfigFailed { message } => ConditionIntent::new(
            "Programmed",
            false,
            "Invalid",
            format!("Tunnel configuration could not be resolved: {}", message),
        ),
        PassOutcome::RemoteFailed { message } => ConditionIntent::new(
            "Programmed",
            false,
            "Pending",
            format!("Tunnel not updated: {}", message),
        ),
        PassOutcome::LimitExceeded { count, limit } => ConditionIntent::new(
            "Programmed",
            false,
            "Pending",
            format!("Ingress rule count {} exceeds limit of {}", count, limit),
        ),
    };

    snapshot
        .gateways
        .iter()
        .map(|gateway| {
            let listeners = gateway
                .listeners
                .iter()
                .map(|listener| {
                    let (supported_kinds, kinds_ok) = match allowed_kinds(listener) {
                        AllowedKinds::Explicit(kinds) | AllowedKinds::Protocol(kinds) => (kinds, true),
                        AllowedKinds::Unsupported => (Vec::new(), false),
                    };
                    let resolved = if kinds_ok {
                        ConditionIntent::new("ResolvedRefs", true, "ResolvedRefs", "Listener references resolved")
                    } else {
                        ConditionIntent::new(
                            "ResolvedRefs",
                            false,
                            "InvalidRouteKinds",
                            "Listener allows no HTTPRoute or GRPCRoute",
                        )
                    };
                    let listener_programmed = ConditionIntent {
                        type_: "Programmed".to_string(),
                        ..programmed.clone()
                    };

                    ListenerStatusIntent {
                        name: listener.name.clone(),
                        attached_routes: plan.attached_routes_for(&gateway.key, &listener.name),
                        supported_kinds,
                        conditions: vec![
                            ConditionIntent::new("Accepted", true, "Accepted", "Listener is accepted"),
                            resolved,
                            listener_programmed,
                        ],
                    }
                })
                .collect();

            GatewayStatusIntent {
                gateway: gateway.key.clone(),
                generation: gateway.generation,
                address: tunnel_id.map(|id| format!("{}.{}", id, TUNNEL_ADDRESS_SUFFIX)),
                conditions: vec![
                    ConditionIntent::new("Accepted", true, "Accepted", "Gateway is accepted"),
                    programmed.clone(),
                ],
                listeners,
            }
        })
        .collect()
}
