//! Route-to-listener binding
//!
//! Decides, per (route, parentRef), whether the route may attach to a Gateway.
//! Checks run in order and stop at the first failure:
//!
//! 1. kind admission (explicit `allowedRoutes.kinds` or protocol defaults)
//! 2. `sectionName` resolution
//! 3. namespace policy
//! 4. hostname intersection
//!
//! Binding rejections are expected outcomes, not errors; they are reported on
//! route status with a machine-readable reason.

use crate::hostname::{route_matches_listener, validate_hostname};
use crate::route::{
    GatewayInfo, GatewayKey, ListenerInfo, NamespacePolicy, ParentRef, RouteInfo, RouteKind,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason attached to the route's `Accepted` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingReason {
    Accepted,
    /// Kind or namespace not admitted by any candidate listener
    NotAllowedByListeners,
    /// The listener only allows kinds this controller does not implement
    InvalidRouteKinds,
    /// No listener hostname intersects the route hostnames
    NoMatchingListenerHostname,
    /// sectionName does not name exactly one listener
    NoMatchingParent,
    /// Route hostnames are all invalid, or the route would match every request
    UnsupportedValue,
}

impl BindingReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BindingReason::Accepted => "Accepted",
            BindingReason::NotAllowedByListeners => "NotAllowedByListeners",
            BindingReason::InvalidRouteKinds => "InvalidRouteKinds",
            BindingReason::NoMatchingListenerHostname => "NoMatchingListenerHostname",
            BindingReason::NoMatchingParent => "NoMatchingParent",
            BindingReason::UnsupportedValue => "UnsupportedValue",
        }
    }
}

impl fmt::Display for BindingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one parent reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResult {
    pub accepted: bool,
    pub reason: BindingReason,
    pub message: String,
    /// Listeners the route attached to (empty when rejected)
    pub listeners: Vec<String>,
}

impl BindingResult {
    fn accepted(listeners: Vec<String>) -> Self {
        Self {
            accepted: true,
            reason: BindingReason::Accepted,
            message: "Route is accepted".to_string(),
            listeners,
        }
    }

    pub fn rejected(reason: BindingReason, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason,
            message: message.into(),
            listeners: Vec::new(),
        }
    }
}

/// The route-side inputs of a binding decision
#[derive(Debug, Clone, Copy)]
pub struct BindingRequest<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub hostnames: &'a [String],
    pub kind: RouteKind,
    pub section_name: Option<&'a str>,
}

/// Route kinds a listener admits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedKinds {
    /// Derived from an explicit `allowedRoutes.kinds`
    Explicit(Vec<RouteKind>),
    /// Derived from the listener protocol
    Protocol(Vec<RouteKind>),
    /// Nothing this controller supports (explicit list of foreign kinds, or a
    /// TLS/TCP/UDP listener)
    Unsupported,
}

impl AllowedKinds {
    pub fn admits(&self, kind: RouteKind) -> bool {
        match self {
            AllowedKinds::Explicit(kinds) | AllowedKinds::Protocol(kinds) => kinds.contains(&kind),
            AllowedKinds::Unsupported => false,
        }
    }
}

/// Resolve the route kinds a listener admits
pub fn allowed_kinds(listener: &ListenerInfo) -> AllowedKinds {
    if let Some(kinds) = &listener.allowed_routes.kinds {
        let mut supported: Vec<RouteKind> =
            kinds.iter().filter_map(|k| k.supported_kind()).collect();
        supported.sort_unstable();
        supported.dedup();
        // An explicit empty list means "protocol defaults" in the Gateway API
        if kinds.is_empty() {
            return protocol_kinds(&listener.protocol);
        }
        return if supported.is_empty() {
            AllowedKinds::Unsupported
        } else {
            AllowedKinds::Explicit(supported)
        };
    }
    protocol_kinds(&listener.protocol)
}

fn protocol_kinds(protocol: &str) -> AllowedKinds {
    match protocol.to_ascii_uppercase().as_str() {
        "HTTP" | "HTTPS" => AllowedKinds::Protocol(RouteKind::ALL.to_vec()),
        _ => AllowedKinds::Unsupported,
    }
}

/// Whether the listener's namespace policy admits a route namespace
pub fn namespace_allowed(listener: &ListenerInfo, gateway_namespace: &str, route_namespace: &str) -> bool {
    match listener.allowed_routes.namespaces {
        NamespacePolicy::All => true,
        NamespacePolicy::Same | NamespacePolicy::Selector => route_namespace == gateway_namespace,
    }
}

/// Validate one (gateway, parentRef) pair
pub fn validate(gateway: &GatewayInfo, request: &BindingRequest<'_>) -> BindingResult {
    // 1. kind admission
    let admitting: Vec<&ListenerInfo> = gateway
        .listeners
        .iter()
        .filter(|l| allowed_kinds(l).admits(request.kind))
        .collect();
    if admitting.is_empty() {
        let unsupported = !gateway.listeners.is_empty()
            && gateway
                .listeners
                .iter()
                .all(|l| allowed_kinds(l) == AllowedKinds::Unsupported);
        return if unsupported {
            BindingResult::rejected(
                BindingReason::InvalidRouteKinds,
                format!(
                    "Gateway {} has no listener supporting HTTPRoute or GRPCRoute",
                    gateway.key
                ),
            )
        } else {
            BindingResult::rejected(
                BindingReason::NotAllowedByListeners,
                format!(
                    "No listener of Gateway {} allows kind {}",
                    gateway.key, request.kind
                ),
            )
        };
    }

    // 2. sectionName
    let candidates: Vec<&ListenerInfo> = match request.section_name {
        Some(section) => {
            let named: Vec<&ListenerInfo> = gateway
                .listeners
                .iter()
                .filter(|l| l.name == section)
                .collect();
            if named.len() != 1 {
                return BindingResult::rejected(
                    BindingReason::NoMatchingParent,
                    format!("Gateway {} has no listener named '{}'", gateway.key, section),
                );
            }
            let kinds = allowed_kinds(named[0]);
            if kinds == AllowedKinds::Unsupported {
                return BindingResult::rejected(
                    BindingReason::InvalidRouteKinds,
                    format!(
                        "Listener '{}' of Gateway {} supports neither HTTPRoute nor GRPCRoute",
                        section, gateway.key
                    ),
                );
            }
            if !kinds.admits(request.kind) {
                return BindingResult::rejected(
                    BindingReason::NotAllowedByListeners,
                    format!(
                        "Listener '{}' of Gateway {} does not allow kind {}",
                        section, gateway.key, request.kind
                    ),
                );
            }
            named
        }
        None => admitting,
    };

    // 3. namespace policy
    let candidates: Vec<&ListenerInfo> = candidates
        .into_iter()
        .filter(|l| namespace_allowed(l, gateway.namespace(), request.namespace))
        .collect();
    if candidates.is_empty() {
        return BindingResult::rejected(
            BindingReason::NotAllowedByListeners,
            format!(
                "Namespace '{}' is not allowed by the listeners of Gateway {}",
                request.namespace, gateway.key
            ),
        );
    }

    // 4. hostname intersection
    let matched: Vec<String> = candidates
        .into_iter()
        .filter(|l| route_matches_listener(request.hostnames, l.hostname.as_deref()))
        .map(|l| l.name.clone())
        .collect();
    if matched.is_empty() {
        return BindingResult::rejected(
            BindingReason::NoMatchingListenerHostname,
            format!(
                "No listener hostname of Gateway {} matches {:?}",
                gateway.key, request.hostnames
            ),
        );
    }

    BindingResult::accepted(matched)
}

/// Binding of one parent reference against a Gateway of this controller's class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentBinding {
    pub parent_ref: ParentRef,
    pub gateway: GatewayKey,
    pub result: BindingResult,
}

/// All bindings of a route against this controller's Gateways
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBinding {
    pub route: RouteInfo,
    /// Hostnames that passed validation (empty means "any")
    pub hostnames: Vec<String>,
    pub parents: Vec<ParentBinding>,
}

impl RouteBinding {
    /// A route participates in rule building if any parent accepted it
    pub fn is_accepted(&self) -> bool {
        self.parents.iter().any(|p| p.result.accepted)
    }

    /// Accepted (gateway, listener name) pairs
    pub fn accepted_listeners(&self) -> impl Iterator<Item = (&GatewayKey, &str)> {
        self.parents
            .iter()
            .filter(|p| p.result.accepted)
            .flat_map(|p| p.result.listeners.iter().map(move |l| (&p.gateway, l.as_str())))
    }
}

/// Bind a route against the Gateways of this controller's class
///
/// Parent references naming anything other than one of `gateways` are skipped:
/// they belong to another controller and receive no status from this one.
pub fn bind_route(gateways: &[GatewayInfo], route: &RouteInfo) -> RouteBinding {
    let hostnames: Vec<String> = route
        .hostnames
        .iter()
        .filter(|h| validate_hostname(h).is_ok())
        .map(|h| h.to_ascii_lowercase())
        .collect();
    let all_hostnames_invalid = !route.hostnames.is_empty() && hostnames.is_empty();

    let mut parents = Vec::new();
    for parent_ref in route.parent_refs.iter().filter(|p| p.is_gateway()) {
        let key = parent_ref.gateway_key(route.namespace());
        let Some(gateway) = gateways.iter().find(|g| g.key == key) else {
            continue;
        };

        let result = if all_hostnames_invalid {
            BindingResult::rejected(
                BindingReason::UnsupportedValue,
                format!("All hostnames are invalid: {:?}", route.hostnames),
            )
        } else {
            validate(
                gateway,
                &BindingRequest {
                    name: route.name(),
                    namespace: route.namespace(),
                    hostnames: &hostnames,
                    kind: route.kind(),
                    section_name: parent_ref.section_name.as_deref(),
                },
            )
        };

        parents.push(ParentBinding {
            parent_ref: parent_ref.clone(),
            gateway: key,
            result,
        });
    }

    RouteBinding {
        route: route.clone(),
        hostnames,
        parents,
    }
}
