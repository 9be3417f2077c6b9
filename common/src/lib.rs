//! Tunnel gateway synchronization core
//!
//! Pure logic shared by the controller: Gateway API binding rules, ReferenceGrant
//! authorization, ingress rule building and the diff/limit step that precedes a
//! write to the tunnel. Nothing here talks to Kubernetes or the network.

pub mod binding;
pub mod grant;
pub mod hostname;
pub mod plan;
pub mod reconcile;
pub mod route;
pub mod rules;

pub use binding::{bind_route, validate, BindingReason, BindingRequest, BindingResult, RouteBinding};
pub use grant::{ObjectRef, ReferenceAuthorizer, ReferenceGrantInfo};
pub use plan::{
    gateway_status, plan_pass, route_status, ClusterSnapshot, ConditionIntent,
    GatewayStatusIntent, PassOutcome, PassPlan, PlanOptions, RouteStatusIntent,
};
pub use reconcile::{sync, LimitExceeded, RuleDiff, SyncPlan, MAX_INGRESS_RULES};
pub use route::{
    BackendRef, GatewayInfo, GatewayKey, ListenerInfo, NamespacePolicy, ParentRef, PathMatch,
    RouteInfo, RouteKey, RouteKind, RouteRule,
};
pub use rules::{BackendRefError, BackendRefReason, IngressRule, RuleBuilder};
