//! Gateway API support (v1)
//!
//! Controllers for the Gateway API objects this controller programs:
//! - GatewayClass: controller identity and parametersRef validation
//! - Gateway: resync trigger for Gateways of our class, plus ReferenceGrant,
//!   configuration and credential Secret changes
//! - HTTPRoute / GRPCRoute: resync triggers for route changes
//! - Status: conflict-safe status writes

#[allow(clippy::module_inception)]
pub mod gateway;
pub mod gateway_class;
pub mod route;
pub mod route_adapter;
pub mod secret_watcher;
pub mod status;
