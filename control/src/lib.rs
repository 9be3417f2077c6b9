//! Tunnel Gateway controller
//!
//! Keeps a remote tunnel's ingress rules in sync with the HTTPRoutes and
//! GRPCRoutes attached to Gateways of one GatewayClass.

pub mod apis;
pub mod config;
pub mod credentials;
pub mod error;
pub mod server;
pub mod sync;
pub mod tunnel;
