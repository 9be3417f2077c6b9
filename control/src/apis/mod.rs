//! Kubernetes API integrations
//!
//! Gateway API (v1) controllers, status writers and the controller metrics.

pub mod gateway;
pub mod metrics;
