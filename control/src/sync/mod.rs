//! Full-resync orchestration of the tunnel ingress list

pub mod cluster;
pub mod orchestrator;

pub use cluster::{ClusterReader, KubeClusterReader};
pub use orchestrator::{SyncDeps, SyncOrchestrator, SyncState, Trigger};
