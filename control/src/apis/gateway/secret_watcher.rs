//! Credential Secret tracking
//!
//! The Gateway controller watches every Secret in the cluster, but only the
//! Secrets named by a GatewayClassConfig may trigger a resync. The resolver
//! records each Secret it reads here, and the watch mapper filters on it.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Safe RwLock read helper that recovers from poisoning
#[inline]
fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during read, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe RwLock write helper that recovers from poisoning
#[inline]
fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during write, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Set of (namespace, name) of Secrets holding tunnel credentials
#[derive(Debug, Default)]
pub struct WatchedSecrets {
    inner: RwLock<HashSet<(String, String)>>,
}

impl WatchedSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a Secret. Returns `true` if it was not tracked yet.
    pub fn insert(&self, namespace: &str, name: &str) -> bool {
        let mut inner = safe_write(&self.inner);
        let is_new = inner.insert((namespace.to_string(), name.to_string()));
        if is_new {
            debug!(
                "WatchedSecrets: added {}/{} (total: {})",
                namespace,
                name,
                inner.len()
            );
        }
        is_new
    }

    #[inline]
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        safe_read(&self.inner).contains(&(namespace.to_string(), name.to_string()))
    }

    /// Whether a change to this Secret affects tunnel credentials
    pub fn is_watched(&self, secret: &Secret) -> bool {
        let namespace = secret.namespace().unwrap_or_default();
        self.contains(&namespace, &secret.name_any())
    }
}
