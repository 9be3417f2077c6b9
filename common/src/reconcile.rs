//! Reconciliation diff/apply
//!
//! The controller exclusively owns the tunnel's ingress list: every pass replaces
//! it wholesale with the desired list. The diff computed here is for telemetry and
//! for skipping no-op writes, never for merging.

use crate::rules::{finalize, IngressRule};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Rule ceiling of the remote tunnel configuration, catch-all included
pub const MAX_INGRESS_RULES: usize = 1000;

/// Changes between remote and desired rule lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDiff {
    pub added: Vec<IngressRule>,
    pub removed: Vec<IngressRule>,
    pub unchanged: usize,
}

impl RuleDiff {
    /// Set difference in both directions; rule identity is full equality
    pub fn compute(remote: &[IngressRule], desired: &[IngressRule]) -> Self {
        let remote_set: HashSet<&IngressRule> = remote.iter().collect();
        let desired_set: HashSet<&IngressRule> = desired.iter().collect();

        let added = desired
            .iter()
            .filter(|r| !remote_set.contains(r))
            .cloned()
            .collect();
        let removed = remote
            .iter()
            .filter(|r| !desired_set.contains(r))
            .cloned()
            .collect();
        let unchanged = desired.iter().filter(|r| remote_set.contains(r)).count();

        Self {
            added,
            removed,
            unchanged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for RuleDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} -{} ={}",
            self.added.len(),
            self.removed.len(),
            self.unchanged
        )
    }
}

/// Desired rule count exceeds the remote ceiling; nothing may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ingress rule count {count} exceeds limit of {limit}")]
pub struct LimitExceeded {
    pub count: usize,
    pub limit: usize,
}

/// What a pass should commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    /// Final rule list, catch-all last
    pub rules: Vec<IngressRule>,
    pub diff: RuleDiff,
    /// False when remote already equals `rules` (order included)
    pub needs_write: bool,
}

/// Plan the replacement of `remote` by `desired`
///
/// `desired` is re-finalized, so callers may pass a list with or without the
/// catch-all. Remote rules are normalized before comparison.
pub fn sync(remote: &[IngressRule], desired: Vec<IngressRule>) -> Result<SyncPlan, LimitExceeded> {
    let rules = finalize(desired);

    if rules.len() > MAX_INGRESS_RULES {
        return Err(LimitExceeded {
            count: rules.len(),
            limit: MAX_INGRESS_RULES,
        });
    }

    let remote: Vec<IngressRule> = remote.iter().cloned().map(IngressRule::normalized).collect();
    let diff = RuleDiff::compute(&remote, &rules);
    let needs_write = remote != rules;

    Ok(SyncPlan {
        rules,
        diff,
        needs_write,
    })
}
