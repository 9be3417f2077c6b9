//! Sync orchestrator
//!
//! Every trigger, whatever object it came from, runs a full resync of the
//! tunnel ingress list. Passes are serialized; a trigger that queued behind a
//! pass which started after it was raised reuses that pass's outcome.
//!
//! Until the startup pass has completed, triggers are deferred so the first
//! write is computed from the complete cluster state.

use super::cluster::ClusterReader;
use crate::apis::gateway::status::StatusWriter;
use crate::apis::metrics::{record_binding, record_rules, record_sync};
use crate::config::TimingConfig;
use crate::credentials::{ConfigResolver, ResolvedConfig};
use crate::error::SyncError;
use crate::tunnel::TunnelApi;
use kube::runtime::controller::Action;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use tunnel_common::plan::{gateway_status, route_status};
use tunnel_common::{plan_pass, sync, ClusterSnapshot, PassOutcome, PassPlan, PlanOptions};

/// Readiness of the orchestrator. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    NotStarted = 0,
    StartupSyncInFlight = 1,
    Ready = 2,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SyncState::NotStarted,
            1 => SyncState::StartupSyncInFlight,
            _ => SyncState::Ready,
        }
    }
}

/// Result of a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Startup sync still running; try again later
    Deferred,
    /// A pass covering this trigger completed
    Completed(PassOutcome),
}

/// Collaborators of the orchestrator
pub struct SyncDeps {
    pub resolver: Arc<dyn ConfigResolver>,
    pub tunnel: Arc<dyn TunnelApi>,
    pub reader: Arc<dyn ClusterReader>,
    pub status: Arc<dyn StatusWriter>,
}

pub struct SyncOrchestrator {
    gateway_class: String,
    controller_name: String,
    cluster_domain: String,
    timing: TimingConfig,
    deps: SyncDeps,
    state: AtomicU8,
    /// Trigger tickets handed out
    requested: AtomicU64,
    /// Highest ticket covered by a completed pass
    completed: AtomicU64,
    /// Serializes passes; holds the outcome of the last completed pass
    last_outcome: Mutex<Option<PassOutcome>>,
}

impl SyncOrchestrator {
    pub fn new(
        gateway_class: impl Into<String>,
        controller_name: impl Into<String>,
        cluster_domain: impl Into<String>,
        timing: TimingConfig,
        deps: SyncDeps,
    ) -> Self {
        Self {
            gateway_class: gateway_class.into(),
            controller_name: controller_name.into(),
            cluster_domain: cluster_domain.into(),
            timing,
            deps,
            state: AtomicU8::new(SyncState::NotStarted as u8),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SyncState::Ready
    }

    pub fn gateway_class(&self) -> &str {
        &self.gateway_class
    }

    /// Run the startup pass until it produces a complete desired state, then mark Ready
    pub async fn run_startup(&self) {
        if self
            .state
            .compare_exchange(
                SyncState::NotStarted as u8,
                SyncState::StartupSyncInFlight as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("Startup sync already started");
            return;
        }

        info!(gateway_class = %self.gateway_class, "Starting initial tunnel sync");

        loop {
            let ticket = self.requested.load(Ordering::Acquire);
            match self.run_serialized(ticket).await {
                // A rule-limit failure still computed the full desired state
                Ok(outcome)
                    if outcome.is_success()
                        || matches!(outcome, PassOutcome::LimitExceeded { .. }) =>
                {
                    self.state.store(SyncState::Ready as u8, Ordering::Release);
                    info!(result = outcome.label(), "Initial tunnel sync complete, controller ready");
                    return;
                }
                Ok(outcome) => warn!(
                    result = outcome.label(),
                    "Initial tunnel sync failed, retrying in {:?}",
                    self.timing.retry_delay()
                ),
                Err(e) => warn!(
                    "Initial tunnel sync failed: {}, retrying in {:?}",
                    e,
                    self.timing.retry_delay()
                ),
            }
            tokio::time::sleep(self.timing.retry_delay()).await;
        }
    }

    /// Handle a change to any watched object
    pub async fn trigger(&self, source: &str) -> Result<Trigger, SyncError> {
        if !self.is_ready() {
            debug!(source, "Startup sync not complete, deferring");
            return Ok(Trigger::Deferred);
        }

        let ticket = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(source, ticket, "Resync requested");
        self.run_serialized(ticket).await.map(Trigger::Completed)
    }

    /// Requeue policy for a trigger result
    pub fn next_action(&self, result: &Trigger) -> Action {
        match result {
            Trigger::Deferred => Action::requeue(self.timing.startup_backoff()),
            Trigger::Completed(outcome) if outcome.is_success() => {
                Action::requeue(self.timing.resync_interval())
            }
            // Retrying cannot help until the cluster changes
            Trigger::Completed(PassOutcome::LimitExceeded { .. }) => Action::await_change(),
            Trigger::Completed(_) => Action::requeue(self.timing.retry_delay()),
        }
    }

    /// Requeue after a reconciler error
    pub fn retry_action(&self) -> Action {
        Action::requeue(self.timing.retry_delay())
    }

    /// Resync after an object was deleted
    ///
    /// Deleted objects are never reconciled and cannot be requeued, so the
    /// resync waits out startup in a background task instead of being deferred.
    pub fn spawn_deleted_resync(self: &Arc<Self>, source: String) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while !orchestrator.is_ready() {
                tokio::time::sleep(orchestrator.timing.startup_backoff()).await;
            }
            match orchestrator.trigger(&source).await {
                Ok(result) => debug!(source = %source, ?result, "Resynced after deletion"),
                Err(e) => error!(source = %source, "Resync after deletion failed: {}", e),
            }
        });
    }

    async fn run_serialized(&self, ticket: u64) -> Result<PassOutcome, SyncError> {
        let mut last = self.last_outcome.lock().await;

        if ticket > 0 && self.completed.load(Ordering::Acquire) >= ticket {
            if let Some(outcome) = last.as_ref() {
                debug!(ticket, "Trigger covered by a completed pass");
                return Ok(outcome.clone());
            }
        }

        let covered = self.requested.load(Ordering::Acquire);
        let outcome = self.run_pass().await?;
        self.completed.fetch_max(covered, Ordering::AcqRel);
        *last = Some(outcome.clone());
        Ok(outcome)
    }

    fn plan_options(&self, config: Option<&ResolvedConfig>) -> PlanOptions {
        let defaults = PlanOptions::default();
        PlanOptions {
            controller_name: self.controller_name.clone(),
            cluster_domain: self.cluster_domain.clone(),
            grpc_http2_origin: config
                .map(|c| c.flags.grpc_http2_origin)
                .unwrap_or(defaults.grpc_http2_origin),
        }
    }

    /// One full resync
    #[instrument(skip(self), fields(gateway_class = %self.gateway_class))]
    async fn run_pass(&self) -> Result<PassOutcome, SyncError> {
        let start = Instant::now();

        let snapshot = self.deps.reader.snapshot(&self.gateway_class).await?;
        let resolved = self.deps.resolver.resolve(&self.gateway_class).await;
        let plan = plan_pass(&snapshot, &self.plan_options(resolved.as_ref().ok()));

        let (result, tunnel_id) = match resolved {
            Ok(config) => (self.apply(&config, &plan).await, Some(config.tunnel_id)),
            Err(e) => (Err(SyncError::from(e)), None),
        };

        let outcome = match result {
            Ok(true) => PassOutcome::Applied,
            Ok(false) => PassOutcome::Unchanged,
            Err(SyncError::Config(e)) => {
                error!("Tunnel configuration could not be resolved: {}", e);
                PassOutcome::ConfigFailed {
                    message: e.to_string(),
                }
            }
            Err(SyncError::Remote(e)) => PassOutcome::RemoteFailed {
                message: e.to_string(),
            },
            Err(SyncError::LimitExceeded(e)) => {
                error!(count = e.count, limit = e.limit, "Refusing to write tunnel ingress: {}", e);
                PassOutcome::LimitExceeded {
                    count: e.count,
                    limit: e.limit,
                }
            }
            Err(e @ SyncError::Kube(_)) => return Err(e),
        };

        self.publish_status(&snapshot, &plan, &outcome, tunnel_id.as_deref())
            .await;

        for binding in &plan.bindings {
            let result = if binding.is_accepted() { "accepted" } else { "rejected" };
            record_binding(binding.route.kind().as_str(), result);
        }
        record_sync(start.elapsed().as_secs_f64(), outcome.label());

        info!(
            result = outcome.label(),
            routes = plan.bindings.len(),
            rules = plan.build.rules.len(),
            failed_refs = plan.build.failed_refs.len(),
            "Sync pass finished in {:?}",
            start.elapsed()
        );
        Ok(outcome)
    }

    /// Fetch remote state, diff and write. Returns whether a write happened.
    async fn apply(&self, config: &ResolvedConfig, plan: &PassPlan) -> Result<bool, SyncError> {
        let remote = self.deps.tunnel.get_configuration(config).await?;
        let sync_plan = sync(&remote.ingress, plan.build.rules.clone())?;

        info!(
            added = sync_plan.diff.added.len(),
            removed = sync_plan.diff.removed.len(),
            unchanged = sync_plan.diff.unchanged,
            "Tunnel ingress diff {}",
            sync_plan.diff
        );

        if !sync_plan.needs_write {
            record_rules(sync_plan.rules.len(), 0, 0);
            debug!("Remote ingress already up to date");
            return Ok(false);
        }

        let added = sync_plan.diff.added.len();
        let removed = sync_plan.diff.removed.len();
        let total = sync_plan.rules.len();
        self.deps
            .tunnel
            .update_configuration(config, &remote.with_ingress(sync_plan.rules))
            .await?;

        record_rules(total, added, removed);
        info!(rules = total, "Wrote tunnel ingress");
        Ok(true)
    }

    /// Write route and Gateway status. Failures are logged and left to the next pass.
    async fn publish_status(
        &self,
        snapshot: &ClusterSnapshot,
        plan: &PassPlan,
        outcome: &PassOutcome,
        tunnel_id: Option<&str>,
    ) {
        for intent in route_status(plan, outcome) {
            if let Err(e) = self.deps.status.write_route_status(&intent).await {
                warn!(route = %intent.route, "Failed to update route status: {}", e);
            }
        }

        for intent in gateway_status(snapshot, plan, outcome, tunnel_id) {
            if let Err(e) = self.deps.status.write_gateway_status(&intent).await {
                warn!(gateway = %intent.gateway, "Failed to update Gateway status: {}", e);
            }
        }
    }
}
