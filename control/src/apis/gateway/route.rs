//! HTTPRoute and GRPCRoute controllers
//!
//! One reconciler, instantiated per route kind. A route change of any kind
//! triggers a full resync; binding and rule generation happen in the pass.

use crate::apis::gateway::route_adapter::RouteObject;
use crate::apis::metrics::record_reconciliation;
use crate::error::ControllerError;
use crate::sync::{SyncOrchestrator, Trigger};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Route reconciler for one route kind
pub struct RouteReconciler<K> {
    client: Client,
    orchestrator: Arc<SyncOrchestrator>,
    _kind: PhantomData<fn() -> K>,
}

/// Requeue policy for route triggers
///
/// The Gateway controller owns the periodic resync, so a route that synced
/// successfully waits for its next change.
fn route_action(orchestrator: &SyncOrchestrator, result: &Trigger) -> Action {
    match result {
        Trigger::Completed(outcome) if outcome.is_success() => Action::await_change(),
        other => orchestrator.next_action(other),
    }
}

impl<K: RouteObject> RouteReconciler<K> {
    pub fn new(client: Client, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            client,
            orchestrator,
            _kind: PhantomData,
        }
    }

    async fn reconcile(route: Arc<K>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let kind = K::KIND.as_str();
        let namespace = route.namespace().unwrap_or_default();
        let name = route.name_any();

        // Routes without a Gateway parent may have just dropped ours; resync anyway
        debug!(
            references_gateway = route.references_gateway(),
            "Reconciling {} {}/{}",
            kind,
            namespace,
            name
        );

        let result = ctx
            .orchestrator
            .trigger(&format!("{} {}/{}", kind, namespace, name))
            .await?;

        let label = match &result {
            Trigger::Deferred => "deferred",
            Trigger::Completed(outcome) => outcome.label(),
        };
        record_reconciliation(kind, label);

        Ok(route_action(&ctx.orchestrator, &result))
    }

    fn error_policy(route: Arc<K>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        error!(
            "{} {}/{} reconciliation error: {}",
            K::KIND.as_str(),
            route.namespace().unwrap_or_default(),
            route.name_any(),
            error
        );
        record_reconciliation(K::KIND.as_str(), "error");
        ctx.orchestrator.retry_action()
    }

    /// Start the controller for this route kind
    pub async fn run(self) -> Result<(), kube::Error> {
        let api: Api<K> = Api::all(self.client.clone());
        let orchestrator = self.orchestrator.clone();
        let ctx = Arc::new(self);

        info!("Starting {} controller", K::KIND.as_str());

        Controller::new(api, WatcherConfig::default())
            .run(Self::reconcile, Self::error_policy, ctx)
            .for_each(move |res| {
                match res {
                    Ok(o) => debug!("Reconciled {}: {:?}", K::KIND.as_str(), o.0),
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        orchestrator.spawn_deleted_resync(format!("{} {} deleted", K::KIND.as_str(), obj));
                    }
                    Err(e) => error!("{} reconciliation error: {:?}", K::KIND.as_str(), e),
                }
                futures::future::ready(())
            })
            .await;

        Ok(())
    }
}
