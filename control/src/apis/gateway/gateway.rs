//! Gateway controller
//!
//! Reconciles Gateways of our GatewayClass. Every reconcile is a resync trigger.
//! ReferenceGrants, the configuration CRD and credential Secrets have no
//! controller of their own: their changes are mapped onto our Gateways.

use crate::apis::gateway::route_adapter::gateway_class_of;
use crate::apis::gateway::secret_watcher::WatchedSecrets;
use crate::apis::metrics::record_reconciliation;
use crate::credentials::GatewayClassConfig;
use crate::error::ControllerError;
use crate::sync::{SyncOrchestrator, Trigger};
use futures::StreamExt;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info};

const KIND: &str = "Gateway";

/// Gateway reconciler
pub struct GatewayReconciler {
    client: Client,
    orchestrator: Arc<SyncOrchestrator>,
    watched_secrets: Arc<WatchedSecrets>,
}

/// References to every cached Gateway of `class`
fn our_gateways(store: &Store<Gateway>, class: &str) -> Vec<ObjectRef<Gateway>> {
    store
        .state()
        .iter()
        .filter(|gw| gateway_class_of(gw) == class)
        .map(|gw| ObjectRef::from_obj(gw.as_ref()))
        .collect()
}

impl GatewayReconciler {
    pub fn new(
        client: Client,
        orchestrator: Arc<SyncOrchestrator>,
        watched_secrets: Arc<WatchedSecrets>,
    ) -> Self {
        Self {
            client,
            orchestrator,
            watched_secrets,
        }
    }

    /// Check if this Gateway references our GatewayClass
    fn should_reconcile(&self, gateway: &Gateway) -> bool {
        gateway_class_of(gateway) == self.orchestrator.gateway_class()
    }

    async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let namespace = gateway.namespace().unwrap_or_default();
        let name = gateway.name_any();

        if !ctx.should_reconcile(&gateway) {
            debug!(
                "Gateway {}/{} references GatewayClass '{}', ignoring",
                namespace,
                name,
                gateway_class_of(&gateway)
            );
            return Ok(Action::await_change());
        }

        debug!(listeners = gateway.spec.listeners.len(), "Reconciling Gateway {}/{}", namespace, name);

        let result = ctx
            .orchestrator
            .trigger(&format!("{} {}/{}", KIND, namespace, name))
            .await?;

        let label = match &result {
            Trigger::Deferred => "deferred",
            Trigger::Completed(outcome) => outcome.label(),
        };
        record_reconciliation(KIND, label);

        Ok(ctx.orchestrator.next_action(&result))
    }

    fn error_policy(gateway: Arc<Gateway>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        error!(
            "Gateway {}/{} reconciliation error: {}",
            gateway.namespace().unwrap_or_default(),
            gateway.name_any(),
            error
        );
        record_reconciliation(KIND, "error");
        ctx.orchestrator.retry_action()
    }

    /// Start the Gateway controller
    pub async fn run(self) -> Result<(), kube::Error> {
        let client = self.client.clone();
        let class = self.orchestrator.gateway_class().to_string();
        let orchestrator = self.orchestrator.clone();
        let watched_secrets = self.watched_secrets.clone();
        let ctx = Arc::new(self);

        info!(gateway_class = %class, "Starting Gateway controller");

        let controller = Controller::new(Api::<Gateway>::all(client.clone()), WatcherConfig::default());
        let store = controller.store();

        let grant_mapper = {
            let (store, class) = (store.clone(), class.clone());
            move |_: ReferenceGrant| our_gateways(&store, &class)
        };
        let config_mapper = {
            let (store, class) = (store.clone(), class.clone());
            move |_: GatewayClassConfig| our_gateways(&store, &class)
        };
        let secret_mapper = move |secret: Secret| {
            if watched_secrets.is_watched(&secret) {
                info!("Credential Secret {}/{} changed", secret.namespace().unwrap_or_default(), secret.name_any());
                our_gateways(&store, &class)
            } else {
                Vec::new()
            }
        };

        controller
            .watches(Api::<ReferenceGrant>::all(client.clone()), WatcherConfig::default(), grant_mapper)
            .watches(Api::<GatewayClassConfig>::all(client.clone()), WatcherConfig::default(), config_mapper)
            .watches(Api::<Secret>::all(client), WatcherConfig::default(), secret_mapper)
            .run(Self::reconcile, Self::error_policy, ctx)
            .for_each(move |res| {
                match res {
                    Ok(o) => debug!("Reconciled Gateway: {:?}", o.0),
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        orchestrator.spawn_deleted_resync(format!("{} {} deleted", KIND, obj));
                    }
                    Err(e) => error!("Reconciliation error: {:?}", e),
                }
                futures::future::ready(())
            })
            .await;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kube::runtime::reflector;
    use kube::runtime::watcher;
    use serde_json::json;

    fn gateway(namespace: &str, name: &str, class: &str) -> Gateway {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": {"name": name, "namespace": namespace},
            "spec": {
                "gatewayClassName": class,
                "listeners": [{"name": "http", "port": 80, "protocol": "HTTP"}]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_mapper_targets_only_our_gateways() {
        let (reader, mut writer) = reflector::store::<Gateway>();
        writer.apply_watcher_event(&watcher::Event::Apply(gateway("edge", "gw", "tunnel")));
        writer.apply_watcher_event(&watcher::Event::Apply(gateway("edge", "nginx", "nginx")));
        writer.apply_watcher_event(&watcher::Event::Apply(gateway("apps", "gw2", "tunnel")));

        let mut refs: Vec<String> = our_gateways(&reader, "tunnel")
            .iter()
            .map(|r| format!("{}/{}", r.namespace.clone().unwrap_or_default(), r.name))
            .collect();
        refs.sort();
        assert_eq!(refs, vec!["apps/gw2", "edge/gw"]);
    }

    #[test]
    fn test_mapper_empty_store() {
        let (reader, _writer) = reflector::store::<Gateway>();
        assert!(our_gateways(&reader, "tunnel").is_empty());
    }
}
