//! GatewayClass controller
//!
//! Accepts GatewayClasses with our controllerName once their parametersRef
//! resolves to a usable configuration.

use crate::apis::gateway::status::{self, FIELD_MANAGER};
use crate::apis::metrics::record_reconciliation;
use crate::credentials::{ConfigResolver, GatewayClassConfig, ResolvedConfig};
use crate::error::{ConfigError, ControllerError};
use crate::sync::SyncOrchestrator;
use futures::StreamExt;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tunnel_common::ConditionIntent;

const KIND: &str = "GatewayClass";

/// GatewayClass reconciler
pub struct GatewayClassReconciler {
    client: Client,
    controller_name: String,
    resolver: Arc<dyn ConfigResolver>,
    orchestrator: Arc<SyncOrchestrator>,
}

/// `Accepted` condition for a resolution result
pub fn accepted_condition(
    controller_name: &str,
    resolved: &Result<ResolvedConfig, ConfigError>,
) -> ConditionIntent {
    match resolved {
        Ok(_) => ConditionIntent::new(
            "Accepted",
            true,
            "Accepted",
            format!("GatewayClass is accepted by controller {}", controller_name),
        ),
        Err(e) => ConditionIntent::new(
            "Accepted",
            false,
            "InvalidParameters",
            format!("GatewayClass parameters are invalid: {}", e),
        ),
    }
}

/// Classes of ours whose parametersRef names `config_name`
fn classes_using(
    store: &Store<GatewayClass>,
    controller_name: &str,
    config_name: &str,
) -> Vec<ObjectRef<GatewayClass>> {
    store
        .state()
        .iter()
        .filter(|class| class.spec.controller_name == controller_name)
        .filter(|class| {
            class
                .spec
                .parameters_ref
                .as_ref()
                .is_some_and(|p| p.name == config_name)
        })
        .map(|class| ObjectRef::from_obj(class.as_ref()))
        .collect()
}

impl GatewayClassReconciler {
    pub fn new(
        client: Client,
        controller_name: impl Into<String>,
        resolver: Arc<dyn ConfigResolver>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            client,
            controller_name: controller_name.into(),
            resolver,
            orchestrator,
        }
    }

    /// Check if a GatewayClass should be accepted by this controller
    pub fn should_accept(&self, controller_name: &str) -> bool {
        controller_name == self.controller_name
    }

    async fn reconcile(class: Arc<GatewayClass>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let name = class.name_any();

        if !ctx.should_accept(&class.spec.controller_name) {
            debug!(
                "GatewayClass {} has controllerName '{}', ignoring",
                name, class.spec.controller_name
            );
            return Ok(Action::await_change());
        }

        let resolved = ctx.resolver.resolve(&name).await;
        if let Err(e) = &resolved {
            warn!("GatewayClass {} parameters are invalid: {}", name, e);
        }
        let condition = accepted_condition(&ctx.controller_name, &resolved);
        ctx.set_accepted_status(&class, &condition).await?;
        record_reconciliation(KIND, if condition.status { "accepted" } else { "invalid" });

        // parametersRef may now point elsewhere
        if name == ctx.orchestrator.gateway_class() {
            let result = ctx.orchestrator.trigger(&format!("{} {}", KIND, name)).await?;
            return Ok(ctx.orchestrator.next_action(&result));
        }

        Ok(Action::await_change())
    }

    async fn set_accepted_status(
        &self,
        class: &GatewayClass,
        condition: &ConditionIntent,
    ) -> Result<(), kube::Error> {
        let name = class.name_any();
        let existing: Vec<Value> = class
            .status
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok())
            .and_then(|s| s.get("conditions").and_then(Value::as_array).cloned())
            .unwrap_or_default();

        let conditions = status::render_conditions(
            std::slice::from_ref(condition),
            &existing,
            class.metadata.generation,
            &status::now(),
        );
        if conditions == existing {
            debug!("GatewayClass {} status unchanged", name);
            return Ok(());
        }

        let api: Api<GatewayClass> = Api::all(self.client.clone());
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&json!({ "status": { "conditions": conditions } })),
        )
        .await?;

        info!(
            "Updated GatewayClass {} status: accepted={}",
            name, condition.status
        );
        Ok(())
    }

    fn error_policy(class: Arc<GatewayClass>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        error!("GatewayClass {} reconciliation error: {}", class.name_any(), error);
        record_reconciliation(KIND, "error");
        ctx.orchestrator.retry_action()
    }

    /// Start the GatewayClass controller
    pub async fn run(self) -> Result<(), kube::Error> {
        let client = self.client.clone();
        let controller_name = self.controller_name.clone();
        let ctx = Arc::new(self);

        info!("Starting GatewayClass controller");

        let controller = Controller::new(Api::<GatewayClass>::all(client.clone()), WatcherConfig::default());
        let store = controller.store();

        controller
            .watches(
                Api::<GatewayClassConfig>::all(client),
                WatcherConfig::default(),
                move |config: GatewayClassConfig| classes_using(&store, &controller_name, &config.name_any()),
            )
            .run(Self::reconcile, Self::error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled GatewayClass: {:?}", o.0),
                    Err(e) => error!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}
