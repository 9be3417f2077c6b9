//! Status rendering and conflict-safe status writes
//!
//! Status is always fully recomputed. Writes are read-modify-write against the
//! object's current `resourceVersion`, retried a bounded number of times on
//! conflict. `lastTransitionTime` only moves when a condition's status flips, so
//! an unchanged pass renders byte-identical status and skips the write.

use async_trait::async_trait;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::experimental::grpcroutes::GRPCRoute;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt::Debug;
use tracing::{debug, warn};
use tunnel_common::plan::ListenerStatusIntent;
use tunnel_common::route::GATEWAY_API_GROUP;
use tunnel_common::{ConditionIntent, GatewayStatusIntent, RouteKind, RouteStatusIntent};

/// Field manager recorded on status patches
pub const FIELD_MANAGER: &str = "tunnel-gateway-controller";

/// Current time in the format used by `lastTransitionTime`
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn find_condition<'a>(existing: &'a [Value], type_: &str) -> Option<&'a Value> {
    existing
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

/// Render conditions, keeping `lastTransitionTime` of conditions whose status is unchanged
pub fn render_conditions(
    intents: &[ConditionIntent],
    existing: &[Value],
    generation: Option<i64>,
    now: &str,
) -> Vec<Value> {
    intents
        .iter()
        .map(|intent| {
            let last_transition = find_condition(existing, &intent.type_)
                .filter(|prev| prev.get("status").and_then(Value::as_str) == Some(intent.status_str()))
                .and_then(|prev| prev.get("lastTransitionTime").and_then(Value::as_str))
                .unwrap_or(now);

            let mut condition = Map::new();
            condition.insert("type".to_string(), json!(intent.type_));
            condition.insert("status".to_string(), json!(intent.status_str()));
            condition.insert("reason".to_string(), json!(intent.reason));
            condition.insert("message".to_string(), json!(intent.message));
            condition.insert("lastTransitionTime".to_string(), json!(last_transition));
            if let Some(generation) = generation {
                condition.insert("observedGeneration".to_string(), json!(generation));
            }
            Value::Object(condition)
        })
        .collect()
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Render `status.parents` of a route
///
/// Entries written by other controllers are kept in place; this controller's
/// entries are replaced by the intent. An intent without parents removes them all.
pub fn render_route_status(
    controller_name: &str,
    intent: &RouteStatusIntent,
    existing: &Value,
    now: &str,
) -> Value {
    let existing_parents = array(existing, "parents");

    let mut parents: Vec<Value> = existing_parents
        .iter()
        .filter(|p| p.get("controllerName").and_then(Value::as_str) != Some(controller_name))
        .cloned()
        .collect();

    for parent in &intent.parents {
        let parent_ref = serde_json::to_value(&parent.parent_ref).unwrap_or(Value::Null);
        let previous = existing_parents.iter().find(|p| {
            p.get("controllerName").and_then(Value::as_str) == Some(controller_name)
                && p.get("parentRef") == Some(&parent_ref)
        });
        let previous_conditions = previous.map(|p| array(p, "conditions")).unwrap_or(&[]);

        parents.push(json!({
            "parentRef": parent_ref,
            "controllerName": controller_name,
            "conditions": render_conditions(&parent.conditions, previous_conditions, intent.generation, now),
        }));
    }

    json!({ "parents": parents })
}

fn render_listener(listener: &ListenerStatusIntent, existing: &[Value], generation: Option<i64>, now: &str) -> Value {
    let previous = existing
        .iter()
        .find(|l| l.get("name").and_then(Value::as_str) == Some(listener.name.as_str()));
    let previous_conditions = previous.map(|l| array(l, "conditions")).unwrap_or(&[]);

    let supported_kinds: Vec<Value> = listener
        .supported_kinds
        .iter()
        .map(|kind| json!({"group": GATEWAY_API_GROUP, "kind": kind.as_str()}))
        .collect();

    json!({
        "name": listener.name,
        "attachedRoutes": listener.attached_routes,
        "supportedKinds": supported_kinds,
        "conditions": render_conditions(&listener.conditions, previous_conditions, generation, now),
    })
}

/// Render the status of a Gateway
pub fn render_gateway_status(intent: &GatewayStatusIntent, existing: &Value, now: &str) -> Value {
    let listeners: Vec<Value> = intent
        .listeners
        .iter()
        .map(|l| render_listener(l, array(existing, "listeners"), intent.generation, now))
        .collect();

    // Always present: a merge patch leaves out-of-date addresses behind otherwise
    let addresses = match &intent.address {
        Some(address) => json!([{"type": "Hostname", "value": address}]),
        None => json!([]),
    };

    let mut status = Map::new();
    status.insert("addresses".to_string(), addresses);
    status.insert(
        "conditions".to_string(),
        Value::Array(render_conditions(
            &intent.conditions,
            array(existing, "conditions"),
            intent.generation,
            now,
        )),
    );
    status.insert("listeners".to_string(), Value::Array(listeners));
    Value::Object(status)
}

/// Writes status computed by a sync pass
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_route_status(&self, intent: &RouteStatusIntent) -> Result<(), kube::Error>;

    async fn write_gateway_status(&self, intent: &GatewayStatusIntent) -> Result<(), kube::Error>;
}

/// Status writer backed by the Kubernetes API
pub struct KubeStatusWriter {
    client: Client,
    controller_name: String,
    retries: u32,
}

impl KubeStatusWriter {
    pub fn new(client: Client, controller_name: impl Into<String>, retries: u32) -> Self {
        Self {
            client,
            controller_name: controller_name.into(),
            retries,
        }
    }

    /// Read-modify-write `status` of one object, retrying on conflict
    async fn update_status<K, F>(&self, api: Api<K>, name: &str, render: F) -> Result<(), kube::Error>
    where
        K: Resource + Clone + Debug + Serialize + DeserializeOwned,
        F: Fn(&Value) -> Value,
    {
        let mut attempt = 0;
        loop {
            let current = match api.get_status(name).await {
                Ok(obj) => obj,
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!("{} no longer exists, skipping status write", name);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let resource_version = current.resource_version();
            let current_status = serde_json::to_value(&current)
                .map_err(kube::Error::SerdeError)?
                .get("status")
                .cloned()
                .unwrap_or(Value::Null);

            let desired = render(&current_status);
            if desired == current_status {
                debug!("Status of {} unchanged", name);
                return Ok(());
            }

            let patch = json!({
                "metadata": { "resourceVersion": resource_version },
                "status": desired,
            });

            match api
                .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(e)) if e.code == 409 && attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, "Status conflict on {}, retrying", name);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_route_status(&self, intent: &RouteStatusIntent) -> Result<(), kube::Error> {
        let namespace = &intent.route.namespace;
        let name = &intent.route.name;
        let now = now();
        let render = |existing: &Value| {
            let mut status = existing.as_object().cloned().unwrap_or_default();
            let rendered = render_route_status(&self.controller_name, intent, existing, &now);
            status.insert("parents".to_string(), rendered["parents"].clone());
            Value::Object(status)
        };

        match intent.route.kind {
            RouteKind::Http => {
                let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), namespace);
                self.update_status(api, name, render).await
            }
            RouteKind::Grpc => {
                let api: Api<GRPCRoute> = Api::namespaced(self.client.clone(), namespace);
                self.update_status(api, name, render).await
            }
        }
    }

    async fn write_gateway_status(&self, intent: &GatewayStatusIntent) -> Result<(), kube::Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), &intent.gateway.namespace);
        let now = now();
        self.update_status(api, &intent.gateway.name, |existing| {
            render_gateway_status(intent, existing, &now)
        })
        .await
    }
}
