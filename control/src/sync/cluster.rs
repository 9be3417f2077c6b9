//! Cluster state read at the start of every pass

use crate::apis::gateway::route_adapter::{gateway_class_of, gateway_info, grant_info, RouteObject};
use async_trait::async_trait;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::experimental::grpcroutes::GRPCRoute;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;
use tunnel_common::{ClusterSnapshot, RouteInfo};

/// Reads the objects a pass is computed from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Gateways of `gateway_class`, every route referencing a Gateway or carrying
    /// parent status, and all ReferenceGrants
    async fn snapshot(&self, gateway_class: &str) -> Result<ClusterSnapshot, kube::Error>;
}

/// Lists objects straight from the API server
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_routes<K: RouteObject>(&self) -> Result<Vec<RouteInfo>, kube::Error> {
        let api: Api<K> = Api::all(self.client.clone());
        let objects = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            // Route CRD not installed
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("{} not served by the API server, skipping", K::KIND.as_str());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        // Routes that dropped every Gateway parent may still carry our status
        Ok(objects
            .iter()
            .filter(|route| route.references_gateway() || route.has_parent_status())
            .map(K::to_route_info)
            .collect())
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn snapshot(&self, gateway_class: &str) -> Result<ClusterSnapshot, kube::Error> {
        let gateways: Api<Gateway> = Api::all(self.client.clone());
        let gateways = gateways
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter(|gw| gateway_class_of(gw) == gateway_class)
            .map(gateway_info)
            .collect();

        let mut routes = self.list_routes::<HTTPRoute>().await?;
        routes.extend(self.list_routes::<GRPCRoute>().await?);

        let grants: Api<ReferenceGrant> = Api::all(self.client.clone());
        let grants = grants
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(grant_info)
            .collect();

        let snapshot = ClusterSnapshot {
            gateways,
            routes,
            grants,
        };
        debug!(
            gateways = snapshot.gateways.len(),
            routes = snapshot.routes.len(),
            grants = snapshot.grants.len(),
            "Read cluster snapshot"
        );
        Ok(snapshot)
    }
}
