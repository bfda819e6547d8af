pub mod service;

use std::path::PathBuf;

use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use crate::Result;
use crate::reconcile::{EndpointSnapshot, Service};

/// Source of the desired snapshot, listed afresh every cycle.
pub trait DesiredState: Send + Sync {
    /// Services that carry a tunnel IP.
    fn services(&self) -> impl Future<Output = Result<ahash::HashSet<Service>>> + Send;

    /// Backends of each of `services`. Every requested service is present
    /// in the result, with an empty set when it has no ready backends.
    fn endpoints(
        &self,
        services: &ahash::HashSet<Service>,
    ) -> impl Future<Output = Result<EndpointSnapshot>> + Send;
}

/// Desired state read from the Kubernetes API.
pub struct KubeState {
    client: kube::Client,
    annotation: String,
    name_limit: Option<usize>,
    node_name: String,
    netns_dir: PathBuf,
}

impl KubeState {
    pub fn new(
        client: kube::Client,
        annotation: impl Into<String>,
        name_limit: Option<usize>,
        node_name: impl Into<String>,
        netns_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            annotation: annotation.into(),
            name_limit,
            node_name: node_name.into(),
            netns_dir: netns_dir.into(),
        }
    }
}

impl DesiredState for KubeState {
    async fn services(&self) -> Result<ahash::HashSet<Service>> {
        let api: Api<KubeService> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        let services =
            service::managed_services(&list.items, &self.annotation, self.name_limit);
        debug!(
            listed = list.items.len(),
            managed = services.len(),
            "listed services"
        );
        Ok(services)
    }

    async fn endpoints(&self, services: &ahash::HashSet<Service>) -> Result<EndpointSnapshot> {
        let api: Api<EndpointSlice> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(service::endpoints_by_service(
            &list.items,
            services,
            &self.node_name,
            &self.netns_dir,
        ))
    }
}
