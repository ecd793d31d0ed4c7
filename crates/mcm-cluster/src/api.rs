use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use mcm_core::Result;

/// The orchestrator operations the controller and the application engine use.
///
/// Deployments, services and selector-matched pods live in the configured
/// namespace; nodes are cluster-wide. `get_*` answer `None` for absent
/// objects, `delete_*` fail with `NotFound`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Replace the node object. Fails with `Conflict` when its resource
    /// version is stale.
    async fn replace_node(&self, node: &Node) -> Result<Node>;

    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Pods matching a label selector such as `app=web`.
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    /// Pods of every namespace scheduled on `node`.
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>>;

    async fn list_deployments(&self) -> Result<Vec<Deployment>>;

    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn get_service(&self, name: &str) -> Result<Option<Service>>;

    async fn delete_service(&self, name: &str) -> Result<()>;
}
