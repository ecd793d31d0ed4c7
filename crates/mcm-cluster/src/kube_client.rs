use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use mcm_core::{McmError, Result};
use tracing::info;

use crate::api::ClusterApi;

/// [`ClusterApi`] over a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Connect with the kubeconfig at `path`.
    pub async fn connect(path: &Path, namespace: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| McmError::validation(format!("read kubeconfig {}: {}", path.display(), e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| McmError::validation(format!("load kubeconfig {}: {}", path.display(), e)))?;
        info!(cluster = %config.cluster_url, namespace, "connecting to orchestrator");
        let client = Client::try_from(config).map_err(map_kube_error)?;
        Ok(Self::from_client(client, namespace))
    }

    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map a client error onto the error kinds, keeping the server's message.
pub fn map_kube_error(e: kube::Error) -> McmError {
    match e {
        kube::Error::Api(resp) => {
            let msg = format!("{} ({})", resp.message, resp.reason);
            match resp.code {
                404 => McmError::NotFound(msg),
                409 => McmError::Conflict(msg),
                401 | 403 => McmError::Auth(msg),
                408 | 504 => McmError::Timeout(msg),
                _ => McmError::Backend(msg),
            }
        }
        kube::Error::SerdeError(e) => McmError::Backend(format!("malformed response: {}", e)),
        other => McmError::Network(other.to_string()),
    }
}

fn absent_ok<T>(r: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(map_kube_error(e)),
    }
}

fn node_name(node: &Node) -> Result<&str> {
    node.metadata
        .name
        .as_deref()
        .ok_or_else(|| McmError::validation("node object without a name"))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        absent_ok(self.nodes().get(name).await)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node_name(node)?;
        self.nodes()
            .replace(name, &PostParams::default(), node)
            .await
            .map_err(map_kube_error)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.nodes()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e).context(format!("delete node {}", name)))
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node)))
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.deployments()
            .create(&PostParams::default(), deployment)
            .await
            .map_err(map_kube_error)
    }

    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        absent_ok(self.deployments().get(name).await)
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let list = self
            .deployments()
            .list(&ListParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.deployments()
            .delete(name, &DeleteParams::foreground())
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.services()
            .create(&PostParams::default(), service)
            .await
            .map_err(map_kube_error)
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        absent_ok(self.services().get(name).await)
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.services()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }
}
