//! Application engine: declarative apps mapped onto a deployment and service.

pub mod build;
pub mod model;
pub mod status;

use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;
use mcm_core::config::ManagerConfig;
use mcm_core::naming::{app_name_from_deployment, deployment_name, service_name};
use mcm_core::wait::{WaitConfig, wait_for};
use mcm_core::{McmError, Result, ResultExt};
use tracing::{debug, info, instrument, warn};

use crate::api::ClusterApi;
use build::{app_selector, build_deployment, build_service, validate_app};
use model::{AppInfo, K8sApp};
use status::app_info;

pub struct AppEngine {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    master_ip: String,
    delete_wait: WaitConfig,
}

impl AppEngine {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        master_ip: impl Into<String>,
        delete_wait: WaitConfig,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            master_ip: master_ip.into(),
            delete_wait,
        }
    }

    pub fn from_config(config: &ManagerConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        Self::new(
            cluster,
            config.cluster.namespace.clone(),
            config.cluster.master_ip.clone(),
            config.timeouts.app_delete(),
        )
    }

    /// Create the deployment and, when a port is published, the service.
    ///
    /// The service is built before anything is written so a bad port spec
    /// leaves the cluster untouched.
    #[instrument(skip_all, fields(app = %app.name))]
    pub async fn create_application(&self, app: &K8sApp) -> Result<()> {
        validate_app(app)?;
        let service = build_service(app, &self.namespace)?;
        let deployment = build_deployment(app, &self.namespace);

        self.cluster
            .create_deployment(&deployment)
            .await
            .context_with(|| format!("create deployment for {}", app.name))?;
        info!(replicas = app.replicas, "deployment created");

        if let Some(service) = service {
            self.cluster
                .create_service(&service)
                .await
                .context_with(|| format!("create service for {}", app.name))?;
            info!("service created");
        }
        Ok(())
    }

    async fn info_for(&self, deployment: &Deployment) -> Result<AppInfo> {
        let deploy = deployment.metadata.name.clone().unwrap_or_default();
        let app = app_name_from_deployment(&deploy);
        let pods = self.cluster.list_pods(&app_selector(app)).await?;
        let service = self.cluster.get_service(&service_name(app)).await?;
        Ok(app_info(deployment, &pods, service.as_ref(), &self.master_ip))
    }

    /// Every application in the namespace. An app whose pods or service
    /// cannot be read is logged and left out; the others are still listed.
    pub async fn list_applications(&self) -> Result<Vec<AppInfo>> {
        let deployments = self.cluster.list_deployments().await?;
        let infos = join_all(deployments.iter().map(|d| self.info_for(d))).await;
        Ok(deployments
            .iter()
            .zip(infos)
            .filter_map(|(d, info)| match info {
                Ok(info) => Some(info),
                Err(e) => {
                    let deploy = d.metadata.name.as_deref().unwrap_or_default();
                    warn!(deployment = deploy, error = %e, "skipping application");
                    None
                }
            })
            .collect())
    }

    pub async fn get_application(&self, name: &str) -> Result<AppInfo> {
        let deployment = self
            .cluster
            .get_deployment(&deployment_name(name))
            .await?
            .ok_or_else(|| McmError::not_found(format!("application {}", name)))?;
        self.info_for(&deployment).await
    }

    /// Delete the deployment and the service, then wait for the pods to go.
    /// Deleting an application that is already gone succeeds.
    #[instrument(skip(self))]
    pub async fn delete_application(&self, name: &str) -> Result<()> {
        match self.cluster.delete_deployment(&deployment_name(name)).await {
            Err(e) if e.is_not_found() => debug!("no deployment to delete"),
            other => other?,
        }
        match self.cluster.delete_service(&service_name(name)).await {
            Err(e) if e.is_not_found() => debug!("no service to delete"),
            other => other?,
        }

        let selector = app_selector(name);
        let label = format!("pods of {} to terminate", name);
        let cluster = self.cluster.as_ref();
        let selector = selector.as_str();
        wait_for(&label, self.delete_wait, || async move {
            let left = cluster.list_pods(selector).await?.len();
            if left > 0 {
                debug!(left, "pods still terminating");
            }
            Ok(left == 0)
        })
        .await?;
        info!("application deleted");
        Ok(())
    }

    /// Wait until every replica counter of the app matches its declared
    /// replicas. A missing app fails right away.
    pub async fn wait_for_app_running(&self, name: &str, wait: WaitConfig) -> Result<()> {
        let label = format!("application {} to run", name);
        wait_for(&label, wait, || async move {
            match self.get_application(name).await {
                Ok(info) => Ok(info.is_running()),
                Err(e) if e.is_not_found() => Err(e),
                Err(e) => {
                    warn!(app = name, error = %e, "status check failed, polling again");
                    Ok(false)
                }
            }
        })
        .await
    }
}
