use futures::future::join_all;
use mcm_core::vm::{IaasVm, ResourceStatus};
use mcm_core::{McmError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{CloudRegistry, Iaas};

/// Summary of one configured cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub cloud_type: String,
    pub web_url: String,
    pub resources: ResourceStatus,
}

/// A cloud together with the VMs it currently runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDetail {
    #[serde(flatten)]
    pub info: CloudInfo,
    pub vms: Vec<IaasVm>,
}

async fn describe(cloud: &dyn Iaas) -> (CloudInfo, Option<McmError>) {
    let (resources, err) = match cloud.check_resources().await {
        Ok(r) => (r, None),
        Err(e) => {
            warn!(cloud = cloud.name(), error = %e, "resource check failed");
            (
                ResourceStatus::unknown(),
                Some(e.context(format!("check resources of cloud {}", cloud.name()))),
            )
        }
    };
    let info = CloudInfo {
        name: cloud.name().to_string(),
        cloud_type: cloud.cloud_type().to_string(),
        web_url: cloud.web_url(),
        resources,
    };
    (info, err)
}

/// Every cloud, with quotas checked in parallel. A cloud whose check fails
/// is still listed, with unknown resources, and its error is returned too.
pub async fn list_clouds(registry: &CloudRegistry) -> (Vec<CloudInfo>, Option<McmError>) {
    let described = join_all(registry.iter().map(|c| describe(c.as_ref()))).await;
    let mut infos = Vec::with_capacity(described.len());
    let mut errors = Vec::new();
    for (info, err) in described {
        infos.push(info);
        errors.extend(err);
    }
    (infos, mcm_core::aggregate::aggregate(errors))
}

/// One cloud with its VMs. Quota and listing run concurrently; a failure of
/// either is returned alongside whatever the other produced.
pub async fn get_cloud(registry: &CloudRegistry, name: &str) -> Result<(CloudDetail, Option<McmError>)> {
    let cloud = registry.require(name)?;
    let ((info, quota_err), vms) = tokio::join!(describe(cloud.as_ref()), cloud.list_all_vms());

    let mut errors: Vec<McmError> = quota_err.into_iter().collect();
    let vms = vms.unwrap_or_else(|e| {
        warn!(cloud = name, error = %e, "listing vms failed");
        errors.push(e.context(format!("list vms of cloud {}", name)));
        Vec::new()
    });
    Ok((CloudDetail { info, vms }, mcm_core::aggregate::aggregate(errors)))
}
