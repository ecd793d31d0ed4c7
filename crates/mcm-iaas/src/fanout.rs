use std::sync::Arc;

use futures::future::join_all;
use mcm_core::aggregate::BatchResult;
use mcm_core::vm::{IaasVm, group_vms_by_cloud};
use mcm_core::{McmError, Result};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{CloudRegistry, Iaas};

/// Create every VM in `specs`, one task per cloud.
///
/// Specs of one cloud are created one after another (Proxmox cannot clone
/// in parallel on one host); clouds run in parallel. Only `cloud`, `name`,
/// `vcpu`, `ram` and `storage` of each spec are read.
pub async fn create_vms(registry: &CloudRegistry, specs: Vec<IaasVm>) -> BatchResult<IaasVm> {
    let total = specs.len();
    let mut batch = BatchResult::default();
    let mut set = JoinSet::new();

    for (cloud_name, group) in group_vms_by_cloud(specs) {
        let Some(cloud) = registry.get(&cloud_name) else {
            for spec in group {
                batch.record(Err(McmError::not_found(format!(
                    "cloud {:?} of vm {} is not configured",
                    cloud_name, spec.name
                ))));
            }
            continue;
        };
        set.spawn(create_serially(cloud, group));
    }

    join_batches(&mut set, &mut batch).await;
    pad_lost(&mut batch, total, "create");
    info!(
        created = batch.success_count(),
        failed = batch.failure_count(),
        "vm creation finished"
    );
    batch
}

async fn create_serially(cloud: Arc<dyn Iaas>, specs: Vec<IaasVm>) -> BatchResult<IaasVm> {
    let mut batch = BatchResult::default();
    for spec in specs {
        info!(cloud = cloud.name(), vm = %spec.name, "creating vm");
        let outcome = cloud
            .create_vm(
                &spec.name,
                spec.vcpu.max(1.0) as u32,
                spec.ram.max(0.0) as u64,
                spec.storage.max(0.0) as u64,
            )
            .await
            .map_err(|e| e.context(format!("create vm {} on cloud {}", spec.name, cloud.name())));
        if let Err(e) = &outcome {
            warn!(cloud = cloud.name(), vm = %spec.name, error = %e, "vm creation failed");
        }
        batch.record(outcome);
    }
    batch
}

/// Delete every VM in `vms` by id, grouped per cloud like [`create_vms`].
/// Successes are the names of the deleted VMs.
pub async fn delete_vms(registry: &CloudRegistry, vms: Vec<IaasVm>) -> BatchResult<String> {
    let total = vms.len();
    let mut batch = BatchResult::default();
    let mut set = JoinSet::new();

    for (cloud_name, group) in group_vms_by_cloud(vms) {
        let Some(cloud) = registry.get(&cloud_name) else {
            for vm in group {
                batch.record(Err(McmError::not_found(format!(
                    "cloud {:?} of vm {} is not configured",
                    cloud_name, vm.name
                ))));
            }
            continue;
        };
        set.spawn(async move {
            let mut batch = BatchResult::default();
            for vm in group {
                info!(cloud = cloud.name(), vm = %vm.name, "deleting vm");
                let outcome = cloud
                    .delete_vm(&vm.id)
                    .await
                    .map(|()| vm.name.clone())
                    .map_err(|e| e.context(format!("delete vm {} on cloud {}", vm.name, cloud.name())));
                batch.record(outcome);
            }
            batch
        });
    }

    join_batches(&mut set, &mut batch).await;
    pad_lost(&mut batch, total, "delete");
    batch
}

/// Every VM of every cloud. Failed clouds land in `failed` and do not hide
/// the VMs of the others.
pub async fn list_vms_all_clouds(registry: &CloudRegistry) -> BatchResult<IaasVm> {
    let lists = join_all(registry.iter().map(|cloud| async move {
        cloud
            .list_all_vms()
            .await
            .map_err(|e| e.context(format!("list vms of cloud {}", cloud.name())))
    }))
    .await;

    let mut batch = BatchResult::default();
    for list in lists {
        match list {
            Ok(vms) => batch.succeeded.extend(vms),
            Err(e) => {
                warn!(error = %e, "listing vms failed");
                batch.failed.push(e);
            }
        }
    }
    batch
}

/// VMs whose name starts with `prefix`, across all clouds. Any cloud failing
/// fails the whole call.
pub async fn list_vms_name_prefix(registry: &CloudRegistry, prefix: &str) -> Result<Vec<IaasVm>> {
    let (vms, err) = list_vms_all_clouds(registry).await.into_parts();
    if let Some(e) = err {
        return Err(e);
    }
    Ok(vms.into_iter().filter(|vm| vm.name.starts_with(prefix)).collect())
}

async fn join_batches<T: 'static>(set: &mut JoinSet<BatchResult<T>>, batch: &mut BatchResult<T>) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(part) => batch.merge(part),
            Err(e) => warn!(error = %e, "fan-out task aborted"),
        }
    }
}

/// An aborted task loses its outcomes; count each lost input as a failure so
/// the totals still add up.
fn pad_lost<T>(batch: &mut BatchResult<T>, total: usize, what: &str) {
    for _ in batch.total()..total {
        batch
            .failed
            .push(McmError::backend(format!("{} task aborted before reporting", what)));
    }
}
