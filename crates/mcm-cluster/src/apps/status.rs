use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use mcm_core::naming::{app_name_from_deployment, service_name};
use tracing::debug;

use super::model::{ANNO_AUTO_SCHEDULE, ANNO_PRIORITY, AppInfo, PodHost, STATUS_NOT_STABLE, STATUS_RUNNING};

/// Every replica counter equals the declared replica count.
pub fn is_stable(d: &Deployment) -> bool {
    let want = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = d.status.as_ref() else {
        return false;
    };
    [
        status.replicas,
        status.updated_replicas,
        status.ready_replicas,
        status.available_replicas,
    ]
    .iter()
    .all(|n| n.unwrap_or(0) == want)
}

pub fn pod_hosts(pods: &[Pod]) -> Vec<PodHost> {
    pods.iter()
        .filter_map(|pod| {
            let status = pod.status.as_ref();
            let pod_ip = status
                .and_then(|s| s.pod_ips.as_ref())
                .and_then(|ips| ips.first())
                .map(|ip| ip.ip.clone())
                .or_else(|| status.and_then(|s| s.pod_ip.clone()))
                .unwrap_or_default();
            let host_name = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default();
            let host_ip = status.and_then(|s| s.host_ip.clone()).unwrap_or_default();
            if pod_ip.is_empty() && host_name.is_empty() && host_ip.is_empty() {
                return None;
            }
            Some(PodHost {
                pod_ip,
                host_name,
                host_ip,
            })
        })
        .collect()
}

/// Host IPs of the pods. The master answers on node ports too, but only for
/// host-network pods.
pub fn node_port_ips(pods: &[Pod], master_ip: &str) -> Vec<String> {
    let mut ips: Vec<String> = pods
        .iter()
        .filter_map(|p| p.status.as_ref()?.host_ip.clone())
        .filter(|ip| !ip.is_empty())
        .collect();
    let host_network = pods
        .first()
        .and_then(|p| p.spec.as_ref())
        .and_then(|s| s.host_network)
        .unwrap_or(false);
    if !ips.is_empty() && host_network && !master_ip.is_empty() {
        ips.push(master_ip.to_string());
    }
    ips
}

fn int_or_string(v: &IntOrString) -> String {
    match v {
        IntOrString::Int(i) => i.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}

/// Compose the status of an application from its objects.
pub fn app_info(d: &Deployment, pods: &[Pod], service: Option<&Service>, master_ip: &str) -> AppInfo {
    let deploy_name = d.metadata.name.clone().unwrap_or_default();
    let app_name = app_name_from_deployment(&deploy_name).to_string();
    let annotations = d.metadata.annotations.clone().unwrap_or_default();

    let auto_scheduled = annotations
        .get(ANNO_AUTO_SCHEDULE)
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);
    let priority = annotations
        .get(ANNO_PRIORITY)
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or_else(|| {
            debug!(app = %app_name, "no priority annotation, using 0");
            0
        });

    let mut info = AppInfo {
        svc_name: service_name(&app_name),
        app_name,
        deploy_name,
        hosts: pod_hosts(pods),
        status: if is_stable(d) { STATUS_RUNNING } else { STATUS_NOT_STABLE }.to_string(),
        priority,
        auto_scheduled,
        ..Default::default()
    };

    if let Some(spec) = service.and_then(|s| s.spec.as_ref()) {
        info.cluster_ip = spec.cluster_ip.clone().unwrap_or_default();
        if spec.type_.as_deref() == Some("NodePort") {
            info.node_port_ip = node_port_ips(pods, master_ip);
        }
        for port in spec.ports.iter().flatten() {
            info.svc_port.push(port.port.to_string());
            info.node_port.push(port.node_port.unwrap_or(0).to_string());
            info.container_port
                .push(port.target_port.as_ref().map(int_or_string).unwrap_or_default());
        }
    }
    info
}
