use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use serde::{Deserialize, Serialize};

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 10;

pub const STATUS_RUNNING: &str = "Stable Running";
pub const STATUS_NOT_STABLE: &str = "Not Yet Stable";

/// Reserved workload annotations.
pub const ANNO_AUTO_SCHEDULE: &str = "auto-schedule";
pub const ANNO_PRIORITY: &str = "priority";

/// Declarative description of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sApp {
    pub name: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default)]
    pub containers: Vec<K8sContainer>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub auto_scheduled: bool,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sContainer {
    pub name: String,
    pub image: String,
    pub work_dir: String,
    pub resources: ResourceRequirements,
    pub commands: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub limits: ResourceList,
    pub requests: ResourceList,
}

/// Quantities as the orchestrator writes them (`500m`, `512Mi`). Empty
/// fields are left out of the workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceList {
    pub memory: String,
    pub cpu: String,
    pub storage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A VM directory mounted into the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub vm_path: String,
    pub container_path: String,
}

/// A container port. A non-empty `service_port` or `node_port` publishes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortInfo {
    pub container_port: i32,
    pub name: String,
    pub protocol: String,
    pub service_port: String,
    pub node_port: String,
}

impl PortInfo {
    pub fn is_published(&self) -> bool {
        !self.service_port.is_empty() || !self.node_port.is_empty()
    }
}

/// Where a pod of an application runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodHost {
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub host_name: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
}

/// Status of a running application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub app_name: String,
    pub svc_name: String,
    pub deploy_name: String,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    #[serde(rename = "nodePortIP")]
    pub node_port_ip: Vec<String>,
    pub svc_port: Vec<String>,
    pub node_port: Vec<String>,
    pub container_port: Vec<String>,
    pub hosts: Vec<PodHost>,
    pub status: String,
    pub priority: i32,
    pub auto_scheduled: bool,
}

impl AppInfo {
    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }
}
