use mcm_cluster::apps::model::AppInfo;
use mcm_cluster::nodes::NodeInfo;
use mcm_core::vm::{IaasVm, ResourceStatus};
use mcm_iaas::cloud::CloudInfo;
use tabled::Tabled;

/// Render a resource amount; negative means unknown or unlimited.
fn amount(v: f64) -> String {
    if v < 0.0 {
        "-".to_string()
    } else if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}

fn used_of(used: f64, total: f64) -> String {
    format!("{}/{}", amount(used), amount(total))
}

/// Display row for `cloud list` and `cloud show`.
#[derive(Debug, Tabled)]
pub struct CloudRow {
    #[tabled(rename = "CLOUD")]
    pub name: String,
    #[tabled(rename = "TYPE")]
    pub cloud_type: String,
    #[tabled(rename = "VCPU")]
    pub vcpu: String,
    #[tabled(rename = "RAM MIB")]
    pub ram: String,
    #[tabled(rename = "STORAGE GIB")]
    pub storage: String,
    #[tabled(rename = "VMS")]
    pub vms: String,
    #[tabled(rename = "FREE")]
    pub free: String,
    #[tabled(rename = "URL")]
    pub web_url: String,
}

/// Remaining share, `over` past a limit and `full` once any bounded
/// resource is used up.
fn free_pct(r: &ResourceStatus) -> String {
    if r.limit.vcpu < 0.0 && r.limit.ram < 0.0 && r.limit.storage < 0.0 {
        return "-".to_string();
    }
    if r.overflow() {
        return "over".to_string();
    }
    if !r.limit.all_more_than(&r.in_use) {
        return "full".to_string();
    }
    format!("{:.0}%", r.least_remain_pct() * 100.0)
}

impl From<&CloudInfo> for CloudRow {
    fn from(c: &CloudInfo) -> Self {
        let r = &c.resources;
        Self {
            name: c.name.clone(),
            cloud_type: c.cloud_type.clone(),
            vcpu: used_of(r.in_use.vcpu, r.limit.vcpu),
            ram: used_of(r.in_use.ram, r.limit.ram),
            storage: used_of(r.in_use.storage, r.limit.storage),
            vms: used_of(r.in_use.vm, r.limit.vm),
            free: free_pct(r),
            web_url: c.web_url.clone(),
        }
    }
}

/// Display row for `vm list`, `vm create` and `node add-new`.
#[derive(Debug, Tabled)]
pub struct VmRow {
    #[tabled(rename = "CLOUD")]
    pub cloud: String,
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "IP")]
    pub ip: String,
    #[tabled(rename = "VCPU")]
    pub vcpu: String,
    #[tabled(rename = "RAM MIB")]
    pub ram: String,
    #[tabled(rename = "STORAGE GIB")]
    pub storage: String,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "MCM")]
    pub mcm_create: String,
}

impl From<&IaasVm> for VmRow {
    fn from(vm: &IaasVm) -> Self {
        Self {
            cloud: vm.cloud.clone(),
            id: vm.id.clone(),
            name: vm.name.clone(),
            ip: vm.primary_ip().unwrap_or("-").to_string(),
            vcpu: amount(vm.vcpu),
            ram: amount(vm.ram),
            storage: amount(vm.storage),
            status: vm.status.clone(),
            mcm_create: if vm.mcm_create { "yes" } else { "no" }.to_string(),
        }
    }
}

/// Display row for `node list`.
#[derive(Debug, Tabled)]
pub struct NodeRow {
    #[tabled(rename = "NODE")]
    pub name: String,
    #[tabled(rename = "IP")]
    pub ip: String,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "CPU")]
    pub cpu: String,
    #[tabled(rename = "MEMORY MIB")]
    pub memory: String,
    #[tabled(rename = "STORAGE GIB")]
    pub storage: String,
    #[tabled(rename = "NET TEST")]
    pub net_test: String,
}

impl From<&NodeInfo> for NodeRow {
    fn from(n: &NodeInfo) -> Self {
        Self {
            name: n.name.clone(),
            ip: n.ip.clone(),
            status: n.status.clone(),
            cpu: used_of(n.used_resources.cpu_core, n.total_resources.cpu_core),
            memory: used_of(n.used_resources.memory, n.total_resources.memory),
            storage: used_of(n.used_resources.storage, n.total_resources.storage),
            net_test: if n.net_test { "yes" } else { "-" }.to_string(),
        }
    }
}

/// Display row for `app list` and `app get`.
#[derive(Debug, Tabled)]
pub struct AppRow {
    #[tabled(rename = "APP")]
    pub app_name: String,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "PODS")]
    pub pods: usize,
    #[tabled(rename = "HOSTS")]
    pub hosts: String,
    #[tabled(rename = "CLUSTER IP")]
    pub cluster_ip: String,
    #[tabled(rename = "PORTS")]
    pub ports: String,
    #[tabled(rename = "NODE PORT IPS")]
    pub node_port_ips: String,
    #[tabled(rename = "PRIORITY")]
    pub priority: i32,
    #[tabled(rename = "AUTO")]
    pub auto_scheduled: String,
}

/// `svc:container` per port, with `/node` appended when a node port is set.
fn port_summary(info: &AppInfo) -> String {
    let ports: Vec<String> = info
        .svc_port
        .iter()
        .enumerate()
        .map(|(i, svc)| {
            let target = info.container_port.get(i).map(String::as_str).unwrap_or("-");
            match info.node_port.get(i).map(String::as_str) {
                Some("0") | None => format!("{}:{}", svc, target),
                Some(node) => format!("{}:{}/{}", svc, target, node),
            }
        })
        .collect();
    if ports.is_empty() {
        "-".to_string()
    } else {
        ports.join(", ")
    }
}

fn or_dash(items: Vec<&str>) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

impl From<&AppInfo> for AppRow {
    fn from(a: &AppInfo) -> Self {
        Self {
            app_name: a.app_name.clone(),
            status: a.status.clone(),
            pods: a.hosts.len(),
            hosts: or_dash(a.hosts.iter().map(|h| h.host_name.as_str()).collect()),
            cluster_ip: if a.cluster_ip.is_empty() {
                "-".to_string()
            } else {
                a.cluster_ip.clone()
            },
            ports: port_summary(a),
            node_port_ips: or_dash(a.node_port_ip.iter().map(String::as_str).collect()),
            priority: a.priority,
            auto_scheduled: if a.auto_scheduled { "yes" } else { "no" }.to_string(),
        }
    }
}
