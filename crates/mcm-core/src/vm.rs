use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Marker written into VM metadata (OpenStack) or description (Proxmox) so we
/// only ever delete machines we created ourselves.
pub const MCM_SIGN: &str = "multi-cloud-manager";

/// Value of a resource field the backend does not report.
pub const UNKNOWN: f64 = -1.0;

/// Uniform VM record returned by every backend.
///
/// Also the request body of the create-VM and add-node operations, which is
/// why it carries serde names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IaasVm {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// VMs we create have exactly one usable address, the first.
    #[serde(default)]
    pub ips: Vec<String>,
    /// Logical cores.
    #[serde(default)]
    pub vcpu: f64,
    /// MiB.
    #[serde(default)]
    pub ram: f64,
    /// GiB.
    #[serde(default)]
    pub storage: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub cloud_type: String,
    #[serde(default)]
    pub mcm_create: bool,
}

impl IaasVm {
    /// Address used to reach this VM.
    pub fn primary_ip(&self) -> Option<&str> {
        self.ips.first().map(String::as_str)
    }
}

/// Amounts of each resource kind. Negative values mean unlimited / unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResSet {
    pub vcpu: f64,
    /// MiB.
    pub ram: f64,
    pub vm: f64,
    pub volume: f64,
    /// GiB.
    pub storage: f64,
    pub port: f64,
}

impl ResSet {
    pub fn unknown() -> Self {
        Self {
            vcpu: UNKNOWN,
            ram: UNKNOWN,
            vm: UNKNOWN,
            volume: UNKNOWN,
            storage: UNKNOWN,
            port: UNKNOWN,
        }
    }

    /// Whether every bounded field of `self` is strictly above `other`.
    ///
    /// Negative fields in `self` are unlimited and always pass.
    pub fn all_more_than(&self, other: &ResSet) -> bool {
        let pairs = [
            (self.vcpu, other.vcpu),
            (self.ram, other.ram),
            (self.vm, other.vm),
            (self.volume, other.volume),
            (self.storage, other.storage),
            (self.port, other.port),
        ];
        pairs.iter().all(|&(mine, theirs)| mine < 0.0 || mine > theirs)
    }
}

/// Quota pair reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub limit: ResSet,
    pub in_use: ResSet,
}

impl ResourceStatus {
    pub fn unknown() -> Self {
        Self {
            limit: ResSet::unknown(),
            in_use: ResSet::unknown(),
        }
    }

    /// Smallest remaining fraction among vcpu, ram and storage, capped at 1.
    pub fn least_remain_pct(&self) -> f64 {
        let pct = |limit: f64, used: f64| (limit - used) / limit;
        [
            pct(self.limit.vcpu, self.in_use.vcpu),
            pct(self.limit.ram, self.in_use.ram),
            pct(self.limit.storage, self.in_use.storage),
        ]
        .into_iter()
        .fold(1.0, f64::min)
    }

    /// Whether vcpu, ram or storage usage exceeds its limit.
    pub fn overflow(&self) -> bool {
        self.in_use.vcpu > self.limit.vcpu
            || self.in_use.ram > self.limit.ram
            || self.in_use.storage > self.limit.storage
    }
}

pub fn find_vm<'a>(name: &str, vms: &'a [IaasVm]) -> Option<&'a IaasVm> {
    vms.iter().find(|vm| vm.name == name)
}

/// Group VMs by the cloud they belong to, keeping input order inside a group.
pub fn group_vms_by_cloud(vms: Vec<IaasVm>) -> BTreeMap<String, Vec<IaasVm>> {
    let mut groups: BTreeMap<String, Vec<IaasVm>> = BTreeMap::new();
    for vm in vms {
        groups.entry(vm.cloud.clone()).or_default().push(vm);
    }
    groups
}
