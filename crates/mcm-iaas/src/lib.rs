// mcm-iaas: uniform capability surface over IaaS backends
// Depends on mcm-core, mcm-runtime

pub mod cloud;
pub mod config;
pub mod fanout;
pub mod openstack;
pub mod proxmox;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcm_core::config::ManagerConfig;
use mcm_core::vm::{IaasVm, ResourceStatus};
use mcm_core::wait::WaitConfig;
use mcm_core::Result;
use mcm_runtime::ssh::{Dialer, SshAuth};

pub use config::{CloudConfig, IaasConfigDoc};
pub use registry::CloudRegistry;

/// Port VMs and Proxmox hosts accept secure shell on.
pub const SSH_PORT: u16 = 22;

/// Capability set every backend provides.
///
/// Sizes follow [`mcm_core::vm::ResSet`]: cores, MiB of RAM, GiB of storage.
#[async_trait]
pub trait Iaas: Send + Sync {
    fn name(&self) -> &str;

    fn cloud_type(&self) -> &str;

    fn web_url(&self) -> String;

    async fn get_vm(&self, id: &str) -> Result<IaasVm>;

    async fn list_all_vms(&self) -> Result<Vec<IaasVm>>;

    /// Create a VM and return once it accepts secure shell logins.
    async fn create_vm(&self, name: &str, vcpu: u32, ram_mib: u64, storage_gib: u64)
    -> Result<IaasVm>;

    /// Delete a VM this system created. Others are refused with `Validation`.
    async fn delete_vm(&self, id: &str) -> Result<()>;

    async fn check_resources(&self) -> Result<ResourceStatus>;

    async fn is_created_by_mcm(&self, id: &str) -> Result<bool>;

    /// User and credentials that log into VMs of this cloud.
    fn ssh_credentials(&self) -> (String, SshAuth);

    /// Down-cast for Proxmox-only endpoints.
    fn as_proxmox(&self) -> Option<&proxmox::Proxmox> {
        None
    }
}

/// Collaborators and pacing shared by all backends.
#[derive(Clone)]
pub struct BackendOptions {
    pub dialer: Arc<dyn Dialer>,
    /// Bound for every create/delete polling loop, ssh readiness included.
    pub wait: WaitConfig,
    /// Pause after each Proxmox API call.
    pub api_interval: Duration,
    pub http_timeout: Duration,
}

impl BackendOptions {
    pub fn from_config(config: &ManagerConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            wait: config.timeouts.general(),
            api_interval: Duration::from_millis(config.iaas.api_interval_ms),
            http_timeout: Duration::from_secs(60),
        }
    }
}
