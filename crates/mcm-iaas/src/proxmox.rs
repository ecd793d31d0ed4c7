//! Proxmox VE backend.
//!
//! Talks to the node API at `https://{ip}:{port}/api2/json/nodes/{cloud}/...`
//! with an API token, and to the host itself over secure shell for the one
//! operation the API gets wrong (`qm rescan` after a disk resize).
//!
//! Response bodies are decoded into record types whose fields are all
//! optional; a missing `data` object fails the call, a missing field reads as
//! unknown.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mcm_core::retry::retry_fixed;
use mcm_core::vm::{IaasVm, MCM_SIGN, ResSet, ResourceStatus, UNKNOWN};
use mcm_core::wait::wait_for;
use mcm_core::{McmError, Result};
use mcm_runtime::http;
use mcm_runtime::ssh::{self, DISK_INIT_CMD, SshAuth, SshTarget};
use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ProxmoxConfig;
use crate::{BackendOptions, Iaas, SSH_PORT};

pub const TYPE_PROXMOX: &str = "proxmox";

/// Proxmox hands out VM ids from 100 upward.
const FIRST_VMID: u64 = 100;
const LOOPBACK_MAC: &str = "00:00:00:00:00:00";
const LOOPBACK_NAME: &str = "lo";
/// Only these interfaces carry addresses we can reach; the rest are
/// container bridges and the like.
const ALLOWED_IF_PREFIXES: [&str; 2] = ["en", "et"];
const IPV4: &str = "ipv4";
const IP_ATTEMPTS: u32 = 4;
const IP_RETRY_DELAY: Duration = Duration::from_secs(30);
const ROOT_USER: &str = "root";
const STATUS_STOPPED: &str = "stopped";
const TASK_RUNNING: &str = "running";
const TASK_OK: &str = "OK";

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub cpuinfo: CpuInfo,
    #[serde(default)]
    pub memory: Capacity,
    #[serde(default)]
    pub rootfs: Capacity,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuInfo {
    pub cpus: Option<f64>,
}

/// Bytes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Capacity {
    pub total: Option<f64>,
}

/// One entry of `qemu` or `qemu/{vmid}/status/current`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Qemu {
    pub vmid: Option<u64>,
    pub name: Option<String>,
    pub cpus: Option<f64>,
    /// Bytes.
    pub maxmem: Option<f64>,
    /// Bytes.
    pub maxdisk: Option<f64>,
    pub status: Option<String>,
    /// Present while a clone or config change holds the VM.
    pub lock: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QemuConfig {
    pub boot: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStatus {
    pub status: Option<String>,
    pub exitstatus: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetInterface {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpAddress {
    #[serde(rename = "ip-address-type", default)]
    pub kind: String,
    #[serde(rename = "ip-address", default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
    Failed(String),
}

/// Interpret a task status: `running` keeps polling, `stopped` with exit
/// status `OK` is done, anything else failed.
pub fn task_state(task: &TaskStatus) -> TaskState {
    match task.status.as_deref() {
        Some(TASK_RUNNING) => TaskState::Running,
        Some(STATUS_STOPPED) if task.exitstatus.as_deref() == Some(TASK_OK) => TaskState::Finished,
        Some(STATUS_STOPPED) => TaskState::Failed(format!(
            "task stopped with exit status {:?}",
            task.exitstatus.as_deref().unwrap_or("")
        )),
        other => TaskState::Failed(format!(
            "task status is neither {} nor {}: {:?}",
            TASK_RUNNING, STATUS_STOPPED, other
        )),
    }
}

/// Fail when a response body carries an `errors` object.
pub fn check_err_in_resp(body: &Value) -> Result<()> {
    match body.get("errors") {
        Some(errors) if !errors.is_null() => {
            Err(McmError::backend(format!("error in response: {}", errors)))
        }
        _ => Ok(()),
    }
}

fn take_data<T: DeserializeOwned>(body: Value, what: &str) -> Result<T> {
    let data = match body {
        Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
        _ => Value::Null,
    };
    serde_json::from_value(data)
        .map_err(|e| McmError::backend(format!("unexpected {} response: {}", what, e)))
}

/// Capacity from node status, usage from the sum over all qemus.
pub fn resources_from(node: &NodeStatus, qemus: &[Qemu]) -> ResourceStatus {
    let limit = ResSet {
        vcpu: node.cpuinfo.cpus.unwrap_or(UNKNOWN),
        ram: node.memory.total.map_or(UNKNOWN, |b| b / BYTES_PER_MIB),
        storage: node.rootfs.total.map_or(UNKNOWN, |b| b / BYTES_PER_GIB),
        vm: UNKNOWN,
        volume: UNKNOWN,
        port: UNKNOWN,
    };
    let in_use = ResSet {
        vcpu: qemus.iter().filter_map(|q| q.cpus).sum(),
        ram: qemus.iter().filter_map(|q| q.maxmem).sum::<f64>() / BYTES_PER_MIB,
        storage: qemus.iter().filter_map(|q| q.maxdisk).sum::<f64>() / BYTES_PER_GIB,
        vm: UNKNOWN,
        volume: UNKNOWN,
        port: UNKNOWN,
    };
    ResourceStatus { limit, in_use }
}

/// IPv4 addresses of the non-loopback `en*`/`et*` interfaces.
pub fn vm_ips(interfaces: &[NetInterface]) -> Vec<String> {
    interfaces
        .iter()
        .filter(|i| i.hardware_address != LOOPBACK_MAC && i.name != LOOPBACK_NAME)
        .filter(|i| ALLOWED_IF_PREFIXES.iter().any(|p| i.name.starts_with(p)))
        .flat_map(|i| i.ip_addresses.iter())
        .filter(|a| a.kind == IPV4 && !a.address.is_empty())
        .map(|a| a.address.clone())
        .collect()
}

/// Addresses from an `agent/network-get-interfaces` body. Anything
/// unexpected yields no addresses.
pub fn parse_ips(body: &Value) -> Vec<String> {
    body.get("data")
        .and_then(|d| d.get("result"))
        .and_then(|r| serde_json::from_value::<Vec<NetInterface>>(r.clone()).ok())
        .map(|interfaces| vm_ips(&interfaces))
        .unwrap_or_default()
}

pub fn next_free_vmid(qemus: &[Qemu]) -> u64 {
    let taken: HashSet<u64> = qemus.iter().filter_map(|q| q.vmid).collect();
    (FIRST_VMID..)
        .find(|id| !taken.contains(id))
        .unwrap_or(FIRST_VMID)
}

/// Disk to resize: the first entry of `boot`, e.g. `order=scsi0;ide2;net0`.
pub fn boot_disk(boot: &str) -> Option<String> {
    let order = boot.strip_prefix("order=").unwrap_or(boot);
    order
        .split(';')
        .next()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

pub fn is_signed(config: &QemuConfig) -> bool {
    config
        .description
        .as_deref()
        .is_some_and(|d| d.trim() == MCM_SIGN)
}

pub struct Proxmox {
    config: ProxmoxConfig,
    auth_header: String,
    http: reqwest::Client,
    opts: BackendOptions,
}

impl Proxmox {
    pub fn new(config: ProxmoxConfig, opts: BackendOptions) -> Result<Self> {
        let auth_header = format!(
            "PVEAPIToken={}@pam!{}={}",
            config.proxmox_user, config.token_name, config.token_secret
        );
        // Proxmox ships a self-signed certificate.
        let http = http::insecure_client(opts.http_timeout)?;
        Ok(Self {
            config,
            auth_header,
            http,
            opts,
        })
    }

    pub fn auth_header(&self) -> &str {
        &self.auth_header
    }

    fn url(&self, path: &str) -> String {
        format!(
            "https://{}:{}/api2/json/nodes/{}/{}",
            self.config.ip, self.config.port, self.config.name, path
        )
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self.url(path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(AUTHORIZATION, &self.auth_header);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = http::send_json(request, &url)
            .await
            .map_err(|e| e.context(format!("cloud {} {} {}", self.config.name, method, path)))?;
        debug!(cloud = %self.config.name, %method, path, "proxmox api call finished");
        check_err_in_resp(&resp)?;
        Ok(resp)
    }

    /// Proxmox chokes on back-to-back writes; pause between calls of a flow.
    async fn pause(&self) {
        tokio::time::sleep(self.opts.api_interval).await;
    }

    pub async fn node_status(&self) -> Result<NodeStatus> {
        take_data(self.call(Method::GET, "status", None).await?, "node status")
    }

    pub async fn list_qemus(&self) -> Result<Vec<Qemu>> {
        take_data(self.call(Method::GET, "qemu", None).await?, "qemu list")
    }

    pub async fn get_qemu(&self, vmid: &str) -> Result<Qemu> {
        let path = format!("qemu/{}/status/current", vmid);
        take_data(self.call(Method::GET, &path, None).await?, "qemu status")
    }

    pub async fn qemu_config(&self, vmid: &str) -> Result<QemuConfig> {
        let path = format!("qemu/{}/config", vmid);
        take_data(self.call(Method::GET, &path, None).await?, "qemu config")
    }

    pub async fn net_interfaces(&self, vmid: &str) -> Result<Value> {
        let path = format!("qemu/{}/agent/network-get-interfaces", vmid);
        self.call(Method::GET, &path, None).await
    }

    /// Full clone of the template; returns the task id.
    pub async fn clone_qemu(&self, new_vmid: u64, name: &str) -> Result<String> {
        let path = format!("qemu/{}/clone", self.config.template_id);
        let body = json!({
            "newid": new_vmid,
            "full": true,
            "name": name,
            "description": MCM_SIGN,
        });
        take_data(self.call(Method::POST, &path, Some(body)).await?, "clone")
    }

    pub async fn config_core_ram(&self, vmid: u64, ram_mib: u64, cores: u32) -> Result<()> {
        let path = format!("qemu/{}/config", vmid);
        let body = json!({ "memory": ram_mib, "cores": cores });
        self.call(Method::PUT, &path, Some(body)).await.map(|_| ())
    }

    /// `size` carries its unit, e.g. `40G`.
    pub async fn resize_disk(&self, vmid: u64, disk: &str, size: &str) -> Result<()> {
        let path = format!("qemu/{}/resize", vmid);
        let body = json!({ "disk": disk, "size": size });
        self.call(Method::PUT, &path, Some(body)).await.map(|_| ())
    }

    pub async fn start_qemu(&self, vmid: u64) -> Result<()> {
        let path = format!("qemu/{}/status/start", vmid);
        self.call(Method::POST, &path, None).await.map(|_| ())
    }

    /// Graceful shutdown; returns the task id.
    pub async fn shutdown_qemu(&self, vmid: &str) -> Result<String> {
        let path = format!("qemu/{}/status/shutdown", vmid);
        take_data(self.call(Method::POST, &path, None).await?, "shutdown")
    }

    /// Delete with purge; returns the task id.
    pub async fn delete_qemu(&self, vmid: &str) -> Result<String> {
        let path = format!("qemu/{}?purge=1&destroy-unreferenced-disks=1", vmid);
        take_data(self.call(Method::DELETE, &path, None).await?, "delete")
    }

    pub async fn task_status(&self, upid: &str) -> Result<TaskStatus> {
        let path = format!("tasks/{}/status", upid);
        take_data(self.call(Method::GET, &path, None).await?, "task status")
    }

    /// Addresses of a VM, empty when the guest agent cannot tell yet.
    pub async fn vm_ips(&self, vmid: &str) -> Vec<String> {
        match self.net_interfaces(vmid).await {
            Ok(body) => parse_ips(&body),
            Err(e) => {
                debug!(cloud = %self.config.name, vm = vmid, error = %e, "no interfaces reported");
                Vec::new()
            }
        }
    }

    async fn wait_task(&self, upid: &str) -> Result<()> {
        let label = format!("proxmox task {}", upid);
        let what = label.as_str();
        wait_for(what, self.opts.wait, || async move {
            let task = match self.task_status(upid).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(cloud = %self.config.name, upid, error = %e, "task status unavailable");
                    return Ok(false);
                }
            };
            match task_state(&task) {
                TaskState::Running => Ok(false),
                TaskState::Finished => Ok(true),
                TaskState::Failed(msg) => Err(McmError::backend(format!("{}: {}", what, msg))),
            }
        })
        .await
    }

    async fn wait_unlock(&self, vmid: &str) -> Result<()> {
        wait_for(&format!("unlock of vm {}", vmid), self.opts.wait, || async move {
            match self.get_qemu(vmid).await {
                Ok(q) => Ok(q.lock.is_none()),
                Err(e) => {
                    debug!(cloud = %self.config.name, vm = vmid, error = %e, "qemu status unavailable");
                    Ok(false)
                }
            }
        })
        .await
    }

    async fn wait_stopped(&self, vmid: &str) -> Result<()> {
        wait_for(&format!("stop of vm {}", vmid), self.opts.wait, || async move {
            match self.get_qemu(vmid).await {
                Ok(q) => Ok(q.status.as_deref() == Some(STATUS_STOPPED)),
                Err(e) => {
                    debug!(cloud = %self.config.name, vm = vmid, error = %e, "qemu status unavailable");
                    Ok(false)
                }
            }
        })
        .await
    }

    /// A freshly cloned disk refuses resizing for a while.
    async fn wait_resize(&self, vmid: u64, disk: &str, size: &str) -> Result<()> {
        let label = format!("resize of vm {} disk {} to {}", vmid, disk, size);
        wait_for(&label, self.opts.wait, || async move {
            let outcome = self.resize_disk(vmid, disk, size).await;
            self.pause().await;
            match outcome {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!(cloud = %self.config.name, vm = vmid, error = %e, "resize not accepted yet");
                    Ok(false)
                }
            }
        })
        .await
    }

    /// Refresh the disk size Proxmox records after a resize that failed at
    /// least once before succeeding.
    async fn rescan(&self, vmid: u64) -> Result<()> {
        let host = SshTarget::new(
            self.config.ip.clone(),
            SSH_PORT,
            self.config.proxmox_user.clone(),
            SshAuth::Password(self.config.proxmox_password.clone()),
        );
        let cmd = format!("qm rescan --vmid {}", vmid);
        ssh::exec_checked(self.opts.dialer.as_ref(), &host, &cmd).await?;
        Ok(())
    }

    fn to_vm(&self, qemu: &Qemu, fallback_id: &str, ips: Vec<String>, signed: bool) -> IaasVm {
        IaasVm {
            id: qemu
                .vmid
                .map_or_else(|| fallback_id.to_string(), |id| id.to_string()),
            name: qemu.name.clone().unwrap_or_default(),
            ips,
            vcpu: qemu.cpus.unwrap_or(UNKNOWN),
            ram: qemu.maxmem.map_or(UNKNOWN, |b| b / BYTES_PER_MIB),
            storage: qemu.maxdisk.map_or(UNKNOWN, |b| b / BYTES_PER_GIB),
            status: qemu.status.clone().unwrap_or_default(),
            cloud: self.config.name.clone(),
            cloud_type: TYPE_PROXMOX.to_string(),
            mcm_create: signed,
        }
    }

    async fn describe(&self, qemu: &Qemu) -> IaasVm {
        let vmid = qemu.vmid.map(|id| id.to_string()).unwrap_or_default();
        let (ips, config) = tokio::join!(self.vm_ips(&vmid), self.qemu_config(&vmid));
        let signed = config.map(|c| is_signed(&c)).unwrap_or(false);
        self.to_vm(qemu, &vmid, ips, signed)
    }

    async fn create_inner(&self, name: &str, vcpu: u32, ram_mib: u64, storage_gib: u64) -> Result<IaasVm> {
        let qemus = self.list_qemus().await?;
        self.pause().await;
        let vmid = next_free_vmid(&qemus);
        let vmid_str = vmid.to_string();
        info!(cloud = %self.config.name, vm = name, vmid, "cloning template");

        let upid = self.clone_qemu(vmid, name).await?;
        self.pause().await;
        self.wait_task(&upid).await?;
        self.wait_unlock(&vmid_str).await?;

        self.config_core_ram(vmid, ram_mib, vcpu).await?;
        self.pause().await;

        let config = self.qemu_config(&vmid_str).await?;
        self.pause().await;
        let disk = config
            .boot
            .as_deref()
            .and_then(boot_disk)
            .ok_or_else(|| McmError::backend(format!("vm {} has no boot disk in its config", vmid)))?;
        let size = format!("{}G", storage_gib);
        self.wait_resize(vmid, &disk, &size).await?;
        self.rescan(vmid).await?;

        info!(cloud = %self.config.name, vm = name, vmid, "starting");
        self.start_qemu(vmid).await?;
        self.pause().await;

        let label = format!("addresses of vm {}", vmid);
        let vmid_ref = vmid_str.as_str();
        let ips = retry_fixed(IP_ATTEMPTS, IP_RETRY_DELAY, &label, || async move {
            let ips = self.vm_ips(vmid_ref).await;
            if ips.is_empty() {
                Err(McmError::not_found(format!("no IPv4 address reported for vm {}", vmid)))
            } else {
                Ok(ips)
            }
        })
        .await?;

        let target = SshTarget::new(
            ips[0].clone(),
            SSH_PORT,
            ROOT_USER,
            SshAuth::Password(self.config.root_password.clone()),
        );
        ssh::wait_for_ssh(self.opts.dialer.as_ref(), &target, DISK_INIT_CMD, self.opts.wait).await?;

        self.get_vm(&vmid_str).await
    }

    async fn delete_inner(&self, vmid: &str) -> Result<()> {
        if !self.is_created_by_mcm(vmid).await? {
            return Err(McmError::validation(format!(
                "vm {} in cloud {} was not created by the manager",
                vmid, self.config.name
            )));
        }

        let upid = self.shutdown_qemu(vmid).await?;
        self.pause().await;
        self.wait_task(&upid).await?;
        self.wait_stopped(vmid).await?;

        let upid = self.delete_qemu(vmid).await?;
        self.pause().await;
        self.wait_task(&upid).await
    }
}

#[async_trait]
impl Iaas for Proxmox {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn cloud_type(&self) -> &str {
        TYPE_PROXMOX
    }

    fn web_url(&self) -> String {
        format!("https://{}:{}/", self.config.ip, self.config.port)
    }

    async fn get_vm(&self, id: &str) -> Result<IaasVm> {
        let qemu = self.get_qemu(id).await?;
        let (ips, config) = tokio::join!(self.vm_ips(id), self.qemu_config(id));
        let signed = config.map(|c| is_signed(&c)).unwrap_or(false);
        Ok(self.to_vm(&qemu, id, ips, signed))
    }

    async fn list_all_vms(&self) -> Result<Vec<IaasVm>> {
        let qemus = self.list_qemus().await?;
        Ok(join_all(qemus.iter().map(|q| self.describe(q))).await)
    }

    async fn create_vm(
        &self,
        name: &str,
        vcpu: u32,
        ram_mib: u64,
        storage_gib: u64,
    ) -> Result<IaasVm> {
        self.create_inner(name, vcpu, ram_mib, storage_gib)
            .await
            .map_err(|e| e.context(format!("cloud {}: create vm {}", self.config.name, name)))
    }

    async fn delete_vm(&self, id: &str) -> Result<()> {
        self.delete_inner(id)
            .await
            .map_err(|e| e.context(format!("cloud {}: delete vm {}", self.config.name, id)))
    }

    async fn check_resources(&self) -> Result<ResourceStatus> {
        let node = self.node_status().await?;
        let qemus = self.list_qemus().await?;
        Ok(resources_from(&node, &qemus))
    }

    async fn is_created_by_mcm(&self, id: &str) -> Result<bool> {
        Ok(is_signed(&self.qemu_config(id).await?))
    }

    fn ssh_credentials(&self) -> (String, SshAuth) {
        (
            ROOT_USER.to_string(),
            SshAuth::Password(self.config.root_password.clone()),
        )
    }

    fn as_proxmox(&self) -> Option<&Proxmox> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcm_core::wait::WaitConfig;
    use mcm_runtime::ssh::RusshDialer;
    use std::sync::Arc;

    const GIB: f64 = BYTES_PER_GIB;

    fn backend() -> Proxmox {
        let config = ProxmoxConfig {
            name: "pve1".into(),
            ip: "192.168.10.4".into(),
            port: "8006".into(),
            proxmox_user: "root".into(),
            proxmox_password: "pw".into(),
            token_name: "mcm".into(),
            token_secret: "abc-123".into(),
            root_password: "rootpw".into(),
            template_id: "9000".into(),
        };
        let opts = BackendOptions {
            dialer: Arc::new(RusshDialer::default()),
            wait: WaitConfig::from_secs(60, 5),
            api_interval: Duration::from_millis(0),
            http_timeout: Duration::from_secs(5),
        };
        Proxmox::new(config, opts).unwrap()
    }

    #[test]
    fn test_resource_accounting() {
        let node: NodeStatus = serde_json::from_value(json!({
            "cpuinfo": {"cpus": 16},
            "memory": {"total": 32.0 * GIB, "used": 1024},
            "rootfs": {"total": 500.0 * GIB}
        }))
        .unwrap();
        let qemus: Vec<Qemu> = serde_json::from_value(json!([
            {"vmid": 100, "cpus": 2, "maxmem": 4.0 * GIB, "maxdisk": 50.0 * GIB},
            {"vmid": 101, "cpus": 4, "maxmem": 8.0 * GIB, "maxdisk": 100.0 * GIB}
        ]))
        .unwrap();

        let rs = resources_from(&node, &qemus);
        assert_eq!(
            rs.limit,
            ResSet {
                vcpu: 16.0,
                ram: 32768.0,
                vm: -1.0,
                volume: -1.0,
                storage: 500.0,
                port: -1.0,
            }
        );
        assert_eq!(rs.in_use.vcpu, 6.0);
        assert_eq!(rs.in_use.ram, 12288.0);
        assert_eq!(rs.in_use.storage, 150.0);
        assert_eq!(rs.in_use.vm, UNKNOWN);
        assert_eq!(rs.in_use.volume, UNKNOWN);
        assert_eq!(rs.in_use.port, UNKNOWN);
        assert!(rs.in_use.vcpu <= rs.limit.vcpu);
    }

    #[test]
    fn test_resource_accounting_missing_totals() {
        let rs = resources_from(&NodeStatus::default(), &[]);
        assert_eq!(rs.limit.vcpu, UNKNOWN);
        assert_eq!(rs.limit.ram, UNKNOWN);
        assert_eq!(rs.limit.storage, UNKNOWN);
        assert_eq!(rs.in_use.vcpu, 0.0);
    }

    #[test]
    fn test_parse_ips_filters_interfaces() {
        let body = json!({"data": {"result": [
            {"name": "lo", "hardware-address": "00:00:00:00:00:00",
             "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "127.0.0.1"}]},
            {"name": "ens18", "hardware-address": "bc:24:11:aa:bb:cc",
             "ip-addresses": [
                {"ip-address-type": "ipv4", "ip-address": "192.168.10.50"},
                {"ip-address-type": "ipv6", "ip-address": "fe80::1"}
             ]},
            {"name": "eth1", "hardware-address": "bc:24:11:aa:bb:cd",
             "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "10.1.0.7"}]},
            {"name": "cni0", "hardware-address": "aa:aa:aa:aa:aa:aa",
             "ip-addresses": [{"ip-address-type": "ipv4", "ip-address": "10.244.1.1"}]},
            {"name": "docker0", "hardware-address": "02:42:00:00:00:00"}
        ]}});
        assert_eq!(parse_ips(&body), vec!["192.168.10.50", "10.1.0.7"]);
    }

    #[test]
    fn test_parse_ips_tolerates_garbage() {
        // the agent answers with an error object while the guest boots
        assert!(parse_ips(&json!({"data": null})).is_empty());
        assert!(parse_ips(&json!({"data": {"result": "QEMU guest agent is not running"}})).is_empty());
        assert!(parse_ips(&json!([])).is_empty());
    }

    #[test]
    fn test_next_free_vmid() {
        assert_eq!(next_free_vmid(&[]), 100);
        let qemus: Vec<Qemu> =
            serde_json::from_value(json!([{"vmid": 100}, {"vmid": 101}, {"vmid": 103}, {"vmid": 9000}]))
                .unwrap();
        assert_eq!(next_free_vmid(&qemus), 102);
    }

    #[test]
    fn test_boot_disk() {
        assert_eq!(boot_disk("order=scsi0;ide2;net0").as_deref(), Some("scsi0"));
        assert_eq!(boot_disk("virtio0").as_deref(), Some("virtio0"));
        assert_eq!(boot_disk("order="), None);
        assert_eq!(boot_disk(""), None);
    }

    #[test]
    fn test_task_state() {
        let t = |status: Option<&str>, exit: Option<&str>| TaskStatus {
            status: status.map(String::from),
            exitstatus: exit.map(String::from),
        };
        assert_eq!(task_state(&t(Some("running"), None)), TaskState::Running);
        assert_eq!(task_state(&t(Some("stopped"), Some("OK"))), TaskState::Finished);
        assert!(matches!(
            task_state(&t(Some("stopped"), Some("clone failed: lock timeout"))),
            TaskState::Failed(msg) if msg.contains("lock timeout")
        ));
        assert!(matches!(task_state(&t(None, None)), TaskState::Failed(_)));
    }

    #[test]
    fn test_check_err_in_resp() {
        assert!(check_err_in_resp(&json!({"data": "UPID:pve1:..."})).is_ok());
        assert!(check_err_in_resp(&json!({"data": null, "errors": null})).is_ok());
        let err = check_err_in_resp(&json!({"data": null, "errors": {"size": "invalid format"}}))
            .unwrap_err();
        assert!(err.to_string().contains("invalid format"));
    }

    #[test]
    fn test_take_data_requires_data() {
        let upid: String = take_data(json!({"data": "UPID:pve1:0001"}), "clone").unwrap();
        assert_eq!(upid, "UPID:pve1:0001");
        assert!(take_data::<Qemu>(json!({}), "qemu status").is_err());
    }

    #[test]
    fn test_is_signed() {
        let signed = QemuConfig {
            description: Some(format!("{}\n", MCM_SIGN)),
            ..Default::default()
        };
        assert!(is_signed(&signed));
        assert!(!is_signed(&QemuConfig::default()));
        let other = QemuConfig {
            description: Some("user vm".into()),
            ..Default::default()
        };
        assert!(!is_signed(&other));
    }

    #[test]
    fn test_backend_identity() {
        let p = backend();
        assert_eq!(p.auth_header(), "PVEAPIToken=root@pam!mcm=abc-123");
        assert_eq!(p.web_url(), "https://192.168.10.4:8006/");
        assert_eq!(p.url("qemu"), "https://192.168.10.4:8006/api2/json/nodes/pve1/qemu");
        assert_eq!(p.cloud_type(), TYPE_PROXMOX);
        assert!(p.as_proxmox().is_some());
        let (user, auth) = p.ssh_credentials();
        assert_eq!(user, "root");
        assert_eq!(auth, SshAuth::Password("rootpw".into()));
    }

    #[test]
    fn test_to_vm_converts_units() {
        let p = backend();
        let qemu = Qemu {
            vmid: Some(104),
            name: Some("worker-1".into()),
            cpus: Some(2.0),
            maxmem: Some(4.0 * GIB),
            maxdisk: Some(40.0 * GIB),
            status: Some("running".into()),
            lock: None,
        };
        let vm = p.to_vm(&qemu, "104", vec!["192.168.10.50".into()], true);
        assert_eq!(vm.id, "104");
        assert_eq!(vm.ram, 4096.0);
        assert_eq!(vm.storage, 40.0);
        assert_eq!(vm.cloud, "pve1");
        assert!(vm.mcm_create);
    }
}
