use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::wait::WaitConfig;

/// Top-level manager configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub iaas: IaasSettings,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Orchestrator cluster settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Control-plane address. Also appended to node-port addresses of
    /// host-network applications.
    #[serde(default)]
    pub master_ip: String,
    #[serde(default)]
    pub container_engine_ip: String,
    #[serde(default)]
    pub registry_ip: String,
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub master_ssh: SshLogin,
    /// Container runtime config file on a fresh VM that names the master.
    #[serde(default = "default_runtime_config_path")]
    pub runtime_config_path: String,
    /// Text in `runtime_config_path` replaced by `master_ip`.
    #[serde(default = "default_runtime_placeholder")]
    pub runtime_master_placeholder: String,
    #[serde(default = "default_runtime_service")]
    pub runtime_service: String,
}

/// Login for a host reached over secure shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshLogin {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// IaaS layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IaasSettings {
    /// Path of the JSON document listing the clouds.
    #[serde(default = "default_iaas_config")]
    pub config_path: PathBuf,
    /// Pause after each Proxmox API call (milliseconds).
    #[serde(default = "default_api_interval")]
    pub api_interval_ms: u64,
}

/// Polling bounds (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_node_ready_timeout")]
    pub node_ready_timeout_secs: u64,
    #[serde(default = "default_app_delete_timeout")]
    pub app_delete_timeout_secs: u64,
    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from("/root/.kube/config")
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_runtime_config_path() -> String {
    "/etc/containerd/config.toml".to_string()
}
fn default_runtime_placeholder() -> String {
    "K8S_MASTER_IP".to_string()
}
fn default_runtime_service() -> String {
    "containerd".to_string()
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_iaas_config() -> PathBuf {
    PathBuf::from("conf/iaas.json")
}
fn default_api_interval() -> u64 {
    1000
}
fn default_wait_timeout() -> u64 {
    1200
}
fn default_poll_interval() -> u64 {
    5
}
fn default_node_ready_timeout() -> u64 {
    600
}
fn default_app_delete_timeout() -> u64 {
    600
}
fn default_ssh_connect_timeout() -> u64 {
    10
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            master_ip: String::new(),
            container_engine_ip: String::new(),
            registry_ip: String::new(),
            kubeconfig: default_kubeconfig(),
            namespace: default_namespace(),
            master_ssh: SshLogin::default(),
            runtime_config_path: default_runtime_config_path(),
            runtime_master_placeholder: default_runtime_placeholder(),
            runtime_service: default_runtime_service(),
        }
    }
}

impl Default for SshLogin {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            password: None,
            key_path: None,
        }
    }
}

impl Default for IaasSettings {
    fn default() -> Self {
        Self {
            config_path: default_iaas_config(),
            api_interval_ms: default_api_interval(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout(),
            poll_interval_secs: default_poll_interval(),
            node_ready_timeout_secs: default_node_ready_timeout(),
            app_delete_timeout_secs: default_app_delete_timeout(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout(),
        }
    }
}

impl ManagerConfig {
    /// Load manager config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manager config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse manager config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).with_context(|| "Failed to parse manager config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (label, ip) in self.cluster.reserved_labeled() {
            if ip.is_empty() {
                continue;
            }
            ip.parse::<Ipv4Addr>()
                .with_context(|| format!("cluster.{} is not an IPv4 address: {:?}", label, ip))?;
            if !seen.insert(ip) {
                anyhow::bail!("cluster.{} repeats reserved address {}", label, ip);
            }
        }
        if self.cluster.master_ssh.password.is_some() && self.cluster.master_ssh.key_path.is_some()
        {
            anyhow::bail!("cluster.master_ssh takes either password or key_path, not both");
        }
        if self.timeouts.poll_interval_secs == 0 {
            anyhow::bail!("timeouts.poll_interval_secs must be at least 1");
        }
        if self.timeouts.poll_interval_secs > self.timeouts.wait_timeout_secs {
            anyhow::bail!(
                "timeouts.poll_interval_secs ({}) exceeds timeouts.wait_timeout_secs ({})",
                self.timeouts.poll_interval_secs,
                self.timeouts.wait_timeout_secs
            );
        }
        Ok(())
    }
}

impl ClusterSettings {
    fn reserved_labeled(&self) -> [(&'static str, &str); 3] {
        [
            ("master_ip", self.master_ip.as_str()),
            ("container_engine_ip", self.container_engine_ip.as_str()),
            ("registry_ip", self.registry_ip.as_str()),
        ]
    }

    /// The three addresses a node may never be added from.
    pub fn reserved_ips(&self) -> Vec<&str> {
        self.reserved_labeled()
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(|ip| !ip.is_empty())
            .collect()
    }

    pub fn is_reserved(&self, ip: &str) -> bool {
        self.reserved_ips().contains(&ip)
    }
}

impl Timeouts {
    pub fn general(&self) -> WaitConfig {
        WaitConfig::from_secs(self.wait_timeout_secs, self.poll_interval_secs)
    }

    pub fn node_ready(&self) -> WaitConfig {
        WaitConfig::from_secs(self.node_ready_timeout_secs, self.poll_interval_secs)
    }

    pub fn app_delete(&self) -> WaitConfig {
        WaitConfig::from_secs(self.app_delete_timeout_secs, self.poll_interval_secs)
    }

    pub fn ssh_connect(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }
}
