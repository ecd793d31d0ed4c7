use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use mcm_core::aggregate::{BatchResult, aggregate};
use mcm_core::config::{ClusterSettings, ManagerConfig};
use mcm_core::vm::{IaasVm, MCM_SIGN, UNKNOWN, find_vm};
use mcm_core::wait::{WaitConfig, wait_for};
use mcm_core::{McmError, Result};
use mcm_iaas::fanout::{create_vms, list_vms_all_clouds};
use mcm_iaas::{CloudRegistry, SSH_PORT};
use mcm_runtime::ssh::{Dialer, SshAuth, SshTarget, exec_checked, run_checked, with_session};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::ClusterApi;
use crate::quantity;
use crate::taint;

/// Label carried by control-plane nodes.
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
const NET_TEST_TAINT_VALUE: &str = "net-test";

const JOIN_TOKEN_CMD: &str = "kubeadm token create --print-join-command";
const REMOTE_KUBE_DIR: &str = "/root/.kube";
const REMOTE_KUBECONFIG: &str = "/root/.kube/config";

/// Taint that keeps ordinary workloads off network measurement nodes.
pub fn net_test_taint() -> Taint {
    Taint {
        key: MCM_SIGN.to_string(),
        value: Some(NET_TEST_TAINT_VALUE.to_string()),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    }
}

/// Cores, MiB and GiB of a node; `-1` when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRes {
    pub cpu_core: f64,
    pub memory: f64,
    pub storage: f64,
}

impl NodeRes {
    pub fn unknown() -> Self {
        Self {
            cpu_core: UNKNOWN,
            memory: UNKNOWN,
            storage: UNKNOWN,
        }
    }

    fn add(&mut self, other: NodeRes) {
        self.cpu_core += other.cpu_core;
        self.memory += other.memory;
        self.storage += other.storage;
    }
}

/// A worker node as listed to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    pub ip: String,
    pub status: String,
    /// What the backing VM offers.
    pub total_resources: NodeRes,
    /// Sum of the requests of the pods on the node.
    pub used_resources: NodeRes,
    /// Carries the network measurement taint.
    pub net_test: bool,
}

pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

/// `Ready`, `NotReady` or `Unknown` from the node's Ready condition.
pub fn node_status(node: &Node) -> &'static str {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"));
    match ready.map(|c| c.status.as_str()) {
        Some("True") => "Ready",
        Some(_) => "NotReady",
        None => "Unknown",
    }
}

fn is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
}

/// Resources requested by the containers of a pod.
pub fn pod_requests(pod: &Pod) -> NodeRes {
    let mut used = NodeRes::default();
    let containers = pod.spec.iter().flat_map(|s| s.containers.iter());
    for requests in containers.filter_map(|c| c.resources.as_ref()?.requests.as_ref()) {
        if let Some(q) = requests.get("cpu") {
            used.cpu_core += quantity::cores(q);
        }
        if let Some(q) = requests.get("memory") {
            used.memory += quantity::mebibytes(q);
        }
        if let Some(q) = requests.get("ephemeral-storage") {
            used.storage += quantity::gibibytes(q);
        }
    }
    used
}

fn best_effort<T>(node: &str, step: &str, outcome: Result<T>) {
    if let Err(e) = outcome {
        warn!(node, step, error = %e, "uninstall step failed, continuing");
    }
}

/// Turns VMs into worker nodes and retires them.
pub struct NodeController {
    registry: Arc<CloudRegistry>,
    dialer: Arc<dyn Dialer>,
    cluster: Arc<dyn ClusterApi>,
    settings: ClusterSettings,
    node_ready: WaitConfig,
}

impl NodeController {
    pub fn new(
        registry: Arc<CloudRegistry>,
        dialer: Arc<dyn Dialer>,
        cluster: Arc<dyn ClusterApi>,
        settings: ClusterSettings,
        node_ready: WaitConfig,
    ) -> Self {
        Self {
            registry,
            dialer,
            cluster,
            settings,
            node_ready,
        }
    }

    pub fn from_config(
        config: &ManagerConfig,
        registry: Arc<CloudRegistry>,
        dialer: Arc<dyn Dialer>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self::new(
            registry,
            dialer,
            cluster,
            config.cluster.clone(),
            config.timeouts.node_ready(),
        )
    }

    fn master_target(&self) -> SshTarget {
        let login = &self.settings.master_ssh;
        let auth = match &login.key_path {
            Some(path) => SshAuth::KeyFile(path.clone()),
            None => SshAuth::Password(login.password.clone().unwrap_or_default()),
        };
        SshTarget::new(&self.settings.master_ip, login.port, &login.user, auth)
    }

    /// Create the VMs, then join every created VM.
    ///
    /// Returns all VMs that were created, joined or not, and one error
    /// covering whatever failed in either step.
    pub async fn add_new_vms(&self, specs: Vec<IaasVm>) -> (Vec<IaasVm>, Option<McmError>) {
        info!(count = specs.len(), "creating vms for new nodes");
        let created = create_vms(&self.registry, specs).await;
        let mut errors = created.failed;
        let vms = created.succeeded;

        if !vms.is_empty() {
            let joined = self.add_nodes(vms.clone()).await;
            errors.extend(joined.failed);
        }
        (vms, aggregate(errors))
    }

    /// Join VMs in parallel with one shared join token. Successes are node
    /// names.
    pub async fn add_nodes(&self, vms: Vec<IaasVm>) -> BatchResult<String> {
        let join_cmd = match self.join_command().await {
            Ok(cmd) => cmd,
            Err(e) => {
                return vms
                    .iter()
                    .map(|vm| Err(e.clone().context(format!("add node {}", vm.name))))
                    .collect();
            }
        };

        let outcomes = join_all(vms.iter().map(|vm| {
            let join_cmd = join_cmd.as_str();
            async move {
                self.add_node(vm, join_cmd)
                    .await
                    .map(|()| vm.name.clone())
                    .map_err(|e| e.context(format!("add node {}", vm.name)))
            }
        }))
        .await;
        outcomes.into_iter().collect()
    }

    /// Print a fresh join command on the master. Tokens stay valid for a day.
    pub async fn join_command(&self) -> Result<String> {
        let out = exec_checked(self.dialer.as_ref(), &self.master_target(), JOIN_TOKEN_CMD)
            .await
            .map_err(|e| e.context("create join token"))?;
        let cmd = out.trim();
        if cmd.is_empty() {
            return Err(McmError::backend("master printed an empty join command"));
        }
        Ok(cmd.to_string())
    }

    /// Bootstrap one VM into the cluster and wait until its node is Ready.
    pub async fn add_node(&self, vm: &IaasVm, join_cmd: &str) -> Result<()> {
        let Some(ip) = vm.primary_ip() else {
            return Err(McmError::validation(format!("vm {} has no IP address", vm.name)));
        };
        if self.settings.is_reserved(ip) {
            return Err(McmError::validation(format!(
                "vm {} uses reserved address {}",
                vm.name, ip
            )));
        }
        let cloud = self.registry.require(&vm.cloud)?;
        let (user, auth) = cloud.ssh_credentials();
        let target = SshTarget::new(ip, SSH_PORT, user, auth);

        let commands = vec![
            format!(
                "sed -i 's/{}/{}/g' {}",
                self.settings.runtime_master_placeholder,
                self.settings.master_ip,
                self.settings.runtime_config_path
            ),
            format!("systemctl restart {}", self.settings.runtime_service),
            "systemctl enable kubelet".to_string(),
            format!("{} --node-name={}", join_cmd, vm.name),
        ];
        info!(vm = %vm.name, ip, "joining vm to the cluster");
        with_session(self.dialer.as_ref(), &target, move |s| {
            Box::pin(async move {
                for cmd in &commands {
                    run_checked(s, cmd).await?;
                }
                Ok(())
            })
        })
        .await?;

        self.wait_node_ready(&vm.name).await?;
        info!(node = %vm.name, "node is ready");
        Ok(())
    }

    async fn wait_node_ready(&self, name: &str) -> Result<()> {
        let label = format!("node {} ready", name);
        let cluster = self.cluster.as_ref();
        wait_for(&label, self.node_ready, || async move {
            Ok(cluster
                .get_node(name)
                .await?
                .is_some_and(|n| node_status(&n) == "Ready"))
        })
        .await
    }

    pub async fn taint_node(&self, name: &str, t: &Taint) -> Result<()> {
        taint::taint_node(self.cluster.as_ref(), name, t).await
    }

    /// Drain, reset and delete a node.
    ///
    /// The drain and the final delete must succeed. The reset on the node
    /// itself is best-effort so broken nodes can still be removed.
    pub async fn uninstall_node(&self, name: &str) -> Result<()> {
        let node = self
            .cluster
            .get_node(name)
            .await?
            .ok_or_else(|| McmError::not_found(format!("node {}", name)))?;

        info!(node = name, "draining node");
        exec_checked(
            self.dialer.as_ref(),
            &self.master_target(),
            &format!("kubectl drain {} --ignore-daemonsets --delete-emptydir-data", name),
        )
        .await
        .map_err(|e| e.context(format!("drain node {}", name)))?;

        match node_internal_ip(&node) {
            Some(ip) => self.reset_node(name, &ip).await,
            None => warn!(node = name, "node has no internal IP, skipping reset"),
        }

        self.cluster.delete_node(name).await?;
        info!(node = name, "node removed");
        Ok(())
    }

    async fn reset_node(&self, name: &str, ip: &str) {
        let target = self.node_target(name, ip).await;
        let kubeconfig: PathBuf = self.settings.kubeconfig.clone();
        let node = name.to_string();
        let outcome = with_session(self.dialer.as_ref(), &target, move |s| {
            Box::pin(async move {
                let mkdir = format!("mkdir -p {}", REMOTE_KUBE_DIR);
                best_effort(&node, "create kube dir", run_checked(s, &mkdir).await);
                best_effort(
                    &node,
                    "copy kubeconfig",
                    s.copy_file(&kubeconfig, REMOTE_KUBECONFIG).await,
                );
                best_effort(&node, "kubeadm reset", run_checked(s, "kubeadm reset -f").await);
                let rm = format!("rm -f {}", REMOTE_KUBECONFIG);
                best_effort(&node, "remove kubeconfig", run_checked(s, &rm).await);
                Ok(())
            })
        })
        .await;
        best_effort(name, "connect", outcome);
    }

    /// Login for a node: its VM's cloud credentials when the VM is found,
    /// the master login otherwise.
    async fn node_target(&self, name: &str, ip: &str) -> SshTarget {
        let vms = list_vms_all_clouds(&self.registry).await.succeeded;
        let cloud = find_vm(name, &vms)
            .filter(|vm| vm.primary_ip() == Some(ip))
            .and_then(|vm| self.registry.get(&vm.cloud));
        match cloud {
            Some(cloud) => {
                let (user, auth) = cloud.ssh_credentials();
                SshTarget::new(ip, SSH_PORT, user, auth)
            }
            None => {
                let master = self.master_target();
                SshTarget::new(ip, SSH_PORT, master.user, master.auth)
            }
        }
    }

    /// Uninstall nodes in parallel. Successes are node names.
    pub async fn uninstall_batch_nodes(&self, names: &[String]) -> BatchResult<String> {
        let outcomes = join_all(names.iter().map(|name| async move {
            self.uninstall_node(name)
                .await
                .map(|()| name.clone())
                .map_err(|e| e.context(format!("uninstall node {}", name)))
        }))
        .await;
        outcomes.into_iter().collect()
    }

    /// Worker nodes with their used and total resources.
    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let (vms, vm_err) = list_vms_all_clouds(&self.registry).await.into_parts();
        if let Some(e) = vm_err {
            warn!(error = %e, "some clouds could not list vms, totals may be unknown");
        }
        let nodes = self.cluster.list_nodes().await?;

        let workers: Vec<&Node> = nodes.iter().filter(|n| !is_control_plane(n)).collect();
        let measurement = net_test_taint();
        let infos = join_all(workers.into_iter().map(|node| {
            let vms = &vms;
            let measurement = &measurement;
            async move {
                let name = node.metadata.name.clone().unwrap_or_default();
                let ip = node_internal_ip(node).unwrap_or_default();

                let used_resources = match self.cluster.list_pods_on_node(&name).await {
                    Ok(pods) => pods.iter().fold(NodeRes::default(), |mut acc, p| {
                        acc.add(pod_requests(p));
                        acc
                    }),
                    Err(e) => {
                        warn!(node = %name, error = %e, "listing pods on node failed");
                        NodeRes::unknown()
                    }
                };
                let total_resources = find_vm(&name, vms)
                    .filter(|vm| vm.primary_ip() == Some(ip.as_str()))
                    .map(|vm| NodeRes {
                        cpu_core: vm.vcpu,
                        memory: vm.ram,
                        storage: vm.storage,
                    })
                    .unwrap_or_else(NodeRes::unknown);

                NodeInfo {
                    status: node_status(node).to_string(),
                    net_test: taint::node_has_taint(node, measurement),
                    name,
                    ip,
                    total_resources,
                    used_resources,
                }
            }
        }))
        .await;
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeCluster;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        Container, NodeAddress, NodeCondition, NodeStatus, PodSpec, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mcm_core::ErrorKind;
    use mcm_core::vm::ResourceStatus;
    use mcm_iaas::Iaas;
    use mcm_runtime::ssh::{CommandOutput, SshSession};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MASTER: &str = "192.168.1.10";
    const JOIN: &str = "kubeadm join 192.168.1.10:6443 --token abc.def --discovery-token-ca-cert-hash sha256:00";

    #[derive(Default)]
    struct RecordingDialer {
        dials: AtomicUsize,
        /// `host: command` for every command run.
        log: Arc<Mutex<Vec<String>>>,
        /// Commands containing this text exit 1.
        fail_on: Option<&'static str>,
    }

    struct RecordingSession {
        host: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl SshSession for RecordingSession {
        async fn run(&mut self, command: &str) -> Result<CommandOutput> {
            self.log.lock().unwrap().push(format!("{}: {}", self.host, command));
            let failed = self.fail_on.is_some_and(|f| command.contains(f));
            let output = if command == JOIN_TOKEN_CMD {
                format!("{}\n", JOIN)
            } else {
                String::new()
            };
            Ok(CommandOutput {
                output,
                exit_status: Some(if failed { 1 } else { 0 }),
            })
        }

        async fn copy_file(&mut self, _local: &Path, remote: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}: copy {}", self.host, remote));
            Ok(())
        }

        async fn close(self: Box<Self>) {}
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, target: &SshTarget) -> Result<Box<dyn SshSession>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingSession {
                host: target.host.clone(),
                log: self.log.clone(),
                fail_on: self.fail_on,
            }))
        }
    }

    struct StaticCloud {
        vms: Vec<IaasVm>,
    }

    #[async_trait]
    impl Iaas for StaticCloud {
        fn name(&self) -> &str {
            "pve"
        }
        fn cloud_type(&self) -> &str {
            "proxmox"
        }
        fn web_url(&self) -> String {
            String::new()
        }
        async fn get_vm(&self, id: &str) -> Result<IaasVm> {
            Err(McmError::not_found(id))
        }
        async fn list_all_vms(&self) -> Result<Vec<IaasVm>> {
            Ok(self.vms.clone())
        }
        async fn create_vm(&self, name: &str, vcpu: u32, ram_mib: u64, storage_gib: u64) -> Result<IaasVm> {
            Ok(IaasVm {
                id: "200".into(),
                name: name.into(),
                ips: vec!["10.0.0.20".into()],
                vcpu: vcpu as f64,
                ram: ram_mib as f64,
                storage: storage_gib as f64,
                cloud: "pve".into(),
                ..Default::default()
            })
        }
        async fn delete_vm(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn check_resources(&self) -> Result<ResourceStatus> {
            Ok(ResourceStatus::unknown())
        }
        async fn is_created_by_mcm(&self, _id: &str) -> Result<bool> {
            Ok(true)
        }
        fn ssh_credentials(&self) -> (String, SshAuth) {
            ("root".into(), SshAuth::Password("vm-pw".into()))
        }
    }

    fn settings() -> ClusterSettings {
        let mut cfg = ManagerConfig::parse(&format!(
            r#"
            [cluster]
            master_ip = "{}"
            container_engine_ip = "192.168.1.11"
            registry_ip = "192.168.1.12"
            [cluster.master_ssh]
            password = "master-pw"
            "#,
            MASTER
        ))
        .unwrap();
        cfg.cluster.kubeconfig = PathBuf::from("/tmp/admin.conf");
        cfg.cluster
    }

    fn vm(name: &str, ip: &str) -> IaasVm {
        IaasVm {
            id: "101".into(),
            name: name.into(),
            ips: if ip.is_empty() { vec![] } else { vec![ip.into()] },
            vcpu: 4.0,
            ram: 8192.0,
            storage: 50.0,
            cloud: "pve".into(),
            ..Default::default()
        }
    }

    fn ready_node(name: &str, ip: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    address: ip.into(),
                    type_: "InternalIP".into(),
                }]),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_on(node: &str, cpu: &str, mem: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("p-{}", cpu)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.into()),
                containers: vec![Container {
                    name: "c".into(),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity(cpu.into())),
                            ("memory".to_string(), Quantity(mem.into())),
                        ])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Harness {
        dialer: Arc<RecordingDialer>,
        cluster: Arc<FakeCluster>,
        controller: NodeController,
    }

    fn harness(dialer: RecordingDialer, cluster: FakeCluster, vms: Vec<IaasVm>) -> Harness {
        let dialer = Arc::new(dialer);
        let cluster = Arc::new(cluster);
        let registry =
            CloudRegistry::from_backends(vec![Arc::new(StaticCloud { vms }) as Arc<dyn Iaas>]).unwrap();
        let controller = NodeController::new(
            Arc::new(registry),
            dialer.clone(),
            cluster.clone(),
            settings(),
            WaitConfig::new(Duration::from_millis(200), Duration::from_millis(10)),
        );
        Harness {
            dialer,
            cluster,
            controller,
        }
    }

    #[tokio::test]
    async fn test_add_node_rejects_reserved_ip_without_dialing() {
        let h = harness(RecordingDialer::default(), FakeCluster::default(), vec![]);
        for ip in [MASTER, "192.168.1.11", "192.168.1.12"] {
            let err = h.controller.add_node(&vm("n1", ip), JOIN).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_node_rejects_vm_without_ip() {
        let h = harness(RecordingDialer::default(), FakeCluster::default(), vec![]);
        let err = h.controller.add_node(&vm("n1", ""), JOIN).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_node_runs_bootstrap_in_order() {
        let cluster = FakeCluster::default().with_node(ready_node("n1", "10.0.0.5"));
        let h = harness(RecordingDialer::default(), cluster, vec![]);
        h.controller.add_node(&vm("n1", "10.0.0.5"), JOIN).await.unwrap();

        let log = h.dialer.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "10.0.0.5: sed -i 's/K8S_MASTER_IP/192.168.1.10/g' /etc/containerd/config.toml".to_string(),
                "10.0.0.5: systemctl restart containerd".to_string(),
                "10.0.0.5: systemctl enable kubelet".to_string(),
                format!("10.0.0.5: {} --node-name=n1", JOIN),
            ]
        );
        assert_eq!(h.dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_node_times_out_when_node_never_ready() {
        let h = harness(RecordingDialer::default(), FakeCluster::default(), vec![]);
        let err = h.controller.add_node(&vm("n1", "10.0.0.5"), JOIN).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_add_node_stops_on_failed_step() {
        let dialer = RecordingDialer {
            fail_on: Some("systemctl restart"),
            ..Default::default()
        };
        let h = harness(dialer, FakeCluster::default(), vec![]);
        let err = h.controller.add_node(&vm("n1", "10.0.0.5"), JOIN).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(h.dialer.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_nodes_shares_one_join_token() {
        let cluster = FakeCluster::default()
            .with_node(ready_node("n1", "10.0.0.5"))
            .with_node(ready_node("n2", "10.0.0.6"));
        let h = harness(RecordingDialer::default(), cluster, vec![]);
        let batch = h
            .controller
            .add_nodes(vec![vm("n1", "10.0.0.5"), vm("n2", "10.0.0.6"), vm("bad", MASTER)])
            .await;

        assert_eq!(batch.success_count(), 2);
        assert_eq!(batch.failure_count(), 1);
        let log = h.dialer.log.lock().unwrap();
        let token_calls = log.iter().filter(|l| l.ends_with(JOIN_TOKEN_CMD)).count();
        assert_eq!(token_calls, 1);
        assert!(log.iter().any(|l| l.starts_with(MASTER)));
    }

    #[tokio::test]
    async fn test_add_nodes_without_token_fails_each_vm() {
        let dialer = RecordingDialer {
            fail_on: Some("kubeadm token"),
            ..Default::default()
        };
        let h = harness(dialer, FakeCluster::default(), vec![]);
        let batch = h
            .controller
            .add_nodes(vec![vm("n1", "10.0.0.5"), vm("n2", "10.0.0.6")])
            .await;
        assert_eq!(batch.failure_count(), 2);
        assert_eq!(batch.total(), 2);
    }

    #[tokio::test]
    async fn test_add_new_vms_returns_created_vms() {
        let cluster = FakeCluster::default().with_node(ready_node("w1", "10.0.0.20"));
        let h = harness(RecordingDialer::default(), cluster, vec![]);
        let spec = IaasVm {
            name: "w1".into(),
            cloud: "pve".into(),
            vcpu: 2.0,
            ram: 2048.0,
            storage: 20.0,
            ..Default::default()
        };
        let missing = IaasVm {
            cloud: "aws".into(),
            ..spec.clone()
        };
        let (vms, err) = h.controller.add_new_vms(vec![spec, missing]).await;
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].ips, vec!["10.0.0.20".to_string()]);
        match err.unwrap() {
            McmError::PartialFailure(subs) => {
                assert_eq!(subs.len(), 1);
                assert!(subs[0].is_not_found());
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_uninstall_node() {
        let cluster = FakeCluster::default().with_node(ready_node("n1", "10.0.0.5"));
        let h = harness(
            RecordingDialer::default(),
            cluster,
            vec![vm("n1", "10.0.0.5")],
        );
        h.controller.uninstall_node("n1").await.unwrap();

        let log = h.dialer.log.lock().unwrap().clone();
        assert!(log[0].starts_with(&format!("{}: kubectl drain n1", MASTER)));
        assert_eq!(
            &log[1..],
            &[
                "10.0.0.5: mkdir -p /root/.kube".to_string(),
                "10.0.0.5: copy /root/.kube/config".to_string(),
                "10.0.0.5: kubeadm reset -f".to_string(),
                "10.0.0.5: rm -f /root/.kube/config".to_string(),
            ]
        );
        assert!(h.cluster.nodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_tolerates_failed_reset() {
        let dialer = RecordingDialer {
            fail_on: Some("kubeadm reset"),
            ..Default::default()
        };
        let cluster = FakeCluster::default().with_node(ready_node("n1", "10.0.0.5"));
        let h = harness(dialer, cluster, vec![]);
        h.controller.uninstall_node("n1").await.unwrap();
        assert!(h.cluster.nodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_stops_when_drain_fails() {
        let dialer = RecordingDialer {
            fail_on: Some("kubectl drain"),
            ..Default::default()
        };
        let cluster = FakeCluster::default().with_node(ready_node("n1", "10.0.0.5"));
        let h = harness(dialer, cluster, vec![]);
        assert!(h.controller.uninstall_node("n1").await.is_err());
        assert_eq!(h.cluster.nodes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uninstall_batch_aggregates() {
        let cluster = FakeCluster::default().with_node(ready_node("n1", "10.0.0.5"));
        let h = harness(RecordingDialer::default(), cluster, vec![]);
        let batch = h
            .controller
            .uninstall_batch_nodes(&["n1".to_string(), "ghost".to_string()])
            .await;
        assert_eq!(batch.succeeded, vec!["n1".to_string()]);
        assert!(batch.failed[0].is_not_found());
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let mut master = ready_node("master", MASTER);
        master.metadata.labels = Some(BTreeMap::from([(CONTROL_PLANE_LABEL.to_string(), String::new())]));
        let cluster = FakeCluster::default()
            .with_node(master)
            .with_node(ready_node("n1", "10.0.0.5"))
            .with_node(ready_node("n2", "10.0.0.6"))
            .with_pod(pod_on("n1", "500m", "512Mi"))
            .with_pod(pod_on("n1", "1", "1Gi"));
        let h = harness(RecordingDialer::default(), cluster, vec![vm("n1", "10.0.0.5")]);

        let nodes = h.controller.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        let n1 = nodes.iter().find(|n| n.name == "n1").unwrap();
        assert_eq!(n1.status, "Ready");
        assert_eq!(n1.ip, "10.0.0.5");
        assert_eq!(n1.used_resources.cpu_core, 1.5);
        assert_eq!(n1.used_resources.memory, 1536.0);
        assert_eq!(n1.total_resources.cpu_core, 4.0);

        let n2 = nodes.iter().find(|n| n.name == "n2").unwrap();
        assert_eq!(n2.used_resources, NodeRes::default());
        assert_eq!(n2.total_resources, NodeRes::unknown());
    }

    #[tokio::test]
    async fn test_list_nodes_flags_net_test_nodes() {
        let cluster = FakeCluster::default()
            .with_node(ready_node("n1", "10.0.0.5"))
            .with_node(ready_node("n2", "10.0.0.6"));
        let h = harness(RecordingDialer::default(), cluster, vec![]);
        h.controller.taint_node("n2", &net_test_taint()).await.unwrap();

        let nodes = h.controller.list_nodes().await.unwrap();
        let flagged: Vec<&str> = nodes
            .iter()
            .filter(|n| n.net_test)
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(flagged, vec!["n2"]);
    }

    #[test]
    fn test_net_test_taint() {
        let t = net_test_taint();
        assert_eq!(t.key, MCM_SIGN);
        assert_eq!(t.value.as_deref(), Some("net-test"));
        assert_eq!(t.effect, "NoSchedule");
    }

    #[test]
    fn test_node_status() {
        assert_eq!(node_status(&ready_node("a", "1.1.1.1")), "Ready");
        assert_eq!(node_status(&Node::default()), "Unknown");
    }
}
