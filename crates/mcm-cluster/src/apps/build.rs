//! Translation of an application descriptor into orchestrator objects.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, ExecAction, HostPathVolumeSource, Lifecycle,
    LifecycleHandler, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use mcm_core::naming::{deployment_name, service_name, validate_app_name};
use mcm_core::{McmError, Result};

use super::model::{
    ANNO_AUTO_SCHEDULE, ANNO_PRIORITY, K8sApp, K8sContainer, MAX_PRIORITY, MIN_PRIORITY,
    PortInfo, ResourceList,
};

pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const PRE_STOP_SLEEP: &[&str] = &["/bin/sh", "-c", "sleep 10"];

pub fn validate_app(app: &K8sApp) -> Result<()> {
    validate_app_name(&app.name)?;
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&app.priority) {
        return Err(McmError::validation(format!(
            "priority should be in [{}, {}], got {}",
            MIN_PRIORITY, MAX_PRIORITY, app.priority
        )));
    }
    if app.replicas < 1 {
        return Err(McmError::validation(format!(
            "replicas must be at least 1, got {}",
            app.replicas
        )));
    }
    if app.containers.is_empty() {
        return Err(McmError::validation("an application needs at least one container"));
    }
    Ok(())
}

/// The `app=<name>` label shared by the workload, its pods and the service.
pub fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

pub fn app_selector(app: &str) -> String {
    format!("app={}", app)
}

/// One host-path volume per distinct VM path, named `volume<k>` in order of
/// first appearance, plus the path → volume name lookup.
pub fn volumes(app: &K8sApp) -> (Vec<Volume>, HashMap<String, String>) {
    let mut names: HashMap<String, String> = HashMap::new();
    let mut volumes = Vec::new();
    for mount in app.containers.iter().flat_map(|c| c.mounts.iter()) {
        if names.contains_key(&mount.vm_path) {
            continue;
        }
        let name = format!("volume{}", names.len());
        volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: mount.vm_path.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        });
        names.insert(mount.vm_path.clone(), name);
    }
    (volumes, names)
}

fn quantities(list: &ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = [
        ("cpu", &list.cpu),
        ("memory", &list.memory),
        ("ephemeral-storage", &list.storage),
    ]
    .into_iter()
    .filter(|(_, v)| !v.is_empty())
    .map(|(k, v)| (k.to_string(), Quantity(v.clone())))
    .collect();
    (!map.is_empty()).then_some(map)
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}

fn container(c: &K8sContainer, volume_names: &HashMap<String, String>) -> Container {
    let mounts = c
        .mounts
        .iter()
        .filter_map(|m| {
            volume_names.get(&m.vm_path).map(|name| VolumeMount {
                name: name.clone(),
                mount_path: m.container_path.clone(),
                ..Default::default()
            })
        })
        .collect();
    let ports = c
        .ports
        .iter()
        .map(|p| ContainerPort {
            container_port: p.container_port,
            name: (!p.name.is_empty()).then(|| p.name.clone()),
            protocol: (!p.protocol.is_empty()).then(|| p.protocol.to_uppercase()),
            ..Default::default()
        })
        .collect();
    let env = c
        .env
        .iter()
        .map(|e| EnvVar {
            name: e.name.clone(),
            value: Some(e.value.clone()),
            ..Default::default()
        })
        .collect();

    Container {
        name: c.name.clone(),
        image: Some(c.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(ResourceRequirements {
            limits: quantities(&c.resources.limits),
            requests: quantities(&c.resources.requests),
            ..Default::default()
        }),
        working_dir: (!c.work_dir.is_empty()).then(|| c.work_dir.clone()),
        command: non_empty(c.commands.clone()),
        args: non_empty(c.args.clone()),
        env: non_empty(env),
        volume_mounts: non_empty(mounts),
        ports: non_empty(ports),
        // gives load balancers time to drop the pod before it is killed
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(PRE_STOP_SLEEP.iter().map(|s| s.to_string()).collect()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `(maxUnavailable, maxSurge)`. A single replica never goes unavailable.
pub fn rolling_update_params(replicas: i32) -> (i32, i32) {
    if replicas == 1 { (0, 1) } else { (1, 1) }
}

/// The replicated workload of an application.
pub fn build_deployment(app: &K8sApp, namespace: &str) -> Deployment {
    let labels = app_labels(&app.name);
    let (volumes, volume_names) = volumes(app);
    let containers = app
        .containers
        .iter()
        .map(|c| container(c, &volume_names))
        .collect();
    let (max_unavailable, max_surge) = rolling_update_params(app.replicas);

    let annotations = app.auto_scheduled.then(|| {
        BTreeMap::from([
            (ANNO_AUTO_SCHEDULE.to_string(), app.auto_scheduled.to_string()),
            (ANNO_PRIORITY.to_string(), app.priority.to_string()),
        ])
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(&app.name)),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(max_unavailable)),
                    max_surge: Some(IntOrString::Int(max_surge)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(app.host_network),
                    // host-network pods otherwise lose cluster DNS
                    dns_policy: app
                        .host_network
                        .then(|| "ClusterFirstWithHostNet".to_string()),
                    containers,
                    volumes: non_empty(volumes),
                    affinity: Some(Affinity {
                        pod_anti_affinity: Some(PodAntiAffinity {
                            required_during_scheduling_ignored_during_execution: Some(vec![
                                PodAffinityTerm {
                                    topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                                    label_selector: Some(LabelSelector {
                                        match_labels: Some(labels),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    node_name: app.node_name.clone().filter(|n| !n.is_empty()),
                    node_selector: app.node_selector.clone().filter(|s| !s.is_empty()),
                    tolerations: app.tolerations.clone().filter(|t| !t.is_empty()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn parse_port(field: &str, port: &PortInfo, text: &str) -> Result<i32> {
    text.trim().parse::<i32>().map_err(|_| {
        McmError::validation(format!(
            "port {:?}: {} {:?} is not an integer",
            port.name, field, text
        ))
    })
}

fn service_port(p: &PortInfo) -> Result<ServicePort> {
    let port = if p.service_port.is_empty() {
        p.container_port
    } else {
        parse_port("servicePort", p, &p.service_port)?
    };
    let node_port = if p.node_port.is_empty() {
        None
    } else {
        Some(parse_port("nodePort", p, &p.node_port)?)
    };
    Ok(ServicePort {
        name: (!p.name.is_empty()).then(|| p.name.clone()),
        protocol: (!p.protocol.is_empty()).then(|| p.protocol.to_uppercase()),
        port,
        node_port,
        target_port: Some(IntOrString::Int(p.container_port)),
        ..Default::default()
    })
}

/// The publish object, or `None` when no port asks to be published.
pub fn build_service(app: &K8sApp, namespace: &str) -> Result<Option<Service>> {
    let published: Vec<&PortInfo> = app
        .containers
        .iter()
        .flat_map(|c| c.ports.iter())
        .filter(|p| p.is_published())
        .collect();
    if published.is_empty() {
        return Ok(None);
    }

    let ports = published
        .iter()
        .map(|p| service_port(p))
        .collect::<Result<Vec<_>>>()?;
    let type_ = if published.iter().any(|p| !p.node_port.is_empty()) {
        "NodePort"
    } else {
        "ClusterIP"
    };

    Ok(Some(Service {
        metadata: ObjectMeta {
            name: Some(service_name(&app.name)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(app_labels(&app.name)),
            type_: Some(type_.to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }))
}
