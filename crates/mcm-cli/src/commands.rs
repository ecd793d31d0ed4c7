use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Taint;
use serde::de::DeserializeOwned;

use crate::display::{AppRow, CloudRow, NodeRow, VmRow};
use crate::output::{self, OutputFormat};
use crate::ui;

use mcm_cluster::apps::build::validate_app;
use mcm_cluster::apps::model::K8sApp;
use mcm_cluster::{AppEngine, ClusterApi, KubeCluster, NodeController};
use mcm_core::aggregate::BatchResult;
use mcm_core::config::ManagerConfig;
use mcm_core::logging::{self, LogFormat};
use mcm_core::McmError;
use mcm_core::vm::IaasVm;
use mcm_iaas::{BackendOptions, CloudRegistry, IaasConfigDoc, cloud, fanout};
use mcm_runtime::ssh::{Dialer, RusshDialer};

#[derive(Parser)]
#[command(
    name = "mcmctl",
    version,
    about = "Multi-cloud manager: VMs across IaaS clouds, cluster nodes and applications"
)]
struct Cli {
    /// Manager config file (TOML); built-in defaults when omitted
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configured IaaS clouds and their quotas
    Cloud {
        #[command(subcommand)]
        action: CloudCmd,
    },
    /// Virtual machines across all clouds
    Vm {
        #[command(subcommand)]
        action: VmCmd,
    },
    /// Cluster membership of VMs
    Node {
        #[command(subcommand)]
        action: NodeCmd,
    },
    /// Applications running on the cluster
    App {
        #[command(subcommand)]
        action: AppCmd,
    },
    /// Manager configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum CloudCmd {
    /// List every cloud with its resource usage
    List,
    /// Show one cloud and the VMs it runs
    Show {
        /// Cloud name
        name: String,
    },
}

#[derive(Subcommand)]
enum VmCmd {
    /// List VMs of all clouds
    List {
        /// Only VMs whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Create VMs from a JSON array of VM specs
    Create {
        /// JSON file: [{"name", "cloud", "vcpu", "ram", "storage"}, ...]
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// Delete VMs created by this manager
    Delete {
        /// Cloud the VMs belong to
        #[arg(long, required_unless_present = "file", requires = "id")]
        cloud: Option<String>,
        /// VM ids on that cloud
        #[arg(long, num_args = 1..)]
        id: Vec<String>,
        /// JSON file: [{"id", "name", "cloud"}, ...]
        #[arg(long, short = 'f', conflicts_with_all = ["cloud", "id"])]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    /// List cluster worker nodes with their resources
    List,
    /// Join existing VMs to the cluster
    Add {
        /// JSON file: array of VMs with name, cloud and ips
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// Create VMs, then join them to the cluster
    AddNew {
        /// JSON file: array of VM specs
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// Drain, reset and remove nodes from the cluster
    Remove {
        /// Node names
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Add or update a taint on a node
    Taint {
        /// Node name
        name: String,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "")]
        value: String,
        #[arg(
            long,
            default_value = "NoSchedule",
            value_parser = ["NoSchedule", "PreferNoSchedule", "NoExecute"]
        )]
        effect: String,
    },
}

#[derive(Subcommand)]
enum AppCmd {
    /// Create an application from a JSON descriptor
    Create {
        /// JSON file with the application descriptor
        #[arg(long, short = 'f')]
        file: PathBuf,
        /// Wait until every replica is up
        #[arg(long)]
        wait: bool,
    },
    /// List applications
    List,
    /// Show one application
    Get {
        /// Application name
        name: String,
    },
    /// Delete an application and wait for its pods to go
    Delete {
        /// Application name
        name: String,
    },
    /// Wait until an application is running
    Wait {
        /// Application name
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective configuration
    Show,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::init(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    let config = load_config(cli.config.as_deref())?;
    let out_fmt = cli.output;

    match cli.command {
        Commands::Cloud { action } => cmd_cloud(action, &config, out_fmt),
        Commands::Vm { action } => cmd_vm(action, &config, out_fmt),
        Commands::Node { action } => cmd_node(action, &config, out_fmt),
        Commands::App { action } => cmd_app(action, &config, out_fmt),
        Commands::Config { action } => cmd_config(action, &config, out_fmt),
    }
}

/// Build a tokio runtime and block on `f`.
pub fn run_async<F, T>(f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    match path {
        Some(p) => ManagerConfig::from_file(p),
        None => Ok(ManagerConfig::default()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file {}", what, path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {} file {}", what, path.display()))
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

fn dialer(config: &ManagerConfig) -> Arc<dyn Dialer> {
    Arc::new(RusshDialer::new(config.timeouts.ssh_connect()))
}

fn registry(config: &ManagerConfig, dialer: Arc<dyn Dialer>) -> Result<Arc<CloudRegistry>> {
    let doc = IaasConfigDoc::from_file(&config.iaas.config_path)?;
    let opts = BackendOptions::from_config(config, dialer);
    let registry = CloudRegistry::from_config(&doc, &opts)
        .with_context(|| format!("Failed to set up clouds from {}", config.iaas.config_path.display()))?;
    Ok(Arc::new(registry))
}

async fn cluster(config: &ManagerConfig) -> Result<Arc<dyn ClusterApi>> {
    let kube = KubeCluster::connect(&config.cluster.kubeconfig, &config.cluster.namespace)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to the cluster with {}",
                config.cluster.kubeconfig.display()
            )
        })?;
    Ok(Arc::new(kube))
}

async fn node_controller(config: &ManagerConfig) -> Result<NodeController> {
    let dialer = dialer(config);
    let registry = registry(config, dialer.clone())?;
    let cluster = cluster(config).await?;
    Ok(NodeController::from_config(config, registry, dialer, cluster))
}

async fn app_engine(config: &ManagerConfig) -> Result<AppEngine> {
    Ok(AppEngine::from_config(config, cluster(config).await?))
}

// ---------------------------------------------------------------------------
// Outcome reporting
// ---------------------------------------------------------------------------

/// Turn a leftover aggregate error into the command's exit status.
fn fail_on(err: Option<McmError>) -> Result<()> {
    match err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Delete requests for ids on one cloud; the id doubles as the name.
fn vms_by_id(cloud: &str, ids: Vec<String>) -> Vec<IaasVm> {
    ids.into_iter()
        .map(|id| IaasVm {
            name: id.clone(),
            id,
            cloud: cloud.to_string(),
            ..Default::default()
        })
        .collect()
}

/// Print the summary line of a fan-out and split it into its parts.
fn report_batch<T>(batch: BatchResult<T>, verb: &str, noun: &str) -> (Vec<T>, Option<McmError>) {
    ui::batch_summary(verb, noun, batch.success_count(), batch.total());
    batch.into_parts()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_cloud(action: CloudCmd, config: &ManagerConfig, out_fmt: OutputFormat) -> Result<()> {
    let registry = registry(config, dialer(config))?;
    match action {
        CloudCmd::List => {
            let (clouds, err) = run_async(async { Ok(cloud::list_clouds(&registry).await) })?;
            output::render_list(&clouds, out_fmt, |x| CloudRow::from(x));
            fail_on(err)
        }
        CloudCmd::Show { name } => {
            let (detail, err) = run_async(async {
                cloud::get_cloud(&registry, &name)
                    .await
                    .with_context(|| format!("Failed to show cloud {}", name))
            })?;
            match out_fmt {
                OutputFormat::Json => output::render_one(&detail, out_fmt, |d| CloudRow::from(&d.info)),
                OutputFormat::Table => {
                    output::render_one(&detail.info, out_fmt, |x| CloudRow::from(x));
                    output::render_list(&detail.vms, out_fmt, |x| VmRow::from(x));
                }
            }
            fail_on(err)
        }
    }
}

fn cmd_vm(action: VmCmd, config: &ManagerConfig, out_fmt: OutputFormat) -> Result<()> {
    match action {
        VmCmd::List { prefix } => {
            let registry = registry(config, dialer(config))?;
            match prefix {
                Some(prefix) => {
                    let vms = run_async(async {
                        Ok(fanout::list_vms_name_prefix(&registry, &prefix).await?)
                    })?;
                    output::render_list(&vms, out_fmt, |x| VmRow::from(x));
                    Ok(())
                }
                None => {
                    let batch = run_async(async { Ok(fanout::list_vms_all_clouds(&registry).await) })?;
                    let (vms, err) = batch.into_parts();
                    output::render_list(&vms, out_fmt, |x| VmRow::from(x));
                    fail_on(err)
                }
            }
        }
        VmCmd::Create { file } => {
            let specs: Vec<IaasVm> = read_json(&file, "VM spec")?;
            let registry = registry(config, dialer(config))?;
            let total = specs.len();
            ui::info(&format!("Creating {} vms...", total));
            let batch = run_async(async { Ok(fanout::create_vms(&registry, specs).await) })?;
            let (vms, err) = report_batch(batch, "created", "vms");
            output::render_list(&vms, out_fmt, |x| VmRow::from(x));
            fail_on(err)
        }
        VmCmd::Delete { cloud, id, file } => {
            let vms = match (file, cloud) {
                (Some(file), _) => read_json(&file, "VM list")?,
                (None, Some(cloud)) => vms_by_id(&cloud, id),
                (None, None) => Vec::new(),
            };
            let registry = registry(config, dialer(config))?;
            ui::info(&format!("Deleting {} vms...", vms.len()));
            let batch = run_async(async { Ok(fanout::delete_vms(&registry, vms).await) })?;
            let (deleted, err) = report_batch(batch, "deleted", "vms");
            for name in &deleted {
                ui::info(&format!("deleted {}", name));
            }
            fail_on(err)
        }
    }
}

fn cmd_node(action: NodeCmd, config: &ManagerConfig, out_fmt: OutputFormat) -> Result<()> {
    match action {
        NodeCmd::List => {
            let nodes = run_async(async {
                let controller = node_controller(config).await?;
                Ok(controller.list_nodes().await?)
            })?;
            output::render_list(&nodes, out_fmt, |x| NodeRow::from(x));
            Ok(())
        }
        NodeCmd::Add { file } => {
            let vms: Vec<IaasVm> = read_json(&file, "VM list")?;
            let batch = run_async(async {
                let controller = node_controller(config).await?;
                Ok(controller.add_nodes(vms).await)
            })?;
            let (_, err) = report_batch(batch, "joined", "nodes");
            fail_on(err)
        }
        NodeCmd::AddNew { file } => {
            let specs: Vec<IaasVm> = read_json(&file, "VM spec")?;
            ui::info(&format!("Creating and joining {} vms...", specs.len()));
            let (joined, err) = run_async(async {
                let controller = node_controller(config).await?;
                Ok(controller.add_new_vms(specs).await)
            })?;
            output::render_list(&joined, out_fmt, |x| VmRow::from(x));
            fail_on(err)
        }
        NodeCmd::Remove { names } => {
            let batch = run_async(async {
                let controller = node_controller(config).await?;
                Ok(controller.uninstall_batch_nodes(&names).await)
            })?;
            let (_, err) = report_batch(batch, "removed", "nodes");
            fail_on(err)
        }
        NodeCmd::Taint {
            name,
            key,
            value,
            effect,
        } => {
            let taint = Taint {
                key,
                value: (!value.is_empty()).then_some(value),
                effect,
                time_added: None,
            };
            run_async(async {
                let controller = node_controller(config).await?;
                controller
                    .taint_node(&name, &taint)
                    .await
                    .with_context(|| format!("Failed to taint node {}", name))
            })?;
            ui::success(&format!("Node {} tainted with {}.", name, taint.key));
            Ok(())
        }
    }
}

fn cmd_app(action: AppCmd, config: &ManagerConfig, out_fmt: OutputFormat) -> Result<()> {
    match action {
        AppCmd::Create { file, wait } => {
            let app: K8sApp = read_json(&file, "application")?;
            validate_app(&app).with_context(|| format!("Invalid application in {}", file.display()))?;
            run_async(async {
                let engine = app_engine(config).await?;
                engine.create_application(&app).await?;
                ui::success(&format!("Application {} created.", app.name));
                if wait {
                    ui::info(&format!("Waiting for {} to run...", app.name));
                    engine
                        .wait_for_app_running(&app.name, config.timeouts.general())
                        .await?;
                    ui::success(&format!("Application {} is running.", app.name));
                }
                Ok(())
            })
        }
        AppCmd::List => {
            let apps = run_async(async { Ok(app_engine(config).await?.list_applications().await?) })?;
            output::render_list(&apps, out_fmt, |x| AppRow::from(x));
            Ok(())
        }
        AppCmd::Get { name } => {
            let app = run_async(async { Ok(app_engine(config).await?.get_application(&name).await?) })?;
            output::render_one(&app, out_fmt, |x| AppRow::from(x));
            Ok(())
        }
        AppCmd::Delete { name } => {
            run_async(async {
                app_engine(config)
                    .await?
                    .delete_application(&name)
                    .await
                    .with_context(|| format!("Failed to delete application {}", name))
            })?;
            ui::success(&format!("Application {} deleted.", name));
            Ok(())
        }
        AppCmd::Wait { name } => {
            run_async(async {
                Ok(app_engine(config)
                    .await?
                    .wait_for_app_running(&name, config.timeouts.general())
                    .await?)
            })?;
            ui::success(&format!("Application {} is running.", name));
            Ok(())
        }
    }
}

fn cmd_config(action: ConfigCmd, config: &ManagerConfig, out_fmt: OutputFormat) -> Result<()> {
    match action {
        ConfigCmd::Show => {
            match out_fmt {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
                OutputFormat::Table => print!(
                    "{}",
                    toml::to_string_pretty(config).with_context(|| "Failed to render config")?
                ),
            }
            Ok(())
        }
    }
}
