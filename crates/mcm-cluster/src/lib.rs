// mcm-cluster: node membership and application lifecycle on the orchestrator
// Depends on mcm-core, mcm-runtime, mcm-iaas

pub mod api;
pub mod apps;
pub mod kube_client;
pub mod nodes;
pub mod quantity;
pub mod taint;

pub use api::ClusterApi;
pub use apps::AppEngine;
pub use kube_client::KubeCluster;
pub use nodes::NodeController;
