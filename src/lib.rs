//! # mcmctl: multi-cloud manager
//!
//! Facade crate that re-exports the mcm workspace crates so consumers
//! can depend on a single `mcmctl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | mcm-core | VM model, error kinds, config, wait/retry, logging |
//! | [`runtime`] | mcm-runtime | Secure shell exec, HTTP client plumbing |
//! | [`iaas`] | mcm-iaas | Proxmox and OpenStack backends, cloud registry, fan-out |
//! | [`cluster`] | mcm-cluster | Node membership, taints, application engine |
//! | [`cli`] | mcm-cli | `mcmctl` command tree |

pub use mcm_cli as cli;
pub use mcm_cluster as cluster;
pub use mcm_core as core;
pub use mcm_iaas as iaas;
pub use mcm_runtime as runtime;
