// mcm-cli: clap command tree, terminal output
// Depends on mcm-core, mcm-runtime, mcm-iaas, mcm-cluster

pub mod commands;
pub mod display;
pub mod output;
pub mod ui;

pub use commands::run;
