// mcm-runtime: remote exec over secure shell, HTTP plumbing
// Depends on mcm-core

pub mod http;
pub mod ssh;
