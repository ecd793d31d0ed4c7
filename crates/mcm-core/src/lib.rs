// mcm-core: data model, error kinds, config, wait/retry utilities
// No internal mcm dependencies; everything else builds on it.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod logging;
pub mod naming;
pub mod retry;
pub mod vm;
pub mod wait;

pub use error::{ErrorKind, McmError, Result, ResultExt};
