use crate::error::{McmError, Result};

pub const DEPLOYMENT_SUFFIX: &str = "-deployment";
pub const SERVICE_SUFFIX: &str = "-service";

/// Workload object name of an application.
pub fn deployment_name(app: &str) -> String {
    format!("{}{}", app, DEPLOYMENT_SUFFIX)
}

/// Publish object name of an application.
pub fn service_name(app: &str) -> String {
    format!("{}{}", app, SERVICE_SUFFIX)
}

/// Application name recovered from a workload name.
pub fn app_name_from_deployment(deployment: &str) -> &str {
    deployment
        .strip_suffix(DEPLOYMENT_SUFFIX)
        .unwrap_or(deployment)
}

/// Name of the boot volume created for a VM.
pub fn boot_volume_name(vm: &str) -> String {
    format!("volume-{}", vm)
}

/// Validate an application name: it becomes part of two object names, so it
/// must be a lowercase DNS label short enough to take the longer suffix.
pub fn validate_app_name(name: &str) -> Result<()> {
    let max = 63 - DEPLOYMENT_SUFFIX.len();
    if name.is_empty() || name.len() > max {
        return Err(McmError::validation(format!(
            "app name must be 1-{} characters, got {}",
            max,
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(McmError::validation(format!(
            "app name must be lowercase alphanumeric + hyphens: {:?}",
            name
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(McmError::validation(format!(
            "app name must not start or end with a hyphen: {:?}",
            name
        )));
    }
    Ok(())
}
