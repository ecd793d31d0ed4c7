use std::collections::BTreeMap;
use std::sync::Arc;

use mcm_core::{McmError, Result};
use tracing::info;

use crate::config::{CloudConfig, IaasConfigDoc};
use crate::openstack::Openstack;
use crate::proxmox::Proxmox;
use crate::{BackendOptions, Iaas};

/// Cloud name → backend. Built once at startup and only read afterwards.
#[derive(Clone, Default)]
pub struct CloudRegistry {
    clouds: BTreeMap<String, Arc<dyn Iaas>>,
}

impl CloudRegistry {
    pub fn from_config(doc: &IaasConfigDoc, opts: &BackendOptions) -> Result<Self> {
        let mut backends: Vec<Arc<dyn Iaas>> = Vec::with_capacity(doc.iaas.len());
        for cloud in &doc.iaas {
            info!(cloud = cloud.name(), cloud_type = cloud.type_tag(), "initialising cloud");
            let backend: Arc<dyn Iaas> = match cloud {
                CloudConfig::Proxmox(c) => Arc::new(Proxmox::new(c.clone(), opts.clone())?),
                CloudConfig::Openstack(c) => Arc::new(Openstack::new(c.clone(), opts.clone())?),
            };
            backends.push(backend);
        }
        let registry = Self::from_backends(backends)?;
        info!(clouds = registry.len(), "all clouds initialised");
        Ok(registry)
    }

    pub fn from_backends(backends: Vec<Arc<dyn Iaas>>) -> Result<Self> {
        let mut clouds = BTreeMap::new();
        for backend in backends {
            let name = backend.name().to_string();
            if clouds.insert(name.clone(), backend).is_some() {
                return Err(McmError::validation(format!("duplicate cloud name {:?}", name)));
            }
        }
        Ok(Self { clouds })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Iaas>> {
        self.clouds.get(name).cloned()
    }

    /// Like [`get`](Self::get), failing with `NotFound` for unknown names.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Iaas>> {
        self.get(name)
            .ok_or_else(|| McmError::not_found(format!("cloud {:?} is not configured", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.clouds.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Iaas>> {
        self.clouds.values()
    }

    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }
}
