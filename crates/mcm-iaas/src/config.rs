use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::openstack::TYPE_OPENSTACK;
use crate::proxmox::TYPE_PROXMOX;

/// The IaaS configuration document: `{"iaas": [ {name, type, ...}, ... ]}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IaasConfigDoc {
    pub iaas: Vec<CloudConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CloudConfig {
    Proxmox(ProxmoxConfig),
    Openstack(OpenstackConfig),
}

impl CloudConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Proxmox(c) => &c.name,
            Self::Openstack(c) => &c.name,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Proxmox(_) => TYPE_PROXMOX,
            Self::Openstack(_) => TYPE_OPENSTACK,
        }
    }
}

/// A Proxmox VE host. The cloud name doubles as the Proxmox node name.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    pub name: String,
    pub ip: String,
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    /// Web UI / host login, also used for `qm` commands over ssh.
    pub proxmox_user: String,
    pub proxmox_password: String,
    pub token_name: String,
    pub token_secret: String,
    /// Root password baked into the template, used to reach new VMs.
    pub root_password: String,
    /// VM the clones are made from.
    #[serde(deserialize_with = "string_or_number")]
    pub template_id: String,
}

impl fmt::Debug for ProxmoxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxConfig")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("proxmox_user", &self.proxmox_user)
            .field("token_name", &self.token_name)
            .field("template_id", &self.template_id)
            .finish_non_exhaustive()
    }
}

/// An OpenStack project reached with an application credential.
#[derive(Clone, Serialize, Deserialize)]
pub struct OpenstackConfig {
    pub name: String,
    pub authurl: String,
    pub applicationcredentialid: String,
    pub applicationcredentialsecret: String,
    pub region: String,
    pub project_id: String,
    pub imageid: String,
    pub networkid: String,
    pub securitygroup: String,
    pub keyname: String,
    /// Private key matching `keyname`.
    pub sshpempath: PathBuf,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

impl fmt::Debug for OpenstackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenstackConfig")
            .field("name", &self.name)
            .field("authurl", &self.authurl)
            .field("region", &self.region)
            .field("project_id", &self.project_id)
            .field("imageid", &self.imageid)
            .field("networkid", &self.networkid)
            .field("keyname", &self.keyname)
            .field("ssh_user", &self.ssh_user)
            .finish_non_exhaustive()
    }
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

/// Ports and ids show up both quoted and bare in hand-written documents.
fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
struct RawDoc {
    #[serde(default)]
    iaas: Vec<serde_json::Value>,
}

impl IaasConfigDoc {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read IaaS config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid IaaS config {}", path.display()))
    }

    /// Parse and validate. Entries of an unsupported `type` are skipped.
    pub fn parse(s: &str) -> Result<Self> {
        let raw: RawDoc = serde_json::from_str(s).context("Failed to parse IaaS config JSON")?;

        let mut iaas = Vec::with_capacity(raw.iaas.len());
        for (i, entry) in raw.iaas.into_iter().enumerate() {
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let kind = entry
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let cloud = match kind.as_str() {
                TYPE_PROXMOX => CloudConfig::Proxmox(
                    serde_json::from_value(entry)
                        .with_context(|| format!("iaas[{}] ({:?}): bad proxmox entry", i, name))?,
                ),
                TYPE_OPENSTACK => CloudConfig::Openstack(
                    serde_json::from_value(entry)
                        .with_context(|| format!("iaas[{}] ({:?}): bad openstack entry", i, name))?,
                ),
                other => {
                    info!(cloud = %name, cloud_type = other, "unsupported cloud type, skipping");
                    continue;
                }
            };
            iaas.push(cloud);
        }

        let doc = Self { iaas };
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for cloud in &self.iaas {
            let name = cloud.name();
            if name.is_empty() {
                bail!("A {} cloud has an empty name", cloud.type_tag());
            }
            if !seen.insert(name) {
                bail!("Duplicate cloud name {:?}", name);
            }
            match cloud {
                CloudConfig::Proxmox(p) => {
                    if p.ip.is_empty() {
                        bail!("Cloud {:?}: ip must be set", name);
                    }
                    p.port
                        .parse::<u16>()
                        .with_context(|| format!("Cloud {:?}: invalid port {:?}", name, p.port))?;
                    p.template_id.parse::<u64>().with_context(|| {
                        format!("Cloud {:?}: invalid template_id {:?}", name, p.template_id)
                    })?;
                }
                CloudConfig::Openstack(o) => {
                    if !o.authurl.starts_with("http://") && !o.authurl.starts_with("https://") {
                        bail!("Cloud {:?}: authurl must be an http(s) URL", name);
                    }
                    if o.project_id.is_empty() {
                        bail!("Cloud {:?}: project_id must be set", name);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.iaas.iter().map(CloudConfig::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "iaas": [
            {
                "name": "CLAAUDIAweifan",
                "type": "openstack",
                "authurl": "https://identity.example.org:5000/v3",
                "applicationcredentialid": "id",
                "applicationcredentialsecret": "secret",
                "region": "RegionOne",
                "project_id": "p1",
                "imageid": "img",
                "networkid": "net",
                "securitygroup": "default",
                "keyname": "mcm",
                "sshpempath": "/root/.ssh/mcm.pem"
            },
            {
                "name": "NOKIA4",
                "type": "proxmox",
                "ip": "192.168.10.4",
                "port": "8006",
                "proxmox_user": "root",
                "proxmox_password": "pw",
                "token_name": "mcm",
                "token_secret": "uuid",
                "root_password": "rootpw",
                "template_id": 9000
            },
            {
                "name": "legacy",
                "type": "vsphere"
            }
        ]
    }"#;

    #[test]
    fn test_parse_skips_unknown_types() {
        let doc = IaasConfigDoc::parse(DOC).unwrap();
        assert_eq!(doc.names(), vec!["CLAAUDIAweifan", "NOKIA4"]);
        match &doc.iaas[0] {
            CloudConfig::Openstack(o) => {
                assert_eq!(o.ssh_user, "ubuntu");
                assert_eq!(o.region, "RegionOne");
            }
            other => panic!("expected openstack, got {:?}", other),
        }
        match &doc.iaas[1] {
            CloudConfig::Proxmox(p) => {
                assert_eq!(p.port, "8006");
                assert_eq!(p.template_id, "9000");
            }
            other => panic!("expected proxmox, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let doc = r#"{"iaas": [
            {"name": "a", "type": "proxmox", "ip": "10.0.0.1", "port": 8006,
             "proxmox_user": "root", "proxmox_password": "x", "token_name": "t",
             "token_secret": "s", "root_password": "r", "template_id": "100"},
            {"name": "a", "type": "proxmox", "ip": "10.0.0.2", "port": 8006,
             "proxmox_user": "root", "proxmox_password": "x", "token_name": "t",
             "token_secret": "s", "root_password": "r", "template_id": "100"}
        ]}"#;
        let err = IaasConfigDoc::parse(doc).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate cloud name"));
    }

    #[test]
    fn test_missing_field_rejected() {
        let doc = r#"{"iaas": [{"name": "p", "type": "proxmox", "ip": "10.0.0.1"}]}"#;
        assert!(IaasConfigDoc::parse(doc).is_err());
    }

    #[test]
    fn test_bad_port_rejected() {
        let doc = r#"{"iaas": [
            {"name": "p", "type": "proxmox", "ip": "10.0.0.1", "port": "eighty",
             "proxmox_user": "root", "proxmox_password": "x", "token_name": "t",
             "token_secret": "s", "root_password": "r", "template_id": "100"}
        ]}"#;
        let err = IaasConfigDoc::parse(doc).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid port"));
    }

    #[test]
    fn test_empty_document() {
        let doc = IaasConfigDoc::parse("{}").unwrap();
        assert!(doc.iaas.is_empty());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let doc = IaasConfigDoc::parse(DOC).unwrap();
        let shown = format!("{:?}", doc);
        assert!(!shown.contains("rootpw"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(DOC.as_bytes()).unwrap();
        let doc = IaasConfigDoc::from_file(f.path()).unwrap();
        assert_eq!(doc.iaas.len(), 2);
    }

    #[test]
    fn test_from_file_missing() {
        let err = IaasConfigDoc::from_file(Path::new("/nonexistent/iaas.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read IaaS config"));
    }
}
