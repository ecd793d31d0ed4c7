//! OpenStack backend.
//!
//! Authenticates with an application credential against the identity v3
//! API, then talks to compute (nova), network (neutron) and block storage
//! (cinder) through the public endpoints of the configured region. The token
//! and endpoints are cached until shortly before the token expires, or until
//! a call is answered with 401.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcm_core::naming::boot_volume_name;
use mcm_core::vm::{IaasVm, MCM_SIGN, ResSet, ResourceStatus, UNKNOWN};
use mcm_core::wait::wait_for;
use mcm_core::{McmError, Result};
use mcm_runtime::http;
use mcm_runtime::ssh::{self, DISK_INIT_CMD, SshAuth, SshTarget};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::OpenstackConfig;
use crate::{BackendOptions, Iaas, SSH_PORT};

pub const TYPE_OPENSTACK: &str = "openstack";

/// Servers embed their flavor (vcpus, ram, disk) from this microversion on.
const NOVA_MICROVERSION: &str = "2.47";
const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
/// Re-authenticate this long before the token runs out.
const TOKEN_SLACK_SECS: i64 = 60;

const VOLUME_AVAILABLE: &str = "available";
const VOLUME_ERROR: &str = "error";
const SERVER_ACTIVE: &str = "ACTIVE";
const SERVER_ERROR: &str = "ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    Compute,
    Network,
    Volume,
}

/// Authenticated token plus the endpoints it unlocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub compute: String,
    pub network: String,
    pub volume: String,
}

impl Session {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|t| t > now + chrono::Duration::seconds(TOKEN_SLACK_SECS))
    }

    fn base(&self, service: Service) -> &str {
        match service {
            Service::Compute => &self.compute,
            Service::Network => &self.network,
            Service::Volume => &self.volume,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    expires_at: Option<String>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

fn public_endpoint(catalog: &[CatalogEntry], kinds: &[&str], region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| kinds.contains(&entry.kind.as_str()))
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public"
                && (ep.region.as_deref() == Some(region) || ep.region_id.as_deref() == Some(region))
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

/// Build a session from the token issued by `POST /auth/tokens`.
pub fn parse_session(token: String, body: Value, region: &str) -> Result<Session> {
    let body: TokenBody = serde_json::from_value(body)
        .map_err(|e| McmError::Auth(format!("unexpected token response: {}", e)))?;
    let catalog = &body.token.catalog;
    let find = |kinds: &[&str]| {
        public_endpoint(catalog, kinds, region).ok_or_else(|| {
            McmError::not_found(format!(
                "no public {} endpoint in region {}",
                kinds.join("/"),
                region
            ))
        })
    };
    let compute = find(&["compute"])?;
    let network = find(&["network"])?;
    let volume = find(&["volumev3", "block-storage"])?;
    let expires_at = body
        .token
        .expires_at
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(Session {
        token,
        expires_at,
        compute,
        // neutron lists only its root in the catalog
        network: format!("{}/v2.0", network.trim_end_matches("/v2.0")),
        volume,
    })
}

/// `…/v3/auth/tokens` whether or not the configured URL names the version.
pub fn token_url(authurl: &str) -> String {
    let base = authurl.trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{}/auth/tokens", base)
    } else {
        format!("{}/v3/auth/tokens", base)
    }
}

/// `scheme://host/` of the identity endpoint, where Horizon usually lives.
pub fn dashboard_url(authurl: &str) -> String {
    match reqwest::Url::parse(authurl) {
        Ok(url) => format!("{}://{}/", url.scheme(), url.host_str().unwrap_or_default()),
        Err(_) => authurl.to_string(),
    }
}

/// Quota figure. Nova and cinder say `in_use`, neutron says `used`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct QuotaDetail {
    #[serde(default)]
    pub limit: i64,
    #[serde(default, alias = "used")]
    pub in_use: i64,
}

impl QuotaDetail {
    /// `None` when the limit is unlimited.
    pub fn remaining(&self) -> Option<i64> {
        (self.limit >= 0).then(|| self.limit - self.in_use)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComputeQuota {
    #[serde(default)]
    pub cores: QuotaDetail,
    #[serde(default)]
    pub ram: QuotaDetail,
    #[serde(default)]
    pub instances: QuotaDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageQuota {
    #[serde(default)]
    pub volumes: QuotaDetail,
    #[serde(default)]
    pub gigabytes: QuotaDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkQuota {
    #[serde(default)]
    pub port: QuotaDetail,
}

pub fn resources_from(
    compute: &ComputeQuota,
    storage: &StorageQuota,
    network: &NetworkQuota,
) -> ResourceStatus {
    ResourceStatus {
        limit: ResSet {
            vcpu: compute.cores.limit as f64,
            ram: compute.ram.limit as f64,
            vm: compute.instances.limit as f64,
            volume: storage.volumes.limit as f64,
            storage: storage.gigabytes.limit as f64,
            port: network.port.limit as f64,
        },
        in_use: ResSet {
            vcpu: compute.cores.in_use as f64,
            ram: compute.ram.in_use as f64,
            vm: compute.instances.in_use as f64,
            volume: storage.volumes.in_use as f64,
            storage: storage.gigabytes.in_use as f64,
            port: network.port.in_use as f64,
        },
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub vcpus: u32,
    /// MiB.
    pub ram: u64,
}

/// How far a flavor exceeds the request, relative to it.
fn flavor_overflow(flavor: &Flavor, req_cpu: u32, req_ram: u64) -> f64 {
    let cpu = (flavor.vcpus as f64 - req_cpu as f64) / req_cpu as f64;
    let ram = (flavor.ram as f64 - req_ram as f64) / req_ram as f64;
    cpu + ram
}

/// Smallest flavor that covers the request and still fits the remaining
/// quota. `None` remaining means unlimited.
pub fn choose_min_flavor<'a>(
    flavors: &'a [Flavor],
    req_cpu: u32,
    req_ram: u64,
    remaining_cpu: Option<i64>,
    remaining_ram: Option<i64>,
) -> Option<&'a Flavor> {
    let req_cpu = req_cpu.max(1);
    let req_ram = req_ram.max(1);
    flavors
        .iter()
        .filter(|f| f.vcpus >= req_cpu && f.ram >= req_ram)
        .filter(|f| remaining_cpu.is_none_or(|r| i64::from(f.vcpus) <= r))
        .filter(|f| remaining_ram.is_none_or(|r| f.ram as i64 <= r))
        .min_by(|a, b| {
            flavor_overflow(a, req_cpu, req_ram).total_cmp(&flavor_overflow(b, req_cpu, req_ram))
        })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub flavor: Option<EmbeddedFlavor>,
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    pub volumes_attached: Vec<AttachedVolume>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerAddress {
    pub addr: String,
    #[serde(default)]
    pub version: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddedFlavor {
    #[serde(default)]
    pub vcpus: Option<f64>,
    #[serde(default)]
    pub ram: Option<f64>,
    #[serde(default)]
    pub disk: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedVolume {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// IPv4 addresses across all networks of a server.
pub fn server_ips(server: &Server) -> Vec<String> {
    server
        .addresses
        .values()
        .flatten()
        .filter(|a| a.version.is_none_or(|v| v == 4))
        .map(|a| a.addr.clone())
        .collect()
}

pub fn is_signed(server: &Server) -> bool {
    server.metadata.get(MCM_SIGN).map(String::as_str) == Some(MCM_SIGN)
}

fn field<T: DeserializeOwned>(mut body: Value, key: &str) -> Result<T> {
    let inner = body.get_mut(key).map(Value::take).unwrap_or(Value::Null);
    serde_json::from_value(inner)
        .map_err(|e| McmError::backend(format!("unexpected response, reading {:?}: {}", key, e)))
}

/// Cached session. The slot is never locked while a token is fetched.
#[derive(Default)]
struct SessionCache {
    slot: RwLock<Option<Arc<Session>>>,
}

impl SessionCache {
    async fn fresh(&self) -> Option<Arc<Session>> {
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_fresh(Utc::now()))
            .cloned()
    }

    /// The cached session, or a new one from `refresh` when it is missing or
    /// about to expire. A session stored by a concurrent refresh wins.
    async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session>>,
    {
        if let Some(s) = self.fresh().await {
            return Ok(s);
        }
        let fetched = Arc::new(refresh().await?);
        let mut slot = self.slot.write().await;
        if let Some(s) = slot.as_ref().filter(|s| s.is_fresh(Utc::now())) {
            return Ok(s.clone());
        }
        *slot = Some(fetched.clone());
        Ok(fetched)
    }

    async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

pub struct Openstack {
    config: OpenstackConfig,
    http: reqwest::Client,
    opts: BackendOptions,
    session: SessionCache,
}

impl Openstack {
    pub fn new(config: OpenstackConfig, opts: BackendOptions) -> Result<Self> {
        let http = http::client(opts.http_timeout)?;
        Ok(Self {
            config,
            http,
            opts,
            session: SessionCache::default(),
        })
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = token_url(&self.config.authurl);
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": {
                        "id": self.config.applicationcredentialid,
                        "secret": self.config.applicationcredentialsecret,
                    }
                }
            }
        });
        let resp = http::send(self.http.post(&url).json(&body), &url).await?;
        let token = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| McmError::Auth(format!("{} returned no token", url)))?;
        let body = http::read_json(resp, &url).await?;
        let session = parse_session(token, body, &self.config.region)?;
        info!(cloud = %self.config.name, expires_at = ?session.expires_at, "authenticated");
        Ok(session)
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.session.get_or_refresh(|| self.authenticate()).await
    }

    async fn invalidate(&self) {
        self.session.clear().await;
    }

    async fn call(
        &self,
        service: Service,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut retried = false;
        loop {
            let session = self.session().await?;
            let url = format!("{}{}", session.base(service), path);
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(TOKEN_HEADER, &session.token);
            if service == Service::Compute {
                request = request.header("X-OpenStack-Nova-API-Version", NOVA_MICROVERSION);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            match http::send_json(request, &url).await {
                Err(McmError::Auth(msg)) if !retried => {
                    warn!(cloud = %self.config.name, error = %msg, "token rejected, re-authenticating");
                    self.invalidate().await;
                    retried = true;
                }
                other => {
                    debug!(cloud = %self.config.name, %method, path, "openstack api call finished");
                    return other;
                }
            }
        }
    }

    async fn get(&self, service: Service, path: &str) -> Result<Value> {
        self.call(service, Method::GET, path, None).await
    }

    pub async fn compute_quota(&self) -> Result<ComputeQuota> {
        let path = format!("/os-quota-sets/{}/detail", self.config.project_id);
        field(self.get(Service::Compute, &path).await?, "quota_set")
    }

    pub async fn storage_quota(&self) -> Result<StorageQuota> {
        let path = format!("/os-quota-sets/{}?usage=True", self.config.project_id);
        field(self.get(Service::Volume, &path).await?, "quota_set")
    }

    pub async fn network_quota(&self) -> Result<NetworkQuota> {
        let path = format!("/quotas/{}/details.json", self.config.project_id);
        field(self.get(Service::Network, &path).await?, "quota")
    }

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        field(self.get(Service::Compute, "/flavors/detail").await?, "flavors")
    }

    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        field(self.get(Service::Compute, "/servers/detail").await?, "servers")
    }

    pub async fn get_server(&self, id: &str) -> Result<Server> {
        field(self.get(Service::Compute, &format!("/servers/{}", id)).await?, "server")
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let path = format!("/servers/{}", id);
        self.call(Service::Compute, Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    pub async fn create_volume(&self, name: &str, size_gib: u64) -> Result<Volume> {
        let body = json!({
            "volume": {
                "name": name,
                "size": size_gib,
                "imageRef": self.config.imageid,
            }
        });
        let resp = self
            .call(Service::Volume, Method::POST, "/volumes", Some(&body))
            .await?;
        field(resp, "volume")
    }

    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        field(self.get(Service::Volume, &format!("/volumes/{}", id)).await?, "volume")
    }

    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        let path = format!("/volumes/{}", id);
        self.call(Service::Volume, Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    fn to_vm(&self, server: &Server) -> IaasVm {
        let flavor = server.flavor.clone().unwrap_or_default();
        IaasVm {
            id: server.id.clone(),
            name: server.name.clone(),
            ips: server_ips(server),
            vcpu: flavor.vcpus.unwrap_or(UNKNOWN),
            ram: flavor.ram.unwrap_or(UNKNOWN),
            storage: flavor.disk.unwrap_or(UNKNOWN),
            status: server.status.clone(),
            cloud: self.config.name.clone(),
            cloud_type: TYPE_OPENSTACK.to_string(),
            mcm_create: is_signed(server),
        }
    }

    async fn wait_volume_available(&self, id: &str) -> Result<()> {
        wait_for(&format!("volume {} available", id), self.opts.wait, || async move {
            let vol = self.get_volume(id).await?;
            match vol.status.as_str() {
                VOLUME_AVAILABLE => Ok(true),
                VOLUME_ERROR => Err(McmError::backend(format!("volume {} went into error", id))),
                _ => Ok(false),
            }
        })
        .await
    }

    async fn wait_server_active(&self, id: &str) -> Result<()> {
        wait_for(&format!("server {} active", id), self.opts.wait, || async move {
            let server = self.get_server(id).await?;
            match server.status.as_str() {
                SERVER_ACTIVE => Ok(true),
                SERVER_ERROR => Err(McmError::backend(format!("server {} went into error", id))),
                _ => Ok(false),
            }
        })
        .await
    }

    async fn wait_server_gone(&self, id: &str) -> Result<()> {
        wait_for(&format!("server {} deleted", id), self.opts.wait, || async move {
            match self.get_server(id).await {
                Err(e) if e.is_not_found() => Ok(true),
                Err(e) => {
                    debug!(cloud = %self.config.name, vm = id, error = %e, "server lookup failed");
                    Ok(false)
                }
                Ok(_) => Ok(false),
            }
        })
        .await
    }

    async fn wait_volume_gone(&self, id: &str) -> Result<()> {
        wait_for(&format!("volume {} deleted", id), self.opts.wait, || async move {
            match self.get_volume(id).await {
                Err(e) if e.is_not_found() => Ok(true),
                Err(e) => {
                    debug!(cloud = %self.config.name, volume = id, error = %e, "volume lookup failed");
                    Ok(false)
                }
                Ok(_) => Ok(false),
            }
        })
        .await
    }

    async fn create_inner(&self, name: &str, vcpu: u32, ram_mib: u64, storage_gib: u64) -> Result<IaasVm> {
        let volume = self
            .create_volume(&boot_volume_name(name), storage_gib)
            .await?;
        info!(cloud = %self.config.name, vm = name, volume = %volume.id, "boot volume requested");
        self.wait_volume_available(&volume.id).await?;

        let flavors = self.list_flavors().await?;
        let quota = self.compute_quota().await?;
        let flavor = choose_min_flavor(
            &flavors,
            vcpu,
            ram_mib,
            quota.cores.remaining(),
            quota.ram.remaining(),
        )
        .ok_or_else(|| {
            McmError::validation(format!(
                "no flavor within quota offers {} vCPU and {} MiB",
                vcpu, ram_mib
            ))
        })?;
        info!(cloud = %self.config.name, vm = name, flavor = %flavor.name, "flavor chosen");

        let body = json!({
            "server": {
                "name": name,
                "flavorRef": flavor.id,
                "metadata": { MCM_SIGN: MCM_SIGN },
                "security_groups": [{ "name": self.config.securitygroup }],
                "networks": [{ "uuid": self.config.networkid }],
                "key_name": self.config.keyname,
                "block_device_mapping_v2": [{
                    "boot_index": 0,
                    "uuid": volume.id,
                    "source_type": "volume",
                    "destination_type": "volume",
                    "delete_on_termination": false,
                }],
            }
        });
        let created: Server = field(
            self.call(Service::Compute, Method::POST, "/servers", Some(&body))
                .await?,
            "server",
        )?;
        self.wait_server_active(&created.id).await?;

        let server = self.get_server(&created.id).await?;
        let ip = server_ips(&server)
            .into_iter()
            .next()
            .ok_or_else(|| McmError::backend(format!("server {} has no IPv4 address", created.id)))?;
        let (user, auth) = self.ssh_credentials();
        let target = SshTarget::new(ip, SSH_PORT, user, auth);
        ssh::wait_for_ssh(self.opts.dialer.as_ref(), &target, DISK_INIT_CMD, self.opts.wait).await?;

        self.get_vm(&created.id).await
    }

    async fn delete_inner(&self, id: &str) -> Result<()> {
        let server = self.get_server(id).await?;
        if !is_signed(&server) {
            return Err(McmError::validation(format!(
                "server {} in cloud {} was not created by the manager",
                id, self.config.name
            )));
        }

        self.delete_server(id).await?;
        self.wait_server_gone(id).await?;

        for volume in &server.volumes_attached {
            match self.delete_volume(&volume.id).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
            self.wait_volume_gone(&volume.id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Iaas for Openstack {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn cloud_type(&self) -> &str {
        TYPE_OPENSTACK
    }

    fn web_url(&self) -> String {
        dashboard_url(&self.config.authurl)
    }

    async fn get_vm(&self, id: &str) -> Result<IaasVm> {
        Ok(self.to_vm(&self.get_server(id).await?))
    }

    async fn list_all_vms(&self) -> Result<Vec<IaasVm>> {
        Ok(self.list_servers().await?.iter().map(|s| self.to_vm(s)).collect())
    }

    async fn create_vm(
        &self,
        name: &str,
        vcpu: u32,
        ram_mib: u64,
        storage_gib: u64,
    ) -> Result<IaasVm> {
        self.create_inner(name, vcpu, ram_mib, storage_gib)
            .await
            .map_err(|e| e.context(format!("cloud {}: create vm {}", self.config.name, name)))
    }

    async fn delete_vm(&self, id: &str) -> Result<()> {
        self.delete_inner(id)
            .await
            .map_err(|e| e.context(format!("cloud {}: delete vm {}", self.config.name, id)))
    }

    async fn check_resources(&self) -> Result<ResourceStatus> {
        let (compute, storage, network) = tokio::try_join!(
            self.compute_quota(),
            self.storage_quota(),
            self.network_quota()
        )?;
        Ok(resources_from(&compute, &storage, &network))
    }

    async fn is_created_by_mcm(&self, id: &str) -> Result<bool> {
        Ok(is_signed(&self.get_server(id).await?))
    }

    fn ssh_credentials(&self) -> (String, SshAuth) {
        (
            self.config.ssh_user.clone(),
            SshAuth::KeyFile(self.config.sshpempath.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcm_core::wait::WaitConfig;
    use mcm_runtime::ssh::RusshDialer;
    use std::path::PathBuf;
    use std::time::Duration;

    fn catalog_body() -> Value {
        json!({"token": {
            "expires_at": "2030-01-01T12:00:00.000000Z",
            "catalog": [
                {"type": "compute", "name": "nova", "endpoints": [
                    {"interface": "internal", "region": "RegionOne", "url": "http://10.0.0.5:8774/v2.1"},
                    {"interface": "public", "region": "RegionTwo", "url": "https://two.example.org:8774/v2.1"},
                    {"interface": "public", "region": "RegionOne", "url": "https://one.example.org:8774/v2.1/"}
                ]},
                {"type": "network", "name": "neutron", "endpoints": [
                    {"interface": "public", "region_id": "RegionOne", "url": "https://one.example.org:9696"}
                ]},
                {"type": "volumev3", "name": "cinderv3", "endpoints": [
                    {"interface": "public", "region": "RegionOne", "url": "https://one.example.org:8776/v3/p1"}
                ]}
            ]
        }})
    }

    fn flavor(id: &str, vcpus: u32, ram: u64) -> Flavor {
        Flavor {
            id: id.into(),
            name: id.into(),
            vcpus,
            ram,
        }
    }

    #[test]
    fn test_parse_session_picks_public_region_endpoints() {
        let s = parse_session("tok".into(), catalog_body(), "RegionOne").unwrap();
        assert_eq!(s.token, "tok");
        assert_eq!(s.compute, "https://one.example.org:8774/v2.1");
        assert_eq!(s.network, "https://one.example.org:9696/v2.0");
        assert_eq!(s.volume, "https://one.example.org:8776/v3/p1");
        assert!(s.expires_at.is_some());
    }

    #[test]
    fn test_parse_session_missing_service() {
        let err = parse_session("tok".into(), catalog_body(), "RegionThree").unwrap_err();
        assert!(err.is_not_found());
        let err = parse_session("tok".into(), json!({"error": {}}), "RegionOne").unwrap_err();
        assert_eq!(err.kind(), mcm_core::ErrorKind::Auth);
    }

    #[test]
    fn test_session_freshness() {
        let now = Utc::now();
        let mut s = parse_session("tok".into(), catalog_body(), "RegionOne").unwrap();
        s.expires_at = Some(now + chrono::Duration::seconds(3600));
        assert!(s.is_fresh(now));
        s.expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!s.is_fresh(now));
        s.expires_at = None;
        assert!(s.is_fresh(now));
    }

    fn session(token: &str) -> Result<Session> {
        let mut s = parse_session(token.into(), catalog_body(), "RegionOne")?;
        s.expires_at = None;
        Ok(s)
    }

    #[tokio::test]
    async fn test_session_cache_refreshes_unlocked() {
        let cache = SessionCache::default();
        let first = cache
            .get_or_refresh(|| async {
                assert!(cache.slot.try_write().is_ok(), "slot locked during refresh");
                session("tok")
            })
            .await
            .unwrap();
        assert_eq!(first.token, "tok");

        let again = cache
            .get_or_refresh(|| async { Err(McmError::backend("cached session not reused")) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        cache.clear().await;
        let renewed = cache.get_or_refresh(|| async { session("tok2") }).await.unwrap();
        assert_eq!(renewed.token, "tok2");
    }

    #[tokio::test]
    async fn test_session_cache_replaces_stale_session() {
        let cache = SessionCache::default();
        let mut stale = session("old").unwrap();
        stale.expires_at = Some(Utc::now());
        *cache.slot.write().await = Some(Arc::new(stale));

        let s = cache.get_or_refresh(|| async { session("new") }).await.unwrap();
        assert_eq!(s.token, "new");
    }

    #[tokio::test]
    async fn test_session_cache_refresh_error_keeps_slot_empty() {
        let cache = SessionCache::default();
        let err = cache
            .get_or_refresh(|| async { Err(McmError::Auth("bad credential".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), mcm_core::ErrorKind::Auth);
        assert!(cache.slot.read().await.is_none());
    }

    #[test]
    fn test_token_and_dashboard_urls() {
        assert_eq!(
            token_url("https://keystone.example.org:5000/v3/"),
            "https://keystone.example.org:5000/v3/auth/tokens"
        );
        assert_eq!(
            token_url("https://keystone.example.org:5000"),
            "https://keystone.example.org:5000/v3/auth/tokens"
        );
        assert_eq!(
            dashboard_url("https://keystone.example.org:5000/v3"),
            "https://keystone.example.org/"
        );
    }

    #[test]
    fn test_choose_min_flavor() {
        let flavors = vec![
            flavor("m1.small", 1, 2048),
            flavor("m1.medium", 2, 4096),
            flavor("m1.large", 4, 8192),
            flavor("c1.wide", 8, 4096),
        ];
        let f = choose_min_flavor(&flavors, 2, 4096, None, None).unwrap();
        assert_eq!(f.id, "m1.medium");
        let f = choose_min_flavor(&flavors, 2, 6000, None, None).unwrap();
        assert_eq!(f.id, "m1.large");
        // m1.large no longer fits the remaining quota
        assert!(choose_min_flavor(&flavors, 2, 6000, Some(3), Some(100_000)).is_none());
        assert!(choose_min_flavor(&flavors, 16, 1024, None, None).is_none());
    }

    #[test]
    fn test_quota_remaining() {
        let q = QuotaDetail {
            limit: 20,
            in_use: 6,
        };
        assert_eq!(q.remaining(), Some(14));
        let unlimited = QuotaDetail {
            limit: -1,
            in_use: 6,
        };
        assert_eq!(unlimited.remaining(), None);
    }

    #[test]
    fn test_resources_from_quota_details() {
        let compute: ComputeQuota = serde_json::from_value(json!({
            "cores": {"limit": 20, "in_use": 6, "reserved": 0},
            "ram": {"limit": 51200, "in_use": 12288, "reserved": 0},
            "instances": {"limit": 10, "in_use": 3, "reserved": 0}
        }))
        .unwrap();
        let storage: StorageQuota = serde_json::from_value(json!({
            "volumes": {"limit": 10, "in_use": 3},
            "gigabytes": {"limit": 1000, "in_use": 120}
        }))
        .unwrap();
        let network: NetworkQuota =
            serde_json::from_value(json!({"port": {"limit": 50, "used": 7, "reserved": 0}})).unwrap();

        let rs = resources_from(&compute, &storage, &network);
        assert_eq!(rs.limit.vcpu, 20.0);
        assert_eq!(rs.in_use.ram, 12288.0);
        assert_eq!(rs.limit.vm, 10.0);
        assert_eq!(rs.in_use.volume, 3.0);
        assert_eq!(rs.limit.storage, 1000.0);
        assert_eq!(rs.in_use.port, 7.0);
    }

    #[test]
    fn test_server_decoding() {
        let server: Server = serde_json::from_value(json!({
            "id": "c0ffee",
            "name": "worker-1",
            "status": "ACTIVE",
            "addresses": {
                "provider": [
                    {"addr": "10.92.1.17", "version": 4},
                    {"addr": "fd00::17", "version": 6}
                ]
            },
            "metadata": {"multi-cloud-manager": "multi-cloud-manager"},
            "flavor": {"vcpus": 2, "ram": 4096, "disk": 40, "original_name": "m1.medium"},
            "os-extended-volumes:volumes_attached": [{"id": "vol-1"}]
        }))
        .unwrap();
        assert_eq!(server_ips(&server), vec!["10.92.1.17"]);
        assert!(is_signed(&server));
        assert_eq!(server.volumes_attached[0].id, "vol-1");

        let os = backend();
        let vm = os.to_vm(&server);
        assert_eq!(vm.vcpu, 2.0);
        assert_eq!(vm.ram, 4096.0);
        assert_eq!(vm.storage, 40.0);
        assert_eq!(vm.cloud_type, TYPE_OPENSTACK);
        assert!(vm.mcm_create);
    }

    #[test]
    fn test_unsigned_server() {
        let server: Server = serde_json::from_value(json!({"id": "x", "metadata": {}})).unwrap();
        assert!(!is_signed(&server));
        let vm = backend().to_vm(&server);
        assert_eq!(vm.vcpu, UNKNOWN);
        assert!(vm.ips.is_empty());
    }

    fn backend() -> Openstack {
        let config = OpenstackConfig {
            name: "os1".into(),
            authurl: "https://keystone.example.org:5000/v3".into(),
            applicationcredentialid: "id".into(),
            applicationcredentialsecret: "secret".into(),
            region: "RegionOne".into(),
            project_id: "p1".into(),
            imageid: "img".into(),
            networkid: "net".into(),
            securitygroup: "default".into(),
            keyname: "mcm".into(),
            sshpempath: PathBuf::from("/root/.ssh/mcm.pem"),
            ssh_user: "ubuntu".into(),
        };
        let opts = BackendOptions {
            dialer: Arc::new(RusshDialer::default()),
            wait: WaitConfig::new(Duration::from_secs(60), Duration::from_secs(5)),
            api_interval: Duration::ZERO,
            http_timeout: Duration::from_secs(5),
        };
        Openstack::new(config, opts).unwrap()
    }

    #[test]
    fn test_ssh_credentials_use_key_file() {
        let (user, auth) = backend().ssh_credentials();
        assert_eq!(user, "ubuntu");
        assert_eq!(auth, SshAuth::KeyFile(PathBuf::from("/root/.ssh/mcm.pem")));
        assert!(backend().as_proxmox().is_none());
    }
}
