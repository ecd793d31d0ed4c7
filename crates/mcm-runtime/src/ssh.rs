//! Remote command execution over secure shell.
//!
//! Flows talk to [`Dialer`] / [`SshSession`] rather than to `russh` directly
//! so they can be driven by in-memory fakes in tests. [`RusshDialer`] is the
//! real implementation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use mcm_core::wait::{WaitConfig, wait_for};
use mcm_core::{McmError, Result};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tracing::{debug, info, warn};

/// Grows the root partition and file system to the size of the (possibly
/// resized) disk. Doubles as the "is the VM usable yet" check after creation.
pub const DISK_INIT_CMD: &str = r#"ROOT_DEV=$(findmnt -n -o SOURCE /)
DISK=/dev/$(lsblk -no pkname "$ROOT_DEV")
PART=$(echo "$ROOT_DEV" | grep -o '[0-9]*$')
sudo growpart "$DISK" "$PART" || true
sudo resize2fs "$ROOT_DEV" || true
df -h /"#;

#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    KeyFile(PathBuf),
    Password(String),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Where and as whom to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            auth,
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout followed by stderr chunks, in arrival order.
    pub output: String,
    /// `None` when the server closed the channel without reporting one.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// An authenticated connection. Dropping it tears the connection down;
/// [`SshSession::close`] does so gracefully.
#[async_trait]
pub trait SshSession: Send {
    /// Run one command. A non-zero exit status is not an error here.
    async fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Write the local file to `remote` on the host.
    async fn copy_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &SshTarget) -> Result<Box<dyn SshSession>>;
}

/// Run `command` and fail with `Backend` unless it exits 0.
pub async fn run_checked(session: &mut dyn SshSession, command: &str) -> Result<String> {
    let out = session.run(command).await?;
    if out.success() {
        Ok(out.output)
    } else {
        Err(McmError::backend(format!(
            "command {:?} exited with {:?}: {}",
            command,
            out.exit_status,
            out.output.trim()
        )))
    }
}

/// Dial `target`, hand the session to `body`, and close the session whatever
/// `body` returns.
pub async fn with_session<T, F>(dialer: &dyn Dialer, target: &SshTarget, body: F) -> Result<T>
where
    F: for<'s> FnOnce(&'s mut dyn SshSession) -> BoxFuture<'s, Result<T>>,
{
    let mut session = dialer.dial(target).await?;
    let result = body(session.as_mut()).await;
    session.close().await;
    result
}

/// Dial, run a single command, and close.
pub async fn exec(dialer: &dyn Dialer, target: &SshTarget, command: &str) -> Result<CommandOutput> {
    let mut session = dialer.dial(target).await?;
    let result = session.run(command).await;
    session.close().await;
    result
}

/// Like [`exec`] but requires exit status 0.
pub async fn exec_checked(dialer: &dyn Dialer, target: &SshTarget, command: &str) -> Result<String> {
    let mut session = dialer.dial(target).await?;
    let result = run_checked(session.as_mut(), command).await;
    session.close().await;
    result
}

/// Wait until `target` accepts a login and runs `init_cmd`.
///
/// Freshly booted VMs refuse connections, reset them, or reject credentials
/// while cloud-init is still running, so every failure counts as "not yet".
pub async fn wait_for_ssh(
    dialer: &dyn Dialer,
    target: &SshTarget,
    init_cmd: &str,
    wait: WaitConfig,
) -> Result<()> {
    let label = format!("ssh to {}", target);
    wait_for(&label, wait, || async move {
        match exec(dialer, target, init_cmd).await {
            Ok(out) => {
                info!(host = %target, output = %out.output.trim(), "ssh is enabled");
                Ok(true)
            }
            Err(e) => {
                debug!(host = %target, error = %e, "ssh not ready yet");
                Ok(false)
            }
        }
    })
    .await
}

/// [`Dialer`] backed by `russh`.
#[derive(Debug, Clone)]
pub struct RusshDialer {
    connect_timeout: Duration,
}

impl RusshDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RusshDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// VMs are created moments before we log in, so there is no known host key
/// to pin against.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

fn classify(e: russh::Error, what: &str) -> McmError {
    match e {
        russh::Error::IO(io) => McmError::from(io).context(what),
        other => McmError::Network(format!("{}: {}", what, other)),
    }
}

#[async_trait]
impl Dialer for RusshDialer {
    async fn dial(&self, target: &SshTarget) -> Result<Box<dyn SshSession>> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });

        let connect = client::connect(
            config,
            (target.host.as_str(), target.port),
            AcceptAnyHostKey,
        );
        let mut handle = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                McmError::Timeout(format!(
                    "ssh connect to {} after {}s",
                    target,
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| classify(e, &format!("ssh connect to {}", target)))?;

        let accepted = match &target.auth {
            SshAuth::Password(password) => handle
                .authenticate_password(target.user.clone(), password.clone())
                .await
                .map_err(|e| classify(e, &format!("ssh password login to {}", target)))?,
            SshAuth::KeyFile(path) => {
                let key_pair = russh_keys::load_secret_key(path, None).map_err(|e| {
                    McmError::Auth(format!("load ssh key {}: {}", path.display(), e))
                })?;
                handle
                    .authenticate_publickey(target.user.clone(), Arc::new(key_pair))
                    .await
                    .map_err(|e| classify(e, &format!("ssh key login to {}", target)))?
            }
        };
        if !accepted {
            return Err(McmError::Auth(format!("{} rejected the credentials", target)));
        }

        debug!(host = %target, "ssh session established");
        Ok(Box::new(RusshSession {
            handle,
            label: target.to_string(),
        }))
    }
}

struct RusshSession {
    handle: client::Handle<AcceptAnyHostKey>,
    label: String,
}

impl RusshSession {
    async fn open_exec(&mut self, command: &str) -> Result<russh::Channel<client::Msg>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| classify(e, &format!("open channel on {}", self.label)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| classify(e, &format!("exec on {}", self.label)))?;
        Ok(channel)
    }
}

async fn drain(channel: &mut russh::Channel<client::Msg>) -> CommandOutput {
    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(&data[..]),
            ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(&data[..]),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }
    CommandOutput {
        output: String::from_utf8_lossy(&output).into_owned(),
        exit_status,
    }
}

#[async_trait]
impl SshSession for RusshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.open_exec(command).await?;
        let out = drain(&mut channel).await;
        if out.success() {
            info!(host = %self.label, command, "ssh command finished");
        } else {
            warn!(
                host = %self.label,
                command,
                exit_status = ?out.exit_status,
                output = %out.output.trim(),
                "ssh command exited non-zero"
            );
        }
        Ok(out)
    }

    async fn copy_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| McmError::from(e).context(format!("read {}", local.display())))?;
        let mut channel = self.open_exec(&format!("cat > '{}'", remote)).await?;
        channel
            .data(&bytes[..])
            .await
            .map_err(|e| classify(e, &format!("send {} to {}", local.display(), self.label)))?;
        channel
            .eof()
            .await
            .map_err(|e| classify(e, &format!("finish copy to {}", self.label)))?;
        let out = drain(&mut channel).await;
        if !out.success() {
            return Err(McmError::backend(format!(
                "copy {} to {}:{} exited with {:?}: {}",
                local.display(),
                self.label,
                remote,
                out.exit_status,
                out.output.trim()
            )));
        }
        info!(host = %self.label, local = %local.display(), remote, "file copied");
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.label, error = %e, "ssh disconnect failed");
        }
    }
}
