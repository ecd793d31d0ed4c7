use std::fmt;

/// Error kinds surfaced by every core operation.
///
/// The kind survives context wrapping, so a `NotFound` raised deep inside a
/// backend is still a `NotFound` (and still maps to 404) once it reaches the
/// caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McmError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{}", render_partial(.0))]
    PartialFailure(Vec<McmError>),
    #[error("{0}")]
    Backend(String),
}

/// Payload-free tag of an [`McmError`], for branching on the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Auth,
    Network,
    Timeout,
    Conflict,
    Validation,
    PartialFailure,
    Backend,
}

pub type Result<T, E = McmError> = std::result::Result<T, E>;

fn render_partial(errors: &[McmError]) -> String {
    let mut out = format!("{} error(s):", errors.len());
    for (i, e) in errors.iter().enumerate() {
        out.push_str(&format!(" [{}] {};", i + 1, e));
    }
    out.pop();
    out
}

impl McmError {
    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn validation(msg: impl fmt::Display) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn backend(msg: impl fmt::Display) -> Self {
        Self::Backend(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::PartialFailure(_) => ErrorKind::PartialFailure,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// HTTP status a front end should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 400,
            ErrorKind::Conflict => 409,
            _ => 500,
        }
    }

    /// Prefix the message with `ctx`, keeping the kind.
    ///
    /// Partial failures are left as-is: their sub-errors already carry their
    /// own context and a prefix would hide the count.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        let wrap = |msg: String| format!("{}: {}", ctx, msg);
        match self {
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Auth(m) => Self::Auth(wrap(m)),
            Self::Network(m) => Self::Network(wrap(m)),
            Self::Timeout(m) => Self::Timeout(wrap(m)),
            Self::Conflict(m) => Self::Conflict(wrap(m)),
            Self::Validation(m) => Self::Validation(wrap(m)),
            Self::Backend(m) => Self::Backend(wrap(m)),
            partial @ Self::PartialFailure(_) => partial,
        }
    }
}

impl From<serde_json::Error> for McmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(format!("malformed JSON: {}", e))
    }
}

impl From<std::io::Error> for McmError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Auth(e.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => Self::Network(e.to_string()),
            _ => Self::Backend(e.to_string()),
        }
    }
}

/// `anyhow::Context`-style helper for `Result<T, McmError>`.
pub trait ResultExt<T> {
    fn context_with<C, F>(self, f: F) -> Result<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C;
}

impl<T, E: Into<McmError>> ResultExt<T> for std::result::Result<T, E> {
    fn context_with<C, F>(self, f: F) -> Result<T>
    where
        C: fmt::Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
