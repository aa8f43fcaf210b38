//! Error taxonomy for machine lifecycle operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type KubeboxResult<T> = Result<T, KubeboxError>;

#[derive(Debug, Error)]
pub enum KubeboxError {
    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------
    #[error("driver {0:?} not found")]
    DriverNotFound(String),

    #[error("driver {0:?} is already registered")]
    DuplicateName(String),

    // ------------------------------------------------------------------
    // Store / machine identity
    // ------------------------------------------------------------------
    #[error("machine {0:?} does not exist")]
    HostDoesNotExist(String),

    #[error("machine {0:?} already exists")]
    HostAlreadyExists(String),

    #[error("machine {name:?} is already {state}")]
    HostAlreadyInState { name: String, state: String },

    #[error(
        "invalid machine name {0:?}: must start with a letter or digit and contain only letters, digits, '-' and '.'"
    )]
    InvalidHostname(String),

    // ------------------------------------------------------------------
    // Creation and certificates
    // ------------------------------------------------------------------
    #[error("error with pre-create check: {0}")]
    PreCreateFailed(#[source] Box<KubeboxError>),

    #[error(
        "error checking TLS connection to {url}: {cause}\nYou can attempt to regenerate the certificates to fix this"
    )]
    CertInvalid { url: String, cause: String },

    #[error("timed out after {timeout:?} acquiring lock {}", path.display())]
    LockAcquireTimeout { path: PathBuf, timeout: Duration },

    /// An error raised inside a named pipeline step.
    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<KubeboxError>,
    },

    // ------------------------------------------------------------------
    // Infrastructure
    // ------------------------------------------------------------------
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("provisioning error: {0}")]
    Provision(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KubeboxError {
    /// Wrap this error with the name of the step that produced it.
    pub fn in_step(self, step: impl Into<String>) -> Self {
        KubeboxError::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Strip any step wrappers and return the innermost error.
    pub fn root(&self) -> &KubeboxError {
        match self {
            KubeboxError::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for KubeboxError {
    fn from(err: std::io::Error) -> Self {
        KubeboxError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for KubeboxError {
    fn from(err: serde_json::Error) -> Self {
        KubeboxError::Config(err.to_string())
    }
}
