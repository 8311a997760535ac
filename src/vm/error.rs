//! Error types for guest provisioning and lifecycle management.

use std::path::PathBuf;

use thiserror::Error;

use super::GuestKind;
use super::lifecycle::LifecycleState;

/// Errors reported by a guest execution backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot perform this operation at all.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The configuration was rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The handle does not refer to a machine this backend knows about.
    #[error("unknown guest handle {0}")]
    UnknownHandle(u64),

    /// The machine is not in a state that allows the operation.
    #[error("machine is {state}, cannot {operation}")]
    InvalidState {
        state: String,
        operation: &'static str,
    },

    /// Backend-side operation failure.
    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn operation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            reason: reason.into(),
        }
    }
}

/// Errors raised while obtaining an installable OS image.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The image catalog could not be queried or parsed.
    #[error("restore image lookup failed: {0}")]
    Lookup(String),

    /// HTTP-level failure while transferring the payload.
    #[error("download of {url} failed with HTTP {status}")]
    Status { url: String, status: u16 },

    /// Connection, timeout or body error while transferring the payload.
    #[error("download of {url} failed: {source}")]
    Transfer {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A resumed transfer came back starting at the wrong offset.
    #[error("download of {url} resumed at {actual:?} instead of byte {expected}")]
    RangeMismatch {
        url: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// A local installer image was expected but is absent.
    #[error("install media not found at {0}")]
    MediaMissing(PathBuf),

    /// No install media was configured for a kind that needs a local one.
    #[error("no install media configured for {0} guests")]
    MediaNotConfigured(GuestKind),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same transfer may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AcquireError::Transfer { .. } | AcquireError::RangeMismatch { .. } => true,
            AcquireError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

/// Errors surfaced by the lifecycle controller.
///
/// Everything except [`LifecycleError::Backend`] raised after boot is a setup
/// failure the host cannot recover from without operator action.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The bundle directory existed before storage bootstrap: an earlier run
    /// stopped part way through provisioning.
    #[error("{kind} guest bundle already exists at {path}; a previous provisioning attempt was interrupted")]
    PriorPartialState { kind: GuestKind, path: PathBuf },

    #[error("failed to acquire {kind} install image: {source}")]
    Acquire {
        kind: GuestKind,
        #[source]
        source: AcquireError,
    },

    #[error("{kind} guest storage error at {path}: {source}")]
    Storage {
        kind: GuestKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted identity file is missing.
    #[error("{kind} guest identity file missing: {path}")]
    IdentityMissing { kind: GuestKind, path: PathBuf },

    /// A persisted identity file exists but cannot be parsed.
    #[error("{kind} guest identity file is corrupt: {path}: {reason}")]
    IdentityCorrupt {
        kind: GuestKind,
        path: PathBuf,
        reason: String,
    },

    /// The persisted hardware model cannot run on this host.
    #[error("{kind} hardware model in {path} is not supported on this host")]
    UnsupportedHardwareModel { kind: GuestKind, path: PathBuf },

    /// The fresh path needs configuration requirements from the image.
    #[error("{kind} install image carries no configuration requirements")]
    MissingRequirements { kind: GuestKind },

    /// The assembled configuration was rejected by the backend.
    #[error("{kind} guest configuration rejected: {source}")]
    InvalidConfiguration {
        kind: GuestKind,
        #[source]
        source: BackendError,
    },

    #[error("an installation is already running for the {0} guest")]
    InstallInProgress(GuestKind),

    #[error("{kind} guest installation failed: {source}")]
    Install {
        kind: GuestKind,
        #[source]
        source: BackendError,
    },

    /// A backend operation on the running guest failed.
    #[error("{kind} guest {operation} failed: {source}")]
    Backend {
        kind: GuestKind,
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    /// The requested operation does not apply in the current state.
    #[error("{kind} guest is {state:?}, cannot {operation}")]
    InvalidState {
        kind: GuestKind,
        state: LifecycleState,
        operation: &'static str,
    },

    #[error("{0} guest has terminated")]
    Terminated(GuestKind),

    /// The guest actor task is gone.
    #[error("{0} guest actor has shut down")]
    ActorGone(GuestKind),
}

impl LifecycleError {
    /// Whether the host must treat this error as a fatal startup failure.
    ///
    /// Only a busy installer is worth retrying from the host side.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LifecycleError::InstallInProgress(_))
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
