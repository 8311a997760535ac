//! Guest execution backend abstraction.
//!
//! The lifecycle manager never executes guests itself. Every primitive that
//! touches a running machine (validate, instantiate, start, pause, resume,
//! save, restore, install, display reconfiguration) goes through the
//! [`GuestBackend`] trait, which is injected into the controller explicitly.
//!
//! All async methods are single-shot: one call, one completion.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::configuration::GuestConfiguration;
use super::error::BackendError;
use super::identity::HardwareModel;
use super::{DisplaySize, GuestKind};

/// Opaque reference to a machine instantiated by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestHandle {
    id: u64,
    kind: GuestKind,
}

impl GuestHandle {
    pub fn new(id: u64, kind: GuestKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> GuestKind {
        self.kind
    }
}

impl fmt::Display for GuestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// A guest stopped outside of an explicit pause/save sequence.
#[derive(Debug, Clone)]
pub struct StopEvent {
    pub handle: GuestHandle,
    /// Backend-provided reason, `None` for a clean guest-initiated shutdown.
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl StopEvent {
    pub fn new(handle: GuestHandle, error: Option<String>) -> Self {
        Self {
            handle,
            error,
            at: Utc::now(),
        }
    }
}

/// CPU and memory bounds the backend accepts for any configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub min_cpu_count: u32,
    pub max_cpu_count: u32,
    pub min_memory_bytes: u64,
    pub max_memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            min_cpu_count: 1,
            max_cpu_count: 64,
            min_memory_bytes: 512 * 1024 * 1024,
            max_memory_bytes: 64 * 1024 * 1024 * 1024,
        }
    }
}

/// Host virtualization backend.
///
/// Implementations must be safe to share between the macOS and Linux guest
/// actors; each handle belongs to exactly one of them.
#[async_trait]
pub trait GuestBackend: Send + Sync {
    /// Backend name (for logging and error messages).
    fn name(&self) -> &'static str;

    fn limits(&self) -> ResourceLimits;

    /// Whether a macOS hardware model can run on the current host.
    fn supports_hardware_model(&self, model: &HardwareModel) -> bool;

    /// Create auxiliary storage at `path` bound to `model`.
    fn create_auxiliary_storage(
        &self,
        path: &Path,
        model: &HardwareModel,
    ) -> Result<(), BackendError>;

    /// Create an empty EFI variable store at `path`.
    fn create_efi_variable_store(&self, path: &Path) -> Result<(), BackendError>;

    /// Check a fully assembled configuration.
    fn validate(&self, config: &GuestConfiguration) -> Result<(), BackendError>;

    /// Create a machine from `config` without starting it.
    async fn instantiate(&self, config: &GuestConfiguration) -> Result<GuestHandle, BackendError>;

    async fn start(&self, handle: &GuestHandle) -> Result<(), BackendError>;

    async fn pause(&self, handle: &GuestHandle) -> Result<(), BackendError>;

    async fn resume(&self, handle: &GuestHandle) -> Result<(), BackendError>;

    /// Serialize the paused machine's state to `path`.
    async fn save_state(&self, handle: &GuestHandle, path: &Path) -> Result<(), BackendError>;

    /// Load a saved state into a machine that has not been started.
    async fn restore_state(&self, handle: &GuestHandle, path: &Path) -> Result<(), BackendError>;

    /// Run the OS installer from `media` against the machine.
    ///
    /// Reports fractional progress through `on_progress` and leaves the
    /// machine stopped on success.
    async fn install(
        &self,
        handle: &GuestHandle,
        media: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), BackendError>;

    async fn reconfigure_display(
        &self,
        handle: &GuestHandle,
        size: DisplaySize,
    ) -> Result<(), BackendError>;

    /// Subscribe to unexpected-stop notifications for every handle.
    fn stop_events(&self) -> broadcast::Receiver<StopEvent>;
}
