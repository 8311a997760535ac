//! Guest lifecycle management for the native preview surfaces.
//!
//! Provisions, boots, persists and restores the virtual machines that host
//! the macOS and Linux preview guests: image acquisition, sparse disk
//! bootstrap, identity persistence, device configuration, OS installation and
//! the pause/save/resume cycle driven by the host application.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod acquisition;
pub mod actor;
pub mod backend;
pub mod configuration;
pub mod error;
pub mod filesystem;
pub mod identity;
pub mod installation;
pub mod lifecycle;
pub mod profile;
pub mod progress;
pub mod vfkit;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Operating-system family of a guest slot.
///
/// Determines platform-identity requirements (hardware model, auxiliary
/// storage) and the device set the guest is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    #[serde(rename = "macos")]
    MacOs,
    Linux,
}

impl GuestKind {
    /// Stable name used in bundle directory names and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            GuestKind::MacOs => "macOS",
            GuestKind::Linux => "linux",
        }
    }

    /// Capacity of the sparse disk image allocated for a fresh guest.
    pub fn disk_capacity_bytes(self) -> u64 {
        match self {
            GuestKind::MacOs => 128 * 1024 * 1024 * 1024,
            GuestKind::Linux => 64 * 1024 * 1024 * 1024,
        }
    }
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest display size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl DisplaySize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for DisplaySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use actor::{ActorHandle, spawn_guest_actor};
pub use backend::{GuestBackend, GuestHandle, StopEvent};
pub use error::{AcquireError, BackendError, LifecycleError};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use profile::{GuestLayout, GuestProfile};
pub use progress::{ProgressPhase, ProvisionProgress};
