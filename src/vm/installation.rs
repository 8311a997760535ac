//! Guest OS installation.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

use super::backend::{GuestBackend, GuestHandle};
use super::configuration::GuestConfiguration;
use super::error::{LifecycleError, Result};
use super::progress::{ProgressPhase, ProgressReporter};
use super::GuestKind;

/// Runs the backend installer, one installation at a time.
pub struct InstallationOrchestrator {
    kind: GuestKind,
    backend: Arc<dyn GuestBackend>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the installation finishes or is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl InstallationOrchestrator {
    pub fn new(kind: GuestKind, backend: Arc<dyn GuestBackend>) -> Self {
        Self {
            kind,
            backend,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_installing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Install the OS from `media` onto the machine behind `handle`.
    ///
    /// The bundle and disk image are left in place on failure.
    pub async fn install(
        &self,
        handle: &GuestHandle,
        configuration: &GuestConfiguration,
        media: &Path,
        progress: &ProgressReporter,
    ) -> Result<()> {
        let kind = self.kind;
        let _guard = InFlight::acquire(&self.in_flight)
            .ok_or(LifecycleError::InstallInProgress(kind))?;

        info!(
            target: "installation",
            kind = %kind,
            handle = %handle,
            media = %media.display(),
            cpus = configuration.cpu_count,
            memory_bytes = configuration.memory_bytes,
            "starting guest installation"
        );

        progress.report(ProgressPhase::Install, 0.0);
        let on_progress = |fraction: f64| progress.report(ProgressPhase::Install, fraction);

        match self.backend.install(handle, media, &on_progress).await {
            Ok(()) => {
                progress.complete(ProgressPhase::Install);
                info!(target: "installation", kind = %kind, "guest installation finished");
                Ok(())
            }
            Err(source) => {
                error!(
                    target: "installation",
                    kind = %kind,
                    error = %source,
                    "guest installation failed, leaving bundle for inspection"
                );
                Err(LifecycleError::Install { kind, source })
            }
        }
    }
}
