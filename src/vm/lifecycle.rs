//! Guest lifecycle controller.
//!
//! One controller owns one guest profile: its state machine, its live
//! [`GuestHandle`] and the decision of which boot path to take.
//!
//! ```text
//! provision()
//!     ├─ disk image absent   → acquire → stage → build_fresh → install → start
//!     └─ disk image present  → build_restore → instantiate
//!             ├─ saved state present → restore → resume   (cold boot on failure)
//!             └─ no saved state      → start
//! suspend_and_persist()      pause → save → Paused
//! terminate()                pause → save → Terminated
//! handle_stop(event)         best-effort pause → save → Halted
//! ```
//!
//! The controller is not `Sync`-shared; the host drives it from a single
//! task (see [`crate::vm::actor`]).

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::state_machine::lifecycle_sm::{GuestEvent, GuestMachine, GuestStateMachine};

use super::acquisition::ImageAcquirer;
use super::backend::{GuestBackend, GuestHandle, StopEvent};
use super::configuration::{ConfigurationBuilder, DeviceOptions, GuestConfiguration};
use super::error::{LifecycleError, Result};
use super::filesystem;
use super::installation::InstallationOrchestrator;
use super::profile::{GuestLayout, GuestProfile};
use super::progress::{ProgressPhase, ProgressReporter, ProvisionProgress};
use super::{DisplaySize, GuestKind};

/// Externally visible lifecycle state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    NotProvisioned,
    AcquiringImage,
    ProvisioningStorage,
    Installing,
    RestoringSavedState,
    Booted,
    Running,
    Paused,
    Saving,
    /// Stopped unexpectedly; the next provision boots from disk again.
    Halted,
    Terminated,
}

impl LifecycleState {
    /// A machine exists and `provision` returns it unchanged.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LifecycleState::Booted | LifecycleState::Running | LifecycleState::Paused
        )
    }
}

/// Which half of a saved-state restore was rejected.
#[derive(Debug, Clone, Copy)]
enum RestoreStage {
    Load,
    Resume,
}

pub struct LifecycleController {
    profile: GuestProfile,
    layout: GuestLayout,
    backend: Arc<dyn GuestBackend>,
    acquirer: ImageAcquirer,
    builder: ConfigurationBuilder,
    installer: InstallationOrchestrator,
    progress: ProgressReporter,
    machine: GuestStateMachine,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    handle: Option<GuestHandle>,
    last_display: DisplaySize,
}

impl LifecycleController {
    pub fn new(
        profile: GuestProfile,
        vms_root: &Path,
        backend: Arc<dyn GuestBackend>,
        acquirer: ImageAcquirer,
        devices: DeviceOptions,
    ) -> Self {
        let layout = profile.layout(vms_root);
        let builder =
            ConfigurationBuilder::new(Arc::clone(&backend), profile, layout.clone(), devices);
        let installer = InstallationOrchestrator::new(profile.kind, Arc::clone(&backend));
        let (progress, _) = ProgressReporter::new();

        Self {
            profile,
            layout,
            backend,
            acquirer,
            builder,
            installer,
            progress,
            machine: GuestMachine::new(profile.kind).into_machine(),
            state: LifecycleState::NotProvisioned,
            history: vec![LifecycleState::NotProvisioned],
            handle: None,
            last_display: profile.display,
        }
    }

    pub fn profile(&self) -> &GuestProfile {
        &self.profile
    }

    pub fn layout(&self) -> &GuestLayout {
        &self.layout
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered since construction, oldest first.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// The live machine, if any.
    pub fn handle(&self) -> Option<&GuestHandle> {
        self.handle.as_ref()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProvisionProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe_stops(&self) -> broadcast::Receiver<StopEvent> {
        self.backend.stop_events()
    }

    fn kind(&self) -> GuestKind {
        self.profile.kind
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Bring the guest to `Running`, installing or restoring as needed.
    ///
    /// Returns the existing handle when the guest is already live.
    pub async fn provision(&mut self) -> Result<GuestHandle> {
        let kind = self.kind();

        if self.state.is_live() {
            if let Some(handle) = &self.handle {
                debug!(target: "lifecycle", kind = %kind, handle = %handle, "guest already live");
                return Ok(handle.clone());
            }
        }

        match self.state {
            LifecycleState::NotProvisioned => {}
            LifecycleState::Halted => {
                info!(target: "lifecycle", kind = %kind, "reprovisioning halted guest");
                self.handle = None;
                self.transition(GuestEvent::Reset, "provision")?;
            }
            LifecycleState::Terminated => return Err(LifecycleError::Terminated(kind)),
            state => {
                return Err(LifecycleError::InvalidState {
                    kind,
                    state,
                    operation: "provision",
                });
            }
        }

        let result = if self.layout.has_disk_image() {
            self.boot_installed().await
        } else {
            self.install_fresh().await
        };

        if let Err(err) = &result {
            error!(target: "lifecycle", kind = %kind, error = %err, "guest provisioning failed");
            self.abandon_setup();
        }
        result
    }

    async fn install_fresh(&mut self) -> Result<GuestHandle> {
        let kind = self.kind();
        info!(target: "lifecycle", kind = %kind, "no disk image, installing fresh guest");
        self.progress.reset();

        self.transition(GuestEvent::AcquireImage, "provision")?;
        let progress = &self.progress;
        let on_download = |fraction: f64| progress.report(ProgressPhase::Download, fraction);
        let fetched = self
            .acquirer
            .fetch(kind, &on_download)
            .await
            .map_err(|source| LifecycleError::Acquire { kind, source })?;
        self.progress.complete(ProgressPhase::Download);

        self.transition(GuestEvent::ImageAcquired, "provision")?;
        let acquired = self.acquirer.stage(&self.layout, fetched)?;
        let (config, identity) = self.builder.build_fresh(&acquired)?;
        debug!(
            target: "lifecycle",
            kind = %kind,
            machine_identifier = %identity.machine_identifier,
            "fresh identity minted"
        );

        self.transition(GuestEvent::StorageProvisioned, "provision")?;
        let handle = self.instantiate(&config).await?;
        self.installer
            .install(&handle, &config, &acquired.media, &self.progress)
            .await?;

        self.transition(GuestEvent::Installed, "provision")?;
        self.start(handle).await
    }

    async fn boot_installed(&mut self) -> Result<GuestHandle> {
        let kind = self.kind();
        let config = self.builder.build_restore()?;
        let handle = self.instantiate(&config).await?;

        if !self.layout.has_saved_state() {
            info!(target: "lifecycle", kind = %kind, "no saved state, cold booting");
            self.transition(GuestEvent::ColdBoot, "provision")?;
            return self.start(handle).await;
        }

        self.transition(GuestEvent::RestoreSavedState, "provision")?;
        let saved_state = self.layout.saved_state();
        let restored = match self.backend.restore_state(&handle, &saved_state).await {
            Ok(()) => self
                .backend
                .resume(&handle)
                .await
                .map_err(|err| (err, RestoreStage::Resume)),
            Err(err) => Err((err, RestoreStage::Load)),
        };
        self.discard_saved_state();

        match restored {
            Ok(()) => {
                self.transition(GuestEvent::RestoreSucceeded, "provision")?;
                info!(target: "lifecycle", kind = %kind, handle = %handle, "guest restored from saved state");
                Ok(handle)
            }
            Err((err, stage)) => {
                warn!(
                    target: "lifecycle",
                    kind = %kind,
                    error = %err,
                    stage = ?stage,
                    "saved state rejected, falling back to cold boot"
                );
                self.transition(GuestEvent::RestoreFailed, "provision")?;
                // A machine holding loaded state cannot be started again.
                let handle = match stage {
                    RestoreStage::Load => handle,
                    RestoreStage::Resume => self.instantiate(&config).await?,
                };
                self.start(handle).await
            }
        }
    }

    async fn instantiate(&mut self, config: &GuestConfiguration) -> Result<GuestHandle> {
        let kind = self.kind();
        let handle = self
            .backend
            .instantiate(config)
            .await
            .map_err(|source| LifecycleError::Backend {
                kind,
                operation: "instantiate",
                source,
            })?;
        self.handle = Some(handle.clone());
        self.last_display = self.profile.display;
        Ok(handle)
    }

    async fn start(&mut self, handle: GuestHandle) -> Result<GuestHandle> {
        let kind = self.kind();
        self.backend
            .start(&handle)
            .await
            .map_err(|source| LifecycleError::Backend {
                kind,
                operation: "start",
                source,
            })?;
        self.transition(GuestEvent::Started, "start")?;
        info!(target: "lifecycle", kind = %kind, handle = %handle, "guest running");
        Ok(handle)
    }

    /// The saved state is single use, whatever the restore outcome.
    fn discard_saved_state(&self) {
        let path = self.layout.saved_state();
        if let Err(err) = filesystem::remove_if_exists(&path) {
            warn!(
                target: "lifecycle",
                kind = %self.kind(),
                path = %path.display(),
                error = %err,
                "could not delete consumed saved state"
            );
        }
    }

    fn abandon_setup(&mut self) {
        self.handle = None;
        if self.state != LifecycleState::NotProvisioned {
            if let Err(err) = self.transition(GuestEvent::Reset, "reset") {
                warn!(target: "lifecycle", kind = %self.kind(), error = %err, "could not reset state machine");
            }
        }
    }

    // ------------------------------------------------------------------
    // Running guest
    // ------------------------------------------------------------------

    /// Pause the guest and write its state to the saved-state file.
    pub async fn suspend_and_persist(&mut self) -> Result<()> {
        let handle = self.live_handle("suspend")?;
        self.pause_and_save(&handle, false).await
    }

    /// Resume a paused guest.
    pub async fn resume(&mut self) -> Result<()> {
        let kind = self.kind();
        if self.state == LifecycleState::Running {
            debug!(target: "lifecycle", kind = %kind, "guest already running");
            return Ok(());
        }
        let handle = self.live_handle("resume")?;
        self.backend
            .resume(&handle)
            .await
            .map_err(|source| LifecycleError::Backend {
                kind,
                operation: "resume",
                source,
            })?;
        self.transition(GuestEvent::Resumed, "resume")
    }

    /// Save-on-quit: persist the guest and enter `Terminated`.
    pub async fn terminate(&mut self) -> Result<()> {
        let kind = self.kind();
        match self.state {
            LifecycleState::Running | LifecycleState::Paused => {
                let handle = self.live_handle("terminate")?;
                self.pause_and_save(&handle, true).await
            }
            state => {
                info!(target: "lifecycle", kind = %kind, state = ?state, "nothing live to save on quit");
                Ok(())
            }
        }
    }

    /// Forward a display size change, skipping repeats of the last size.
    pub async fn reconfigure_display(&mut self, size: DisplaySize) -> Result<()> {
        let kind = self.kind();
        if size == self.last_display {
            debug!(target: "lifecycle", kind = %kind, size = %size, "display size unchanged");
            return Ok(());
        }

        let handle = self.live_handle("reconfigure display")?;
        self.backend
            .reconfigure_display(&handle, size)
            .await
            .map_err(|source| LifecycleError::Backend {
                kind,
                operation: "reconfigure display",
                source,
            })?;
        self.last_display = size;
        debug!(target: "lifecycle", kind = %kind, size = %size, "display reconfigured");
        Ok(())
    }

    /// Absorb an unexpected backend stop.
    pub async fn handle_stop(&mut self, event: StopEvent) {
        let kind = self.kind();
        let Some(handle) = self.handle.clone().filter(|h| *h == event.handle) else {
            debug!(target: "lifecycle", kind = %kind, handle = %event.handle, "stop event for a stale handle");
            return;
        };
        if !matches!(
            self.state,
            LifecycleState::Running | LifecycleState::Paused
        ) {
            debug!(target: "lifecycle", kind = %kind, state = ?self.state, "ignoring stop event");
            return;
        }

        warn!(
            target: "lifecycle",
            kind = %kind,
            handle = %handle,
            error = ?event.error,
            at = %event.at,
            "guest stopped unexpectedly"
        );

        if let Err(err) = self.pause_and_save(&handle, false).await {
            warn!(target: "lifecycle", kind = %kind, error = %err, "could not save stopped guest");
        }
        if let Err(err) = self.transition(GuestEvent::GuestStopped, "handle stop") {
            warn!(target: "lifecycle", kind = %kind, error = %err, "stop event left state unchanged");
        }
    }

    async fn pause_and_save(&mut self, handle: &GuestHandle, terminating: bool) -> Result<()> {
        let kind = self.kind();

        if self.state == LifecycleState::Running {
            self.backend
                .pause(handle)
                .await
                .map_err(|source| LifecycleError::Backend {
                    kind,
                    operation: "pause",
                    source,
                })?;
            self.transition(GuestEvent::Paused, "pause")?;
        }

        self.transition(GuestEvent::SaveStarted, "save")?;
        let path = self.layout.saved_state();
        match self.backend.save_state(handle, &path).await {
            Ok(()) => {
                let event = if terminating {
                    GuestEvent::SavedForTermination
                } else {
                    GuestEvent::Saved
                };
                self.transition(event, "save")?;
                info!(target: "lifecycle", kind = %kind, path = %path.display(), "guest state saved");
                Ok(())
            }
            Err(source) => {
                self.transition(GuestEvent::SaveFailed, "save")?;
                Err(LifecycleError::Backend {
                    kind,
                    operation: "save",
                    source,
                })
            }
        }
    }

    fn live_handle(&self, operation: &'static str) -> Result<GuestHandle> {
        let kind = self.kind();
        match (self.state, &self.handle) {
            (LifecycleState::Running | LifecycleState::Paused, Some(handle)) => Ok(handle.clone()),
            (LifecycleState::Terminated, _) => Err(LifecycleError::Terminated(kind)),
            (state, _) => Err(LifecycleError::InvalidState {
                kind,
                state,
                operation,
            }),
        }
    }

    /// Feed `event` to the state machine; an unchanged state means the event
    /// is not valid here.
    fn transition(&mut self, event: GuestEvent, operation: &'static str) -> Result<()> {
        let before = self.state;
        self.machine.handle(&event);
        let after = GuestMachine::lifecycle_state(self.machine.state());

        if after == before {
            return Err(LifecycleError::InvalidState {
                kind: self.kind(),
                state: before,
                operation,
            });
        }

        debug!(
            target: "lifecycle",
            kind = %self.kind(),
            from = ?before,
            to = ?after,
            event = ?event,
            "state transition"
        );
        self.state = after;
        self.history.push(after);
        Ok(())
    }
}
