//! Guest lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! NotProvisioned
//! Setup (superstate, accepts Reset → NotProvisioned)
//!     ├── AcquiringImage → ProvisioningStorage → Installing → Booted
//!     ├── RestoringSavedState → Running | Booted
//!     └── Booted → Running
//! Live (superstate, accepts GuestStopped → Halted)
//!     ├── Running ⇄ Paused
//!     └── Paused → Saving
//! Saving → Paused | Terminated
//! Halted → NotProvisioned (Reset)
//! Terminated
//! ```
//!
//! Only transitions are modelled here. The controller performs the backend
//! work and feeds the outcome back in as an event; an event a state does not
//! accept leaves the state untouched, which the controller reports as an
//! invalid-state error.

use statig::prelude::*;
use tracing::{info, warn};

use crate::vm::GuestKind;
use crate::vm::lifecycle::LifecycleState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    /// No disk image: start the fresh install path.
    AcquireImage,
    ImageAcquired,
    StorageProvisioned,
    Installed,
    /// Disk image and saved state present.
    RestoreSavedState,
    RestoreSucceeded,
    /// Saved state rejected; fall back to a cold boot.
    RestoreFailed,
    /// Disk image present, no saved state.
    ColdBoot,
    Started,
    Paused,
    Resumed,
    SaveStarted,
    Saved,
    SaveFailed,
    /// Save completed as part of host shutdown.
    SavedForTermination,
    /// Backend reported the guest stopped on its own.
    GuestStopped,
    /// Abandon a failed setup or a halted guest.
    Reset,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct GuestMachine {
    pub kind: GuestKind,
}

pub type GuestStateMachine = statig::blocking::StateMachine<GuestMachine>;

impl GuestMachine {
    pub fn new(kind: GuestKind) -> Self {
        Self { kind }
    }

    pub fn into_machine(self) -> GuestStateMachine {
        self.state_machine()
    }

    /// Public lifecycle state for a machine state.
    pub fn lifecycle_state(state: &State) -> LifecycleState {
        match state {
            State::NotProvisioned {} => LifecycleState::NotProvisioned,
            State::AcquiringImage {} => LifecycleState::AcquiringImage,
            State::ProvisioningStorage {} => LifecycleState::ProvisioningStorage,
            State::Installing {} => LifecycleState::Installing,
            State::RestoringSavedState {} => LifecycleState::RestoringSavedState,
            State::Booted {} => LifecycleState::Booted,
            State::Running {} => LifecycleState::Running,
            State::Paused {} => LifecycleState::Paused,
            State::Saving {} => LifecycleState::Saving,
            State::Halted {} => LifecycleState::Halted,
            State::Terminated {} => LifecycleState::Terminated,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::not_provisioned()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl GuestMachine {
    // ------------------------------------------------------------------
    // Superstates
    // ------------------------------------------------------------------

    #[superstate]
    fn setup(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Reset => Transition(State::not_provisioned()),
            _ => Handled,
        }
    }

    #[superstate]
    fn live(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::GuestStopped => Transition(State::halted()),
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Leaf states
    // ------------------------------------------------------------------

    #[state]
    fn not_provisioned(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::AcquireImage => Transition(State::acquiring_image()),
            GuestEvent::RestoreSavedState => Transition(State::restoring_saved_state()),
            GuestEvent::ColdBoot => Transition(State::booted()),
            _ => Handled,
        }
    }

    #[state(superstate = "setup")]
    fn acquiring_image(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::ImageAcquired => Transition(State::provisioning_storage()),
            _ => Super,
        }
    }

    #[state(superstate = "setup")]
    fn provisioning_storage(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::StorageProvisioned => Transition(State::installing()),
            _ => Super,
        }
    }

    #[state(superstate = "setup")]
    fn installing(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Installed => Transition(State::booted()),
            _ => Super,
        }
    }

    #[state(superstate = "setup")]
    fn restoring_saved_state(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::RestoreSucceeded => Transition(State::running()),
            GuestEvent::RestoreFailed => Transition(State::booted()),
            _ => Super,
        }
    }

    /// Machine instantiated and ready to start.
    #[state(superstate = "setup")]
    fn booted(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Started => Transition(State::running()),
            _ => Super,
        }
    }

    #[state(superstate = "live")]
    fn running(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Paused => Transition(State::paused()),
            _ => Super,
        }
    }

    #[state(superstate = "live")]
    fn paused(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Resumed => Transition(State::running()),
            GuestEvent::SaveStarted => Transition(State::saving()),
            _ => Super,
        }
    }

    #[state]
    fn saving(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Saved | GuestEvent::SaveFailed => Transition(State::paused()),
            GuestEvent::SavedForTermination => Transition(State::terminated()),
            _ => Handled,
        }
    }

    /// Stopped without a save; the next provision restores from disk.
    #[state(entry_action = "enter_halted")]
    fn halted(&mut self, event: &GuestEvent) -> Outcome<State> {
        match event {
            GuestEvent::Reset => Transition(State::not_provisioned()),
            _ => Handled,
        }
    }

    #[state(entry_action = "enter_terminated")]
    fn terminated(&mut self) -> Outcome<State> {
        Handled
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    #[action]
    fn enter_halted(&mut self) {
        warn!(target: "lifecycle", kind = %self.kind, "guest halted");
    }

    #[action]
    fn enter_terminated(&mut self) {
        info!(target: "lifecycle", kind = %self.kind, "guest terminated");
    }
}
