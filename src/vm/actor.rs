//! Single-task actor around a [`LifecycleController`].
//!
//! Every request and every backend stop notification for one guest goes
//! through one queue, so the controller never sees two operations at once:
//!
//! ```text
//! ActorHandle ──mpsc<Command>──┐
//!                              ├─► select! ─► LifecycleController
//! backend ──broadcast<Stop>────┘
//! ```

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::backend::{GuestHandle, StopEvent};
use super::error::{LifecycleError, Result};
use super::lifecycle::{LifecycleController, LifecycleState};
use super::progress::ProvisionProgress;
use super::{DisplaySize, GuestKind};

const COMMAND_QUEUE_DEPTH: usize = 32;

enum Command {
    Provision(oneshot::Sender<Result<GuestHandle>>),
    Suspend(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    ReconfigureDisplay(DisplaySize, oneshot::Sender<Result<()>>),
    Terminate(oneshot::Sender<Result<()>>),
    State(oneshot::Sender<LifecycleState>),
    History(oneshot::Sender<Vec<LifecycleState>>),
}

/// Cloneable client for one guest actor.
#[derive(Clone)]
pub struct ActorHandle {
    kind: GuestKind,
    tx: mpsc::Sender<Command>,
    progress: watch::Receiver<ProvisionProgress>,
}

/// Move `controller` onto its own task and return a handle to it.
///
/// Must be called from within a tokio runtime. The task exits once every
/// [`ActorHandle`] has been dropped.
pub fn spawn_guest_actor(controller: LifecycleController) -> ActorHandle {
    let kind = controller.profile().kind;
    let progress = controller.subscribe_progress();
    let stops = controller.subscribe_stops();
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    tokio::spawn(run(controller, rx, stops));

    ActorHandle { kind, tx, progress }
}

async fn run(
    mut controller: LifecycleController,
    mut rx: mpsc::Receiver<Command>,
    mut stops: broadcast::Receiver<StopEvent>,
) {
    let kind = controller.profile().kind;
    let mut stops_open = true;
    debug!(target: "actor", kind = %kind, "guest actor started");

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(command) => dispatch(&mut controller, command).await,
                    None => break,
                }
            }

            stop = stops.recv(), if stops_open => {
                match stop {
                    Ok(event) if event.handle.kind() == kind => {
                        controller.handle_stop(event).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "actor", kind = %kind, skipped, "missed backend stop events");
                    }
                    Err(RecvError::Closed) => {
                        debug!(target: "actor", kind = %kind, "backend stop channel closed");
                        stops_open = false;
                    }
                }
            }
        }
    }

    info!(target: "actor", kind = %kind, state = ?controller.state(), "guest actor stopped");
}

async fn dispatch(controller: &mut LifecycleController, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Provision(reply) => {
            let _ = reply.send(controller.provision().await);
        }
        Command::Suspend(reply) => {
            let _ = reply.send(controller.suspend_and_persist().await);
        }
        Command::Resume(reply) => {
            let _ = reply.send(controller.resume().await);
        }
        Command::ReconfigureDisplay(size, reply) => {
            let _ = reply.send(controller.reconfigure_display(size).await);
        }
        Command::Terminate(reply) => {
            let _ = reply.send(controller.terminate().await);
        }
        Command::State(reply) => {
            let _ = reply.send(controller.state());
        }
        Command::History(reply) => {
            let _ = reply.send(controller.history().to_vec());
        }
    }
}

impl ActorHandle {
    pub fn kind(&self) -> GuestKind {
        self.kind
    }

    /// Latest provisioning progress; the watch receiver is the only place
    /// progress is delivered.
    pub fn progress(&self) -> watch::Receiver<ProvisionProgress> {
        self.progress.clone()
    }

    pub async fn provision(&self) -> Result<GuestHandle> {
        self.request(Command::Provision).await?
    }

    pub async fn suspend_and_persist(&self) -> Result<()> {
        self.request(Command::Suspend).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await?
    }

    pub async fn reconfigure_display(&self, size: DisplaySize) -> Result<()> {
        self.request(|reply| Command::ReconfigureDisplay(size, reply))
            .await?
    }

    pub async fn terminate(&self) -> Result<()> {
        self.request(Command::Terminate).await?
    }

    pub async fn state(&self) -> Result<LifecycleState> {
        self.request(Command::State).await
    }

    pub async fn history(&self) -> Result<Vec<LifecycleState>> {
        self.request(Command::History).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| LifecycleError::ActorGone(self.kind))?;
        reply_rx
            .await
            .map_err(|_| LifecycleError::ActorGone(self.kind))
    }
}
