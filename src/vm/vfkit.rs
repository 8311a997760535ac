//! [`GuestBackend`] driving the `vfkit` CLI (Virtualization.framework wrapper).
//!
//! ## Architecture
//!
//! ```text
//! instantiate(config)  → Machine { config, rest_port }        (no process yet)
//! start / install      → tokio::process::Command → vfkit child
//!                            ├─► health-check task  (try_wait + GET /vm/state)
//!                            │       └─► StopEvent on unexpected exit
//!                            └─► pause / resume     (PUT /vm/state)
//! ```
//!
//! vfkit boots EFI Linux guests only. macOS guests, machine state
//! save/restore and live display reconfiguration are reported as
//! [`BackendError::Unsupported`]; the lifecycle controller falls back to a
//! cold boot whenever a restore is refused.
//!
//! ## External Requirements (macOS)
//!
//! - `vfkit`: on `$PATH`, in a Homebrew prefix, or configured explicitly
//!   (`brew install vfkit`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use super::backend::{GuestBackend, GuestHandle, ResourceLimits, StopEvent};
use super::configuration::{
    AudioStream, BootLoader, GraphicsDevice, GuestConfiguration, Keyboard, PointingDevice,
    StorageBus, StorageDevice,
};
use super::error::BackendError;
use super::identity::HardwareModel;
use super::{DisplaySize, GuestKind};

const BACKEND: &str = "vfkit";

/// Default first REST port; machine `n` listens on `base + n`.
pub const DEFAULT_REST_PORT: u16 = 7620;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const STOP_DEADLINE: Duration = Duration::from_secs(30);
const VSOCK_PORT: u32 = 1024;

/// Observed state of one vfkit process.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProcessState {
    NotStarted,
    Running,
    Paused,
    Stopping,
    Stopped,
}

struct Machine {
    kind: GuestKind,
    config: GuestConfiguration,
    rest_port: u16,
    child: Arc<RwLock<Option<Child>>>,
    state: Arc<RwLock<ProcessState>>,
    /// Set while we are the ones making the process exit.
    expect_exit: Arc<AtomicBool>,
}

pub struct VfkitBackend {
    vfkit: Option<PathBuf>,
    rest_port_base: u16,
    client: reqwest::Client,
    next_id: AtomicU64,
    machines: RwLock<HashMap<u64, Machine>>,
    stops: broadcast::Sender<StopEvent>,
}

impl VfkitBackend {
    /// `vfkit` overrides binary discovery when set.
    pub fn new(vfkit: Option<PathBuf>, rest_port_base: u16) -> Self {
        let (stops, _) = broadcast::channel(16);
        Self {
            vfkit,
            rest_port_base,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            machines: RwLock::new(HashMap::new()),
            stops,
        }
    }

    fn resolve_vfkit(&self) -> Result<PathBuf, BackendError> {
        match &self.vfkit {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => Err(BackendError::InvalidConfiguration(format!(
                "configured vfkit binary does not exist: {}",
                path.display()
            ))),
            None => find_vfkit(),
        }
    }

    /// Launch vfkit for `handle`, optionally with the installer attached.
    async fn launch(&self, handle: &GuestHandle, with_install_media: bool) -> Result<(), BackendError> {
        let vfkit = self.resolve_vfkit()?;
        let machines = self.machines.read().await;
        let machine = machines
            .get(&handle.id())
            .ok_or(BackendError::UnknownHandle(handle.id()))?;

        {
            let state = machine.state.read().await;
            if !matches!(*state, ProcessState::NotStarted | ProcessState::Stopped) {
                return Err(BackendError::InvalidState {
                    state: format!("{:?}", *state),
                    operation: "start",
                });
            }
        }

        let args = vfkit_args(&machine.config, machine.rest_port, with_install_media);
        debug!(target: "vfkit", handle = %handle, args = ?args, "launching vfkit");

        let child = Command::new(&vfkit)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BackendError::operation("start", format!("spawn vfkit: {e}")))?;

        info!(
            target: "vfkit",
            kind = %machine.kind,
            handle = %handle,
            port = machine.rest_port,
            cpus = machine.config.cpu_count,
            memory_mb = machine.config.memory_bytes >> 20,
            install_media = with_install_media,
            "guest process spawned"
        );

        machine.expect_exit.store(with_install_media, Ordering::Release);
        *machine.child.write().await = Some(child);
        *machine.state.write().await = ProcessState::Running;
        Ok(())
    }

    async fn set_vm_state(
        &self,
        handle: &GuestHandle,
        operation: &'static str,
        from: ProcessState,
        to: ProcessState,
        requested: &str,
    ) -> Result<(), BackendError> {
        let (port, state) = {
            let machines = self.machines.read().await;
            let machine = machines
                .get(&handle.id())
                .ok_or(BackendError::UnknownHandle(handle.id()))?;
            (machine.rest_port, Arc::clone(&machine.state))
        };

        let current = state.read().await.clone();
        if current != from {
            return Err(BackendError::InvalidState {
                state: format!("{current:?}"),
                operation,
            });
        }

        let response = self
            .client
            .put(format!("http://localhost:{port}/vm/state"))
            .json(&serde_json::json!({ "state": requested }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| BackendError::operation(operation, e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::operation(
                operation,
                format!("vfkit REST API returned HTTP {}", response.status().as_u16()),
            ));
        }

        *state.write().await = to;
        debug!(target: "vfkit", handle = %handle, state = requested, "guest state changed");
        Ok(())
    }

    /// Gracefully stop every guest process, killing any that do not exit in
    /// time.
    pub async fn shutdown(&self) {
        let machines = self.machines.read().await;
        for (id, machine) in machines.iter() {
            if machine.child.read().await.is_none() {
                continue;
            }
            machine.expect_exit.store(true, Ordering::Release);
            *machine.state.write().await = ProcessState::Stopping;

            let stop = self
                .client
                .put(format!("http://localhost:{}/vm/state", machine.rest_port))
                .json(&serde_json::json!({ "state": "Stop" }))
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            match stop {
                Ok(resp) => {
                    info!(target: "vfkit", id, port = machine.rest_port, status = resp.status().as_u16(), "guest stop requested");
                }
                Err(e) => {
                    warn!(target: "vfkit", id, error = %e, "REST stop failed, killing guest process");
                    if let Some(child) = machine.child.write().await.as_mut() {
                        let _ = child.kill().await;
                    }
                }
            }

            wait_for_exit(&machine.child, STOP_DEADLINE).await;
            *machine.state.write().await = ProcessState::Stopped;
        }
    }
}

#[async_trait]
impl GuestBackend for VfkitBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn limits(&self) -> ResourceLimits {
        let host_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        ResourceLimits {
            max_cpu_count: host_cpus,
            ..ResourceLimits::default()
        }
    }

    fn supports_hardware_model(&self, _model: &HardwareModel) -> bool {
        false
    }

    fn create_auxiliary_storage(
        &self,
        _path: &Path,
        _model: &HardwareModel,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            backend: BACKEND,
            operation: "create auxiliary storage",
        })
    }

    fn create_efi_variable_store(&self, path: &Path) -> Result<(), BackendError> {
        // vfkit creates the store itself when launched with `create`.
        debug!(target: "vfkit", path = %path.display(), "EFI variable store created on first launch");
        Ok(())
    }

    fn validate(&self, config: &GuestConfiguration) -> Result<(), BackendError> {
        if config.kind == GuestKind::MacOs {
            return Err(BackendError::InvalidConfiguration(
                "vfkit cannot host macOS guests".to_string(),
            ));
        }
        if !matches!(config.boot_loader, BootLoader::Efi { .. }) {
            return Err(BackendError::InvalidConfiguration(
                "vfkit guests need an EFI boot loader".to_string(),
            ));
        }
        if config.cpu_count == 0 || config.memory_bytes < (1 << 20) {
            return Err(BackendError::InvalidConfiguration(format!(
                "{} CPUs and {} bytes of memory is not a bootable machine",
                config.cpu_count, config.memory_bytes
            )));
        }
        if !config
            .storage
            .iter()
            .any(|device| device.bus == StorageBus::VirtioBlock && !device.read_only)
        {
            return Err(BackendError::InvalidConfiguration(
                "no writable boot disk".to_string(),
            ));
        }
        self.resolve_vfkit().map(|_| ())
    }

    async fn instantiate(&self, config: &GuestConfiguration) -> Result<GuestHandle, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rest_port = u16::try_from(id)
            .ok()
            .and_then(|offset| self.rest_port_base.checked_add(offset))
            .ok_or_else(|| BackendError::operation("instantiate", "out of REST ports"))?;
        let handle = GuestHandle::new(id, config.kind);

        self.machines.write().await.insert(
            id,
            Machine {
                kind: config.kind,
                config: config.clone(),
                rest_port,
                child: Arc::new(RwLock::new(None)),
                state: Arc::new(RwLock::new(ProcessState::NotStarted)),
                expect_exit: Arc::new(AtomicBool::new(false)),
            },
        );
        debug!(target: "vfkit", handle = %handle, port = rest_port, "machine instantiated");
        Ok(handle)
    }

    async fn start(&self, handle: &GuestHandle) -> Result<(), BackendError> {
        self.launch(handle, false).await?;

        let machines = self.machines.read().await;
        if let Some(machine) = machines.get(&handle.id()) {
            spawn_health_check(
                handle.clone(),
                machine.rest_port,
                Arc::clone(&machine.state),
                Arc::clone(&machine.child),
                Arc::clone(&machine.expect_exit),
                self.stops.clone(),
            );
        }
        Ok(())
    }

    async fn pause(&self, handle: &GuestHandle) -> Result<(), BackendError> {
        self.set_vm_state(handle, "pause", ProcessState::Running, ProcessState::Paused, "Pause")
            .await
    }

    async fn resume(&self, handle: &GuestHandle) -> Result<(), BackendError> {
        self.set_vm_state(handle, "resume", ProcessState::Paused, ProcessState::Running, "Resume")
            .await
    }

    async fn save_state(&self, _handle: &GuestHandle, _path: &Path) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            backend: BACKEND,
            operation: "save machine state",
        })
    }

    async fn restore_state(&self, _handle: &GuestHandle, _path: &Path) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            backend: BACKEND,
            operation: "restore machine state",
        })
    }

    async fn install(
        &self,
        handle: &GuestHandle,
        media: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), BackendError> {
        {
            let mut machines = self.machines.write().await;
            let machine = machines
                .get_mut(&handle.id())
                .ok_or(BackendError::UnknownHandle(handle.id()))?;
            if machine.config.install_media().is_none() {
                machine.config.storage.push(StorageDevice {
                    path: media.to_path_buf(),
                    read_only: true,
                    bus: StorageBus::UsbMassStorage,
                });
            }
        }

        self.launch(handle, true).await?;
        on_progress(0.0);
        info!(target: "vfkit", handle = %handle, "installer running, waiting for guest power-off");

        let (child, state) = {
            let machines = self.machines.read().await;
            let machine = machines
                .get(&handle.id())
                .ok_or(BackendError::UnknownHandle(handle.id()))?;
            (Arc::clone(&machine.child), Arc::clone(&machine.state))
        };

        let status = {
            let mut guard = child.write().await;
            match guard.as_mut() {
                Some(process) => process.wait().await?,
                None => return Err(BackendError::operation("install", "installer process missing")),
            }
        };
        *child.write().await = None;
        *state.write().await = ProcessState::Stopped;

        if status.success() {
            on_progress(1.0);
            Ok(())
        } else {
            Err(BackendError::operation(
                "install",
                format!("installer guest exited with {status}"),
            ))
        }
    }

    async fn reconfigure_display(
        &self,
        _handle: &GuestHandle,
        _size: DisplaySize,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            backend: BACKEND,
            operation: "reconfigure display",
        })
    }

    fn stop_events(&self) -> broadcast::Receiver<StopEvent> {
        self.stops.subscribe()
    }
}

// ---------------------------------------------------------------------------
// vfkit command line
// ---------------------------------------------------------------------------

/// Translate a configuration into vfkit arguments.
pub fn vfkit_args(config: &GuestConfiguration, rest_port: u16, with_install_media: bool) -> Vec<String> {
    let mut args = Vec::new();
    let mut device = |spec: String| {
        args.push("--device".to_string());
        args.push(spec);
    };

    let bundle = config
        .storage
        .first()
        .and_then(|disk| disk.path.parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();

    for disk in &config.storage {
        let readonly = if disk.read_only { ",readonly" } else { "" };
        match disk.bus {
            StorageBus::VirtioBlock => {
                device(format!("virtio-blk,path={}{readonly}", disk.path.display()))
            }
            StorageBus::UsbMassStorage if with_install_media => {
                device(format!("usb-mass-storage,path={}{readonly}", disk.path.display()))
            }
            StorageBus::UsbMassStorage => {}
        }
    }

    for nic in &config.network {
        device(format!("virtio-net,nat,mac={}", nic.mac_address));
    }

    for _ in 0..config.socket_devices {
        device(format!(
            "virtio-vsock,port={VSOCK_PORT},socketURL={},listen",
            bundle.join(format!("vsock-{VSOCK_PORT}.sock")).display()
        ));
    }

    if let GraphicsDevice::Virtio { size } = config.graphics {
        device(format!("virtio-gpu,width={},height={}", size.width, size.height));
    }

    match config.pointing {
        PointingDevice::UsbScreenCoordinate => device("virtio-input,pointing".to_string()),
        PointingDevice::MacTrackpad => {}
    }
    match config.keyboard {
        Keyboard::Usb => device("virtio-input,keyboard".to_string()),
        Keyboard::Mac => {}
    }

    for share in &config.shared_directories {
        device(format!(
            "virtio-fs,sharedDir={},mountTag={}",
            share.host_path.display(),
            share.tag
        ));
    }

    device(format!(
        "virtio-serial,logFilePath={}",
        bundle.join("console.log").display()
    ));
    device("virtio-rng".to_string());

    if !config.audio.is_empty() {
        let streams: Vec<&str> = config
            .audio
            .iter()
            .map(|stream| match stream {
                AudioStream::HostInput => "input",
                AudioStream::HostOutput => "output",
            })
            .collect();
        debug!(target: "vfkit", streams = ?streams, "audio devices not available in vfkit, skipping");
    }
    if !config.consoles.is_empty() {
        debug!(target: "vfkit", count = config.consoles.len(), "spice console ports not available in vfkit, skipping");
    }

    if let BootLoader::Efi { variable_store } = &config.boot_loader {
        let create = if variable_store.exists() { "" } else { ",create" };
        args.push("--bootloader".to_string());
        args.push(format!("efi,variable-store={}{create}", variable_store.display()));
    }

    args.push("--cpus".to_string());
    args.push(config.cpu_count.to_string());
    args.push("--memory".to_string());
    args.push((config.memory_bytes >> 20).to_string());

    args.push("--restful-uri".to_string());
    args.push(format!("tcp://localhost:{rest_port}"));

    if matches!(config.graphics, GraphicsDevice::Virtio { .. }) {
        args.push("--gui".to_string());
    }

    args
}

/// Resolve the `vfkit` binary from `$PATH` or the Homebrew prefixes.
fn find_vfkit() -> Result<PathBuf, BackendError> {
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("vfkit");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
        let candidate = PathBuf::from(path);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(BackendError::InvalidConfiguration(
        "vfkit binary not found; install it with `brew install vfkit`".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Process supervision
// ---------------------------------------------------------------------------

async fn wait_for_exit(child: &Arc<RwLock<Option<Child>>>, deadline: Duration) -> Option<ExitStatus> {
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        {
            let mut guard = child.write().await;
            let Some(process) = guard.as_mut() else {
                return None;
            };
            match process.try_wait() {
                Ok(Some(status)) => {
                    info!(target: "vfkit", exit_status = ?status, "guest process exited");
                    *guard = None;
                    return Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(target: "vfkit", error = %e, "error waiting for guest process");
                    *guard = None;
                    return None;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(target: "vfkit", "guest did not exit in time, killing");
                let _ = process.kill().await;
                *guard = None;
                return None;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Poll the vfkit process and REST API, publishing a [`StopEvent`] if the
/// process exits while nobody asked it to.
fn spawn_health_check(
    handle: GuestHandle,
    rest_port: u16,
    state: Arc<RwLock<ProcessState>>,
    child: Arc<RwLock<Option<Child>>>,
    expect_exit: Arc<AtomicBool>,
    stops: broadcast::Sender<StopEvent>,
) {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!(target: "vfkit", error = %e, "could not build health-check client");
                return;
            }
        };
        let url = format!("http://localhost:{rest_port}/vm/state");

        loop {
            tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;

            if matches!(
                *state.read().await,
                ProcessState::Stopping | ProcessState::Stopped
            ) {
                debug!(target: "vfkit", handle = %handle, "health-check task exiting");
                return;
            }

            let exited = {
                let mut guard = child.write().await;
                match guard.as_mut().map(|process| process.try_wait()) {
                    Some(Ok(Some(status))) => {
                        *guard = None;
                        Some(Some(status))
                    }
                    Some(Ok(None)) => None,
                    Some(Err(e)) => {
                        error!(target: "vfkit", handle = %handle, error = %e, "try_wait error in health-check");
                        None
                    }
                    None => Some(None),
                }
            };

            if let Some(status) = exited {
                *state.write().await = ProcessState::Stopped;
                if expect_exit.load(Ordering::Acquire) {
                    debug!(target: "vfkit", handle = %handle, "guest exited on request");
                    return;
                }
                let reason = status
                    .filter(|status| !status.success())
                    .map(|status| format!("vfkit exited with {status}"));
                warn!(target: "vfkit", handle = %handle, reason = ?reason, "guest process exited unexpectedly");
                let _ = stops.send(StopEvent::new(handle.clone(), reason));
                return;
            }

            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await.unwrap_or_default();
                    debug!(target: "vfkit", handle = %handle, state = %body, "health-check OK");
                }
                Ok(resp) => {
                    warn!(target: "vfkit", handle = %handle, http_status = resp.status().as_u16(), "health-check non-2xx");
                }
                Err(e) => {
                    // The guest may still be booting; only process exit counts.
                    debug!(target: "vfkit", handle = %handle, error = %e, "health-check failed");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::configuration::{ConsolePort, NetworkDevice, Platform, SharedDirectory};
    use crate::vm::identity::MachineIdentifier;

    fn linux_config(bundle: &Path) -> GuestConfiguration {
        GuestConfiguration {
            kind: GuestKind::Linux,
            platform: Platform::Generic {
                machine_identifier: MachineIdentifier::generate(),
            },
            boot_loader: BootLoader::Efi {
                variable_store: bundle.join("EFIVariableStore"),
            },
            cpu_count: 3,
            memory_bytes: 4 << 30,
            graphics: GraphicsDevice::Virtio {
                size: DisplaySize::new(1280, 720),
            },
            storage: vec![
                StorageDevice {
                    path: bundle.join("Disk.img"),
                    read_only: false,
                    bus: StorageBus::VirtioBlock,
                },
                StorageDevice {
                    path: bundle.join("Installer.iso"),
                    read_only: true,
                    bus: StorageBus::UsbMassStorage,
                },
            ],
            network: vec![NetworkDevice {
                mac_address: "d6:a7:58:8e:78:d4".to_string(),
                nat: true,
            }],
            socket_devices: 1,
            pointing: PointingDevice::UsbScreenCoordinate,
            keyboard: Keyboard::Usb,
            audio: vec![AudioStream::HostInput, AudioStream::HostOutput],
            consoles: vec![ConsolePort {
                name: "com.redhat.spice.0".to_string(),
                spice_agent: true,
            }],
            shared_directories: vec![SharedDirectory {
                host_path: PathBuf::from("/Users/me/InertiaStorage"),
                tag: "inertia_storage".to_string(),
                read_only: false,
            }],
        }
    }

    fn device_specs(args: &[String]) -> Vec<&str> {
        args.windows(2)
            .filter(|pair| pair[0] == "--device")
            .map(|pair| pair[1].as_str())
            .collect()
    }

    #[test]
    fn args_cover_every_vfkit_device() {
        let bundle = Path::new("/vms/VM_linux.bundle");
        let args = vfkit_args(&linux_config(bundle), 7621, true);
        let devices = device_specs(&args);

        assert!(devices.contains(&"virtio-blk,path=/vms/VM_linux.bundle/Disk.img"));
        assert!(devices.contains(&"usb-mass-storage,path=/vms/VM_linux.bundle/Installer.iso,readonly"));
        assert!(devices.contains(&"virtio-net,nat,mac=d6:a7:58:8e:78:d4"));
        assert!(devices.contains(&"virtio-gpu,width=1280,height=720"));
        assert!(devices.contains(&"virtio-input,pointing"));
        assert!(devices.contains(&"virtio-input,keyboard"));
        assert!(devices.contains(
            &"virtio-fs,sharedDir=/Users/me/InertiaStorage,mountTag=inertia_storage"
        ));
        assert!(devices.iter().any(|d| d.starts_with("virtio-vsock,port=1024,")));
    }

    #[test]
    fn args_set_resources_and_rest_endpoint() {
        let args = vfkit_args(&linux_config(Path::new("/b")), 7621, false);
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        assert_eq!(args[pos("--cpus") + 1], "3");
        assert_eq!(args[pos("--memory") + 1], "4096");
        assert_eq!(args[pos("--restful-uri") + 1], "tcp://localhost:7621");
        assert_eq!(
            args[pos("--bootloader") + 1],
            "efi,variable-store=/b/EFIVariableStore,create"
        );
    }

    #[test]
    fn install_media_is_only_attached_for_installation() {
        let args = vfkit_args(&linux_config(Path::new("/b")), 7621, false);
        assert!(!device_specs(&args).iter().any(|d| d.starts_with("usb-mass-storage")));
    }

    #[test]
    fn validate_rejects_macos_guests() {
        let backend = VfkitBackend::new(None, DEFAULT_REST_PORT);
        let mut config = linux_config(Path::new("/b"));
        config.kind = GuestKind::MacOs;

        let err = backend.validate(&config).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn state_persistence_is_unsupported() {
        let backend = VfkitBackend::new(None, DEFAULT_REST_PORT);
        let handle = backend
            .instantiate(&linux_config(Path::new("/b")))
            .await
            .unwrap();

        let err = backend
            .save_state(&handle, Path::new("/b/SaveFile.vzvmsave"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn pause_requires_a_running_process() {
        let backend = VfkitBackend::new(None, DEFAULT_REST_PORT);
        let handle = backend
            .instantiate(&linux_config(Path::new("/b")))
            .await
            .unwrap();

        let err = backend.pause(&handle).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidState { .. }));
    }
}
