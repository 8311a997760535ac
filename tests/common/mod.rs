//! Shared fakes for the lifecycle scenario tests.
//!
//! `FakeBackend` keeps no machines at all: it records every call, writes the
//! files a real backend would write (auxiliary storage, EFI store, saved
//! state) and fails any operation the test scripts a failure for.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};
use url::Url;

use inertia_guests::vm::acquisition::{
    ConfigurationRequirements, ImageAcquirer, ImageSource, RestoreImage,
};
use inertia_guests::vm::backend::ResourceLimits;
use inertia_guests::vm::configuration::{DeviceOptions, GuestConfiguration};
use inertia_guests::vm::identity::HardwareModel;
use inertia_guests::vm::{
    AcquireError, BackendError, DisplaySize, GuestBackend, GuestHandle, GuestKind, GuestProfile,
    LifecycleController, StopEvent,
};

/// Saved-state contents the fake refuses to restore.
pub const CORRUPT_STATE: &[u8] = b"corrupt";

pub const DEFAULT_DISPLAY: DisplaySize = DisplaySize::new(1280, 800);

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct FakeBackend {
    next_id: AtomicU64,
    calls: Mutex<Vec<&'static str>>,
    failing: Mutex<HashSet<&'static str>>,
    configurations: Mutex<Vec<GuestConfiguration>>,
    displays: Mutex<Vec<DisplaySize>>,
    install_gate: Mutex<Option<Arc<Notify>>>,
    supports_model: AtomicBool,
    stops: broadcast::Sender<StopEvent>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (stops, _) = broadcast::channel(16);
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            configurations: Mutex::new(Vec::new()),
            displays: Mutex::new(Vec::new()),
            install_gate: Mutex::new(None),
            supports_model: AtomicBool::new(true),
            stops,
        })
    }

    /// Make every later call to `operation` fail.
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == operation)
            .count()
    }

    /// Every configuration passed to `instantiate`, in order.
    pub fn configurations(&self) -> Vec<GuestConfiguration> {
        self.configurations.lock().unwrap().clone()
    }

    pub fn displays(&self) -> Vec<DisplaySize> {
        self.displays.lock().unwrap().clone()
    }

    /// Hold every later `install` call until the returned notify fires.
    pub fn gate_install(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.install_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn set_supports_hardware_model(&self, supported: bool) {
        self.supports_model.store(supported, Ordering::SeqCst);
    }

    /// Report that `handle` stopped on its own.
    pub fn emit_stop(&self, handle: &GuestHandle, error: Option<&str>) {
        let _ = self
            .stops
            .send(StopEvent::new(handle.clone(), error.map(str::to_string)));
    }

    fn record(&self, operation: &'static str) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(operation);
        if self.failing.lock().unwrap().contains(operation) {
            return Err(BackendError::operation(operation, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl GuestBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }

    fn supports_hardware_model(&self, _model: &HardwareModel) -> bool {
        self.supports_model.load(Ordering::SeqCst)
    }

    fn create_auxiliary_storage(
        &self,
        path: &Path,
        model: &HardwareModel,
    ) -> Result<(), BackendError> {
        self.record("create_auxiliary_storage")?;
        std::fs::write(path, model.as_bytes())?;
        Ok(())
    }

    fn create_efi_variable_store(&self, path: &Path) -> Result<(), BackendError> {
        self.record("create_efi_variable_store")?;
        std::fs::write(path, b"efi")?;
        Ok(())
    }

    fn validate(&self, config: &GuestConfiguration) -> Result<(), BackendError> {
        self.record("validate")?;
        if config.storage.is_empty() {
            return Err(BackendError::InvalidConfiguration("no storage".into()));
        }
        Ok(())
    }

    async fn instantiate(&self, config: &GuestConfiguration) -> Result<GuestHandle, BackendError> {
        self.record("instantiate")?;
        self.configurations.lock().unwrap().push(config.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(GuestHandle::new(id, config.kind))
    }

    async fn start(&self, _handle: &GuestHandle) -> Result<(), BackendError> {
        self.record("start")
    }

    async fn pause(&self, _handle: &GuestHandle) -> Result<(), BackendError> {
        self.record("pause")
    }

    async fn resume(&self, _handle: &GuestHandle) -> Result<(), BackendError> {
        self.record("resume")
    }

    async fn save_state(&self, _handle: &GuestHandle, path: &Path) -> Result<(), BackendError> {
        self.record("save_state")?;
        tokio::fs::write(path, b"saved").await?;
        Ok(())
    }

    async fn restore_state(&self, _handle: &GuestHandle, path: &Path) -> Result<(), BackendError> {
        self.record("restore_state")?;
        let contents = tokio::fs::read(path).await?;
        if contents == CORRUPT_STATE {
            return Err(BackendError::operation(
                "restore_state",
                "saved state does not match configuration",
            ));
        }
        Ok(())
    }

    async fn install(
        &self,
        _handle: &GuestHandle,
        media: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), BackendError> {
        self.record("install")?;
        let gate = self.install_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if !media.exists() {
            return Err(BackendError::operation("install", "install media missing"));
        }
        for fraction in [0.25, 0.5, 0.4, 0.75] {
            on_progress(fraction);
        }
        Ok(())
    }

    async fn reconfigure_display(
        &self,
        _handle: &GuestHandle,
        size: DisplaySize,
    ) -> Result<(), BackendError> {
        self.record("reconfigure_display")?;
        self.displays.lock().unwrap().push(size);
        Ok(())
    }

    fn stop_events(&self) -> broadcast::Receiver<StopEvent> {
        self.stops.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Image source
// ---------------------------------------------------------------------------

pub struct FakeImageSource {
    lookups: AtomicU32,
    downloads: AtomicU32,
}

impl FakeImageSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lookups: AtomicU32::new(0),
            downloads: AtomicU32::new(0),
        })
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }
}

pub fn requirements() -> ConfigurationRequirements {
    ConfigurationRequirements {
        hardware_model: HardwareModel::from_bytes(vec![0xa1, 0xb2, 0xc3, 0xd4]).unwrap(),
        minimum_cpu_count: 2,
        minimum_memory_bytes: 4 * 1024 * 1024 * 1024,
    }
}

#[async_trait]
impl ImageSource for FakeImageSource {
    async fn fetch_latest_supported(&self) -> Result<RestoreImage, AcquireError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(RestoreImage {
            url: Url::parse("https://images.test/macos/25A100.ipsw").unwrap(),
            build: "25A100".into(),
            requirements: requirements(),
        })
    }

    async fn download(
        &self,
        _url: &Url,
        dest: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), AcquireError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        for fraction in [0.0, 0.5, 0.3, 1.0] {
            on_progress(fraction);
        }
        tokio::fs::write(dest, b"ipsw")
            .await
            .map_err(|source| AcquireError::Io {
                path: dest.to_path_buf(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// One temporary host: a VM root, a download cache and an operator ISO,
/// shared by every controller the test builds.
pub struct Harness {
    pub root: TempDir,
    pub backend: Arc<FakeBackend>,
    pub source: Arc<FakeImageSource>,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("debian.iso"), b"iso").unwrap();
        Self {
            root,
            backend: FakeBackend::new(),
            source: FakeImageSource::new(),
        }
    }

    pub fn vms(&self) -> PathBuf {
        self.root.path().join("vms")
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.path().join("downloads")
    }

    pub fn iso(&self) -> PathBuf {
        self.root.path().join("debian.iso")
    }

    /// A controller as the host would build it after a restart.
    pub fn controller(&self, kind: GuestKind) -> LifecycleController {
        self.controller_with_iso(kind, Some(self.iso()))
    }

    pub fn controller_with_iso(&self, kind: GuestKind, iso: Option<PathBuf>) -> LifecycleController {
        let backend: Arc<dyn GuestBackend> = self.backend.clone();
        let acquirer = ImageAcquirer::new(self.source.clone(), self.downloads(), iso);
        let devices = DeviceOptions {
            host_cpu_count: Some(8),
            ..DeviceOptions::default()
        };
        LifecycleController::new(
            GuestProfile::new(kind, DEFAULT_DISPLAY),
            &self.vms(),
            backend,
            acquirer,
            devices,
        )
    }
}
