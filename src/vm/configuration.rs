//! Hardware/device configuration assembly.
//!
//! [`ConfigurationBuilder`] has two entry points:
//!
//! ```text
//! build_fresh(acquired)  ─► mint identity ─► persist ─┐
//!                                                     ├─► assemble devices ─► validate
//! build_restore()        ─► load identity ───────────┘
//! ```
//!
//! Identity handling is the only difference between the two; the device list
//! comes from the same `assemble` call, so a restored guest sees exactly the
//! hardware it was installed on (minus the installer medium).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::acquisition::{AcquiredImage, ConfigurationRequirements};
use super::backend::{GuestBackend, ResourceLimits};
use super::error::{LifecycleError, Result};
use super::identity::{GuestIdentity, HardwareModel, MachineIdentifier};
use super::profile::{GuestLayout, GuestProfile};
use super::{DisplaySize, GuestKind};

/// Pixel density of the macOS guest display.
pub const MAC_DISPLAY_PIXELS_PER_INCH: u32 = 284;

/// Locally administered MAC address given to every guest NIC by default.
pub const DEFAULT_MAC_ADDRESS: &str = "d6:a7:58:8e:78:d4";

/// Guest memory before clamping to backend limits.
pub const DEFAULT_GUEST_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Console port name the SPICE guest agent listens on.
pub const SPICE_AGENT_PORT_NAME: &str = "com.redhat.spice.0";

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Mac {
        hardware_model: HardwareModel,
        machine_identifier: MachineIdentifier,
        auxiliary_storage: PathBuf,
    },
    Generic {
        machine_identifier: MachineIdentifier,
    },
}

impl Platform {
    pub fn machine_identifier(&self) -> MachineIdentifier {
        match self {
            Platform::Mac {
                machine_identifier, ..
            }
            | Platform::Generic { machine_identifier } => *machine_identifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    /// macOS platform boot loader.
    MacOs,
    Efi { variable_store: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsDevice {
    Mac {
        size: DisplaySize,
        pixels_per_inch: u32,
    },
    /// Single Virtio GPU scanout.
    Virtio { size: DisplaySize },
}

impl GraphicsDevice {
    pub fn size(&self) -> DisplaySize {
        match self {
            GraphicsDevice::Mac { size, .. } | GraphicsDevice::Virtio { size } => *size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBus {
    VirtioBlock,
    UsbMassStorage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub path: PathBuf,
    pub read_only: bool,
    pub bus: StorageBus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub mac_address: String,
    /// NAT is the only attachment guests get.
    pub nat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingDevice {
    MacTrackpad,
    UsbScreenCoordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyboard {
    Mac,
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStream {
    /// Host microphone into the guest.
    HostInput,
    /// Guest audio out to the host speakers.
    HostOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolePort {
    pub name: String,
    pub spice_agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDirectory {
    pub host_path: PathBuf,
    pub tag: String,
    pub read_only: bool,
}

/// Fully assembled device/hardware description handed to the backend.
///
/// Rebuilt on every boot and never persisted; only the identity inside
/// `platform` is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfiguration {
    pub kind: GuestKind,
    pub platform: Platform,
    pub boot_loader: BootLoader,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub graphics: GraphicsDevice,
    pub storage: Vec<StorageDevice>,
    pub network: Vec<NetworkDevice>,
    /// Number of Virtio socket devices.
    pub socket_devices: u32,
    pub pointing: PointingDevice,
    pub keyboard: Keyboard,
    pub audio: Vec<AudioStream>,
    pub consoles: Vec<ConsolePort>,
    pub shared_directories: Vec<SharedDirectory>,
}

impl GuestConfiguration {
    /// Read-only installer medium attached to this configuration, if any.
    pub fn install_media(&self) -> Option<&Path> {
        self.storage
            .iter()
            .find(|device| device.read_only && device.bus == StorageBus::UsbMassStorage)
            .map(|device| device.path.as_path())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Host-side knobs that shape every configuration.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub memory_bytes: u64,
    pub mac_address: String,
    pub shared_directory: Option<SharedDirectory>,
    /// Host logical CPU count; resolved from the OS when `None`.
    pub host_cpu_count: Option<usize>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_GUEST_MEMORY_BYTES,
            mac_address: DEFAULT_MAC_ADDRESS.to_string(),
            shared_directory: None,
            host_cpu_count: None,
        }
    }
}

pub struct ConfigurationBuilder {
    backend: Arc<dyn GuestBackend>,
    profile: GuestProfile,
    layout: GuestLayout,
    options: DeviceOptions,
}

impl ConfigurationBuilder {
    pub fn new(
        backend: Arc<dyn GuestBackend>,
        profile: GuestProfile,
        layout: GuestLayout,
        options: DeviceOptions,
    ) -> Self {
        Self {
            backend,
            profile,
            layout,
            options,
        }
    }

    /// Mint and persist a new identity, then assemble a validated
    /// configuration for installing the guest.
    pub fn build_fresh(
        &self,
        acquired: &AcquiredImage,
    ) -> Result<(GuestConfiguration, GuestIdentity)> {
        let kind = self.profile.kind;
        let requirements = acquired.requirements.as_ref();

        let identity = GuestIdentity::mint(kind, requirements)?;
        identity.persist(&self.layout)?;

        let (platform, boot_loader, install_media) = match kind {
            GuestKind::MacOs => {
                let hardware_model = identity
                    .hardware_model
                    .clone()
                    .ok_or(LifecycleError::MissingRequirements { kind })?;
                let auxiliary_storage = self.layout.auxiliary_storage();
                self.backend
                    .create_auxiliary_storage(&auxiliary_storage, &hardware_model)
                    .map_err(|source| LifecycleError::InvalidConfiguration { kind, source })?;

                let platform = Platform::Mac {
                    hardware_model,
                    machine_identifier: identity.machine_identifier,
                    auxiliary_storage,
                };
                (platform, BootLoader::MacOs, None)
            }
            GuestKind::Linux => {
                let variable_store = self.layout.efi_variable_store();
                self.backend
                    .create_efi_variable_store(&variable_store)
                    .map_err(|source| LifecycleError::InvalidConfiguration { kind, source })?;

                let platform = Platform::Generic {
                    machine_identifier: identity.machine_identifier,
                };
                (
                    platform,
                    BootLoader::Efi { variable_store },
                    Some(acquired.media.as_path()),
                )
            }
        };

        let config = self.assemble(platform, boot_loader, install_media, requirements);
        self.validated(config).map(|config| (config, identity))
    }

    /// Load the persisted identity and assemble a configuration for booting
    /// an already installed guest.
    pub fn build_restore(&self) -> Result<GuestConfiguration> {
        let kind = self.profile.kind;
        let identity = GuestIdentity::load(&self.layout)?;

        let (platform, boot_loader) = match kind {
            GuestKind::MacOs => {
                let hardware_model = identity.hardware_model.clone().ok_or_else(|| {
                    LifecycleError::IdentityMissing {
                        kind,
                        path: self.layout.hardware_model(),
                    }
                })?;
                if !self.backend.supports_hardware_model(&hardware_model) {
                    return Err(LifecycleError::UnsupportedHardwareModel {
                        kind,
                        path: self.layout.hardware_model(),
                    });
                }

                let auxiliary_storage = self.layout.auxiliary_storage();
                if !auxiliary_storage.exists() {
                    return Err(LifecycleError::Storage {
                        kind,
                        path: auxiliary_storage,
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "auxiliary storage missing",
                        ),
                    });
                }

                let platform = Platform::Mac {
                    hardware_model,
                    machine_identifier: identity.machine_identifier,
                    auxiliary_storage,
                };
                (platform, BootLoader::MacOs)
            }
            GuestKind::Linux => {
                let variable_store = self.layout.efi_variable_store();
                if !variable_store.exists() {
                    warn!(
                        target: "configuration",
                        kind = %kind,
                        path = %variable_store.display(),
                        "EFI variable store missing, creating a new one"
                    );
                    self.backend
                        .create_efi_variable_store(&variable_store)
                        .map_err(|source| LifecycleError::InvalidConfiguration { kind, source })?;
                }

                let platform = Platform::Generic {
                    machine_identifier: identity.machine_identifier,
                };
                (platform, BootLoader::Efi { variable_store })
            }
        };

        let config = self.assemble(platform, boot_loader, None, None);
        self.validated(config)
    }

    fn assemble(
        &self,
        platform: Platform,
        boot_loader: BootLoader,
        install_media: Option<&Path>,
        requirements: Option<&ConfigurationRequirements>,
    ) -> GuestConfiguration {
        let kind = self.profile.kind;
        let limits = self.backend.limits();
        let host_cpus = self.options.host_cpu_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let cpu_count = compute_cpu_count(
            host_cpus,
            &limits,
            requirements.map(|r| r.minimum_cpu_count),
        );
        let memory_bytes = compute_memory_size(
            self.options.memory_bytes,
            &limits,
            requirements.map(|r| r.minimum_memory_bytes),
        );

        let mut storage = vec![StorageDevice {
            path: self.layout.disk_image(),
            read_only: false,
            bus: StorageBus::VirtioBlock,
        }];
        if let Some(media) = install_media {
            storage.push(StorageDevice {
                path: media.to_path_buf(),
                read_only: true,
                bus: StorageBus::UsbMassStorage,
            });
        }

        let network = vec![NetworkDevice {
            mac_address: self.options.mac_address.clone(),
            nat: true,
        }];

        let shared_directories = self.options.shared_directory.iter().cloned().collect();

        let config = match kind {
            GuestKind::MacOs => GuestConfiguration {
                kind,
                platform,
                boot_loader,
                cpu_count,
                memory_bytes,
                graphics: GraphicsDevice::Mac {
                    size: self.profile.display,
                    pixels_per_inch: MAC_DISPLAY_PIXELS_PER_INCH,
                },
                storage,
                network,
                socket_devices: 1,
                pointing: PointingDevice::MacTrackpad,
                keyboard: Keyboard::Mac,
                audio: Vec::new(),
                consoles: Vec::new(),
                shared_directories,
            },
            GuestKind::Linux => GuestConfiguration {
                kind,
                platform,
                boot_loader,
                cpu_count,
                memory_bytes,
                graphics: GraphicsDevice::Virtio {
                    size: self.profile.display,
                },
                storage,
                network,
                socket_devices: 1,
                pointing: PointingDevice::UsbScreenCoordinate,
                keyboard: Keyboard::Usb,
                audio: vec![AudioStream::HostInput, AudioStream::HostOutput],
                consoles: vec![ConsolePort {
                    name: SPICE_AGENT_PORT_NAME.to_string(),
                    spice_agent: true,
                }],
                shared_directories,
            },
        };

        debug!(
            target: "configuration",
            kind = %kind,
            cpus = config.cpu_count,
            memory_bytes = config.memory_bytes,
            display = %self.profile.display,
            storage_devices = config.storage.len(),
            "assembled guest configuration"
        );
        config
    }

    fn validated(&self, config: GuestConfiguration) -> Result<GuestConfiguration> {
        let kind = config.kind;
        self.backend
            .validate(&config)
            .map_err(|source| LifecycleError::InvalidConfiguration { kind, source })?;
        info!(
            target: "configuration",
            kind = %kind,
            backend = self.backend.name(),
            machine_identifier = %config.platform.machine_identifier(),
            "guest configuration validated"
        );
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Resource sizing
// ---------------------------------------------------------------------------

/// One core is left to the host; the result is clamped to backend limits and
/// raised to the image's minimum when one is known.
pub fn compute_cpu_count(host_cpus: usize, limits: &ResourceLimits, minimum: Option<u32>) -> u32 {
    let host_cpus = u32::try_from(host_cpus).unwrap_or(u32::MAX);
    let mut count = if host_cpus <= 1 { 1 } else { host_cpus - 1 };
    if let Some(minimum) = minimum {
        count = count.max(minimum);
    }
    count.clamp(limits.min_cpu_count, limits.max_cpu_count)
}

pub fn compute_memory_size(default: u64, limits: &ResourceLimits, minimum: Option<u64>) -> u64 {
    let mut size = default;
    if let Some(minimum) = minimum {
        size = size.max(minimum);
    }
    size.clamp(limits.min_memory_bytes, limits.max_memory_bytes)
}
