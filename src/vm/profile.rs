//! Guest profiles and their deterministic on-disk layout.
//!
//! Every path below is a pure function of the layout root and the guest kind,
//! so two controllers for the same kind would write the same files. The host
//! keeps exactly one controller per kind alive.

use std::path::{Path, PathBuf};

use super::{DisplaySize, GuestKind};

/// Immutable description of one guest slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestProfile {
    pub kind: GuestKind,
    pub display: DisplaySize,
}

impl GuestProfile {
    pub fn new(kind: GuestKind, display: DisplaySize) -> Self {
        Self { kind, display }
    }

    /// Resolve the storage layout for this profile under `root`.
    pub fn layout(&self, root: &Path) -> GuestLayout {
        GuestLayout::new(root, self.kind)
    }
}

/// Resolved paths of every artifact a guest keeps on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLayout {
    kind: GuestKind,
    bundle: PathBuf,
}

impl GuestLayout {
    pub fn new(root: &Path, kind: GuestKind) -> Self {
        Self {
            kind,
            bundle: root.join(format!("VM_{}.bundle", kind.as_str())),
        }
    }

    pub fn kind(&self) -> GuestKind {
        self.kind
    }

    /// Bundle directory holding every other artifact.
    pub fn bundle_dir(&self) -> &Path {
        &self.bundle
    }

    pub fn disk_image(&self) -> PathBuf {
        self.bundle.join("Disk.img")
    }

    /// macOS only: platform storage bound to the hardware model.
    pub fn auxiliary_storage(&self) -> PathBuf {
        self.bundle.join("AuxiliaryStorage")
    }

    /// macOS only.
    pub fn hardware_model(&self) -> PathBuf {
        self.bundle.join("HardwareModel")
    }

    pub fn machine_identifier(&self) -> PathBuf {
        self.bundle.join("MachineIdentifier")
    }

    /// Linux only.
    pub fn efi_variable_store(&self) -> PathBuf {
        self.bundle.join("EFIVariableStore")
    }

    pub fn saved_state(&self) -> PathBuf {
        self.bundle.join("SaveFile.vzvmsave")
    }

    /// Installer medium staged inside the bundle: the downloaded restore
    /// image for macOS, a link to (or copy of) the operator's ISO for Linux.
    pub fn staged_install_image(&self) -> PathBuf {
        match self.kind {
            GuestKind::MacOs => self.bundle.join("RestoreImage.ipsw"),
            GuestKind::Linux => self.bundle.join("Installer.iso"),
        }
    }

    pub fn has_disk_image(&self) -> bool {
        self.disk_image().exists()
    }

    pub fn has_saved_state(&self) -> bool {
        self.saved_state().exists()
    }

    /// Every artifact that belongs to this guest kind, with a short label.
    pub fn artifacts(&self) -> Vec<(&'static str, PathBuf)> {
        let mut artifacts = vec![
            ("bundle", self.bundle.clone()),
            ("disk image", self.disk_image()),
        ];
        if self.kind == GuestKind::MacOs {
            artifacts.push(("auxiliary storage", self.auxiliary_storage()));
            artifacts.push(("hardware model", self.hardware_model()));
        }
        artifacts.push(("machine identifier", self.machine_identifier()));
        if self.kind == GuestKind::Linux {
            artifacts.push(("EFI variable store", self.efi_variable_store()));
        }
        artifacts.push(("saved state", self.saved_state()));
        artifacts.push(("install image", self.staged_install_image()));
        artifacts
    }
}
