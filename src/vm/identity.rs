//! Guest platform identity: hardware model and machine identifier.
//!
//! The identity is minted exactly once, on the fresh path, and written to the
//! bundle. Every later boot must read back the same bytes: a different
//! machine identifier invalidates the saved state, and on macOS a different
//! hardware model loses the right to use the existing auxiliary storage.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;
use uuid::Uuid;

use super::GuestKind;
use super::acquisition::ConfigurationRequirements;
use super::error::{LifecycleError, Result};
use super::profile::GuestLayout;

/// Opaque macOS hardware model descriptor, taken from the restore image.
#[derive(Clone, PartialEq, Eq)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    /// Returns `None` for an empty representation.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for HardwareModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareModel({} bytes)", self.0.len())
    }
}

/// Unique machine identifier, stored on disk as its 16 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineIdentifier(Uuid);

impl MachineIdentifier {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl fmt::Display for MachineIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Persisted identity of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    /// Present for macOS guests only.
    pub hardware_model: Option<HardwareModel>,
    pub machine_identifier: MachineIdentifier,
}

impl GuestIdentity {
    /// Mint a brand new identity for a fresh guest.
    ///
    /// macOS guests take their hardware model from the restore image's
    /// configuration requirements; Linux guests only get a machine identifier.
    pub fn mint(kind: GuestKind, requirements: Option<&ConfigurationRequirements>) -> Result<Self> {
        let hardware_model = match kind {
            GuestKind::MacOs => {
                let requirements =
                    requirements.ok_or(LifecycleError::MissingRequirements { kind })?;
                Some(requirements.hardware_model.clone())
            }
            GuestKind::Linux => None,
        };

        Ok(Self {
            hardware_model,
            machine_identifier: MachineIdentifier::generate(),
        })
    }

    /// Write every identity field to its layout path.
    pub fn persist(&self, layout: &GuestLayout) -> Result<()> {
        let kind = layout.kind();

        if let Some(model) = &self.hardware_model {
            write_file(kind, &layout.hardware_model(), model.as_bytes())?;
        }
        write_file(
            kind,
            &layout.machine_identifier(),
            &self.machine_identifier.to_bytes(),
        )?;

        info!(
            target: "identity",
            kind = %kind,
            machine_identifier = %self.machine_identifier,
            "persisted guest identity"
        );
        Ok(())
    }

    /// Load a previously persisted identity.
    ///
    /// Missing or unparsable files are fatal: there is no safe default.
    pub fn load(layout: &GuestLayout) -> Result<Self> {
        let kind = layout.kind();

        let hardware_model = match kind {
            GuestKind::MacOs => {
                let path = layout.hardware_model();
                let bytes = read_file(kind, &path)?;
                let model = HardwareModel::from_bytes(bytes).ok_or_else(|| {
                    LifecycleError::IdentityCorrupt {
                        kind,
                        path: path.clone(),
                        reason: "empty hardware model".to_string(),
                    }
                })?;
                Some(model)
            }
            GuestKind::Linux => None,
        };

        let path = layout.machine_identifier();
        let bytes = read_file(kind, &path)?;
        let machine_identifier =
            MachineIdentifier::from_bytes(&bytes).ok_or_else(|| LifecycleError::IdentityCorrupt {
                kind,
                path: path.clone(),
                reason: format!("expected 16 bytes, found {}", bytes.len()),
            })?;

        Ok(Self {
            hardware_model,
            machine_identifier,
        })
    }
}

fn write_file(kind: GuestKind, path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|source| LifecycleError::Storage {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(kind: GuestKind, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => LifecycleError::IdentityMissing {
            kind,
            path: path.to_path_buf(),
        },
        _ => LifecycleError::Storage {
            kind,
            path: path.to_path_buf(),
            source,
        },
    })
}
