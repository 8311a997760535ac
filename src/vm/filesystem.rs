//! Guest bundle storage on the host filesystem.
//!
//! ## Layout bootstrap
//!
//! ```text
//! <vms>/VM_<kind>.bundle/        created once, must not already exist
//!     Disk.img                    sparse, 128 GiB (macOS) / 64 GiB (Linux)
//!     RestoreImage.ipsw | Installer.iso
//! ```
//!
//! A bundle directory that already exists when bootstrap starts means an
//! earlier provisioning attempt stopped part way through. That is reported as
//! [`LifecycleError::PriorPartialState`] and left for the operator; nothing
//! here deletes a bundle.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info};

use super::GuestKind;
use super::error::{LifecycleError, Result};
use super::profile::GuestLayout;

// ---------------------------------------------------------------------------
// Bundle bootstrap
// ---------------------------------------------------------------------------

/// Create the bundle directory and the sparse disk image for a fresh guest.
pub fn bootstrap_storage(layout: &GuestLayout) -> Result<()> {
    let kind = layout.kind();
    let bundle = layout.bundle_dir();

    if let Some(parent) = bundle.parent() {
        std::fs::create_dir_all(parent).map_err(|source| storage_error(kind, parent, source))?;
    }

    match std::fs::create_dir(bundle) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(LifecycleError::PriorPartialState {
                kind,
                path: bundle.to_path_buf(),
            });
        }
        Err(source) => return Err(storage_error(kind, bundle, source)),
    }

    let disk = layout.disk_image();
    create_sparse_disk(&disk, kind.disk_capacity_bytes())
        .map_err(|source| storage_error(kind, &disk, source))?;

    info!(
        target: "storage",
        kind = %kind,
        bundle = %bundle.display(),
        capacity_gib = kind.disk_capacity_bytes() >> 30,
        "guest storage bootstrapped"
    );
    Ok(())
}

/// Allocate a sparse raw disk image of `capacity` bytes.
///
/// The file only consumes real blocks once the guest writes them. Fails if
/// `path` already exists.
pub fn create_sparse_disk(path: &Path, capacity: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(capacity)?;
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Install media staging
// ---------------------------------------------------------------------------

/// Move a downloaded payload into the bundle.
///
/// Falls back to copy-then-remove when the download cache and the bundle live
/// on different volumes.
pub fn move_into_bundle(kind: GuestKind, from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            debug!(target: "storage", from = %from.display(), "rename crossed volumes, copying");
            std::fs::copy(from, to).map_err(|source| storage_error(kind, to, source))?;
            std::fs::remove_file(from).map_err(|source| storage_error(kind, from, source))?;
        }
        Err(source) => return Err(storage_error(kind, from, source)),
    }
    debug!(target: "storage", kind = %kind, path = %to.display(), "install image staged");
    Ok(())
}

/// Stage an operator-owned installer without disturbing the original.
///
/// Hard-links when possible and copies otherwise.
pub fn link_into_bundle(kind: GuestKind, from: &Path, to: &Path) -> Result<()> {
    if let Err(err) = std::fs::hard_link(from, to) {
        debug!(
            target: "storage",
            from = %from.display(),
            error = %err,
            "hard link failed, copying install image"
        );
        std::fs::copy(from, to).map_err(|source| storage_error(kind, to, source))?;
    }
    debug!(target: "storage", kind = %kind, path = %to.display(), "install image staged");
    Ok(())
}

// ---------------------------------------------------------------------------
// Host-side helpers
// ---------------------------------------------------------------------------

/// Ensure the host side of the guest file share exists.
pub fn ensure_shared_directory(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn storage_error(kind: GuestKind, path: &Path, source: std::io::Error) -> LifecycleError {
    LifecycleError::Storage {
        kind,
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_bundle_and_sparse_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = GuestLayout::new(&tmp.path().join("vms"), GuestKind::Linux);

        bootstrap_storage(&layout).unwrap();

        assert!(layout.bundle_dir().is_dir());
        let meta = std::fs::metadata(layout.disk_image()).unwrap();
        assert_eq!(meta.len(), 64 * 1024 * 1024 * 1024);
    }

    #[test]
    fn bootstrap_refuses_existing_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = GuestLayout::new(tmp.path(), GuestKind::MacOs);
        std::fs::create_dir_all(layout.bundle_dir()).unwrap();

        let err = bootstrap_storage(&layout).unwrap_err();
        match err {
            LifecycleError::PriorPartialState { path, .. } => {
                assert_eq!(path, layout.bundle_dir())
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!layout.has_disk_image());
    }

    #[test]
    fn sparse_disk_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("Disk.img");
        create_sparse_disk(&disk, 4096).unwrap();

        let err = create_sparse_disk(&disk, 8192).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(std::fs::metadata(&disk).unwrap().len(), 4096);
    }

    #[test]
    fn move_into_bundle_relocates_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let from = tmp.path().join("24A335.ipsw");
        let to = tmp.path().join("RestoreImage.ipsw");
        std::fs::write(&from, b"payload").unwrap();

        move_into_bundle(GuestKind::MacOs, &from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn link_into_bundle_keeps_original() {
        let tmp = tempfile::tempdir().unwrap();
        let from = tmp.path().join("debian.iso");
        let to = tmp.path().join("Installer.iso");
        std::fs::write(&from, b"iso").unwrap();

        link_into_bundle(GuestKind::Linux, &from, &to).unwrap();

        assert!(from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"iso");
    }

    #[test]
    fn remove_if_exists_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("SaveFile.vzvmsave");
        assert!(!remove_if_exists(&path).unwrap());

        std::fs::write(&path, b"state").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
