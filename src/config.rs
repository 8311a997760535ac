//! User settings for inertia-guests.
//!
//! Loaded from `~/.config/inertia-guests/guests.toml`. Every section is
//! `#[serde(default)]`, so a missing file, a missing section or a missing key
//! all fall back to the defaults below.
//!
//! ```toml
//! [linux]
//! iso = "/Users/me/Downloads/debian-13-arm64.iso"
//!
//! [download]
//! max_attempts = 5
//!
//! [shared_directory]
//! enabled = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::paths::AppPaths;
use crate::vm::acquisition::RetryPolicy;
use crate::vm::configuration::{
    DEFAULT_GUEST_MEMORY_BYTES, DEFAULT_MAC_ADDRESS, DeviceOptions, SharedDirectory,
};
use crate::vm::vfkit::DEFAULT_REST_PORT;
use crate::vm::{DisplaySize, GuestKind};

/// Virtio-fs tag the guest mounts the shared folder by.
pub const SHARED_DIRECTORY_TAG: &str = "inertia_storage";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub macos: MacOsSettings,
    pub linux: LinuxSettings,
    pub image_source: ImageSourceSettings,
    pub download: RetryPolicy,
    pub guest: GuestSettings,
    pub shared_directory: SharedDirectorySettings,
    pub vfkit: VfkitSettings,
}

// --- Sub-structs ---

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MacOsSettings {
    pub display: DisplaySize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinuxSettings {
    pub display: DisplaySize,
    /// Installer ISO for fresh Linux guests.
    pub iso: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageSourceSettings {
    /// JSON document describing the latest supported macOS restore image.
    pub catalog_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuestSettings {
    pub memory_bytes: u64,
    pub mac_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SharedDirectorySettings {
    pub enabled: bool,
    /// Host directory; `~/InertiaStorage` when unset.
    pub path: Option<PathBuf>,
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VfkitSettings {
    /// Explicit vfkit binary; searched on `$PATH` and Homebrew when unset.
    pub binary: Option<PathBuf>,
    pub rest_port: u16,
}

// ---------------------------------------------------------------------------
// Default impls
// ---------------------------------------------------------------------------

impl Default for MacOsSettings {
    fn default() -> Self {
        Self {
            display: DisplaySize::new(1350, 990),
        }
    }
}

impl Default for LinuxSettings {
    fn default() -> Self {
        Self {
            display: DisplaySize::new(1280, 800),
            iso: None,
        }
    }
}

impl Default for ImageSourceSettings {
    fn default() -> Self {
        Self {
            catalog_url: "https://images.inertia.dev/macos/latest.json".to_string(),
        }
    }
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_GUEST_MEMORY_BYTES,
            mac_address: DEFAULT_MAC_ADDRESS.to_string(),
        }
    }
}

impl Default for SharedDirectorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            read_only: false,
        }
    }
}

impl Default for VfkitSettings {
    fn default() -> Self {
        Self {
            binary: None,
            rest_port: DEFAULT_REST_PORT,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and derived values
// ---------------------------------------------------------------------------

impl Settings {
    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("parse settings file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("read settings file {}", path.display()))
            }
        }
    }

    pub fn display_for(&self, kind: GuestKind) -> DisplaySize {
        match kind {
            GuestKind::MacOs => self.macos.display,
            GuestKind::Linux => self.linux.display,
        }
    }

    pub fn catalog_url(&self) -> Result<Url> {
        Url::parse(&self.image_source.catalog_url)
            .with_context(|| format!("invalid catalog URL {:?}", self.image_source.catalog_url))
    }

    /// Device knobs for the configuration builder.
    pub fn device_options(&self, paths: &AppPaths) -> DeviceOptions {
        let shared_directory = self.shared_directory.enabled.then(|| SharedDirectory {
            host_path: self
                .shared_directory
                .path
                .clone()
                .unwrap_or_else(|| paths.shared.clone()),
            tag: SHARED_DIRECTORY_TAG.to_string(),
            read_only: self.shared_directory.read_only,
        });

        DeviceOptions {
            memory_bytes: self.guest.memory_bytes,
            mac_address: self.guest.mac_address.clone(),
            shared_directory,
            host_cpu_count: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path) -> AppPaths {
        AppPaths {
            config: root.join("config"),
            vms: root.join("data/vms"),
            downloads: root.join("cache/downloads"),
            logs: root.join("logs"),
            shared: root.join("InertiaStorage"),
        }
    }

    #[test]
    fn defaults_match_guest_constants() {
        let s = Settings::default();
        assert_eq!(s.guest.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(s.guest.mac_address, "d6:a7:58:8e:78:d4");
        assert_eq!(s.download, RetryPolicy::default());
        assert!(s.linux.iso.is_none());
        assert!(s.catalog_url().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let s = Settings::from_toml(
            r#"
[linux]
iso = "/isos/debian.iso"

[download]
max_attempts = 5
"#,
        )
        .expect("partial parse failed");

        assert_eq!(s.linux.iso.as_deref(), Some(Path::new("/isos/debian.iso")));
        assert_eq!(s.linux.display, DisplaySize::new(1280, 800));
        assert_eq!(s.download.max_attempts, 5);
        assert_eq!(s.download.initial_backoff_ms, 500);
        assert_eq!(s.vfkit.rest_port, DEFAULT_REST_PORT);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Settings::from_toml("[guest]\nmemory_bytes = \"lots\"").is_err());
    }

    #[test]
    fn toml_roundtrip_keeps_display_sizes() {
        let mut original = Settings::default();
        original.macos.display = DisplaySize::new(1440, 900);
        let parsed = Settings::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(parsed.display_for(GuestKind::MacOs), DisplaySize::new(1440, 900));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let s = Settings::load(&tmp.path().join("guests.toml")).unwrap();
        assert_eq!(s.display_for(GuestKind::Linux), DisplaySize::new(1280, 800));
    }

    #[test]
    fn shared_directory_defaults_to_inertia_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let options = Settings::default().device_options(&paths(tmp.path()));
        let share = options.shared_directory.expect("share enabled by default");
        assert_eq!(share.host_path, tmp.path().join("InertiaStorage"));
        assert_eq!(share.tag, "inertia_storage");
    }

    #[test]
    fn shared_directory_can_be_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let s = Settings::from_toml("[shared_directory]\nenabled = false").unwrap();
        assert!(s.device_options(&paths(tmp.path())).shared_directory.is_none());
    }
}
