//! Host directories used by inertia-guests.
//!
//! | What      | macOS                                            | elsewhere (XDG)                     |
//! |-----------|--------------------------------------------------|-------------------------------------|
//! | settings  | `~/.config/inertia-guests/guests.toml`           | `$XDG_CONFIG_HOME/inertia-guests/`  |
//! | guests    | `~/Library/Application Support/<id>/vms/`        | `$XDG_DATA_HOME/inertia-guests/vms` |
//! | downloads | `~/Library/Caches/<id>/downloads/`               | `$XDG_CACHE_HOME/inertia-guests/…`  |
//! | logs      | `~/Library/Logs/inertia-guests/`                 | `$XDG_STATE_HOME/inertia-guests/…`  |
//!
//! The guest share defaults to `~/InertiaStorage` on every platform.

use std::path::{Path, PathBuf};
use tracing::debug;

const BUNDLE_ID: &str = "dev.inertia.guests";
pub const APP_NAME: &str = "inertia-guests";

const SHARED_DIR_NAME: &str = "InertiaStorage";

/// Resolved host directories.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config: PathBuf,
    /// One `VM_<kind>.bundle` per guest.
    pub vms: PathBuf,
    /// Restore image downloads, including `.part` files.
    pub downloads: PathBuf,
    pub logs: PathBuf,
    /// Default host side of the guest file share; never created here.
    pub shared: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum Base {
    Config,
    Data,
    Cache,
    State,
}

impl Base {
    fn xdg_var(self) -> &'static str {
        match self {
            Base::Config => "XDG_CONFIG_HOME",
            Base::Data => "XDG_DATA_HOME",
            Base::Cache => "XDG_CACHE_HOME",
            Base::State => "XDG_STATE_HOME",
        }
    }

    fn xdg_default(self, home: &Path) -> PathBuf {
        match self {
            Base::Config => home.join(".config"),
            Base::Data => home.join(".local/share"),
            Base::Cache => home.join(".cache"),
            Base::State => home.join(".local/state"),
        }
    }

    /// Application directory under this base.
    fn app_dir(self, home: &Path) -> PathBuf {
        if cfg!(target_os = "macos") {
            match self {
                // Settings stay human-editable under ~/.config on macOS too.
                Base::Config => return home.join(".config").join(APP_NAME),
                Base::Data => return home.join("Library/Application Support").join(BUNDLE_ID),
                Base::Cache => return home.join("Library/Caches").join(BUNDLE_ID),
                Base::State => return home.join("Library/Logs").join(APP_NAME),
            }
        }
        std::env::var_os(self.xdg_var())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.xdg_default(home))
            .join(APP_NAME)
    }
}

impl AppPaths {
    /// Resolve every directory from `$HOME`. Nothing is created; call
    /// `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        Some(Self::under_home(&home))
    }

    fn under_home(home: &Path) -> Self {
        let logs = if cfg!(target_os = "macos") {
            Base::State.app_dir(home)
        } else {
            Base::State.app_dir(home).join("logs")
        };
        Self {
            config: Base::Config.app_dir(home),
            vms: Base::Data.app_dir(home).join("vms"),
            downloads: Base::Cache.app_dir(home).join("downloads"),
            logs,
            shared: home.join(SHARED_DIR_NAME),
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config.join("guests.toml")
    }

    /// Create the directories the manager writes to.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.vms, &self.downloads, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(target: "paths", path = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}
