//! inertia-guests: provision and run a preview guest from the command line.
//!
//! `run` brings one guest up through its actor, logs provisioning progress
//! and persists the guest on Ctrl-C. `layout` prints where a guest's files
//! live and which of them exist.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use inertia_guests::config::Settings;
use inertia_guests::logging;
use inertia_guests::paths::AppPaths;
use inertia_guests::vm::acquisition::{HttpImageSource, ImageAcquirer};
use inertia_guests::vm::filesystem;
use inertia_guests::vm::vfkit::VfkitBackend;
use inertia_guests::vm::{
    DisplaySize, GuestBackend, GuestKind, GuestLayout, GuestProfile, LifecycleController,
    ProvisionProgress, spawn_guest_actor,
};

/// Preview guest lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "inertia-guests", version, about = "Preview guest lifecycle manager")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision (install or restore) a guest and keep it running until Ctrl-C
    Run {
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Installer ISO for a fresh Linux guest (overrides `linux.iso`)
        #[arg(long)]
        iso: Option<PathBuf>,

        /// Display width in pixels
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// Display height in pixels
        #[arg(long, requires = "width")]
        height: Option<u32>,
    },

    /// Print a guest's on-disk layout
    Layout {
        #[arg(short, long, value_enum)]
        kind: KindArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Macos,
    Linux,
}

impl From<KindArg> for GuestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Macos => GuestKind::MacOs,
            KindArg::Linux => GuestKind::Linux,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let Some(paths) = AppPaths::resolve() else {
        bail!("HOME is not set; cannot resolve application directories");
    };
    let _log_guard = logging::init(&paths.logs);

    paths.ensure().context("create application directories")?;
    let settings_file = paths.settings_file();
    let settings = Settings::load(&settings_file)?;
    info!(path = %settings_file.display(), "settings loaded");

    match args.command {
        Command::Run {
            kind,
            iso,
            width,
            height,
        } => {
            let display = match (width, height) {
                (Some(width), Some(height)) => Some(DisplaySize::new(width, height)),
                _ => None,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("start tokio runtime")?;
            runtime.block_on(run(paths, settings, kind.into(), iso, display))
        }
        Command::Layout { kind } => {
            print_layout(&GuestLayout::new(&paths.vms, kind.into()));
            Ok(())
        }
    }
}

async fn run(
    paths: AppPaths,
    settings: Settings,
    kind: GuestKind,
    iso: Option<PathBuf>,
    display: Option<DisplaySize>,
) -> Result<()> {
    let profile = GuestProfile::new(kind, display.unwrap_or(settings.display_for(kind)));

    let devices = settings.device_options(&paths);
    if let Some(share) = &devices.shared_directory {
        filesystem::ensure_shared_directory(&share.host_path).with_context(|| {
            format!("create shared directory {}", share.host_path.display())
        })?;
    }

    let vfkit = Arc::new(VfkitBackend::new(
        settings.vfkit.binary.clone(),
        settings.vfkit.rest_port,
    ));
    let backend: Arc<dyn GuestBackend> = vfkit.clone();

    let source = HttpImageSource::new(settings.catalog_url()?, settings.download);
    let acquirer = ImageAcquirer::new(
        Arc::new(source),
        paths.downloads.clone(),
        iso.or_else(|| settings.linux.iso.clone()),
    );

    let controller = LifecycleController::new(profile, &paths.vms, backend, acquirer, devices);
    info!(
        kind = %kind,
        display = %profile.display,
        bundle = %controller.layout().bundle_dir().display(),
        "guest controller ready"
    );
    let guest = spawn_guest_actor(controller);
    let progress_task = tokio::spawn(log_progress(kind, guest.progress()));

    let handle = match guest.provision().await {
        Ok(handle) => handle,
        Err(err) => {
            error!(kind = %kind, error = %err, fatal = err.is_fatal(), "provisioning failed");
            progress_task.abort();
            vfkit.shutdown().await;
            return Err(err).context("provision guest");
        }
    };
    progress_task.abort();
    info!(kind = %kind, handle = %handle, "guest is running, press Ctrl-C to save and quit");

    tokio::signal::ctrl_c()
        .await
        .context("wait for Ctrl-C")?;
    info!(kind = %kind, "shutting down");

    if let Err(err) = guest.terminate().await {
        warn!(kind = %kind, error = %err, "guest state was not saved");
    }
    if let Ok(state) = guest.state().await {
        info!(kind = %kind, state = ?state, "final guest state");
    }
    vfkit.shutdown().await;
    Ok(())
}

async fn log_progress(kind: GuestKind, mut progress: watch::Receiver<ProvisionProgress>) {
    let mut last_percent = None;
    while progress.changed().await.is_ok() {
        let current = *progress.borrow_and_update();
        let percent = (current.fraction * 100.0).floor() as u32;
        if last_percent == Some((current.phase, percent)) {
            continue;
        }
        last_percent = Some((current.phase, percent));
        info!(target: "progress", kind = %kind, phase = ?current.phase, percent, "provisioning");
    }
}

fn print_layout(layout: &GuestLayout) {
    println!("{} guest", layout.kind());
    for (label, path) in layout.artifacts() {
        let marker = if path.exists() { "present" } else { "missing" };
        println!("  {label:<20} {marker:<8} {}", path.display());
    }
}
