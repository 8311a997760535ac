//! Install image acquisition.
//!
//! macOS guests install from a restore image looked up in a catalog and
//! downloaded over HTTP; Linux guests install from an ISO the operator already
//! has on disk. Acquisition is split in two steps so the controller can report
//! the state change between them:
//!
//! 1. [`ImageAcquirer::fetch`]: catalog lookup plus download (macOS), or
//!    checking the configured ISO exists (Linux).
//! 2. [`ImageAcquirer::stage`]: bundle bootstrap, then the payload is placed
//!    at the layout's staged install image path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::GuestKind;
use super::error::{AcquireError, LifecycleError};
use super::filesystem;
use super::identity::HardwareModel;
use super::profile::GuestLayout;

/// Platform requirements published alongside a macOS restore image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRequirements {
    pub hardware_model: HardwareModel,
    pub minimum_cpu_count: u32,
    pub minimum_memory_bytes: u64,
}

/// Latest supported macOS restore image.
#[derive(Debug, Clone)]
pub struct RestoreImage {
    pub url: Url,
    pub build: String,
    pub requirements: ConfigurationRequirements,
}

/// Installer payload found or downloaded, not yet staged into a bundle.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub payload: PathBuf,
    pub requirements: Option<ConfigurationRequirements>,
    /// The payload is ours to move (downloaded into the cache) rather than an
    /// operator-owned file.
    pub owned: bool,
}

/// Installer staged inside the guest bundle.
#[derive(Debug, Clone)]
pub struct AcquiredImage {
    pub media: PathBuf,
    /// Present for macOS images only.
    pub requirements: Option<ConfigurationRequirements>,
}

/// Where restore images come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_latest_supported(&self) -> Result<RestoreImage, AcquireError>;

    /// Download `url` to `dest`, reporting fractional progress in [0, 1].
    async fn download(
        &self,
        url: &Url,
        dest: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), AcquireError>;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff applied to transient transfer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Whether another attempt is allowed after `attempt` failed with `err`.
    pub fn should_retry(&self, attempt: u32, err: &AcquireError) -> bool {
        err.is_transient() && attempt < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// HTTP image source
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    url: Url,
    build: String,
    /// Base64 of the opaque hardware model representation.
    hardware_model: String,
    minimum_cpu_count: u32,
    minimum_memory_bytes: u64,
}

/// Restore image catalog and payload downloads over HTTP.
pub struct HttpImageSource {
    client: reqwest::Client,
    catalog_url: Url,
    retry: RetryPolicy,
}

impl HttpImageSource {
    pub fn new(catalog_url: Url, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            catalog_url,
            retry,
        }
    }

    async fn request(&self, url: &Url, resume_from: u64) -> Result<reqwest::Response, AcquireError> {
        let mut request = self.client.get(url.clone());
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        }
        request.send().await.map_err(|source| AcquireError::Transfer {
            url: url.to_string(),
            source,
        })
    }

    /// One transfer attempt, resuming from whatever `partial` already holds.
    async fn download_once(
        &self,
        url: &Url,
        partial: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), AcquireError> {
        let mut resume_from = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(AcquireError::io(partial, err)),
        };

        let mut response = self.request(url, resume_from).await?;

        if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            if content_range_total(&response) == Some(resume_from) {
                debug!(target: "acquisition", size = resume_from, "partial download already complete");
                on_progress(1.0);
                return Ok(());
            }
            warn!(
                target: "acquisition",
                path = %partial.display(),
                size = resume_from,
                "partial download does not match the remote payload, restarting"
            );
            filesystem::remove_if_exists(partial).map_err(|err| AcquireError::io(partial, err))?;
            resume_from = 0;
            response = self.request(url, resume_from).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(AcquireError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let append = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        if append {
            let start = content_range_start(&response);
            if start != Some(resume_from) {
                filesystem::remove_if_exists(partial)
                    .map_err(|err| AcquireError::io(partial, err))?;
                return Err(AcquireError::RangeMismatch {
                    url: url.to_string(),
                    expected: resume_from,
                    actual: start,
                });
            }
        }

        let mut downloaded = if append { resume_from } else { 0 };
        let total = response.content_length().map(|len| len + downloaded);

        let mut file = if append {
            debug!(target: "acquisition", offset = resume_from, "resuming download");
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await
        } else {
            tokio::fs::File::create(partial).await
        }
        .map_err(|err| AcquireError::io(partial, err))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| AcquireError::Transfer {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|err| AcquireError::io(partial, err))?;

            downloaded += chunk.len() as u64;
            if let Some(total) = total.filter(|total| *total > 0) {
                on_progress(downloaded as f64 / total as f64);
            }
        }

        file.flush()
            .await
            .map_err(|err| AcquireError::io(partial, err))?;
        Ok(())
    }
}

fn content_range(response: &reqwest::Response) -> Option<&str> {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes ")
}

/// First byte of a `Content-Range: bytes <start>-<end>/<total>` reply.
fn content_range_start(response: &reqwest::Response) -> Option<u64> {
    let (range, _) = content_range(response)?.split_once('/')?;
    range.split_once('-')?.0.trim().parse().ok()
}

/// Complete length from `Content-Range`, as sent with a 416 reply.
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    content_range(response)?.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch_latest_supported(&self) -> Result<RestoreImage, AcquireError> {
        let response = self
            .client
            .get(self.catalog_url.clone())
            .send()
            .await
            .map_err(|e| AcquireError::Lookup(format!("{}: {e}", self.catalog_url)))?;

        if !response.status().is_success() {
            return Err(AcquireError::Lookup(format!(
                "{} returned HTTP {}",
                self.catalog_url,
                response.status()
            )));
        }

        let entry: CatalogEntry = response
            .json()
            .await
            .map_err(|e| AcquireError::Lookup(format!("malformed catalog: {e}")))?;

        let model_bytes = base64::engine::general_purpose::STANDARD
            .decode(entry.hardware_model.trim())
            .map_err(|e| AcquireError::Lookup(format!("hardware model is not base64: {e}")))?;
        let hardware_model = HardwareModel::from_bytes(model_bytes)
            .ok_or_else(|| AcquireError::Lookup("empty hardware model".to_string()))?;

        Ok(RestoreImage {
            url: entry.url,
            build: entry.build,
            requirements: ConfigurationRequirements {
                hardware_model,
                minimum_cpu_count: entry.minimum_cpu_count,
                minimum_memory_bytes: entry.minimum_memory_bytes,
            },
        })
    }

    async fn download(
        &self,
        url: &Url,
        dest: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), AcquireError> {
        let partial = dest.with_extension("part");
        let mut attempt = 1;

        loop {
            match self.download_once(url, &partial, on_progress).await {
                Ok(()) => break,
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        target: "acquisition",
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient download failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|err| AcquireError::io(dest, err))
    }
}

// ---------------------------------------------------------------------------
// Acquirer
// ---------------------------------------------------------------------------

/// Obtains and stages the installer for one guest kind.
pub struct ImageAcquirer {
    source: Arc<dyn ImageSource>,
    downloads_dir: PathBuf,
    linux_iso: Option<PathBuf>,
}

impl ImageAcquirer {
    pub fn new(
        source: Arc<dyn ImageSource>,
        downloads_dir: PathBuf,
        linux_iso: Option<PathBuf>,
    ) -> Self {
        Self {
            source,
            downloads_dir,
            linux_iso,
        }
    }

    /// Locate or download the installer payload.
    pub async fn fetch(
        &self,
        kind: GuestKind,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<FetchedImage, AcquireError> {
        match kind {
            GuestKind::MacOs => {
                let image = self.source.fetch_latest_supported().await?;
                info!(
                    target: "acquisition",
                    build = %image.build,
                    url = %image.url,
                    "latest supported restore image"
                );

                tokio::fs::create_dir_all(&self.downloads_dir)
                    .await
                    .map_err(|err| AcquireError::io(&self.downloads_dir, err))?;
                let dest = self.downloads_dir.join(format!("{}.ipsw", image.build));
                self.source.download(&image.url, &dest, on_progress).await?;

                Ok(FetchedImage {
                    payload: dest,
                    requirements: Some(image.requirements),
                    owned: true,
                })
            }
            GuestKind::Linux => {
                let iso = self
                    .linux_iso
                    .clone()
                    .ok_or(AcquireError::MediaNotConfigured(kind))?;
                if !iso.is_file() {
                    return Err(AcquireError::MediaMissing(iso));
                }
                on_progress(1.0);

                Ok(FetchedImage {
                    payload: iso,
                    requirements: None,
                    owned: false,
                })
            }
        }
    }

    /// Bootstrap the bundle and place the payload at the staged image path.
    pub fn stage(
        &self,
        layout: &GuestLayout,
        fetched: FetchedImage,
    ) -> Result<AcquiredImage, LifecycleError> {
        let kind = layout.kind();
        filesystem::bootstrap_storage(layout)?;

        let media = layout.staged_install_image();
        if fetched.owned {
            filesystem::move_into_bundle(kind, &fetched.payload, &media)?;
        } else {
            filesystem::link_into_bundle(kind, &fetched.payload, &media)?;
        }

        Ok(AcquiredImage {
            media,
            requirements: fetched.requirements,
        })
    }

    /// Fetch and stage in one call.
    pub async fn acquire(
        &self,
        layout: &GuestLayout,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<AcquiredImage, LifecycleError> {
        let kind = layout.kind();
        let fetched = self
            .fetch(kind, on_progress)
            .await
            .map_err(|source| LifecycleError::Acquire { kind, source })?;
        self.stage(layout, fetched)
    }
}
