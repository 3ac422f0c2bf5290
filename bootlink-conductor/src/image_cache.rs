// Copyright 2024 The Bootlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bootlink_config::conductor::ImageCacheSpec;
use bootlink_error::{Code, Error, ResultExt, make_err, make_input_err};
use bootlink_util::background_spawn;
use bootlink_util::fs;
use bootlink_util::retry::{Retrier, RetryResult};
use futures::stream::unfold;
use rand::Rng;
use scopeguard::ScopeGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{ImageFetcher, RequestContext};
use crate::lock_broker::{LockBroker, LockMode, NamedLockGuard};

/// Serializes every mutation of master images, across all master directories.
pub const MASTER_IMAGE_LOCK: &str = "master-image";
/// Serializes creation and inspection of download markers.
pub const IMAGE_DOWNLOAD_LOCK: &str = "image-download";

const MARKER_SUFFIX: &str = ".lock";
const SCRATCH_INFIX: &str = ".tmp";
const SCRATCH_SUFFIX_LEN: usize = uuid::fmt::Simple::LENGTH;

/// A master image found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterImage {
    pub path: PathBuf,
    /// Includes the master entry itself, so `1` means unused.
    pub link_count: u64,
    pub size: u64,
}

/// Deduplicated store of immutable images shared across nodes.
///
/// Each image is downloaded once into a master directory. Consumers get a
/// hard link to the master file and the filesystem link count doubles as
/// the reference count: a master with a link count of one has no consumer
/// left and may be deleted.
///
/// A download in progress is advertised by a `<master>.lock` marker file so
/// that concurrent callers wait for the first download instead of starting
/// their own.
pub struct ImageCache {
    locks: LockBroker,
    fetcher: Arc<dyn ImageFetcher>,
    retrier: Retrier,
    poll_interval: Duration,
    wait_timeout: Option<Duration>,
}

impl core::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ImageCache")
            .field("poll_interval", &self.poll_interval)
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    pub fn new(spec: &ImageCacheSpec, locks: LockBroker, fetcher: Arc<dyn ImageFetcher>) -> Self {
        let jitter_amt = spec.fetch_retry.jitter;
        let retrier = Retrier::new(
            Arc::new(|duration| Box::pin(tokio::time::sleep(duration))),
            Arc::new(move |delay: Duration| {
                if jitter_amt == 0. {
                    return delay;
                }
                let min = 1. - (jitter_amt / 2.);
                let max = 1. + (jitter_amt / 2.);
                delay.mul_f32(rand::rng().random_range(min..max))
            }),
            spec.fetch_retry.clone(),
        );
        Self {
            locks,
            fetcher,
            retrier,
            poll_interval: Duration::from_millis(spec.download_poll_interval_millis.max(1)),
            wait_timeout: (spec.download_wait_timeout_secs > 0)
                .then(|| Duration::from_secs(spec.download_wait_timeout_secs)),
        }
    }

    /// Where the master copy of `image_ref` lives inside `master_dir`. The
    /// last path segment of the reference names the file, so
    /// `glance://host/<uuid>` and `<uuid>` share a master.
    pub fn master_image_path(master_dir: &Path, image_ref: &str) -> Result<PathBuf, Error> {
        let image_id = image_ref.rsplit('/').next().unwrap_or_default();
        if image_id.is_empty() || image_id == "." || image_id == ".." {
            return Err(make_input_err!("Invalid image reference '{image_ref}'"));
        }
        Ok(master_dir.join(image_id))
    }

    fn marker_path(master: &Path) -> PathBuf {
        let mut marker = master.as_os_str().to_owned();
        marker.push(MARKER_SUFFIX);
        PathBuf::from(marker)
    }

    /// Makes `dest` a hard link to the master copy of `image_ref`, fetching
    /// it first if no master exists yet. Without a `master_dir` the image is
    /// fetched straight to `dest` and nothing is shared.
    pub async fn fetch_image(
        &self,
        ctx: &RequestContext,
        image_ref: &str,
        dest: &Path,
        master_dir: Option<&Path>,
    ) -> Result<(), Error> {
        let Some(master_dir) = master_dir else {
            return self
                .fetch(ctx, image_ref, dest)
                .await
                .err_tip(|| format!("Fetching unshared image {image_ref} to {dest:?}"));
        };
        let master = Self::master_image_path(master_dir, image_ref)?;
        let marker = Self::marker_path(&master);
        let started = Instant::now();

        loop {
            {
                let guard = self.locks.acquire(MASTER_IMAGE_LOCK, LockMode::Exclusive).await;
                Self::link_master_image(&guard, &master, dest).await?;
            }
            if fs::exists(dest).await? {
                debug!(?master, ?dest, "Linked existing master image");
                return Ok(());
            }

            fs::create_dir_all(master_dir)
                .await
                .err_tip(|| format!("Creating master directory {master_dir:?}"))?;
            if !self.download_in_progress(&marker).await? {
                return self
                    .download_master(ctx, image_ref, master_dir, &master, &marker, dest)
                    .await;
            }

            debug!(?marker, "Waiting on download by another caller");
            self.wait_for_download(&marker, started).await?;
            // The other download may have failed, so start over rather than
            // assuming the master now exists.
        }
    }

    /// Deletes `master` if no consumer links to it anymore. Returns whether
    /// the file was deleted.
    pub async fn release(&self, master: &Path) -> Result<bool, Error> {
        let _guard = self.locks.acquire(MASTER_IMAGE_LOCK, LockMode::Exclusive).await;
        match fs::link_count(master).await {
            Ok(1) => {
                fs::remove_file(master)
                    .await
                    .err_tip(|| format!("Removing unused master image {master:?}"))?;
                info!(?master, "Removed unused master image");
                Ok(true)
            }
            Ok(link_count) => {
                debug!(?master, link_count, "Master image still in use");
                Ok(false)
            }
            Err(e) if e.code == Code::NotFound => Ok(false),
            Err(e) => Err(e).err_tip(|| format!("Reading link count of {master:?}")),
        }
    }

    /// Removes download markers and scratch files left by a process that
    /// died mid-download. Only safe while no download is running.
    pub async fn prune_stale_downloads(&self, master_dir: &Path) -> Result<usize, Error> {
        let _download_guard = self.locks.acquire(IMAGE_DOWNLOAD_LOCK, LockMode::Exclusive).await;
        let _master_guard = self.locks.acquire(MASTER_IMAGE_LOCK, LockMode::Exclusive).await;
        let names = match fs::read_dir_names(master_dir).await {
            Ok(names) => names,
            Err(e) if e.code == Code::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut pruned = 0;
        for name in names.iter().filter(|name| is_transient(name)) {
            let path = master_dir.join(name);
            warn!(?path, "Removing stale download state");
            fs::unlink_without_raise(&path).await;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Lists the master images in `master_dir`.
    pub async fn master_images(&self, master_dir: &Path) -> Result<Vec<MasterImage>, Error> {
        let mut names = fs::read_dir_names(master_dir)
            .await
            .err_tip(|| format!("Listing master directory {master_dir:?}"))?;
        names.sort();
        let mut images = Vec::with_capacity(names.len());
        for name in names.into_iter().filter(|name| !is_transient(name)) {
            let path = master_dir.join(name);
            let metadata = fs::metadata(&path).await?;
            if !metadata.is_file() {
                continue;
            }
            images.push(MasterImage {
                link_count: fs::link_count(&path).await?,
                size: metadata.len(),
                path,
            });
        }
        Ok(images)
    }

    async fn link_master_image(
        guard: &NamedLockGuard,
        master: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        guard.ensure_exclusive(MASTER_IMAGE_LOCK)?;
        if !fs::exists(master).await? {
            return Ok(());
        }
        match fs::hard_link(master, dest).await {
            Err(e) if e.code != Code::AlreadyExists => {
                Err(e).err_tip(|| format!("Linking {master:?} to {dest:?}"))
            }
            _ => Ok(()),
        }
    }

    /// Creates the download marker unless it exists. Returns `true` when
    /// another caller already owns the download.
    async fn download_in_progress(&self, marker: &Path) -> Result<bool, Error> {
        let _guard = self.locks.acquire(IMAGE_DOWNLOAD_LOCK, LockMode::Exclusive).await;
        match fs::create_new_file(marker).await {
            Ok(()) => Ok(false),
            Err(e) if e.code == Code::AlreadyExists => Ok(true),
            Err(e) => Err(e).err_tip(|| format!("Creating download marker {marker:?}")),
        }
    }

    async fn remove_download_marker(locks: &LockBroker, marker: &Path) {
        let _guard = locks.acquire(IMAGE_DOWNLOAD_LOCK, LockMode::Exclusive).await;
        fs::unlink_without_raise(marker).await;
    }

    async fn download_master(
        &self,
        ctx: &RequestContext,
        image_ref: &str,
        master_dir: &Path,
        master: &Path,
        marker: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        // If this future is dropped mid-download nobody else would ever
        // remove the marker and every waiter would hang.
        let marker_cleanup = scopeguard::guard(
            (self.locks.clone(), marker.to_path_buf()),
            |(locks, marker)| {
                background_spawn!("image_cache_marker_cleanup", async move {
                    Self::remove_download_marker(&locks, &marker).await;
                });
            },
        );

        let result = self
            .fetch_and_promote(ctx, image_ref, master_dir, master, dest)
            .await;

        let (locks, marker) = ScopeGuard::into_inner(marker_cleanup);
        Self::remove_download_marker(&locks, &marker).await;
        result
    }

    async fn fetch_and_promote(
        &self,
        ctx: &RequestContext,
        image_ref: &str,
        master_dir: &Path,
        master: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        let file_name = master
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scratch = master_dir.join(format!(
            "{file_name}{SCRATCH_INFIX}{}",
            Uuid::new_v4().simple()
        ));

        info!(image_ref, ?scratch, "Downloading master image");
        if let Err(e) = self.fetch(ctx, image_ref, &scratch).await {
            fs::unlink_without_raise(&scratch).await;
            return Err(e).err_tip(|| format!("Fetching image {image_ref}"));
        }

        let guard = self.locks.acquire(MASTER_IMAGE_LOCK, LockMode::Exclusive).await;
        let result = Self::create_master_image(&guard, &scratch, master, dest).await;
        fs::unlink_without_raise(&scratch).await;
        result
    }

    /// Promotes a finished download to the master copy unless a master
    /// appeared meanwhile, then links `dest` to the master.
    async fn create_master_image(
        guard: &NamedLockGuard,
        scratch: &Path,
        master: &Path,
        dest: &Path,
    ) -> Result<(), Error> {
        guard.ensure_exclusive(MASTER_IMAGE_LOCK)?;
        if !fs::exists(master).await? {
            fs::hard_link(scratch, master)
                .await
                .err_tip(|| format!("Promoting {scratch:?} to {master:?}"))?;
        }
        fs::hard_link(master, dest)
            .await
            .err_tip(|| format!("Linking {master:?} to {dest:?}"))
    }

    async fn wait_for_download(&self, marker: &Path, started: Instant) -> Result<(), Error> {
        loop {
            if !fs::exists(marker).await? {
                return Ok(());
            }
            if let Some(timeout) = self.wait_timeout {
                if started.elapsed() >= timeout {
                    return Err(make_err!(
                        Code::DeadlineExceeded,
                        "Gave up after {timeout:?} waiting for download marked by {marker:?}"
                    ));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn fetch(
        &self,
        ctx: &RequestContext,
        image_ref: &str,
        dest: &Path,
    ) -> Result<(), Error> {
        self.retrier
            .retry(unfold(0_usize, move |attempt| async move {
                if attempt > 0 {
                    debug!(image_ref, attempt, "Retrying image fetch");
                }
                let result = match self.fetcher.fetch_to_raw(ctx, image_ref, dest).await {
                    Ok(()) => RetryResult::Ok(()),
                    Err(e) => RetryResult::Retry(e),
                };
                Some((result, attempt + 1))
            }))
            .await
    }
}

/// Scratch files are `<id>.tmp<uuid>` with the uuid in simple form.
fn is_scratch(name: &str) -> bool {
    name.rsplit_once(SCRATCH_INFIX).is_some_and(|(id, suffix)| {
        !id.is_empty()
            && suffix.len() == SCRATCH_SUFFIX_LEN
            && suffix.bytes().all(|b| b.is_ascii_hexdigit())
    })
}

fn is_transient(name: &str) -> bool {
    name.ends_with(MARKER_SUFFIX) || is_scratch(name)
}
