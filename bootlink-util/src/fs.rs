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

//! Blocking filesystem calls run on the blocking pool behind a shared
//! semaphore so the conductor never holds more than a bounded number of
//! file descriptors, no matter how many nodes are being provisioned.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::fs::Metadata;
use std::io::Write;
use std::path::{Path, PathBuf};

use bootlink_error::{Code, Error, ResultExt, make_err};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, warn};

const DEFAULT_OPEN_FILE_PERMITS: usize = 10;
static TOTAL_FILE_SEMAPHORES: AtomicUsize = AtomicUsize::new(DEFAULT_OPEN_FILE_PERMITS);
pub static OPEN_FILE_SEMAPHORE: Semaphore = Semaphore::const_new(DEFAULT_OPEN_FILE_PERMITS);

/// Try to acquire a permit from the open file semaphore.
#[inline]
pub async fn get_permit() -> Result<SemaphorePermit<'static>, Error> {
    OPEN_FILE_SEMAPHORE
        .acquire()
        .await
        .map_err(|e| make_err!(Code::Internal, "Open file semaphore closed {:?}", e))
}

/// Acquire a permit from the open file semaphore and call a raw function.
#[inline]
pub async fn call_with_permit<F, T>(f: F) -> Result<T, Error>
where
    F: FnOnce(SemaphorePermit<'static>) -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    let permit = get_permit().await?;
    tokio::task::spawn_blocking(move || f(permit))
        .await
        .unwrap_or_else(|e| Err(make_err!(Code::Internal, "background task failed: {e:?}")))
}

pub fn set_open_file_limit(limit: usize) {
    let current_total = TOTAL_FILE_SEMAPHORES.load(Ordering::Acquire);
    if limit < current_total {
        error!(
            "set_open_file_limit({}) must be greater than {}",
            limit, current_total
        );
        return;
    }
    TOTAL_FILE_SEMAPHORES.fetch_add(limit - current_total, Ordering::Release);
    OPEN_FILE_SEMAPHORE.add_permits(limit - current_total);
}

pub async fn hard_link(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), Error> {
    let src = src.as_ref().to_owned();
    let dst = dst.as_ref().to_owned();
    call_with_permit(move |_| std::fs::hard_link(src, dst).map_err(Into::<Error>::into)).await
}

pub async fn create_dir_all(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::create_dir_all(path).map_err(Into::<Error>::into)).await
}

/// Creates `path` and fails with `AlreadyExists` if anything is already
/// there. This is the atomic "check then create" primitive.
pub async fn create_new_file(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map(|_| ())
            .err_tip(|| format!("Could not create {path:?}"))
    })
    .await
}

/// Writes `contents` to `path`, truncating an existing file.
pub async fn write_file(path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Result<(), Error> {
    let path = path.as_ref().to_owned();
    let contents = contents.into();
    call_with_permit(move |_| {
        let mut file =
            std::fs::File::create(&path).err_tip(|| format!("Could not open {path:?}"))?;
        file.write_all(&contents)
            .err_tip(|| format!("Could not write {path:?}"))?;
        file.sync_all()
            .err_tip(|| format!("Could not sync {path:?}"))
    })
    .await
}

pub async fn read_to_string(path: impl AsRef<Path>) -> Result<String, Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::read_to_string(path).map_err(Into::<Error>::into)).await
}

#[cfg(target_family = "unix")]
pub async fn symlink(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), Error> {
    let src = src.as_ref().to_owned();
    let dst = dst.as_ref().to_owned();
    call_with_permit(move |_| std::os::unix::fs::symlink(src, dst).map_err(Into::<Error>::into))
        .await
}

pub async fn read_link(path: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::read_link(path).map_err(Into::<Error>::into)).await
}

/// Returns the names of every entry directly below `path`.
pub async fn read_dir_names(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&path).err_tip(|| format!("Could not read {path:?}"))? {
            let entry = entry.err_tip(|| format!("Could not read entry of {path:?}"))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    })
    .await
}

pub async fn remove_file(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::remove_file(path).map_err(Into::<Error>::into)).await
}

pub async fn remove_dir_all(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::remove_dir_all(path).map_err(Into::<Error>::into)).await
}

pub async fn metadata(path: impl AsRef<Path>) -> Result<Metadata, Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::metadata(path).map_err(Into::<Error>::into)).await
}

pub async fn symlink_metadata(path: impl AsRef<Path>) -> Result<Metadata, Error> {
    let path = path.as_ref().to_owned();
    call_with_permit(move |_| std::fs::symlink_metadata(path).map_err(Into::<Error>::into)).await
}

/// Whether anything (including a dangling symlink) lives at `path`.
pub async fn exists(path: impl AsRef<Path>) -> Result<bool, Error> {
    match symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.code == Code::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Number of hard links pointing at the inode behind `path`.
#[cfg(target_family = "unix")]
pub async fn link_count(path: impl AsRef<Path>) -> Result<u64, Error> {
    use std::os::unix::fs::MetadataExt;
    Ok(metadata(path).await?.nlink())
}

/// Removes a file, treating an already-missing file as success. Other
/// failures are logged and swallowed.
pub async fn unlink_without_raise(path: impl AsRef<Path>) {
    let path = path.as_ref();
    match remove_file(path).await {
        Ok(()) => debug!(?path, "Removed file"),
        Err(e) if e.code == Code::NotFound => {}
        Err(e) => warn!(?path, ?e, "Failed to remove file"),
    }
}

/// Removes a directory tree, treating an already-missing tree as success.
/// Other failures are logged and swallowed.
pub async fn rmtree_without_raise(path: impl AsRef<Path>) {
    let path = path.as_ref();
    match remove_dir_all(path).await {
        Ok(()) => debug!(?path, "Removed directory tree"),
        Err(e) if e.code == Code::NotFound => {}
        Err(e) => warn!(?path, ?e, "Failed to remove directory tree"),
    }
}
