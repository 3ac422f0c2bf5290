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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bootlink_conductor::boot_config::{BootConfigBuilder, PXELINUX_CFG_DIR};
use bootlink_conductor::collaborators::{ImageFetcher, RequestContext};
use bootlink_conductor::image_cache::ImageCache;
use bootlink_conductor::lock_broker::LockBroker;
use bootlink_config::conductor::BootlinkConfig;
use bootlink_error::{Error, ResultExt, make_err};
use bootlink_util::fs::{create_dir_all, set_open_file_limit};
use bootlink_util::init_tracing;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error_span, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Note: If the default changes make sure you update the documentation in
// `bootlink-config/src/conductor.rs`.
const DEFAULT_MAX_OPEN_FILES: usize = 512;

/// Prepares the directories a PXE conductor serves from and reports the
/// shared image cache.
#[derive(Parser, Debug)]
#[clap(author = "The Bootlink Authors", version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,

    /// Remove download markers and scratch files left by a conductor that
    /// died mid-download. Only run this while no conductor is running.
    #[clap(long)]
    prune: bool,
}

/// The janitor never downloads anything.
#[derive(Debug)]
struct NoFetcher;

#[async_trait]
impl ImageFetcher for NoFetcher {
    async fn fetch_to_raw(
        &self,
        _ctx: &RequestContext,
        image_ref: &str,
        _dest: &Path,
    ) -> Result<(), Error> {
        Err(make_err!(
            bootlink_error::Code::Unimplemented,
            "Refusing to fetch {image_ref} outside a conductor"
        ))
    }
}

async fn inner_main(cfg: BootlinkConfig, prune: bool) -> Result<(), Error> {
    // Fails early on a template that cannot be rendered.
    BootConfigBuilder::new(&cfg.pxe, &cfg.conductor.api_url).await?;

    let tftp_root = PathBuf::from(&cfg.pxe.tftp_root);
    let master_dirs: Vec<PathBuf> = [&cfg.pxe.tftp_master_path, &cfg.pxe.instance_master_path]
        .into_iter()
        .flatten()
        .map(PathBuf::from)
        .collect();
    let dirs = [
        tftp_root.join(PXELINUX_CFG_DIR),
        PathBuf::from(&cfg.pxe.images_path),
    ];
    for dir in dirs.iter().chain(master_dirs.iter()) {
        create_dir_all(dir)
            .await
            .err_tip(|| format!("Creating directory {dir:?}"))?;
    }

    let cache = ImageCache::new(&cfg.image_cache, LockBroker::new(), Arc::new(NoFetcher));
    for master_dir in &master_dirs {
        if prune {
            let pruned = cache.prune_stale_downloads(master_dir).await?;
            info!(?master_dir, pruned, "Pruned stale download state");
        }
        let masters = cache.master_images(master_dir).await?;
        let total_size: u64 = masters.iter().map(|master| master.size).sum();
        info!(?master_dir, count = masters.len(), total_size, "Master images");
        for master in masters {
            if master.link_count <= 1 {
                warn!(path = ?master.path, size = master.size, "Master image has no consumer");
            } else {
                info!(
                    path = ?master.path,
                    consumers = master.link_count - 1,
                    size = master.size,
                    "Master image in use"
                );
            }
        }
    }
    Ok(())
}

async fn get_config(args: &Args) -> Result<BootlinkConfig, Error> {
    let json_contents = String::from_utf8(
        tokio::fs::read(&args.config_file)
            .await
            .err_tip(|| format!("Could not open config file {}", args.config_file))?,
    )
    .map_err(|e| make_err!(bootlink_error::Code::InvalidArgument, "{e}"))?;
    Ok(serde_json5::from_str(&json_contents)?)
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;
    let args = Args::parse();

    #[allow(clippy::disallowed_methods)]
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let cfg = runtime.block_on(get_config(&args))?;
    let max_open_files = cfg
        .global
        .as_ref()
        .map(|global| global.max_open_files)
        .filter(|max_open_files| *max_open_files > 0)
        .unwrap_or(DEFAULT_MAX_OPEN_FILES);
    set_open_file_limit(max_open_files);

    runtime
        .block_on(tracing::Instrument::instrument(
            inner_main(cfg, args.prune),
            error_span!("main"),
        ))
        .err_tip(|| "main() function failed")?;
    Ok(())
}
