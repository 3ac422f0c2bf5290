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

use bootlink_config::conductor::PxeSpec;
use bootlink_error::{Code, Error, ResultExt, make_err, make_input_err};
use bootlink_util::fs;
use tracing::{debug, info, warn};

use crate::boot_config::{BootConfigBuilder, generate_deploy_key};
use crate::collaborators::{ImageService, NetworkApi, PowerDriver};
use crate::driver_info::{DEPLOY_KEY, PxeDriverInfo, parse_driver_info};
use crate::image_cache::ImageCache;
use crate::node::node_power_action;
use crate::states::{PowerState, ProvisionState};
use crate::task_manager::Task;

/// A kernel or ramdisk served over TFTP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TftpImage {
    pub image_ref: String,
    /// Per-node location below the TFTP root.
    pub path: PathBuf,
}

/// Everything a node PXE boots from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TftpImageInfo {
    pub deploy_kernel: TftpImage,
    pub deploy_ramdisk: TftpImage,
    pub kernel: TftpImage,
    pub ramdisk: TftpImage,
}

impl TftpImageInfo {
    pub fn iter(&self) -> impl Iterator<Item = &TftpImage> {
        [
            &self.deploy_kernel,
            &self.deploy_ramdisk,
            &self.kernel,
            &self.ramdisk,
        ]
        .into_iter()
    }
}

/// Network boot deploy driver.
///
/// `prepare` stages images and boot config, `deploy` reboots the node into
/// the deploy ramdisk and leaves it in `DeployWait` until the ramdisk calls
/// back, `tear_down` powers the node off and `clean_up` removes everything
/// `prepare` created.
pub struct PxeDeploy {
    tftp_root: PathBuf,
    images_path: PathBuf,
    tftp_master_path: Option<PathBuf>,
    instance_master_path: Option<PathBuf>,
    image_cache: Arc<ImageCache>,
    boot_config: Arc<BootConfigBuilder>,
    image_service: Arc<dyn ImageService>,
    network: Arc<dyn NetworkApi>,
    power: Arc<dyn PowerDriver>,
}

impl core::fmt::Debug for PxeDeploy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PxeDeploy")
            .field("tftp_root", &self.tftp_root)
            .field("images_path", &self.images_path)
            .field("tftp_master_path", &self.tftp_master_path)
            .field("instance_master_path", &self.instance_master_path)
            .finish_non_exhaustive()
    }
}

impl PxeDeploy {
    pub fn new(
        pxe: &PxeSpec,
        image_cache: Arc<ImageCache>,
        boot_config: Arc<BootConfigBuilder>,
        image_service: Arc<dyn ImageService>,
        network: Arc<dyn NetworkApi>,
        power: Arc<dyn PowerDriver>,
    ) -> Self {
        Self {
            tftp_root: PathBuf::from(&pxe.tftp_root),
            images_path: PathBuf::from(&pxe.images_path),
            tftp_master_path: pxe.tftp_master_path.as_ref().map(PathBuf::from),
            instance_master_path: pxe.instance_master_path.as_ref().map(PathBuf::from),
            image_cache,
            boot_config,
            image_service,
            network,
            power,
        }
    }

    pub const fn boot_config(&self) -> &Arc<BootConfigBuilder> {
        &self.boot_config
    }

    pub fn image_dir_path(&self, node_uuid: &str) -> PathBuf {
        self.images_path.join(node_uuid)
    }

    pub fn image_file_path(&self, node_uuid: &str) -> PathBuf {
        self.image_dir_path(node_uuid).join("disk")
    }

    pub fn token_file_path(&self, node_uuid: &str) -> PathBuf {
        self.tftp_root.join(format!("token-{node_uuid}"))
    }

    /// Fails if the node has no ports or its driver info is incomplete.
    pub fn validate(&self, task: &Task) -> Result<PxeDriverInfo, Error> {
        if task.ports().is_empty() {
            return Err(make_input_err!(
                "Node {} does not have any port associated with it.",
                task.node().uuid
            ));
        }
        parse_driver_info(task.node())
    }

    /// Resolves the deploy images from driver info and the instance
    /// kernel and ramdisk from the image's properties.
    pub async fn tftp_image_info(&self, task: &Task) -> Result<TftpImageInfo, Error> {
        let d_info = parse_driver_info(task.node())?;
        let node_dir = self.tftp_root.join(&task.node().uuid);
        let properties = self
            .image_service
            .show(task.context(), &d_info.image_source)
            .await
            .err_tip(|| format!("Looking up image {}", d_info.image_source))?;
        let property = |value: Option<String>, name: &str| {
            value.ok_or_else(|| {
                make_err!(
                    Code::NotFound,
                    "Image {} has no {name} property",
                    d_info.image_source
                )
            })
        };
        let kernel_id = property(properties.kernel_id, "kernel_id")?;
        let ramdisk_id = property(properties.ramdisk_id, "ramdisk_id")?;
        let entry = |image_ref: &str, label: &str| TftpImage {
            image_ref: image_ref.to_string(),
            path: node_dir.join(label),
        };
        Ok(TftpImageInfo {
            deploy_kernel: entry(&d_info.deploy_kernel, "deploy_kernel"),
            deploy_ramdisk: entry(&d_info.deploy_ramdisk, "deploy_ramdisk"),
            kernel: entry(&kernel_id, "kernel"),
            ramdisk: entry(&ramdisk_id, "ramdisk"),
        })
    }

    /// Publishes the boot config under a fresh deploy key and caches every
    /// image the node boots from.
    pub async fn prepare(&self, task: &mut Task) -> Result<(), Error> {
        let images = self.tftp_image_info(task).await?;
        let deploy_key = generate_deploy_key();
        task.node_mut()?
            .driver_info
            .insert(DEPLOY_KEY.to_string(), deploy_key.clone());
        task.save_node().await?;

        let node_uuid = task.node().uuid.clone();
        let options = self.boot_config.pxe_options(&node_uuid, &deploy_key, &images);
        self.boot_config
            .publish(&node_uuid, &task.mac_addresses(), &options)
            .await?;

        self.cache_tftp_images(task, &images).await?;
        self.cache_instance_image(task).await?;
        Ok(())
    }

    async fn cache_tftp_images(&self, task: &Task, images: &TftpImageInfo) -> Result<(), Error> {
        let node_uuid = &task.node().uuid;
        fs::create_dir_all(self.tftp_root.join(node_uuid)).await?;
        debug!(node = %node_uuid, "Fetching kernel and ramdisk");
        for image in images.iter() {
            if fs::exists(&image.path).await? {
                continue;
            }
            self.image_cache
                .fetch_image(
                    task.context(),
                    &image.image_ref,
                    &image.path,
                    self.tftp_master_path.as_deref(),
                )
                .await
                .err_tip(|| format!("Caching {} for node {node_uuid}", image.image_ref))?;
        }
        Ok(())
    }

    async fn cache_instance_image(&self, task: &Task) -> Result<PathBuf, Error> {
        let d_info = parse_driver_info(task.node())?;
        let node_uuid = &task.node().uuid;
        fs::create_dir_all(self.image_dir_path(node_uuid)).await?;
        let image_path = self.image_file_path(node_uuid);
        debug!(node = %node_uuid, image = %d_info.image_source, "Fetching instance image");
        if !fs::exists(&image_path).await? {
            self.image_cache
                .fetch_image(
                    task.context(),
                    &d_info.image_source,
                    &image_path,
                    self.instance_master_path.as_deref(),
                )
                .await
                .err_tip(|| format!("Caching instance image for node {node_uuid}"))?;
        }
        Ok(image_path)
    }

    /// Writes the token file, points DHCP at this server and reboots the
    /// node into the deploy ramdisk. Does not wait for the node to boot.
    pub async fn deploy(&self, task: &mut Task) -> Result<ProvisionState, Error> {
        task.require_exclusive_lock("deploy")?;
        self.create_token_file(task).await?;
        self.update_dhcp(task).await?;
        node_power_action(task, self.power.as_ref(), PowerState::Reboot).await?;
        Ok(ProvisionState::DeployWait)
    }

    /// Powers the node off. Artifacts are left for `clean_up`.
    pub async fn tear_down(&self, task: &mut Task) -> Result<ProvisionState, Error> {
        task.require_exclusive_lock("tear_down")?;
        node_power_action(task, self.power.as_ref(), PowerState::PowerOff)
            .await
            .err_tip(|| format!("Powering off node {} for tear down", task.node().uuid))?;
        Ok(ProvisionState::Deleted)
    }

    /// Releases the node's images, removes its boot config and token
    /// file. Safe to run more than once. A node whose images can no longer
    /// be resolved still loses every per-node artifact; only the masters
    /// that cannot be named are left for the janitor.
    pub async fn clean_up(&self, task: &Task) {
        let node_uuid = task.node().uuid.clone();
        let d_info = parse_driver_info(task.node())
            .inspect_err(|e| warn!(node = %node_uuid, ?e, "Cleaning up node with invalid driver info"))
            .ok();
        let tftp_refs: Vec<String> = match self.tftp_image_info(task).await {
            Ok(images) => images.iter().map(|image| image.image_ref.clone()).collect(),
            Err(e) => {
                warn!(
                    node = %node_uuid,
                    ?e,
                    "Could not resolve boot images, releasing deploy images only"
                );
                d_info
                    .iter()
                    .flat_map(|d_info| [d_info.deploy_kernel.clone(), d_info.deploy_ramdisk.clone()])
                    .collect()
            }
        };

        self.boot_config
            .retract(&node_uuid, &task.mac_addresses())
            .await;
        fs::rmtree_without_raise(self.tftp_root.join(&node_uuid)).await;
        if let Some(master_dir) = &self.tftp_master_path {
            for image_ref in &tftp_refs {
                self.release_master(master_dir, image_ref).await;
            }
        }

        fs::unlink_without_raise(self.image_file_path(&node_uuid)).await;
        fs::rmtree_without_raise(self.image_dir_path(&node_uuid)).await;
        if let (Some(master_dir), Some(d_info)) = (&self.instance_master_path, &d_info) {
            self.release_master(master_dir, &d_info.image_source).await;
        }

        self.destroy_token_file(&node_uuid).await;
        info!(node = %node_uuid, "Cleaned up deploy artifacts");
    }

    async fn release_master(&self, master_dir: &Path, image_ref: &str) {
        let result = match ImageCache::master_image_path(master_dir, image_ref) {
            Ok(master) => self.image_cache.release(&master).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(image_ref, ?master_dir, ?e, "Failed to release master image");
        }
    }

    /// Re-pushes DHCP boot options for a node this conductor takes over.
    pub async fn take_over(&self, task: &Task) -> Result<(), Error> {
        self.update_dhcp(task).await
    }

    /// Saves the request's auth token for the deploy ramdisk, or removes a
    /// stale one when the request carries none.
    pub async fn create_token_file(&self, task: &Task) -> Result<(), Error> {
        let path = self.token_file_path(&task.node().uuid);
        match &task.context().auth_token {
            Some(token) => fs::write_file(&path, token.as_bytes())
                .await
                .err_tip(|| format!("Writing token file {path:?}")),
            None => {
                fs::unlink_without_raise(&path).await;
                Ok(())
            }
        }
    }

    pub async fn destroy_token_file(&self, node_uuid: &str) {
        fs::unlink_without_raise(self.token_file_path(node_uuid)).await;
    }

    /// Pushes the DHCP boot options to every VIF of the node. Fails with
    /// `Unavailable` only when no VIF could be updated.
    pub async fn update_dhcp(&self, task: &Task) -> Result<(), Error> {
        let node_uuid = &task.node().uuid;
        let vifs = task.vif_ids();
        if vifs.is_empty() {
            warn!(
                node = %node_uuid,
                "No VIFs found when attempting to update DHCP BOOT options"
            );
            return Ok(());
        }

        let options = self.boot_config.dhcp_boot_options();
        let mut failures = Vec::new();
        for (port_uuid, vif) in &vifs {
            if let Err(e) = self
                .network
                .update_port_dhcp_opts(task.context(), vif, &options)
                .await
            {
                warn!(node = %node_uuid, port = %port_uuid, %vif, ?e, "Failed to update DHCP options");
                failures.push(port_uuid.as_str());
            }
        }

        if failures.len() == vifs.len() {
            return Err(make_err!(
                Code::Unavailable,
                "Failed to set DHCP BOOT options for any port on node {node_uuid}."
            ));
        }
        if !failures.is_empty() {
            warn!(
                node = %node_uuid,
                ports = ?failures,
                "Some errors were encountered when updating the DHCP BOOT options"
            );
        }
        Ok(())
    }
}
