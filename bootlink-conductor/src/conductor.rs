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

use std::sync::Arc;

use bootlink_config::conductor::BootlinkConfig;
use bootlink_error::{Error, ResultExt};
use bootlink_util::background_spawn;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::boot_config::BootConfigBuilder;
use crate::collaborators::{Collaborators, RequestContext};
use crate::image_cache::ImageCache;
use crate::lock_broker::LockBroker;
use crate::pxe_deploy::PxeDeploy;
use crate::states::ProvisionState;
use crate::task_manager::{Task, TaskManager};
use crate::vendor_passthru::{CallbackParams, PxeVendorPassthru, VendorMethod};

/// Drives nodes through deploy and tear down. Every operation runs inside
/// a task holding the node's lock.
pub struct Conductor {
    task_manager: TaskManager,
    image_cache: Arc<ImageCache>,
    deploy: Arc<PxeDeploy>,
    vendor: Arc<PxeVendorPassthru>,
}

impl core::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Conductor")
            .field("task_manager", &self.task_manager)
            .field("deploy", &self.deploy)
            .finish_non_exhaustive()
    }
}

impl Conductor {
    pub async fn new(config: &BootlinkConfig, collaborators: Collaborators) -> Result<Self, Error> {
        let locks = LockBroker::new();
        let image_cache = Arc::new(ImageCache::new(
            &config.image_cache,
            locks.clone(),
            collaborators.fetcher.clone(),
        ));
        let boot_config = Arc::new(
            BootConfigBuilder::new(&config.pxe, &config.conductor.api_url)
                .await
                .err_tip(|| "Creating boot config builder")?,
        );
        let deploy = Arc::new(PxeDeploy::new(
            &config.pxe,
            image_cache.clone(),
            boot_config,
            collaborators.image_service.clone(),
            collaborators.network.clone(),
            collaborators.power.clone(),
        ));
        let vendor = Arc::new(PxeVendorPassthru::new(
            deploy.clone(),
            collaborators.power.clone(),
            collaborators.deployer.clone(),
        ));
        Ok(Self {
            task_manager: TaskManager::new(locks, collaborators.inventory),
            image_cache,
            deploy,
            vendor,
        })
    }

    pub const fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub const fn image_cache(&self) -> &Arc<ImageCache> {
        &self.image_cache
    }

    pub const fn deploy(&self) -> &Arc<PxeDeploy> {
        &self.deploy
    }

    pub const fn vendor(&self) -> &Arc<PxeVendorPassthru> {
        &self.vendor
    }

    /// Runs the driver's validation under a shared lock.
    pub async fn validate_node(&self, ctx: RequestContext, node_uuid: &str) -> Result<(), Error> {
        let task = self.task_manager.acquire(ctx, node_uuid, true).await?;
        self.deploy.validate(&task).map(|_| ())
    }

    /// Stages the node's images and boot config and reboots it into the
    /// deploy ramdisk. Returns once the node waits for its callback.
    ///
    /// Any failure after validation leaves the node in `DeployFail` with
    /// `last_error` set, and the error is returned.
    pub async fn do_node_deploy(
        &self,
        ctx: RequestContext,
        node_uuid: &str,
    ) -> Result<ProvisionState, Error> {
        let mut task = self.task_manager.try_acquire(ctx, node_uuid, false).await?;
        self.deploy
            .validate(&task)
            .err_tip(|| format!("Validating node {node_uuid} for deploy"))?;

        let node = task.node_mut()?;
        node.transition(ProvisionState::Deploying, ProvisionState::Active)?;
        node.last_error = None;
        task.save_node().await?;

        let result = async {
            self.deploy.prepare(&mut task).await?;
            self.deploy.deploy(&mut task).await
        }
        .await;

        match result {
            Ok(new_state) => {
                task.node_mut()?
                    .transition(new_state, ProvisionState::Active)?;
                task.save_node().await?;
                info!(node = node_uuid, state = %new_state, "Deploy started");
                Ok(new_state)
            }
            Err(e) => Err(Self::record_failure(&mut task, ProvisionState::DeployFail, e).await),
        }
    }

    /// Powers the node off and removes everything the deploy created.
    pub async fn do_node_tear_down(
        &self,
        ctx: RequestContext,
        node_uuid: &str,
    ) -> Result<ProvisionState, Error> {
        let mut task = self.task_manager.try_acquire(ctx, node_uuid, false).await?;
        let state = task.node().provision_state;
        state
            .check_transition(ProvisionState::Deleted)
            .err_tip(|| format!("Tearing down node {node_uuid}"))?;
        task.node_mut()?.target_provision_state = ProvisionState::Deleted;
        task.save_node().await?;

        let result = async {
            let new_state = self.deploy.tear_down(&mut task).await?;
            self.deploy.clean_up(&task).await;
            Ok::<_, Error>(new_state)
        }
        .await;

        match result {
            Ok(new_state) => {
                task.node_mut()?
                    .transition(new_state, ProvisionState::NoState)?;
                task.save_node().await?;
                info!(node = node_uuid, "Tear down finished");
                Ok(new_state)
            }
            // There is no state for a half torn down node, so it stays where
            // it was and the caller may retry.
            Err(e) => Err(Self::record_failure(&mut task, state, e).await),
        }
    }

    async fn record_failure(task: &mut Task, state: ProvisionState, err: Error) -> Error {
        let node_uuid = task.node().uuid.clone();
        error!(node = %node_uuid, ?err, "Provisioning operation failed");
        let node = match task.node_mut() {
            Ok(node) => node,
            Err(e) => return err.merge(e),
        };
        if node.provision_state != state {
            if let Err(e) = node.transition(state, ProvisionState::NoState) {
                return err.merge(e);
            }
        }
        node.target_provision_state = ProvisionState::NoState;
        // The returned error keeps the full stack of tips.
        node.last_error = Some(err.root_message().to_string());
        match task.save_node().await {
            Ok(()) => err,
            Err(e) => err.merge(e),
        }
    }

    /// Validates a vendor call under the node's exclusive lock. A deploy
    /// callback is then finished on a background task that keeps the lock;
    /// the returned handle may be awaited or dropped.
    pub async fn vendor_passthru(
        &self,
        ctx: RequestContext,
        node_uuid: &str,
        params: CallbackParams,
    ) -> Result<Option<JoinHandle<()>>, Error> {
        let mut task = self.task_manager.try_acquire(ctx, node_uuid, false).await?;
        match self.vendor.validate(&task, &params)? {
            VendorMethod::SetBootDevice => {
                self.vendor.set_boot_device(&task, &params).await?;
                Ok(None)
            }
            VendorMethod::PassDeployInfo => {
                let vendor = self.vendor.clone();
                Ok(Some(background_spawn!(
                    "conductor_continue_deploy",
                    async move {
                        vendor.continue_deploy(&mut task, &params).await;
                    },
                    node = %node_uuid
                )))
            }
        }
    }

    /// Re-pushes DHCP options for a node this conductor takes over.
    pub async fn take_over(&self, ctx: RequestContext, node_uuid: &str) -> Result<(), Error> {
        let task = self.task_manager.acquire(ctx, node_uuid, false).await?;
        self.deploy
            .take_over(&task)
            .await
            .err_tip(|| format!("Taking over node {node_uuid}"))
    }
}
