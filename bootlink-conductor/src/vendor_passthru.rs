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

//! Callbacks from the deploy ramdisk and other driver specific calls.

use std::path::PathBuf;
use std::sync::Arc;

use bootlink_error::{Error, ResultExt, make_input_err};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::collaborators::{DiskDeployer, PowerDriver};
use crate::driver_info::{PxeDriverInfo, parse_driver_info};
use crate::node::node_power_action;
use crate::pxe_deploy::PxeDeploy;
use crate::states::{PowerState, ProvisionState};
use crate::task_manager::Task;

const DEFAULT_ISCSI_PORT: &str = "3260";
const DEFAULT_LUN: &str = "1";

/// Parameters of a vendor passthru call as received from the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackParams {
    pub method: String,
    /// Deploy key the ramdisk booted with.
    pub key: Option<String>,
    pub address: Option<String>,
    pub port: Option<String>,
    pub iqn: Option<String>,
    pub lun: Option<String>,
    /// Set by the ramdisk when it failed to expose the disk.
    pub error: Option<String>,
    pub device: Option<String>,
    pub persistent: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VendorMethod {
    PassDeployInfo,
    SetBootDevice,
}

impl VendorMethod {
    pub fn parse(method: &str) -> Result<Self, Error> {
        match method {
            "pass_deploy_info" => Ok(Self::PassDeployInfo),
            "set_boot_device" => Ok(Self::SetBootDevice),
            other => Err(make_input_err!(
                "Unsupported method ({other}) passed to PXE driver."
            )),
        }
    }
}

/// Everything the disk deployer needs to write the instance image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    pub address: String,
    pub port: String,
    pub iqn: String,
    pub lun: String,
    pub image_path: PathBuf,
    pub pxe_config_path: PathBuf,
    pub root_mb: u64,
    pub swap_mb: u64,
    pub ephemeral_mb: u64,
    pub preserve_ephemeral: bool,
    pub ephemeral_format: Option<String>,
}

fn check_deploy_key(d_info: &PxeDriverInfo, params: &CallbackParams) -> Result<(), Error> {
    match (&d_info.deploy_key, &params.key) {
        (Some(expected), Some(given)) if expected == given => Ok(()),
        _ => Err(make_input_err!("Deploy key does not match")),
    }
}

pub struct PxeVendorPassthru {
    deploy: Arc<PxeDeploy>,
    power: Arc<dyn PowerDriver>,
    deployer: Arc<dyn DiskDeployer>,
}

impl core::fmt::Debug for PxeVendorPassthru {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PxeVendorPassthru")
            .field("deploy", &self.deploy)
            .finish_non_exhaustive()
    }
}

impl PxeVendorPassthru {
    pub const fn new(
        deploy: Arc<PxeDeploy>,
        power: Arc<dyn PowerDriver>,
        deployer: Arc<dyn DiskDeployer>,
    ) -> Self {
        Self {
            deploy,
            power,
            deployer,
        }
    }

    /// Builds the deployer parameters from the node's driver info and the
    /// target the ramdisk exposed.
    pub fn get_deploy_info(
        &self,
        task: &Task,
        params: &CallbackParams,
    ) -> Result<DeployParams, Error> {
        let d_info = parse_driver_info(task.node())?;
        let missing: Vec<&str> = [("address", &params.address), ("iqn", &params.iqn)]
            .into_iter()
            .filter(|(_, value)| value.as_deref().is_none_or(str::is_empty))
            .map(|(name, _)| name)
            .collect();
        if !missing.is_empty() {
            return Err(make_input_err!(
                "Parameters {missing:?} were not passed to the conductor for deploy."
            ));
        }
        let node_uuid = &task.node().uuid;
        let value = |v: &Option<String>, default: &str| {
            v.clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Ok(DeployParams {
            address: value(&params.address, ""),
            port: value(&params.port, DEFAULT_ISCSI_PORT),
            iqn: value(&params.iqn, ""),
            lun: value(&params.lun, DEFAULT_LUN),
            image_path: self.deploy.image_file_path(node_uuid),
            pxe_config_path: self.deploy.boot_config().config_file_path(node_uuid),
            root_mb: d_info.root_mb,
            swap_mb: d_info.swap_mb,
            ephemeral_mb: d_info.ephemeral_mb,
            preserve_ephemeral: d_info.preserve_ephemeral,
            ephemeral_format: d_info.ephemeral_format,
        })
    }

    /// Checks a call before anything is scheduled for it.
    pub fn validate(&self, task: &Task, params: &CallbackParams) -> Result<VendorMethod, Error> {
        let method = VendorMethod::parse(&params.method)?;
        match method {
            VendorMethod::PassDeployInfo => {
                let d_info = parse_driver_info(task.node())?;
                check_deploy_key(&d_info, params)?;
                self.get_deploy_info(task, params)?;
            }
            VendorMethod::SetBootDevice => {
                if params.device.as_deref().is_none_or(str::is_empty) {
                    return Err(make_input_err!(
                        "Parameters ['device'] were not passed to the conductor for set_boot_device."
                    ));
                }
            }
        }
        Ok(method)
    }

    /// Writes the instance image once the deploy ramdisk has exposed the
    /// node's disk. Runs detached from the caller, so every failure ends in
    /// `DeployFail` instead of an error.
    pub async fn continue_deploy(&self, task: &mut Task, params: &CallbackParams) {
        let node_uuid = task.node().uuid.clone();
        let state = task.node().provision_state;
        if state != ProvisionState::DeployWait {
            info!(
                node = %node_uuid,
                %state,
                "Ignoring deploy callback for node not waiting for one"
            );
            return;
        }
        let key_check = parse_driver_info(task.node())
            .and_then(|d_info| check_deploy_key(&d_info, params));
        if let Err(e) = key_check {
            warn!(node = %node_uuid, ?e, "Rejecting deploy callback");
            return;
        }

        let started = task
            .node_mut()
            .and_then(|node| node.transition(ProvisionState::Deploying, ProvisionState::Active));
        if let Err(e) = started {
            error!(node = %node_uuid, ?e, "Could not start continuing the deploy");
            return;
        }
        if let Err(e) = task.save_node().await {
            error!(node = %node_uuid, ?e, "Failed to save node while continuing deploy");
        }
        self.deploy.destroy_token_file(&node_uuid).await;

        if let Some(ramdisk_error) = &params.error {
            error!(node = %node_uuid, %ramdisk_error, "Error returned from PXE deploy ramdisk");
            self.set_failed_state(task, "Failure in PXE deploy ramdisk.")
                .await;
            return;
        }

        let deploy_params = match self.get_deploy_info(task, params) {
            Ok(deploy_params) => deploy_params,
            Err(e) => {
                error!(node = %node_uuid, ?e, "Invalid deploy callback parameters");
                self.set_failed_state(task, "PXE driver failed to continue deployment.")
                    .await;
                return;
            }
        };

        info!(node = %node_uuid, target = %deploy_params.iqn, "Continuing deployment");
        if let Err(e) = self.deployer.deploy(&deploy_params).await {
            error!(node = %node_uuid, ?e, "PXE deploy failed");
            self.set_failed_state(task, "PXE driver failed to continue deployment.")
                .await;
            return;
        }

        let finished = task
            .node_mut()
            .and_then(|node| node.transition(ProvisionState::Active, ProvisionState::NoState));
        match finished {
            Ok(()) => {
                if let Err(e) = task.save_node().await {
                    error!(node = %node_uuid, ?e, "Failed to save deployed node");
                    return;
                }
                info!(node = %node_uuid, "Deployment finished successfully");
            }
            Err(e) => error!(node = %node_uuid, ?e, "Could not mark node active"),
        }
    }

    /// Moves the node to `DeployFail` and powers it off. The final
    /// `last_error` is written after the power action because a successful
    /// power action clears it.
    pub async fn set_failed_state(&self, task: &mut Task, msg: &str) {
        let node_uuid = task.node().uuid.clone();
        let failed = task
            .node_mut()
            .and_then(|node| node.transition(ProvisionState::DeployFail, ProvisionState::NoState));
        if let Err(e) = failed {
            error!(node = %node_uuid, ?e, "Could not mark node as failed");
            return;
        }
        if let Err(e) = task.save_node().await {
            error!(node = %node_uuid, ?e, "Failed to save failed node");
        }

        let mut last_error = msg.to_string();
        if let Err(e) = node_power_action(task, self.power.as_ref(), PowerState::PowerOff).await {
            last_error = format!(
                "Node {node_uuid} failed to power off while handling deploy failure. This may be a serious condition. Node should be removed from the conductor or put in maintenance mode until the problem is resolved."
            );
            error!(node = %node_uuid, ?e, "{last_error}");
        }

        match task.node_mut() {
            Ok(node) => node.last_error = Some(last_error),
            Err(e) => {
                error!(node = %node_uuid, ?e, "Could not record deploy failure");
                return;
            }
        }
        if let Err(e) = task.save_node().await {
            error!(node = %node_uuid, ?e, "Failed to save deploy failure");
        }
    }

    pub async fn set_boot_device(&self, task: &Task, params: &CallbackParams) -> Result<(), Error> {
        let device = params
            .device
            .as_deref()
            .filter(|device| !device.is_empty())
            .ok_or_else(|| {
                make_input_err!(
                    "Parameters ['device'] were not passed to the conductor for set_boot_device."
                )
            })?;
        let persistent = params.persistent.unwrap_or(false);
        self.power
            .set_boot_device(task.context(), task.node(), device, persistent)
            .await
            .err_tip(|| format!("Setting boot device of node {}", task.node().uuid))
    }
}
