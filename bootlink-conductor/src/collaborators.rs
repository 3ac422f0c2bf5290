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

//! Services the conductor drives but does not implement.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bootlink_error::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{Node, Port};
use crate::states::PowerState;
use crate::vendor_passthru::DeployParams;

/// Identity of the request an operation runs on behalf of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    /// Token handed to the deploy ramdisk so it can authenticate its callback.
    pub auth_token: Option<String>,
}

impl RequestContext {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            request_id: format!("req-{}", Uuid::new_v4()),
            auth_token,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Node and port persistence.
#[async_trait]
pub trait Inventory: Send + Sync + 'static {
    /// Fails with `NotFound` for an unknown node.
    async fn get_node(&self, node_uuid: &str) -> Result<Node, Error>;

    async fn save_node(&self, node: &Node) -> Result<(), Error>;

    async fn get_ports(&self, node_uuid: &str) -> Result<Vec<Port>, Error>;
}

/// Converts an externally hosted image into a raw file at `dest`.
#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch_to_raw(
        &self,
        ctx: &RequestContext,
        image_ref: &str,
        dest: &Path,
    ) -> Result<(), Error>;
}

/// Properties of an instance image relevant to network boot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProperties {
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
}

#[async_trait]
pub trait ImageService: Send + Sync + 'static {
    async fn show(&self, ctx: &RequestContext, image_ref: &str)
    -> Result<ImageProperties, Error>;
}

#[async_trait]
pub trait PowerDriver: Send + Sync + 'static {
    async fn get_power_state(&self, ctx: &RequestContext, node: &Node)
    -> Result<PowerState, Error>;

    async fn set_power_state(
        &self,
        ctx: &RequestContext,
        node: &Node,
        state: PowerState,
    ) -> Result<(), Error>;

    async fn set_boot_device(
        &self,
        ctx: &RequestContext,
        node: &Node,
        device: &str,
        persistent: bool,
    ) -> Result<(), Error>;
}

/// A single DHCP option pushed to the network service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOption {
    pub opt_name: String,
    pub opt_value: String,
}

#[async_trait]
pub trait NetworkApi: Send + Sync + 'static {
    async fn update_port_dhcp_opts(
        &self,
        ctx: &RequestContext,
        vif_id: &str,
        options: &[DhcpOption],
    ) -> Result<(), Error>;
}

/// Partitions, formats and writes the instance image over iSCSI.
#[async_trait]
pub trait DiskDeployer: Send + Sync + 'static {
    async fn deploy(&self, params: &DeployParams) -> Result<(), Error>;
}

/// Every external service a conductor needs.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn Inventory>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub image_service: Arc<dyn ImageService>,
    pub power: Arc<dyn PowerDriver>,
    pub network: Arc<dyn NetworkApi>,
    pub deployer: Arc<dyn DiskDeployer>,
}

impl core::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
