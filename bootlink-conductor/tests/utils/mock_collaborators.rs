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

#![allow(dead_code)]

use core::time::Duration;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bootlink_config::conductor::{BootlinkConfig, ConductorSpec, ImageCacheSpec, PxeSpec};
use bootlink_conductor::collaborators::{
    Collaborators, DhcpOption, DiskDeployer, ImageFetcher, ImageProperties, ImageService,
    NetworkApi, PowerDriver, RequestContext,
};
use bootlink_conductor::driver_info::{DEPLOY_KERNEL, DEPLOY_RAMDISK, IMAGE_SOURCE, ROOT_GB};
use bootlink_conductor::memory_inventory::MemoryInventory;
use bootlink_conductor::node::{Node, Port, VIF_PORT_ID};
use bootlink_conductor::states::PowerState;
use bootlink_conductor::vendor_passthru::DeployParams;
use bootlink_error::{Code, Error, make_err};
use parking_lot::Mutex;

pub const NODE_UUID: &str = "1be26c0b-03f2-4d2e-ae87-c02d7f33c123";
pub const OTHER_NODE_UUID: &str = "ab0a4b3e-d2f4-4a7e-8d5b-1cd4b9b4f6a1";
pub const IMAGE_REF: &str = "glance://images/4c5ba5d0-9e6e-4e0c-9c7d-0e1dcd3f9a10";
pub const KERNEL_ID: &str = "kernel-1";
pub const RAMDISK_ID: &str = "ramdisk-1";
pub const API_URL: &str = "http://127.0.0.1:6385/";
pub const TFTP_SERVER: &str = "192.0.2.1";

/// Writes `contents-of:<image_ref>` to the destination and counts calls.
#[derive(Default)]
pub struct CountingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail(&self, image_ref: &str) {
        self.failing.lock().insert(image_ref.to_string());
    }

    pub fn heal(&self, image_ref: &str) {
        self.failing.lock().remove(image_ref);
    }

    pub fn calls(&self, image_ref: &str) -> usize {
        self.calls.lock().get(image_ref).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

pub fn fetched_contents(image_ref: &str) -> String {
    format!("contents-of:{image_ref}")
}

#[async_trait]
impl ImageFetcher for CountingFetcher {
    async fn fetch_to_raw(
        &self,
        _ctx: &RequestContext,
        image_ref: &str,
        dest: &Path,
    ) -> Result<(), Error> {
        *self.calls.lock().entry(image_ref.to_string()).or_default() += 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        // Leave a partial file behind like a real download cut short.
        tokio::fs::write(dest, b"partial").await?;
        if self.failing.lock().contains(image_ref) {
            return Err(make_err!(Code::Unavailable, "Image {image_ref} unavailable"));
        }
        tokio::fs::write(dest, fetched_contents(image_ref)).await?;
        Ok(())
    }
}

pub struct StaticImageService {
    pub properties: Mutex<ImageProperties>,
}

impl Default for StaticImageService {
    fn default() -> Self {
        Self {
            properties: Mutex::new(ImageProperties {
                kernel_id: Some(KERNEL_ID.to_string()),
                ramdisk_id: Some(RAMDISK_ID.to_string()),
            }),
        }
    }
}

#[async_trait]
impl ImageService for StaticImageService {
    async fn show(
        &self,
        _ctx: &RequestContext,
        _image_ref: &str,
    ) -> Result<ImageProperties, Error> {
        Ok(self.properties.lock().clone())
    }
}

/// Remembers the requested power states. `fail_on` makes requests for the
/// given state fail.
pub struct MockPower {
    state: Mutex<PowerState>,
    requests: Mutex<Vec<PowerState>>,
    fail_on: Mutex<Option<PowerState>>,
    boot_devices: Mutex<Vec<(String, bool)>>,
}

impl Default for MockPower {
    fn default() -> Self {
        Self {
            state: Mutex::new(PowerState::PowerOff),
            requests: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            boot_devices: Mutex::new(Vec::new()),
        }
    }
}

impl MockPower {
    pub fn fail_on(&self, state: PowerState) {
        *self.fail_on.lock() = Some(state);
    }

    pub fn set_state(&self, state: PowerState) {
        *self.state.lock() = state;
    }

    pub fn requests(&self) -> Vec<PowerState> {
        self.requests.lock().clone()
    }

    pub fn boot_devices(&self) -> Vec<(String, bool)> {
        self.boot_devices.lock().clone()
    }
}

#[async_trait]
impl PowerDriver for MockPower {
    async fn get_power_state(
        &self,
        _ctx: &RequestContext,
        _node: &Node,
    ) -> Result<PowerState, Error> {
        Ok(*self.state.lock())
    }

    async fn set_power_state(
        &self,
        _ctx: &RequestContext,
        _node: &Node,
        state: PowerState,
    ) -> Result<(), Error> {
        self.requests.lock().push(state);
        if *self.fail_on.lock() == Some(state) {
            return Err(make_err!(Code::Internal, "BMC refused {state}"));
        }
        *self.state.lock() = if state == PowerState::Reboot {
            PowerState::PowerOn
        } else {
            state
        };
        Ok(())
    }

    async fn set_boot_device(
        &self,
        _ctx: &RequestContext,
        _node: &Node,
        device: &str,
        persistent: bool,
    ) -> Result<(), Error> {
        self.boot_devices.lock().push((device.to_string(), persistent));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNetwork {
    failing: Mutex<HashSet<String>>,
    updates: Mutex<Vec<(String, Vec<DhcpOption>)>>,
}

impl MockNetwork {
    pub fn fail(&self, vif: &str) {
        self.failing.lock().insert(vif.to_string());
    }

    /// Successful updates only.
    pub fn updates(&self) -> Vec<(String, Vec<DhcpOption>)> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl NetworkApi for MockNetwork {
    async fn update_port_dhcp_opts(
        &self,
        _ctx: &RequestContext,
        vif_id: &str,
        options: &[DhcpOption],
    ) -> Result<(), Error> {
        if self.failing.lock().contains(vif_id) {
            return Err(make_err!(Code::Unavailable, "Port {vif_id} not reachable"));
        }
        self.updates
            .lock()
            .push((vif_id.to_string(), options.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDeployer {
    fail: AtomicBool,
    calls: Mutex<Vec<DeployParams>>,
}

impl MockDeployer {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DeployParams> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DiskDeployer for MockDeployer {
    async fn deploy(&self, params: &DeployParams) -> Result<(), Error> {
        self.calls.lock().push(params.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(make_err!(Code::Internal, "iSCSI login failed"));
        }
        Ok(())
    }
}

/// Counts concurrently running calls into a critical section.
#[derive(Default)]
pub struct OverlapDetector {
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl OverlapDetector {
    pub fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

/// Collaborators plus typed handles on the mocks behind them.
pub struct Mocks {
    pub inventory: Arc<MemoryInventory>,
    pub fetcher: Arc<CountingFetcher>,
    pub image_service: Arc<StaticImageService>,
    pub power: Arc<MockPower>,
    pub network: Arc<MockNetwork>,
    pub deployer: Arc<MockDeployer>,
}

impl Mocks {
    pub fn new() -> Self {
        Self {
            inventory: Arc::new(MemoryInventory::new()),
            fetcher: Arc::new(CountingFetcher::new()),
            image_service: Arc::new(StaticImageService::default()),
            power: Arc::new(MockPower::default()),
            network: Arc::new(MockNetwork::default()),
            deployer: Arc::new(MockDeployer::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            inventory: self.inventory.clone(),
            fetcher: self.fetcher.clone(),
            image_service: self.image_service.clone(),
            power: self.power.clone(),
            network: self.network.clone(),
            deployer: self.deployer.clone(),
        }
    }
}

pub struct TestPaths {
    pub tftp_root: PathBuf,
    pub images_path: PathBuf,
    pub tftp_master_path: PathBuf,
    pub instance_master_path: PathBuf,
}

impl TestPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            tftp_root: root.join("tftpboot"),
            images_path: root.join("images"),
            tftp_master_path: root.join("tftpboot").join("master_images"),
            instance_master_path: root.join("master_images"),
        }
    }
}

pub fn make_config(paths: &TestPaths) -> BootlinkConfig {
    let display = |path: &Path| path.to_string_lossy().into_owned();
    let mut pxe = PxeSpec::with_tftp_server(TFTP_SERVER);
    pxe.tftp_root = display(&paths.tftp_root);
    pxe.images_path = display(&paths.images_path);
    pxe.tftp_master_path = Some(display(&paths.tftp_master_path));
    pxe.instance_master_path = Some(display(&paths.instance_master_path));
    BootlinkConfig {
        conductor: ConductorSpec {
            api_url: API_URL.to_string(),
        },
        pxe,
        image_cache: ImageCacheSpec {
            download_poll_interval_millis: 10,
            ..ImageCacheSpec::default()
        },
        global: None,
    }
}

pub fn make_node(uuid: &str) -> Node {
    let mut node = Node::new(uuid);
    node.driver_info = BTreeMap::from(
        [
            (IMAGE_SOURCE, IMAGE_REF),
            (DEPLOY_KERNEL, "glance://images/deploy-kernel-1"),
            (DEPLOY_RAMDISK, "glance://images/deploy-ramdisk-1"),
            (ROOT_GB, "10"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    node
}

pub fn make_port(node_uuid: &str, index: u8, vif: Option<&str>) -> Port {
    Port {
        uuid: format!("port-{index}-{node_uuid}"),
        node_uuid: node_uuid.to_string(),
        address: format!("52:54:00:AB:CD:{index:02x}"),
        extra: vif
            .map(|vif| BTreeMap::from([(VIF_PORT_ID.to_string(), vif.to_string())]))
            .unwrap_or_default(),
    }
}
