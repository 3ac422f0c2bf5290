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

use bootlink_config::conductor::PxeSpec;
use bootlink_error::{Error, ResultExt, make_input_err};
use bootlink_util::fs;
use formatx::Template;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, warn};

use crate::collaborators::DhcpOption;
use crate::pxe_deploy::TftpImageInfo;

/// Directory below the TFTP root holding the per-MAC links.
pub const PXELINUX_CFG_DIR: &str = "pxelinux.cfg";
const DEPLOY_KEY_LEN: usize = 32;

/// pxelinux configuration with a `deploy` label that boots the deploy
/// ramdisk and a `boot` label for the instance.
pub const DEFAULT_PXE_CONFIG_TEMPLATE: &str = "default deploy

label deploy
kernel {deployment_aki_path}
append initrd={deployment_ari_path} selinux=0 disk=cciss/c0d0,sda,hda,vda iscsi_target_iqn={deployment_iscsi_iqn} deployment_id={deployment_id} deployment_key={deployment_key} ironic_api_url={ironic_api_url} troubleshoot=0 {pxe_append_params}
ipappend 3


label boot
kernel {aki_path}
append initrd={ari_path} root={ROOT} ro {pxe_append_params}
";

/// Left in the rendered file for the deploy ramdisk to fill in with the
/// root device it creates.
const ROOT_PLACEHOLDER: &str = "{{ ROOT }}";

/// Values substituted into the boot configuration template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PxeOptions {
    pub deployment_id: String,
    pub deployment_key: String,
    pub deployment_iscsi_iqn: String,
    pub deployment_aki_path: String,
    pub deployment_ari_path: String,
    pub aki_path: String,
    pub ari_path: String,
    pub ironic_api_url: String,
    pub pxe_append_params: String,
}

/// Random key the deploy ramdisk must echo back in its callback.
pub fn generate_deploy_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(DEPLOY_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Renders per-node boot configuration and publishes it under the TFTP
/// root so that every interface of the node finds it.
#[derive(Clone, Debug)]
pub struct BootConfigBuilder {
    template: String,
    tftp_root: PathBuf,
    tftp_server: String,
    bootfile_name: String,
    append_params: String,
    api_url: String,
}

impl BootConfigBuilder {
    /// Uses `pxe.pxe_config_template` when set, otherwise the built-in
    /// template.
    pub async fn new(pxe: &PxeSpec, api_url: &str) -> Result<Self, Error> {
        let template = match &pxe.pxe_config_template {
            Some(path) => fs::read_to_string(path)
                .await
                .err_tip(|| format!("Reading pxe_config_template {path}"))?,
            None => DEFAULT_PXE_CONFIG_TEMPLATE.to_string(),
        };
        Self::with_template(pxe, api_url, template)
    }

    pub fn with_template(pxe: &PxeSpec, api_url: &str, template: String) -> Result<Self, Error> {
        Template::new(&template).map_err(|e| {
            make_input_err!("Could not convert pxe_config_template to rust template: {e:?}")
        })?;
        Ok(Self {
            template,
            tftp_root: PathBuf::from(&pxe.tftp_root),
            tftp_server: pxe.tftp_server.clone(),
            bootfile_name: pxe.pxe_bootfile_name.clone(),
            append_params: pxe.pxe_append_params.clone(),
            // The deploy ramdisk appends its own path.
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn tftp_root(&self) -> &Path {
        &self.tftp_root
    }

    pub fn node_dir(&self, node_uuid: &str) -> PathBuf {
        self.tftp_root.join(node_uuid)
    }

    pub fn config_file_path(&self, node_uuid: &str) -> PathBuf {
        self.node_dir(node_uuid).join("config")
    }

    /// `aa:BB:cc:dd:ee:ff` maps to `<tftp_root>/pxelinux.cfg/01-aa-bb-cc-dd-ee-ff`.
    pub fn mac_path(&self, mac: &str) -> PathBuf {
        self.tftp_root.join(PXELINUX_CFG_DIR).join(format!(
            "01-{}",
            mac.replace(':', "-").to_lowercase()
        ))
    }

    pub fn pxe_options(
        &self,
        node_uuid: &str,
        deploy_key: &str,
        images: &TftpImageInfo,
    ) -> PxeOptions {
        let display = |path: &Path| path.to_string_lossy().into_owned();
        PxeOptions {
            deployment_id: node_uuid.to_string(),
            deployment_key: deploy_key.to_string(),
            deployment_iscsi_iqn: format!("iqn-{node_uuid}"),
            deployment_aki_path: display(&images.deploy_kernel.path),
            deployment_ari_path: display(&images.deploy_ramdisk.path),
            aki_path: display(&images.kernel.path),
            ari_path: display(&images.ramdisk.path),
            ironic_api_url: self.api_url.clone(),
            pxe_append_params: self.append_params.clone(),
        }
    }

    pub fn render(&self, options: &PxeOptions) -> Result<String, Error> {
        let mut template = Template::new(&self.template).map_err(|e| {
            make_input_err!("Could not convert pxe_config_template to rust template: {e:?}")
        })?;
        template.replace("deployment_id", &options.deployment_id);
        template.replace("deployment_key", &options.deployment_key);
        template.replace("deployment_iscsi_iqn", &options.deployment_iscsi_iqn);
        template.replace("deployment_aki_path", &options.deployment_aki_path);
        template.replace("deployment_ari_path", &options.deployment_ari_path);
        template.replace("aki_path", &options.aki_path);
        template.replace("ari_path", &options.ari_path);
        template.replace("ironic_api_url", &options.ironic_api_url);
        template.replace("pxe_append_params", &options.pxe_append_params);
        template.replace("ROOT", ROOT_PLACEHOLDER);
        template
            .text()
            .map_err(|e| make_input_err!("Could not render boot config: {e:?}"))
    }

    /// Writes the node's boot configuration and points every MAC link at
    /// it, replacing links left from an earlier deploy.
    pub async fn publish(
        &self,
        node_uuid: &str,
        macs: &[String],
        options: &PxeOptions,
    ) -> Result<PathBuf, Error> {
        fs::create_dir_all(self.node_dir(node_uuid))
            .await
            .err_tip(|| format!("Creating TFTP directory of node {node_uuid}"))?;
        fs::create_dir_all(self.tftp_root.join(PXELINUX_CFG_DIR))
            .await
            .err_tip(|| "Creating pxelinux.cfg directory")?;

        let config_path = self.config_file_path(node_uuid);
        let config = self.render(options)?;
        fs::write_file(&config_path, config)
            .await
            .err_tip(|| format!("Writing boot config {config_path:?}"))?;

        for mac in macs {
            let mac_path = self.mac_path(mac);
            fs::unlink_without_raise(&mac_path).await;
            if let Err(e) = fs::symlink(&config_path, &mac_path).await {
                warn!(node = node_uuid, ?mac_path, ?e, "Failed to link boot config");
            }
        }
        debug!(node = node_uuid, ?config_path, macs = macs.len(), "Published boot config");
        Ok(config_path)
    }

    /// Removes the node's boot configuration and MAC links. Missing
    /// entries are ignored.
    pub async fn retract(&self, node_uuid: &str, macs: &[String]) {
        fs::unlink_without_raise(self.config_file_path(node_uuid)).await;
        for mac in macs {
            fs::unlink_without_raise(self.mac_path(mac)).await;
        }
    }

    /// DHCP options that make a node boot from this TFTP server.
    pub fn dhcp_boot_options(&self) -> Vec<DhcpOption> {
        [
            ("bootfile-name", &self.bootfile_name),
            ("server-ip-address", &self.tftp_server),
            ("tftp-server", &self.tftp_server),
        ]
        .into_iter()
        .map(|(name, value)| DhcpOption {
            opt_name: name.to_string(),
            opt_value: value.clone(),
        })
        .collect()
    }
}
