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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Root of a bootlink configuration file.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct BootlinkConfig {
    /// Settings of the conductor process itself.
    pub conductor: ConductorSpec,

    /// Network boot (PXE/TFTP) layout and boot parameters.
    pub pxe: PxeSpec,

    /// Download coordination of the shared master image caches.
    #[serde(default)]
    pub image_cache: ImageCacheSpec,

    /// Any global configurations that apply to all modules live here.
    pub global: Option<GlobalConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConductorSpec {
    /// URL of the API the deploy ramdisk posts its deploy info to.
    /// A trailing `/` is stripped before it is written into boot configs.
    /// Example: `http://10.0.0.1:6385/`
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub api_url: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PxeSpec {
    /// Additional append parameters for network boot.
    ///
    /// Default: "nofb nomodeset vga=normal"
    #[serde(
        default = "default_pxe_append_params",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub pxe_append_params: String,

    /// Template file used to render the per-node boot configuration.
    /// When unset the built-in pxelinux template is used.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub pxe_config_template: Option<String>,

    /// IP address of the TFTP server advertised to booting nodes.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub tftp_server: String,

    /// Root of the TFTP tree. Per-node kernels, ramdisks and configs live
    /// below `<tftp_root>/<node_uuid>/`.
    ///
    /// Default: "/tftpboot"
    #[serde(
        default = "default_tftp_root",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub tftp_root: String,

    /// Directory where per-node instance disk images are stored.
    ///
    /// Default: "/var/lib/bootlink/images"
    #[serde(
        default = "default_images_path",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub images_path: String,

    /// Directory holding the master copies of kernels and ramdisks. Must be
    /// on the same filesystem as `tftp_root` since per-node copies are hard
    /// links. Set to `null` to download every image per node.
    ///
    /// Default: "/tftpboot/master_images"
    #[serde(
        default = "default_tftp_master_path",
        deserialize_with = "convert_optional_string_with_shellexpand"
    )]
    pub tftp_master_path: Option<String>,

    /// Directory holding the master copies of instance disk images. Must be
    /// on the same filesystem as `images_path`. Set to `null` to disable
    /// sharing.
    ///
    /// Default: "/var/lib/bootlink/master_images"
    #[serde(
        default = "default_instance_master_path",
        deserialize_with = "convert_optional_string_with_shellexpand"
    )]
    pub instance_master_path: Option<String>,

    /// Bootfile name handed out in the DHCP options.
    ///
    /// Default: "pxelinux.0"
    #[serde(
        default = "default_pxe_bootfile_name",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub pxe_bootfile_name: String,
}

impl PxeSpec {
    /// A PXE section with every default applied and the given TFTP server address.
    pub fn with_tftp_server(tftp_server: impl Into<String>) -> Self {
        Self {
            pxe_append_params: default_pxe_append_params(),
            pxe_config_template: None,
            tftp_server: tftp_server.into(),
            tftp_root: default_tftp_root(),
            images_path: default_images_path(),
            tftp_master_path: default_tftp_master_path(),
            instance_master_path: default_instance_master_path(),
            pxe_bootfile_name: default_pxe_bootfile_name(),
        }
    }
}

fn default_pxe_append_params() -> String {
    "nofb nomodeset vga=normal".to_string()
}

fn default_tftp_root() -> String {
    "/tftpboot".to_string()
}

fn default_images_path() -> String {
    "/var/lib/bootlink/images".to_string()
}

#[expect(
    clippy::unnecessary_wraps,
    reason = "serde default for an optional field"
)]
fn default_tftp_master_path() -> Option<String> {
    Some("/tftpboot/master_images".to_string())
}

#[expect(
    clippy::unnecessary_wraps,
    reason = "serde default for an optional field"
)]
fn default_instance_master_path() -> Option<String> {
    Some("/var/lib/bootlink/master_images".to_string())
}

fn default_pxe_bootfile_name() -> String {
    "pxelinux.0".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ImageCacheSpec {
    /// How often a caller waiting on another caller's download checks
    /// whether the download marker is gone.
    ///
    /// Default: 1000 (1 second)
    #[serde(
        default = "default_download_poll_interval_millis",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub download_poll_interval_millis: u64,

    /// Upper bound on how long a caller waits for another caller's
    /// download. Zero waits forever, which will hang callers behind a
    /// wedged downloader.
    ///
    /// Default: 0 (wait forever)
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub download_wait_timeout_secs: u64,

    /// Retry policy applied to image fetches.
    ///
    /// Default: no retries.
    #[serde(default)]
    pub fetch_retry: Retry,
}

impl Default for ImageCacheSpec {
    fn default() -> Self {
        Self {
            download_poll_interval_millis: default_download_poll_interval_millis(),
            download_wait_timeout_secs: 0,
            fetch_retry: Retry::default(),
        }
    }
}

const fn default_download_poll_interval_millis() -> u64 {
    1000
}

/// Retry configuration. This configuration is exponential and each iteration
/// a jitter as a percentage is applied of the calculated delay. For example:
/// ```haskell
/// Retry{
///   max_retries: 7,
///   delay: 0.1,
///   jitter: 0.5,
/// }
/// ```
/// will result in:
/// Attempt - Delay
/// 1         0ms
/// 2         75ms - 125ms
/// 3         150ms - 250ms
/// 4         300ms - 500ms
/// 5         600ms - 1s
/// 6         1.2s - 2s
/// 7         2.4s - 4s
/// 8         4.8s - 8s
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default)]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form. This will
    /// change the formula like:
    /// ```haskell
    /// random(
    ///    (2 ^ {attempt_number}) * {delay} * (1 - (jitter / 2)),
    ///    (2 ^ {attempt_number}) * {delay} * (1 + (jitter / 2)),
    /// )
    /// ```
    #[serde(default)]
    pub jitter: f32,

    /// A list of error codes to retry on, if this is not set then the default
    /// error codes to retry on are used. These default codes are the most
    /// likely to be non-permanent.
    ///  - `Unknown`
    ///  - `Cancelled`
    ///  - `DeadlineExceeded`
    ///  - `ResourceExhausted`
    ///  - `Aborted`
    ///  - `Internal`
    ///  - `Unavailable`
    ///  - `DataLoss`
    #[serde(default)]
    pub retry_on_errors: Option<Vec<ErrorCode>>,
}

/// The possible error codes that might occur on an upstream request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
    // Note: This list is duplicated from bootlink-error/lib.rs.
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Maximum number of open files that can be opened at one time.
    /// This value is not strictly enforced, it is a best effort. Some
    /// filesystem calls made by libraries do not obey this limit, however
    /// every image cache and boot config operation honors it.
    /// Note: This value must be greater than 10.
    ///
    /// Default: 512
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_open_files: usize,
}
