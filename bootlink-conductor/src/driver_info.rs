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

use bootlink_error::{Error, make_input_err};

use crate::node::Node;

pub const IMAGE_SOURCE: &str = "pxe_image_source";
pub const DEPLOY_KERNEL: &str = "pxe_deploy_kernel";
pub const DEPLOY_RAMDISK: &str = "pxe_deploy_ramdisk";
pub const ROOT_GB: &str = "pxe_root_gb";
pub const SWAP_MB: &str = "pxe_swap_mb";
pub const EPHEMERAL_GB: &str = "pxe_ephemeral_gb";
pub const EPHEMERAL_FORMAT: &str = "pxe_ephemeral_format";
pub const PRESERVE_EPHEMERAL: &str = "pxe_preserve_ephemeral";
/// Written by the conductor when it publishes a boot config.
pub const DEPLOY_KEY: &str = "pxe_deploy_key";

const DEFAULT_SWAP_MB: u64 = 1;
const DEFAULT_EPHEMERAL_GB: u64 = 0;
const MB_PER_GB: u64 = 1024;

const TRUE_STRINGS: [&str; 6] = ["1", "t", "true", "on", "y", "yes"];
const FALSE_STRINGS: [&str; 6] = ["0", "f", "false", "off", "n", "no"];

/// Validated PXE settings of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PxeDriverInfo {
    pub image_source: String,
    pub deploy_kernel: String,
    pub deploy_ramdisk: String,
    pub root_gb: u64,
    pub root_mb: u64,
    pub swap_mb: u64,
    pub ephemeral_gb: u64,
    pub ephemeral_mb: u64,
    pub ephemeral_format: Option<String>,
    pub preserve_ephemeral: bool,
    pub deploy_key: Option<String>,
}

fn non_empty<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.driver_info
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}

fn not_an_integer(key: &str, value: &str) -> Error {
    make_input_err!(
        "Can not validate PXE bootloader. Invalid parameter {key}. Reason: '{value}' is not an integer value."
    )
}

fn parse_int(key: &str, value: &str) -> Result<u64, Error> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| not_an_integer(key, value))
}

/// Parses a size in GB and returns it with its MB equivalent. Sizes whose
/// MB value does not fit are rejected like any other non-integer.
fn parse_gb(key: &str, value: &str) -> Result<(u64, u64), Error> {
    let gb = parse_int(key, value)?;
    let mb = gb
        .checked_mul(MB_PER_GB)
        .ok_or_else(|| not_an_integer(key, value))?;
    Ok((gb, mb))
}

fn parse_strict_bool(key: &str, value: &str) -> Result<bool, Error> {
    let lowered = value.trim().to_lowercase();
    if TRUE_STRINGS.contains(&lowered.as_str()) {
        Ok(true)
    } else if FALSE_STRINGS.contains(&lowered.as_str()) {
        Ok(false)
    } else {
        Err(make_input_err!(
            "Can not validate PXE bootloader. Invalid parameter {key}. Reason: Unrecognized value '{value}', acceptable values are: {}",
            TRUE_STRINGS
                .iter()
                .chain(FALSE_STRINGS.iter())
                .map(|s| format!("'{s}'"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

/// Validates and extracts the PXE settings from a node's driver info.
pub fn parse_driver_info(node: &Node) -> Result<PxeDriverInfo, Error> {
    let required = [IMAGE_SOURCE, DEPLOY_KERNEL, DEPLOY_RAMDISK, ROOT_GB];
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|key| non_empty(node, key).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(make_input_err!(
            "Can not validate PXE bootloader. The following parameters were not passed to the conductor: {missing:?}"
        ));
    }
    let required_value = |key| non_empty(node, key).unwrap_or_default().to_string();

    let (root_gb, root_mb) = parse_gb(ROOT_GB, &required_value(ROOT_GB))?;
    let swap_mb = non_empty(node, SWAP_MB)
        .map(|v| parse_int(SWAP_MB, v))
        .transpose()?
        .unwrap_or(DEFAULT_SWAP_MB);
    let (ephemeral_gb, ephemeral_mb) = non_empty(node, EPHEMERAL_GB)
        .map(|v| parse_gb(EPHEMERAL_GB, v))
        .transpose()?
        .unwrap_or((DEFAULT_EPHEMERAL_GB, DEFAULT_EPHEMERAL_GB * MB_PER_GB));
    let ephemeral_format = non_empty(node, EPHEMERAL_FORMAT).map(str::to_string);
    if ephemeral_gb > 0 && ephemeral_format.is_none() {
        return Err(make_input_err!(
            "The deploy contains an ephemeral partition, but no filesystem type was specified by the {EPHEMERAL_FORMAT} parameter"
        ));
    }
    let preserve_ephemeral = non_empty(node, PRESERVE_EPHEMERAL)
        .map(|v| parse_strict_bool(PRESERVE_EPHEMERAL, v))
        .transpose()?
        .unwrap_or(false);

    Ok(PxeDriverInfo {
        image_source: required_value(IMAGE_SOURCE),
        deploy_kernel: required_value(DEPLOY_KERNEL),
        deploy_ramdisk: required_value(DEPLOY_RAMDISK),
        root_gb,
        root_mb,
        swap_mb,
        ephemeral_gb,
        ephemeral_mb,
        ephemeral_format,
        preserve_ephemeral,
        deploy_key: non_empty(node, DEPLOY_KEY).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use bootlink_error::Code;
    use pretty_assertions::assert_eq;

    use super::*;

    fn node_with(pairs: &[(&str, &str)]) -> Node {
        let mut node = Node::new("1be26c0b-03f2-4d2e-ae87-c02d7f33c123");
        for (key, value) in pairs {
            node.driver_info
                .insert((*key).to_string(), (*value).to_string());
        }
        node
    }

    fn complete() -> Vec<(&'static str, &'static str)> {
        vec![
            (IMAGE_SOURCE, "img-1"),
            (DEPLOY_KERNEL, "k-1"),
            (DEPLOY_RAMDISK, "r-1"),
            (ROOT_GB, "10"),
        ]
    }

    #[test]
    fn defaults_applied() {
        let info = parse_driver_info(&node_with(&complete())).unwrap();
        assert_eq!(info.root_gb, 10);
        assert_eq!(info.root_mb, 10 * 1024);
        assert_eq!(info.swap_mb, 1);
        assert_eq!(info.ephemeral_gb, 0);
        assert_eq!(info.ephemeral_mb, 0);
        assert_eq!(info.ephemeral_format, None);
        assert!(!info.preserve_ephemeral);
        assert_eq!(info.deploy_key, None);
    }

    #[test]
    fn all_missing_are_reported() {
        let err = parse_driver_info(&node_with(&[(ROOT_GB, "10")])).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        let msg = err.message_string();
        assert!(msg.contains(IMAGE_SOURCE), "{msg}");
        assert!(msg.contains(DEPLOY_KERNEL), "{msg}");
        assert!(msg.contains(DEPLOY_RAMDISK), "{msg}");
        assert!(!msg.contains(ROOT_GB), "{msg}");
    }

    #[test]
    fn non_integer_rejected() {
        for key in [ROOT_GB, SWAP_MB, EPHEMERAL_GB] {
            let mut pairs = complete();
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, "ten"));
            let err = parse_driver_info(&node_with(&pairs)).unwrap_err();
            assert_eq!(err.code, Code::InvalidArgument);
            assert!(err.message_string().contains(key));
        }
    }

    #[test]
    fn ephemeral_requires_format() {
        let mut pairs = complete();
        pairs.push((EPHEMERAL_GB, "20"));
        assert!(parse_driver_info(&node_with(&pairs)).is_err());
        pairs.push((EPHEMERAL_FORMAT, "ext4"));
        let info = parse_driver_info(&node_with(&pairs)).unwrap();
        assert_eq!(info.ephemeral_gb, 20);
        assert_eq!(info.ephemeral_mb, 20 * 1024);
        assert_eq!(info.ephemeral_format.as_deref(), Some("ext4"));
    }

    #[test]
    fn sizes_overflowing_mb_rejected() {
        // 2^54 GB is a valid u64 but not in MB.
        let huge = "18014398509481984";
        for key in [ROOT_GB, EPHEMERAL_GB] {
            let mut pairs = complete();
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, huge));
            pairs.push((EPHEMERAL_FORMAT, "ext4"));
            let err = parse_driver_info(&node_with(&pairs)).unwrap_err();
            assert_eq!(err.code, Code::InvalidArgument);
            let msg = err.message_string();
            assert!(
                msg.contains(&format!("Invalid parameter {key}. Reason: '{huge}' is not an integer value.")),
                "{msg}"
            );
        }

        let mut pairs = complete();
        pairs.retain(|(k, _)| *k != ROOT_GB);
        pairs.push((ROOT_GB, "18014398509481983"));
        let info = parse_driver_info(&node_with(&pairs)).unwrap();
        assert_eq!(info.root_mb, 18_014_398_509_481_983 * 1024);
    }

    #[test]
    fn preserve_ephemeral_is_strict() {
        let mut pairs = complete();
        pairs.push((PRESERVE_EPHEMERAL, "Yes"));
        assert!(parse_driver_info(&node_with(&pairs)).unwrap().preserve_ephemeral);
        pairs.pop();
        pairs.push((PRESERVE_EPHEMERAL, "maybe"));
        let err = parse_driver_info(&node_with(&pairs)).unwrap_err();
        assert!(err.message_string().contains("Unrecognized value 'maybe'"));
    }
}
