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

use core::fmt;

use bootlink_error::{Code, Error, make_err};
use serde::{Deserialize, Serialize};

/// Provisioning lifecycle stage of a node.
///
/// ```text
///  Available ──► Deploying ──► DeployWait ──► Deploying ──► Active
///      ▲             │              │                         │
///      │             ▼              ▼                         │
///   Deleted ◄── DeployFail ◄────────┘                         │
///      ▲                                                      │
///      └──────────────────── tear down ───────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// No outstanding target. Only meaningful as a target state.
    NoState,
    Available,
    Deploying,
    /// Booted into the deploy ramdisk, waiting for its callback.
    DeployWait,
    DeployFail,
    Active,
    Deleted,
}

impl ProvisionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoState => "none",
            Self::Available => "available",
            Self::Deploying => "deploying",
            Self::DeployWait => "wait call-back",
            Self::DeployFail => "deploy failed",
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    /// Whether a node in `self` may move to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Available | Self::Deleted, Self::Deploying)
                | (
                    Self::Deploying,
                    Self::DeployWait | Self::Active | Self::DeployFail
                )
                | (Self::DeployWait, Self::Deploying | Self::DeployFail)
                | (
                    Self::Active | Self::DeployFail | Self::DeployWait,
                    Self::Deleted
                )
        )
    }

    /// Returns `next` if the move is legal, otherwise a `FailedPrecondition`.
    pub fn check_transition(self, next: Self) -> Result<Self, Error> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(make_err!(
                Code::FailedPrecondition,
                "Illegal provision state transition from '{self}' to '{next}'"
            ))
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PowerOn,
    PowerOff,
    /// Requested action only. A rebooted node reports `PowerOn`.
    Reboot,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PowerOn => "power on",
            Self::PowerOff => "power off",
            Self::Reboot => "rebooting",
        })
    }
}
