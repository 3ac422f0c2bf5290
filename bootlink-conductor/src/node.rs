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

use std::collections::BTreeMap;

use bootlink_error::{Error, ResultExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::PowerDriver;
use crate::states::{PowerState, ProvisionState};
use crate::task_manager::Task;

/// Key in a port's `extra` map naming its virtual interface.
pub const VIF_PORT_ID: &str = "vif_port_id";

/// A physical machine under provisioning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    pub instance_uuid: Option<String>,
    pub provision_state: ProvisionState,
    pub target_provision_state: ProvisionState,
    pub power_state: Option<PowerState>,
    /// Driver specific settings. Values are kept as the strings the
    /// operator supplied and validated on use.
    pub driver_info: BTreeMap<String, String>,
    pub last_error: Option<String>,
}

impl Node {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            instance_uuid: None,
            provision_state: ProvisionState::Available,
            target_provision_state: ProvisionState::NoState,
            power_state: None,
            driver_info: BTreeMap::new(),
            last_error: None,
        }
    }

    /// Moves to `next` with the given target, rejecting illegal moves
    /// without touching the node.
    pub fn transition(
        &mut self,
        next: ProvisionState,
        target: ProvisionState,
    ) -> Result<(), Error> {
        self.provision_state = self
            .provision_state
            .check_transition(next)
            .err_tip(|| format!("For node {}", self.uuid))?;
        self.target_provision_state = target;
        Ok(())
    }
}

/// A network interface of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub uuid: String,
    pub node_uuid: String,
    /// Hardware address, `xx:xx:xx:xx:xx:xx`.
    pub address: String,
    pub extra: BTreeMap<String, String>,
}

impl Port {
    pub fn vif_port_id(&self) -> Option<&str> {
        self.extra
            .get(VIF_PORT_ID)
            .map(String::as_str)
            .filter(|vif| !vif.is_empty())
    }
}

/// Changes the power state of the task's node and persists the outcome.
///
/// On success the new power state is recorded and `last_error` is cleared.
/// On failure `last_error` describes the failure and the error is returned.
pub async fn node_power_action(
    task: &mut Task,
    power: &dyn PowerDriver,
    state: PowerState,
) -> Result<(), Error> {
    task.require_exclusive_lock("node_power_action")?;
    let ctx = task.context().clone();

    if state != PowerState::Reboot {
        let current = power
            .get_power_state(&ctx, task.node())
            .await
            .err_tip(|| format!("Getting power state of node {}", task.node().uuid))?;
        if current == state {
            info!(node = %task.node().uuid, %state, "Node already in requested power state");
            let node = task.node_mut()?;
            node.power_state = Some(current);
            node.last_error = None;
            return task.save_node().await;
        }
    }

    let result = power.set_power_state(&ctx, task.node(), state).await;
    let node = task.node_mut()?;
    match result {
        Ok(()) => {
            node.power_state = Some(if state == PowerState::Reboot {
                PowerState::PowerOn
            } else {
                state
            });
            node.last_error = None;
            info!(node = %node.uuid, %state, "Power action succeeded");
            task.save_node().await
        }
        Err(err) => {
            warn!(node = %node.uuid, %state, ?err, "Power action failed");
            node.last_error = Some(format!(
                "Failed to change power state to '{state}'. Error: {}",
                err.message_string()
            ));
            if let Err(save_err) = task.save_node().await {
                return Err(err.merge(save_err));
            }
            Err(err)
        }
    }
}
