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
use std::sync::Arc;

use bootlink_error::{Code, Error, ResultExt, make_err};
use tracing::debug;

use crate::collaborators::{Inventory, RequestContext};
use crate::lock_broker::{LockBroker, LockMode, NamedLockGuard};
use crate::node::{Node, Port};

/// Name of the lock serializing operations on a node.
pub fn node_lock_name(node_uuid: &str) -> String {
    format!("node-{node_uuid}")
}

/// Hands out node-scoped tasks.
#[derive(Clone)]
pub struct TaskManager {
    locks: LockBroker,
    inventory: Arc<dyn Inventory>,
}

impl core::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskManager")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    pub const fn new(locks: LockBroker, inventory: Arc<dyn Inventory>) -> Self {
        Self { locks, inventory }
    }

    pub const fn lock_broker(&self) -> &LockBroker {
        &self.locks
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    /// Waits for the node's lock, then loads the node and its ports.
    pub async fn acquire(
        &self,
        ctx: RequestContext,
        node_uuid: &str,
        shared: bool,
    ) -> Result<Task, Error> {
        let lock = self
            .locks
            .acquire(&node_lock_name(node_uuid), Self::mode(shared))
            .await;
        self.load(ctx, node_uuid, shared, lock).await
    }

    /// Like `acquire`, but fails with `Aborted` if the node is locked.
    pub async fn try_acquire(
        &self,
        ctx: RequestContext,
        node_uuid: &str,
        shared: bool,
    ) -> Result<Task, Error> {
        let lock = self
            .locks
            .try_acquire(&node_lock_name(node_uuid), Self::mode(shared))
            .err_tip(|| format!("Node {node_uuid} is locked"))?;
        self.load(ctx, node_uuid, shared, lock).await
    }

    const fn mode(shared: bool) -> LockMode {
        if shared {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    async fn load(
        &self,
        ctx: RequestContext,
        node_uuid: &str,
        shared: bool,
        lock: NamedLockGuard,
    ) -> Result<Task, Error> {
        let node = self
            .inventory
            .get_node(node_uuid)
            .await
            .err_tip(|| format!("Loading node {node_uuid} for task"))?;
        let ports = self
            .inventory
            .get_ports(node_uuid)
            .await
            .err_tip(|| format!("Loading ports of node {node_uuid}"))?;
        debug!(node = node_uuid, shared, ports = ports.len(), "Task started");
        Ok(Task {
            context: ctx,
            node,
            ports,
            shared,
            inventory: self.inventory.clone(),
            _lock: lock,
        })
    }
}

/// A node, its ports and the lock on the node. The lock is released when
/// the task is dropped.
pub struct Task {
    context: RequestContext,
    node: Node,
    ports: Vec<Port>,
    shared: bool,
    inventory: Arc<dyn Inventory>,
    _lock: NamedLockGuard,
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("node", &self.node.uuid)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub const fn context(&self) -> &RequestContext {
        &self.context
    }

    pub const fn node(&self) -> &Node {
        &self.node
    }

    /// Fails with `FailedPrecondition` under a shared lock.
    pub fn node_mut(&mut self) -> Result<&mut Node, Error> {
        self.require_exclusive_lock("modify node")?;
        Ok(&mut self.node)
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn mac_addresses(&self) -> Vec<String> {
        self.ports.iter().map(|port| port.address.clone()).collect()
    }

    /// Port uuid to VIF id, for ports bound to a VIF.
    pub fn vif_ids(&self) -> BTreeMap<String, String> {
        self.ports
            .iter()
            .filter_map(|port| {
                port.vif_port_id()
                    .map(|vif| (port.uuid.clone(), vif.to_string()))
            })
            .collect()
    }

    pub fn require_exclusive_lock(&self, operation: &str) -> Result<(), Error> {
        if self.shared {
            return Err(make_err!(
                Code::FailedPrecondition,
                "{operation} requires an exclusive lock on node {}",
                self.node.uuid
            ));
        }
        Ok(())
    }

    /// Persists the node through the inventory.
    pub async fn save_node(&self) -> Result<(), Error> {
        self.require_exclusive_lock("save node")?;
        self.inventory
            .save_node(&self.node)
            .await
            .err_tip(|| format!("Saving node {}", self.node.uuid))
    }
}
