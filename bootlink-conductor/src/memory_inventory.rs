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

use std::collections::HashMap;

use async_trait::async_trait;
use bootlink_error::{Code, Error, make_err};
use parking_lot::Mutex;

use crate::collaborators::Inventory;
use crate::node::{Node, Port};

/// In-process node inventory.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    nodes: Mutex<HashMap<String, Node>>,
    ports: Mutex<HashMap<String, Vec<Port>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node.
    pub fn add_node(&self, node: Node) {
        self.nodes.lock().insert(node.uuid.clone(), node);
    }

    pub fn add_port(&self, port: Port) {
        self.ports
            .lock()
            .entry(port.node_uuid.clone())
            .or_default()
            .push(port);
    }

    /// Snapshot of a stored node.
    pub fn node(&self, node_uuid: &str) -> Option<Node> {
        self.nodes.lock().get(node_uuid).cloned()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn get_node(&self, node_uuid: &str) -> Result<Node, Error> {
        self.node(node_uuid)
            .ok_or_else(|| make_err!(Code::NotFound, "Node {node_uuid} could not be found"))
    }

    async fn save_node(&self, node: &Node) -> Result<(), Error> {
        let mut nodes = self.nodes.lock();
        let Some(stored) = nodes.get_mut(&node.uuid) else {
            return Err(make_err!(
                Code::NotFound,
                "Node {} could not be found",
                node.uuid
            ));
        };
        stored.clone_from(node);
        Ok(())
    }

    async fn get_ports(&self, node_uuid: &str) -> Result<Vec<Port>, Error> {
        Ok(self
            .ports
            .lock()
            .get(node_uuid)
            .cloned()
            .unwrap_or_default())
    }
}
