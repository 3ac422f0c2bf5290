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

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use bootlink_conductor::collaborators::RequestContext;
use bootlink_conductor::lock_broker::LockBroker;
use bootlink_conductor::memory_inventory::MemoryInventory;
use bootlink_conductor::node::node_power_action;
use bootlink_conductor::states::PowerState;
use bootlink_conductor::task_manager::{TaskManager, node_lock_name};
use bootlink_error::{Code, Error};
use bootlink_macro::bootlink_test;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use utils::mock_collaborators::{
    MockPower, NODE_UUID, OTHER_NODE_UUID, OverlapDetector, make_node, make_port,
};

mod utils {
    pub(crate) mod mock_collaborators;
}

fn make_manager() -> (TaskManager, Arc<MemoryInventory>) {
    let inventory = Arc::new(MemoryInventory::new());
    inventory.add_node(make_node(NODE_UUID));
    inventory.add_port(make_port(NODE_UUID, 1, Some("vif-1")));
    inventory.add_port(make_port(NODE_UUID, 2, None));
    inventory.add_node(make_node(OTHER_NODE_UUID));
    (
        TaskManager::new(LockBroker::new(), inventory.clone()),
        inventory,
    )
}

#[bootlink_test]
async fn task_exposes_node_and_ports() -> Result<(), Error> {
    let (manager, _inventory) = make_manager();
    let task = manager
        .acquire(RequestContext::default(), NODE_UUID, false)
        .await?;

    assert_eq!(task.node().uuid, NODE_UUID);
    assert!(!task.is_shared());
    assert_eq!(
        task.mac_addresses(),
        vec!["52:54:00:AB:CD:01".to_string(), "52:54:00:AB:CD:02".to_string()]
    );
    assert_eq!(
        task.vif_ids(),
        BTreeMap::from([(format!("port-1-{NODE_UUID}"), "vif-1".to_string())])
    );
    assert!(manager.lock_broker().is_locked(&node_lock_name(NODE_UUID)));

    drop(task);
    assert!(manager.lock_broker().is_empty());
    Ok(())
}

#[bootlink_test]
async fn shared_task_cannot_modify_node() -> Result<(), Error> {
    let (manager, _inventory) = make_manager();
    let mut first = manager
        .acquire(RequestContext::default(), NODE_UUID, true)
        .await?;
    let second = manager
        .try_acquire(RequestContext::default(), NODE_UUID, true)
        .await?;
    assert!(first.is_shared() && second.is_shared());

    assert_eq!(first.node_mut().unwrap_err().code, Code::FailedPrecondition);
    assert_eq!(
        first.save_node().await.unwrap_err().code,
        Code::FailedPrecondition
    );
    assert_eq!(
        first.require_exclusive_lock("deploy").unwrap_err().code,
        Code::FailedPrecondition
    );

    let err = manager
        .try_acquire(RequestContext::default(), NODE_UUID, false)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Aborted);
    Ok(())
}

#[bootlink_test]
async fn exclusive_task_persists_changes() -> Result<(), Error> {
    let (manager, inventory) = make_manager();
    let mut task = manager
        .acquire(RequestContext::default(), NODE_UUID, false)
        .await?;
    task.node_mut()?.last_error = Some("boom".to_string());
    task.save_node().await?;
    assert_eq!(
        inventory.node(NODE_UUID).and_then(|node| node.last_error),
        Some("boom".to_string())
    );

    // Other nodes are not affected by this node's lock.
    let _other = manager
        .try_acquire(RequestContext::default(), OTHER_NODE_UUID, false)
        .await?;
    Ok(())
}

#[bootlink_test]
async fn unknown_node_releases_lock() -> Result<(), Error> {
    let (manager, _inventory) = make_manager();
    let err = manager
        .acquire(RequestContext::default(), "missing", false)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    assert!(manager.lock_broker().is_empty());
    Ok(())
}

#[bootlink_test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_tasks_on_one_node_never_overlap() -> Result<(), Error> {
    let (manager, _inventory) = make_manager();
    let detector = Arc::new(OverlapDetector::default());

    let handles = (0..16).map(|_| {
        let manager = manager.clone();
        let detector = detector.clone();
        tokio::spawn(async move {
            let _task = manager
                .acquire(RequestContext::default(), NODE_UUID, false)
                .await?;
            detector.enter();
            tokio::time::sleep(Duration::from_millis(1)).await;
            detector.exit();
            Ok::<_, Error>(())
        })
    });
    for result in join_all(handles).await {
        result??;
    }
    assert_eq!(detector.max_running(), 1);
    Ok(())
}

#[bootlink_test]
async fn power_action_records_outcome() -> Result<(), Error> {
    let (manager, inventory) = make_manager();
    let power = MockPower::default();
    let mut task = manager
        .acquire(RequestContext::default(), NODE_UUID, false)
        .await?;

    node_power_action(&mut task, &power, PowerState::Reboot).await?;
    assert_eq!(task.node().power_state, Some(PowerState::PowerOn));
    assert_eq!(task.node().last_error, None);

    // Already on: nothing is requested.
    node_power_action(&mut task, &power, PowerState::PowerOn).await?;
    assert_eq!(power.requests(), vec![PowerState::Reboot]);

    power.fail_on(PowerState::PowerOff);
    let err = node_power_action(&mut task, &power, PowerState::PowerOff)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Internal);
    let stored = inventory.node(NODE_UUID).and_then(|node| node.last_error);
    assert!(
        stored
            .as_deref()
            .is_some_and(|msg| msg.starts_with("Failed to change power state to 'power off'. Error: ")),
        "{stored:?}"
    );
    Ok(())
}

#[bootlink_test]
async fn power_action_needs_exclusive_lock() -> Result<(), Error> {
    let (manager, _inventory) = make_manager();
    let power = MockPower::default();
    let mut task = manager
        .acquire(RequestContext::default(), NODE_UUID, true)
        .await?;
    let err = node_power_action(&mut task, &power, PowerState::PowerOn)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    assert!(power.requests().is_empty());
    Ok(())
}
