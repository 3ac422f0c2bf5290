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

pub mod boot_config;
pub mod collaborators;
pub mod conductor;
pub mod driver_info;
pub mod image_cache;
pub mod lock_broker;
pub mod memory_inventory;
pub mod node;
pub mod pxe_deploy;
pub mod states;
pub mod task_manager;
pub mod vendor_passthru;
