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
use std::collections::HashMap;
use std::sync::Arc;

use bootlink_error::{Code, Error, make_err};
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

/// Each name maps to its lock and the number of live guards and waiters.
type Registry = Arc<Mutex<HashMap<String, (Arc<RwLock<()>>, usize)>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Process wide registry of named locks.
///
/// Locks are created the first time a name is requested and dropped from
/// the registry once nobody holds or waits on them, so the registry only
/// ever contains names that are in use.
#[derive(Clone, Default)]
pub struct LockBroker {
    registry: Registry,
}

impl fmt::Debug for LockBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBroker")
            .field("active_locks", &self.len())
            .finish()
    }
}

impl LockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> RegistryEntry {
        let lock = {
            let mut registry = self.registry.lock();
            let (lock, users) = registry
                .entry(name.to_string())
                .or_insert_with(|| (Arc::new(RwLock::new(())), 0));
            *users += 1;
            lock.clone()
        };
        RegistryEntry {
            name: name.to_string(),
            lock,
            registry: self.registry.clone(),
        }
    }

    /// Waits until `name` can be held in `mode`.
    pub async fn acquire(&self, name: &str, mode: LockMode) -> NamedLockGuard {
        let entry = self.entry(name);
        trace!(name, ?mode, "Acquiring lock");
        let held = match mode {
            LockMode::Exclusive => HeldLock::Exclusive(entry.lock.clone().write_owned().await),
            LockMode::Shared => HeldLock::Shared(entry.lock.clone().read_owned().await),
        };
        NamedLockGuard {
            mode,
            held: Some(held),
            entry,
        }
    }

    /// Like `acquire`, but fails with `Aborted` instead of waiting.
    pub fn try_acquire(&self, name: &str, mode: LockMode) -> Result<NamedLockGuard, Error> {
        let entry = self.entry(name);
        let held = match mode {
            LockMode::Exclusive => entry
                .lock
                .clone()
                .try_write_owned()
                .map(HeldLock::Exclusive),
            LockMode::Shared => entry.lock.clone().try_read_owned().map(HeldLock::Shared),
        }
        .map_err(|_| make_err!(Code::Aborted, "Lock '{name}' is held by another operation"))?;
        Ok(NamedLockGuard {
            mode,
            held: Some(held),
            entry,
        })
    }

    /// Whether `name` is currently held exclusively or shared.
    pub fn is_locked(&self, name: &str) -> bool {
        self.registry
            .lock()
            .get(name)
            .is_some_and(|(lock, _)| lock.try_write().is_err())
    }

    /// Number of names currently held or waited on.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum HeldLock {
    Exclusive(OwnedRwLockWriteGuard<()>),
    Shared(OwnedRwLockReadGuard<()>),
}

/// A reference into the registry. Removes the name once the last
/// reference goes away, including waiters that were cancelled.
struct RegistryEntry {
    name: String,
    lock: Arc<RwLock<()>>,
    registry: Registry,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if let Some((_, users)) = registry.get_mut(&self.name) {
            *users -= 1;
            if *users == 0 {
                registry.remove(&self.name);
            }
        }
    }
}

/// A held named lock. Released when dropped.
#[must_use]
pub struct NamedLockGuard {
    mode: LockMode,
    // Must be released before `entry` so the registry sees the final count.
    held: Option<HeldLock>,
    entry: RegistryEntry,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Fails unless this guard holds `name` exclusively. Used by code that
    /// must run inside a critical section its caller already entered.
    pub fn ensure_exclusive(&self, name: &str) -> Result<(), Error> {
        if self.name() == name && matches!(self.held, Some(HeldLock::Exclusive(_))) {
            return Ok(());
        }
        Err(make_err!(
            Code::FailedPrecondition,
            "Expected exclusive lock '{name}', but holding {:?} lock '{}'",
            self.mode,
            self.name()
        ))
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        trace!(name = self.name(), "Released lock");
    }
}

impl fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name())
            .field("mode", &self.mode)
            .finish()
    }
}
