// Resumable chunked array transport over non-blocking sockets.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Pool of reusable connection handlers.

use std::fmt::{self, Debug, Formatter};

use crate::connection::ConnectionInfo;
use crate::error::PoolError;

/// Items which can be returned to a [`Pool`] and handed out again.
pub trait Recycle {
    /// Clears all the state of the previous use.
    fn recycle(&mut self);
}

/// Handle of a pool item.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("#{0}")]
pub struct PoolKey(usize);

impl PoolKey {
    pub fn index(self) -> usize { self.0 }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct PoolConfig {
    /// Cap on the number of items, busy and idle together. `None` for an unbounded pool.
    pub limit: Option<usize>,
}

impl PoolConfig {
    pub fn limited(limit: usize) -> Self { PoolConfig { limit: Some(limit) } }
    pub fn unlimited() -> Self { PoolConfig { limit: None } }
}

/// Items are never dropped individually: once constructed they stay in the pool and move
/// between the busy and the idle sets.
pub struct Pool<T: Recycle> {
    items: Vec<T>,
    busy: Vec<bool>,
    idle: Vec<usize>,
    limit: Option<usize>,
    factory: Box<dyn FnMut() -> T + Send>,
}

impl<T: Recycle> Debug for Pool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("limit", &self.limit)
            .field("busy", &self.busy())
            .field("idle", &self.idle())
            .finish()
    }
}

impl<T: Recycle> Pool<T> {
    pub fn new(config: PoolConfig, factory: impl FnMut() -> T + Send + 'static) -> Self {
        Pool {
            items: empty!(),
            busy: empty!(),
            idle: empty!(),
            limit: config.limit,
            factory: Box::new(factory),
        }
    }

    /// Hands out the most recently recycled idle item or, if there is none, constructs a new one.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] if all the items are busy and the limit is reached.
    pub fn acquire(&mut self) -> Result<PoolKey, PoolError> {
        if let Some(index) = self.idle.pop() {
            self.busy[index] = true;
            #[cfg(feature = "log")]
            log::trace!(target: "pool", "Reusing idle item #{index}");
            return Ok(PoolKey(index));
        }
        if let Some(limit) = self.limit {
            if self.items.len() >= limit {
                #[cfg(feature = "log")]
                log::warn!(target: "pool", "Pool is exhausted: all {limit} items are busy");
                return Err(PoolError::Exhausted(limit));
            }
        }
        let index = self.items.len();
        self.items.push((self.factory)());
        self.busy.push(true);
        #[cfg(feature = "log")]
        log::debug!(target: "pool", "Constructed item #{index}");
        Ok(PoolKey(index))
    }

    /// Resets the item and returns it to the idle set.
    ///
    /// # Panics
    ///
    /// If the item is not busy.
    pub fn recycle(&mut self, key: PoolKey) {
        assert!(self.is_busy(key), "item {key} is recycled while not in use");
        self.items[key.0].recycle();
        self.busy[key.0] = false;
        self.idle.push(key.0);
        #[cfg(feature = "log")]
        log::trace!(target: "pool", "Item {key} returned to the pool");
    }

    pub fn is_busy(&self, key: PoolKey) -> bool { self.busy.get(key.0).copied().unwrap_or_default() }

    pub fn get(&self, key: PoolKey) -> Option<&T> {
        if self.is_busy(key) {
            self.items.get(key.0)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, key: PoolKey) -> Option<&mut T> {
        if self.is_busy(key) {
            self.items.get_mut(key.0)
        } else {
            None
        }
    }

    pub fn limit(&self) -> Option<usize> { self.limit }

    pub fn is_limited(&self) -> bool { self.limit.is_some() }

    pub fn busy(&self) -> usize { self.items.len() - self.idle.len() }

    pub fn idle(&self) -> usize { self.idle.len() }

    /// Items constructed so far.
    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn busy_keys(&self) -> impl Iterator<Item = PoolKey> + '_ {
        self.busy.iter().enumerate().filter(|(_, busy)| **busy).map(|(index, _)| PoolKey(index))
    }

    /// Read-only views of the busy items, for diagnostics.
    pub fn iter_busy(&self) -> impl Iterator<Item = &dyn ConnectionInfo> + '_
    where T: ConnectionInfo {
        self.busy_keys().map(move |key| &self.items[key.0] as &dyn ConnectionInfo)
    }

    /// One [`ConnectionInfo::format_info`] line per busy item.
    pub fn info(&self) -> Vec<String>
    where T: ConnectionInfo {
        self.iter_busy()
            .map(|item| {
                let mut line = String::new();
                item.format_info(&mut line);
                line
            })
            .collect()
    }
}
