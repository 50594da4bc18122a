// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared pool of component arrays, partitioned by length.

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::component::ComponentArray;

/// Arrays kept per length.
pub const DEFAULT_ARRAYS_PER_LENGTH: usize = 1024;

pub struct ArrayPool {
    partitions: DashMap<usize, ArrayQueue<ComponentArray>, FxBuildHasher>,
    per_length: usize,
}

impl ArrayPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ARRAYS_PER_LENGTH)
    }

    pub fn with_capacity(per_length: usize) -> Self {
        Self {
            partitions: DashMap::with_hasher(FxBuildHasher),
            per_length: per_length.max(1),
        }
    }

    /// An empty array with room for `len` cells.
    pub fn pop(&self, len: usize) -> ComponentArray {
        self.partitions
            .get(&len)
            .and_then(|queue| queue.pop())
            .unwrap_or_else(|| Vec::with_capacity(len))
    }

    /// Return an array to its partition. Dropped when the partition is full.
    pub fn push(&self, mut array: ComponentArray) {
        let len = array.len();
        if len == 0 {
            return;
        }
        array.clear();
        let queue = self
            .partitions
            .entry(len)
            .or_insert_with(|| ArrayQueue::new(self.per_length));
        let _ = queue.push(array);
    }

    /// Arrays currently parked for `len`.
    pub fn pooled(&self, len: usize) -> usize {
        self.partitions.get(&len).map_or(0, |queue| queue.len())
    }
}

impl Default for ArrayPool {
    fn default() -> Self {
        Self::new()
    }
}
