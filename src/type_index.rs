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

//! Type index
//!
//! Assigns a stable small integer to each component type on first sight and
//! folds sets of those integers into content-addressed [`TypeKey`]s.

use std::any::TypeId;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHasher};
use smallvec::SmallVec;

use crate::component::{ComponentType, StateTag};
use crate::error::{InfernoError, Result};

/// Canonical key for a set (or short sequence) of type indices.
///
/// Equality and hashing are by content.
#[derive(Clone)]
pub struct TypeKey {
    hash: u64,
    data: SmallVec<[u32; 4]>,
}

impl TypeKey {
    pub fn single(index: u32) -> Self {
        Self::from_sequence(&[index])
    }

    /// Order-independent key: the indices are sorted first.
    pub fn from_set(indices: &[u32]) -> Self {
        let mut data: SmallVec<[u32; 4]> = SmallVec::from_slice(indices);
        data.sort_unstable();
        Self::build(data)
    }

    /// Order-dependent key, used for (type, ordinal) pairs.
    pub fn from_sequence(indices: &[u32]) -> Self {
        Self::build(SmallVec::from_slice(indices))
    }

    fn build(data: SmallVec<[u32; 4]>) -> Self {
        let mut hasher = FxHasher::default();
        data.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            data,
        }
    }

    pub fn indices(&self) -> &[u32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl std::fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeKey{:?}", self.data.as_slice())
    }
}

/// Process-lifetime registry of component type indices.
///
/// Index 0 is never handed out.
pub struct TypeIndex {
    indices: DashMap<TypeId, u32, FxBuildHasher>,
    next: AtomicU32,
}

impl TypeIndex {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: DashMap::with_capacity_and_hasher(capacity, FxBuildHasher),
            next: AtomicU32::new(1),
        }
    }

    /// Index of a type already seen, if any.
    pub fn index_of(&self, type_id: TypeId) -> Option<u32> {
        self.indices.get(&type_id).map(|entry| *entry)
    }

    /// Index of `type_id`, assigning the next free one on first sight.
    pub fn index_or_assign(&self, type_id: TypeId) -> u32 {
        if let Some(index) = self.index_of(type_id) {
            return index;
        }
        *self
            .indices
            .entry(type_id)
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Canonical key for a set of component types.
    ///
    /// Fails if the same type appears twice.
    pub fn key_for(&self, types: &[ComponentType]) -> Result<TypeKey> {
        match types {
            [] => Ok(TypeKey::from_set(&[])),
            [single] => Ok(TypeKey::single(self.index_or_assign(single.type_id()))),
            _ => {
                let mut pairs: SmallVec<[(u32, &'static str); 8]> = types
                    .iter()
                    .map(|ty| (self.index_or_assign(ty.type_id()), ty.name()))
                    .collect();
                pairs.sort_unstable_by_key(|(index, _)| *index);
                if let Some(dup) = pairs.windows(2).find(|w| w[0].0 == w[1].0) {
                    return Err(InfernoError::DuplicateComponent(dup[0].1));
                }
                let indices: SmallVec<[u32; 8]> = pairs.iter().map(|(index, _)| *index).collect();
                Ok(TypeKey::from_sequence(&indices))
            }
        }
    }

    /// Key of the state chain selected by `state`.
    pub fn state_key<S: StateTag>(&self, state: &S) -> TypeKey {
        let index = self.index_or_assign(TypeId::of::<S>());
        TypeKey::from_sequence(&[index, state.ordinal()])
    }

    /// Number of types assigned so far.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl Default for TypeIndex {
    fn default() -> Self {
        Self::new()
    }
}
