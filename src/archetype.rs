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

//! Composition storage: one per distinct component signature
//!
//! A composition owns the pool tenant for entities of its exact shape and an
//! arena of state chains used for targeted iteration.

use std::any::TypeId;
use std::fmt;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::array_pool::ArrayPool;
use crate::component::{
    ComponentArray, ComponentBox, ComponentType, StateTag, MAX_BUNDLE_COMPONENTS,
};
use crate::entity::{Data, Entity, EntityInner, StateMark};
use crate::error::Result;
use crate::pool::{ChunkedPool, EntityId, PoolIter, Tenant};
use crate::repository::{Repository, RepositoryInner};
use crate::type_index::{TypeIndex, TypeKey};

/// Component signature, ordered by type index
pub type Signature = SmallVec<[ComponentType; MAX_BUNDLE_COMPONENTS]>;

/// Storage unit for all entities sharing one signature
pub struct Composition {
    id: u64,
    key: TypeKey,
    types: Signature,
    /// Only built for multi-component signatures
    slots: Option<FxHashMap<TypeId, usize>>,
    tenant: Tenant<Entity>,
    arrays: Arc<ArrayPool>,
    type_index: Arc<TypeIndex>,
    repository: Weak<RepositoryInner>,
    states: Mutex<StateChains>,
}

impl Composition {
    pub(crate) fn new(
        id: u64,
        key: TypeKey,
        types: Signature,
        pool: &Arc<ChunkedPool<Entity>>,
        arrays: Arc<ArrayPool>,
        type_index: Arc<TypeIndex>,
        repository: Weak<RepositoryInner>,
    ) -> Self {
        let slots = (types.len() > 1).then(|| {
            types
                .iter()
                .enumerate()
                .map(|(slot, ty)| (ty.type_id(), slot))
                .collect()
        });
        Self {
            id,
            key,
            types,
            slots,
            tenant: pool.tenant(),
            arrays,
            type_index,
            repository,
            states: Mutex::new(StateChains::default()),
        }
    }

    /// Unique id within the owning repository
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Get signature
    pub fn types(&self) -> &[ComponentType] {
        &self.types
    }

    pub fn is_multi_component(&self) -> bool {
        self.slots.is_some()
    }

    /// Slot of a component type within this composition's arrays
    pub fn slot_of(&self, type_id: TypeId) -> Option<usize> {
        match &self.slots {
            Some(slots) => slots.get(&type_id).copied(),
            None => self
                .types
                .first()
                .filter(|ty| ty.type_id() == type_id)
                .map(|_| 0),
        }
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.slot_of(type_id).is_some()
    }

    /// Number of live, enabled entities
    pub fn len(&self) -> usize {
        self.tenant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenant.is_empty()
    }

    /// Iterate live entities of this composition
    pub fn entities(&self) -> PoolIter<Entity> {
        self.tenant.iter()
    }

    /// Number of entities linked into the chain selected by `state`
    pub fn state_count<S: StateTag>(&self, state: &S) -> usize {
        let key = self.type_index.state_key(state);
        self.states.lock().len(&key)
    }

    pub(crate) fn type_index(&self) -> &TypeIndex {
        &self.type_index
    }

    pub(crate) fn repository(&self) -> Option<Repository> {
        self.repository.upgrade().map(Repository::from_inner)
    }

    /// Put boxed components into this composition's slot order.
    ///
    /// External arrays bypass the shared array pool.
    pub(crate) fn arrange(
        &self,
        mut boxes: SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]>,
        external: bool,
    ) -> Option<ComponentArray> {
        if self.types.is_empty() {
            return None;
        }
        debug_assert_eq!(boxes.len(), self.types.len(), "array length mismatch for {self:?}");
        if self.slots.is_some() {
            // Cycle sort: each swap parks one element in its final slot
            for i in 0..boxes.len() {
                loop {
                    let Some(target) = self.slot_of(boxes[i].ty.type_id()) else {
                        debug_assert!(false, "{:?} is not part of {self:?}", boxes[i].ty);
                        break;
                    };
                    if target == i {
                        break;
                    }
                    boxes.swap(i, target);
                }
            }
        }
        let mut array = if external {
            Vec::with_capacity(boxes.len())
        } else {
            self.arrays.pop(boxes.len())
        };
        array.extend(boxes.into_iter().map(|component| component.cell));
        Some(array)
    }

    /// Reserve an id in this composition's tenant
    pub(crate) fn reserve_id(&self) -> Result<EntityId> {
        self.tenant.next_id()
    }

    /// Build and register a new entity
    pub(crate) fn create_entity(
        self: &Arc<Self>,
        components: Option<ComponentArray>,
        external: bool,
    ) -> Result<Entity> {
        debug_assert_eq!(components.as_ref().map_or(0, Vec::len), self.types.len());
        let id = self.tenant.next_id()?.with_external_array(external);
        let entity = Entity::new(
            id,
            Data {
                composition: Arc::clone(self),
                components: components.map(Arc::new),
                state: None,
            },
        );
        self.tenant.register(id, entity.clone());
        Ok(entity)
    }

    /// Bind a detached entity into this composition under a reserved id.
    ///
    /// The new data record is published before the id loses its detached flag.
    pub(crate) fn attach(
        self: &Arc<Self>,
        entity: &Entity,
        reserved: EntityId,
        components: Option<ComponentArray>,
        state: Option<TypeKey>,
    ) {
        debug_assert_eq!(components.as_ref().map_or(0, Vec::len), self.types.len());
        let state = state.map(|key| self.link_state(entity, key));
        entity.publish(Data {
            composition: Arc::clone(self),
            components: components.map(Arc::new),
            state,
        });
        let id = entity
            .id()
            .with_payload(reserved.payload())
            .with_external_array(false)
            .attached();
        entity.set_id(id);
        self.tenant.register(id, entity.clone());
    }

    /// Release the entity's slot and flag it detached
    pub(crate) fn detach(&self, entity: &Entity) {
        self.tenant.free_id(entity.id());
        entity.flag_detached();
    }

    /// Give a disabled entity a fresh slot
    pub(crate) fn reattach(&self, entity: &Entity) -> Result<()> {
        let reserved = self.tenant.next_id()?;
        let id = entity.id().with_payload(reserved.payload()).attached();
        entity.set_id(id);
        self.tenant.register(id, entity.clone());
        Ok(())
    }

    /// Permanently remove an entity
    pub(crate) fn delete_entity(&self, entity: &Entity) {
        let external = entity.id().is_external_array();
        if !entity.id().is_detached() {
            self.detach(entity);
        }
        entity.mark_deleted();
        let data = entity.data();
        if let Some(mark) = &data.state {
            self.unlink_state(mark);
        }
        entity.publish(Data {
            composition: Arc::clone(&data.composition),
            components: None,
            state: None,
        });
        self.recycle(data, external);
    }

    /// Return a replaced component array to the array pool when nothing else holds it
    pub(crate) fn recycle(&self, data: Arc<Data>, external: bool) {
        if external {
            return;
        }
        let Ok(data) = Arc::try_unwrap(data) else {
            return;
        };
        if let Some(array) = data.components.and_then(|array| Arc::try_unwrap(array).ok()) {
            self.arrays.push(array);
        }
    }

    /// Replace the entity's state chain membership
    ///
    /// Returns false if the entity had no state and none was requested.
    pub(crate) fn set_entity_state(&self, entity: &Entity, key: Option<TypeKey>) -> bool {
        let data = entity.data();
        let had_state = data.state.is_some();
        if let Some(mark) = &data.state {
            self.unlink_state(mark);
        }
        let state = key.map(|key| self.link_state(entity, key));
        let changed = had_state || state.is_some();
        entity.publish(Data {
            composition: Arc::clone(&data.composition),
            components: data.components.clone(),
            state,
        });
        changed
    }

    pub(crate) fn link_state(&self, entity: &Entity, key: TypeKey) -> StateMark {
        let link = self.states.lock().push(key.clone(), entity.downgrade());
        StateMark { key, link }
    }

    pub(crate) fn unlink_state(&self, mark: &StateMark) {
        let unlinked = self.states.lock().unlink(mark.link);
        debug_assert!(unlinked, "state link {} was not live", mark.link);
    }

    /// Snapshot of a state chain, most recent first
    pub(crate) fn state_members(&self, key: &TypeKey) -> Vec<Entity> {
        self.states
            .lock()
            .members(key)
            .into_iter()
            .filter_map(|weak| weak.upgrade().map(Entity::from_inner))
            .collect()
    }

    /// Drop every registered entity
    pub(crate) fn clear(&self) {
        self.tenant.clear();
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Composition={:?}", self.types.as_slice())
    }
}

struct ChainLink {
    entity: Weak<EntityInner>,
    key: TypeKey,
    /// Older neighbour
    prev: Option<usize>,
    /// Newer neighbour
    next: Option<usize>,
}

/// Arena of doubly linked state chains
///
/// The head of each chain is its most recently linked entity.
#[derive(Default)]
struct StateChains {
    heads: AHashMap<TypeKey, usize>,
    links: Vec<Option<ChainLink>>,
    free: Vec<usize>,
}

impl StateChains {
    fn push(&mut self, key: TypeKey, entity: Weak<EntityInner>) -> usize {
        let prev = self.heads.get(&key).copied();
        let link = ChainLink {
            entity,
            key: key.clone(),
            prev,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.links[slot] = Some(link);
                slot
            }
            None => {
                self.links.push(Some(link));
                self.links.len() - 1
            }
        };
        if let Some(prev) = prev.and_then(|p| self.links[p].as_mut()) {
            prev.next = Some(slot);
        }
        self.heads.insert(key, slot);
        slot
    }

    fn unlink(&mut self, slot: usize) -> bool {
        let Some(link) = self.links.get_mut(slot).and_then(Option::take) else {
            return false;
        };
        match link.next {
            Some(next) => {
                if let Some(next) = self.links[next].as_mut() {
                    next.prev = link.prev;
                }
            }
            None => match link.prev {
                Some(prev) => {
                    self.heads.insert(link.key.clone(), prev);
                }
                None => {
                    self.heads.remove(&link.key);
                }
            },
        }
        if let Some(prev) = link.prev.and_then(|p| self.links[p].as_mut()) {
            prev.next = link.next;
        }
        self.free.push(slot);
        true
    }

    fn members(&self, key: &TypeKey) -> Vec<Weak<EntityInner>> {
        let mut members = Vec::new();
        let mut cursor = self.heads.get(key).copied();
        while let Some(link) = cursor.and_then(|slot| self.links[slot].as_ref()) {
            members.push(link.entity.clone());
            cursor = link.prev;
        }
        members
    }

    fn len(&self, key: &TypeKey) -> usize {
        let mut count = 0;
        let mut cursor = self.heads.get(key).copied();
        while let Some(link) = cursor.and_then(|slot| self.links[slot].as_ref()) {
            count += 1;
            cursor = link.prev;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> TypeKey {
        TypeKey::from_sequence(&[1, n])
    }

    fn ids(chains: &StateChains, key: &TypeKey) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = chains.heads.get(key).copied();
        while let Some(slot) = cursor {
            out.push(slot);
            cursor = chains.links[slot].as_ref().and_then(|link| link.prev);
        }
        out
    }

    #[test]
    fn test_chain_is_most_recent_first() {
        let mut chains = StateChains::default();
        let a = chains.push(key(0), Weak::new());
        let b = chains.push(key(0), Weak::new());
        let c = chains.push(key(0), Weak::new());
        assert_eq!(ids(&chains, &key(0)), vec![c, b, a]);
        assert_eq!(chains.len(&key(1)), 0);
    }

    #[test]
    fn test_unlink_middle_head_and_tail() {
        let mut chains = StateChains::default();
        let a = chains.push(key(0), Weak::new());
        let b = chains.push(key(0), Weak::new());
        let c = chains.push(key(0), Weak::new());
        let d = chains.push(key(0), Weak::new());

        assert!(chains.unlink(b));
        assert_eq!(ids(&chains, &key(0)), vec![d, c, a]);
        assert!(chains.unlink(d));
        assert_eq!(ids(&chains, &key(0)), vec![c, a]);
        assert!(chains.unlink(a));
        assert_eq!(ids(&chains, &key(0)), vec![c]);
        assert!(!chains.unlink(a));
        assert!(chains.unlink(c));
        assert!(chains.heads.is_empty());
    }

    #[test]
    fn test_freed_links_are_reused() {
        let mut chains = StateChains::default();
        let a = chains.push(key(0), Weak::new());
        chains.push(key(1), Weak::new());
        chains.unlink(a);
        let reused = chains.push(key(1), Weak::new());
        assert_eq!(reused, a);
        assert_eq!(chains.len(&key(1)), 2);
        assert_eq!(chains.len(&key(0)), 0);
    }
}
