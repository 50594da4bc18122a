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

//! Entity handles.
//!
//! An [`Entity`] is a shared handle to a mutable record: its packed id and a
//! [`Data`] snapshot naming the owning composition, the component array and
//! the state chain membership. Structural changes publish a new snapshot in
//! one assignment and never replace the handle itself.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::archetype::Composition;
use crate::component::{Component, ComponentArray, ComponentRef, ComponentSet, ComponentType, StateTag};
use crate::error::{InfernoError, Result};
use crate::pool::{EntityId, Identifiable};
use crate::repository::Repository;
use crate::type_index::TypeKey;

/// Position of an entity inside a composition's state chain arena
#[derive(Clone, Debug)]
pub(crate) struct StateMark {
    pub(crate) key: TypeKey,
    pub(crate) link: usize,
}

/// Immutable snapshot of an entity's storage
pub(crate) struct Data {
    pub(crate) composition: Arc<Composition>,
    /// `None` for zero-component entities and after deletion
    pub(crate) components: Option<Arc<ComponentArray>>,
    pub(crate) state: Option<StateMark>,
}

pub(crate) struct EntityInner {
    id: AtomicU32,
    data: RwLock<Arc<Data>>,
    /// Serializes structural mutation; created on first use
    lock: OnceLock<RwLock<()>>,
    deleted: AtomicBool,
}

/// Handle to an entity. Clones refer to the same entity.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, data: Data) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                id: AtomicU32::new(id.raw()),
                data: RwLock::new(Arc::new(data)),
                lock: OnceLock::new(),
                deleted: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EntityInner> {
        Arc::downgrade(&self.inner)
    }

    /// Current packed id. Changes whenever the entity changes composition.
    pub fn id(&self) -> EntityId {
        EntityId::from_raw(self.inner.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: EntityId) {
        self.inner.id.store(id.raw(), Ordering::Release);
    }

    pub(crate) fn flag_detached(&self) {
        self.inner
            .id
            .fetch_or(crate::pool::DETACHED_BIT, Ordering::AcqRel);
    }

    pub(crate) fn data(&self) -> Arc<Data> {
        Arc::clone(&self.inner.data.read())
    }

    pub(crate) fn publish(&self, data: Data) {
        *self.inner.data.write() = Arc::new(data);
    }

    pub(crate) fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Release);
    }

    pub(crate) fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.lock.get_or_init(|| RwLock::new(())).write()
    }

    /// Composition the entity currently belongs to
    pub fn composition(&self) -> Arc<Composition> {
        Arc::clone(&self.data().composition)
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    /// Live and registered in its composition
    pub fn is_enabled(&self) -> bool {
        !self.is_deleted() && !self.id().is_detached()
    }

    fn repository(&self) -> Result<Repository> {
        self.data()
            .composition
            .repository()
            .ok_or(InfernoError::RepositoryClosed)
    }

    /// Add a component, replacing any existing one of the same type.
    ///
    /// `Ok(false)` if the entity is deleted or disabled.
    pub fn add<T: Component>(&self, component: T) -> Result<bool> {
        self.repository()?.transmute::<(T,), ()>(self, (component,))
    }

    /// Remove component types. `Ok(false)` if none of them is present.
    pub fn remove<S: ComponentSet>(&self) -> Result<bool> {
        self.repository()?.transmute::<(), S>(self, ())
    }

    pub fn get<T: Component>(&self) -> Option<ComponentRef<T>> {
        let data = self.data();
        let slot = data.composition.slot_of(TypeId::of::<T>())?;
        let cell = data.components.as_ref()?.get(slot)?;
        ComponentRef::from_cell(cell)
    }

    pub fn has<T: Component>(&self) -> bool {
        let data = self.data();
        data.components.is_some() && data.composition.contains(TypeId::of::<T>())
    }

    /// True if the entity holds a component equal to `value`
    pub fn contains<T: Component + PartialEq>(&self, value: &T) -> bool {
        self.get::<T>()
            .map(|component| *component.read() == *value)
            .unwrap_or(false)
    }

    /// Types of the components currently held
    pub fn component_types(&self) -> Vec<ComponentType> {
        let data = self.data();
        match data.components {
            Some(_) => data.composition.types().to_vec(),
            None => Vec::new(),
        }
    }

    /// Link the entity at the head of the chain for `state`, leaving any previous chain.
    pub fn set_state<S: StateTag>(&self, state: &S) -> bool {
        let _guard = self.write_lock();
        if self.is_deleted() {
            return false;
        }
        let composition = self.composition();
        let key = composition.type_index().state_key(state);
        composition.set_entity_state(self, Some(key))
    }

    /// Leave the current state chain. False if the entity had no state.
    pub fn clear_state(&self) -> bool {
        let _guard = self.write_lock();
        if self.is_deleted() {
            return false;
        }
        self.composition().set_entity_state(self, None)
    }

    /// Disabled entities keep their components but are not iterated.
    ///
    /// Returns whether the enabled state changed.
    pub fn set_enabled(&self, enabled: bool) -> Result<bool> {
        let _guard = self.write_lock();
        if self.is_deleted() {
            return Ok(false);
        }
        let detached = self.id().is_detached();
        let composition = self.composition();
        match (enabled, detached) {
            (true, true) => {
                composition.reattach(self)?;
                Ok(true)
            }
            (false, false) => {
                composition.detach(self);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete the entity. False if it was already deleted.
    pub fn delete(&self) -> bool {
        let _guard = self.write_lock();
        if self.is_deleted() {
            return false;
        }
        self.composition().delete_entity(self);
        true
    }
}

impl Identifiable for Entity {
    fn id(&self) -> EntityId {
        Entity::id(self)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id())
            .field("composition", &self.data().composition)
            .finish()
    }
}
