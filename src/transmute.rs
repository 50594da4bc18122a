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

//! Structural mutation
//!
//! A [`Transition`] describes "add these types, remove those types". For each
//! source composition it memoizes a [`TargetComposition`]: the destination
//! plus where every destination slot takes its cell from.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::archetype::Composition;
use crate::array_pool::ArrayPool;
use crate::component::{Bundle, ComponentArray, ComponentBox, ComponentSet, ComponentType, MAX_BUNDLE_COMPONENTS};
use crate::entity::{Data, Entity};
use crate::error::Result;
use crate::repository::Repository;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CellSource {
    /// Slot in the source array
    Carried(usize),
    /// Position in the added bundle
    Added(usize),
}

/// Destination of one transition from one source composition
pub(crate) struct TargetComposition {
    pub(crate) target: Arc<Composition>,
    sources: SmallVec<[CellSource; MAX_BUNDLE_COMPONENTS]>,
}

impl TargetComposition {
    /// Assemble the destination array from the old cells and the added ones
    fn build(
        &self,
        old: Option<&ComponentArray>,
        added: &[ComponentBox],
        arrays: &ArrayPool,
    ) -> Option<ComponentArray> {
        if self.sources.is_empty() {
            return None;
        }
        let mut array = arrays.pop(self.sources.len());
        for source in &self.sources {
            let cell = match *source {
                CellSource::Carried(slot) => old.and_then(|old| old.get(slot)).cloned(),
                CellSource::Added(index) => added.get(index).map(|component| Arc::clone(&component.cell)),
            };
            match cell {
                Some(cell) => array.push(cell),
                None => debug_assert!(false, "missing cell for {source:?}"),
            }
        }
        Some(array)
    }
}

pub(crate) struct Transition {
    added: SmallVec<[ComponentType; MAX_BUNDLE_COMPONENTS]>,
    removed: SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]>,
    targets: DashMap<u64, Arc<TargetComposition>, FxBuildHasher>,
}

impl Transition {
    fn new(added: &[ComponentType], removed: &[ComponentType]) -> Self {
        Self {
            added: added.iter().copied().collect(),
            removed: removed.iter().map(ComponentType::type_id).collect(),
            targets: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Put the caller's boxes in this transition's added order.
    ///
    /// The cache key ignores tuple order, so a bundle written as `(C, B)` may
    /// reuse a transition first built for `(B, C)`.
    fn order_added(
        &self,
        mut boxes: SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]>,
    ) -> SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]> {
        debug_assert_eq!(boxes.len(), self.added.len());
        for i in 0..boxes.len() {
            loop {
                let Some(target) = self.added.iter().position(|ty| *ty == boxes[i].ty) else {
                    debug_assert!(false, "{:?} is not part of this transition", boxes[i].ty);
                    break;
                };
                if target == i {
                    break;
                }
                boxes.swap(i, target);
            }
        }
        boxes
    }

    fn target_for(&self, repository: &Repository, source: &Composition) -> Result<Arc<TargetComposition>> {
        if let Some(target) = self.targets.get(&source.id()) {
            return Ok(Arc::clone(target.value()));
        }
        // Carried types first, then the added ones; an added type replaces a carried one
        let types: SmallVec<[ComponentType; MAX_BUNDLE_COMPONENTS]> = source
            .types()
            .iter()
            .filter(|ty| !self.removed.contains(&ty.type_id()) && !self.added.contains(*ty))
            .chain(self.added.iter())
            .copied()
            .collect();
        let target = repository.resolve(&types)?;
        let sources: SmallVec<[CellSource; MAX_BUNDLE_COMPONENTS]> = target
            .types()
            .iter()
            .filter_map(|ty| match self.added.iter().position(|added| added == ty) {
                Some(index) => Some(CellSource::Added(index)),
                None => source.slot_of(ty.type_id()).map(CellSource::Carried),
            })
            .collect();
        debug_assert_eq!(sources.len(), target.types().len());

        let entry = Arc::new(TargetComposition { target, sources });
        Ok(Arc::clone(
            self.targets.entry(source.id()).or_insert(entry).value(),
        ))
    }
}

impl Repository {
    fn transition<A: Bundle, R: ComponentSet>(&self) -> Result<Arc<Transition>> {
        let added = A::component_types();
        let removed = R::component_types();
        let type_index = &self.inner().type_index;
        let key = (type_index.key_for(&added)?, type_index.key_for(&removed)?);

        let transitions = &self.inner().transitions;
        if let Some(transition) = transitions.get(&key) {
            return Ok(Arc::clone(transition.value()));
        }
        let transition = Arc::new(Transition::new(&added, &removed));
        Ok(Arc::clone(transitions.entry(key).or_insert(transition).value()))
    }

    /// Add the components of `A` and remove the types of `R` in one move.
    ///
    /// Returns `Ok(false)` when the entity is deleted or disabled, or when the
    /// call would change nothing.
    pub fn transmute<A: Bundle, R: ComponentSet>(&self, entity: &Entity, add: A) -> Result<bool> {
        let _guard = entity.write_lock();
        if entity.is_deleted() || entity.id().is_detached() {
            return Ok(false);
        }
        let data = entity.data();
        let source = Arc::clone(&data.composition);
        let adds_nothing = A::component_types().is_empty();
        if adds_nothing
            && !R::component_types()
                .iter()
                .any(|ty| source.contains(ty.type_id()))
        {
            return Ok(false);
        }

        let transition = self.transition::<A, R>()?;
        let target = transition.target_for(self, &source)?;
        let added = transition.order_added(add.into_components());
        let components = target.build(data.components.as_deref(), &added, &self.inner().arrays);
        let external = entity.id().is_external_array();

        if Arc::ptr_eq(&target.target, &source) {
            // Same signature: values replaced in place
            entity.publish(Data {
                composition: Arc::clone(&source),
                components: components.map(Arc::new),
                state: data.state.clone(),
            });
            entity.set_id(entity.id().with_external_array(false));
            source.recycle(data, external);
            return Ok(true);
        }

        let reserved = target.target.reserve_id()?;
        source.detach(entity);
        if let Some(mark) = &data.state {
            source.unlink_state(mark);
        }
        let state = data.state.as_ref().map(|mark| mark.key.clone());
        target.target.attach(entity, reserved, components, state);
        source.recycle(data, external);
        Ok(true)
    }
}
