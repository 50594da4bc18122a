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

//! Views: lazy queries over every composition holding a set of types
//!
//! A view snapshots the matching graph nodes when it is built. Iteration is
//! weakly isolated from structural mutation: an entity that moves to another
//! composition (or is disabled or deleted) while a view walks its old one is
//! skipped, never surfaced with stale data.

use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::archetype::Composition;
use crate::component::{Component, ComponentCell, ComponentRef, ComponentSet, StateTag};
use crate::entity::Entity;
use crate::pool::PoolIter;
use crate::repository::{NodeSet, Repository};
use crate::type_index::TypeKey;

/// Slots of the requested types inside one composition
pub type QuerySlots = SmallVec<[usize; 6]>;

/// Tuple of 1-6 component types a view projects
pub trait ViewQuery: ComponentSet {
    /// Requested component handles followed by the owning entity
    type Item: Send;

    fn fetch(cells: &[ComponentCell], slots: &[usize], entity: Entity) -> Option<Self::Item>;
}

macro_rules! impl_view_query {
    ($($T:ident),*) => {
        impl<$($T: Component),*> ViewQuery for ($($T,)*) {
            type Item = ($(ComponentRef<$T>,)* Entity);

            #[allow(non_snake_case, unused_assignments)]
            fn fetch(cells: &[ComponentCell], slots: &[usize], entity: Entity) -> Option<Self::Item> {
                let mut i = 0;
                $(
                    let $T = ComponentRef::<$T>::from_cell(cells.get(*slots.get(i)?)?)?;
                    i += 1;
                )*
                Some(($($T,)* entity))
            }
        }
    };
}

impl_view_query!(A);
impl_view_query!(A, B);
impl_view_query!(A, B, C);
impl_view_query!(A, B, C, D);
impl_view_query!(A, B, C, D, E);
impl_view_query!(A, B, C, D, E, F);

/// Query over all compositions containing `Q`
pub struct View<Q> {
    repository: Repository,
    nodes: NodeSet,
    state: Option<TypeKey>,
    _query: PhantomData<fn() -> Q>,
}

impl<Q: ViewQuery> View<Q> {
    pub(crate) fn new(repository: Repository) -> Self {
        let nodes = repository.find_nodes(&Q::component_types());
        Self {
            repository,
            nodes,
            state: None,
            _query: PhantomData,
        }
    }

    /// Also require every type in `S`
    pub fn include<S: ComponentSet>(mut self) -> Self {
        self.repository
            .retain_including(&mut self.nodes, &S::component_types());
        self
    }

    /// Skip compositions holding any type in `S`
    pub fn exclude<S: ComponentSet>(mut self) -> Self {
        self.repository
            .remove_excluded(&mut self.nodes, &S::component_types());
        self
    }

    /// Only walk entities in the chain selected by `state`, most recent first
    pub fn with_state<S: StateTag>(mut self, state: &S) -> Self {
        self.state = Some(self.repository.type_index().state_key(state));
        self
    }

    /// Compositions this view will walk
    pub fn compositions(&self) -> Vec<Arc<Composition>> {
        self.nodes.values().filter_map(|node| node.composition()).collect()
    }

    pub fn iter(&self) -> ViewIter<Q> {
        ViewIter {
            pending: self.compositions().into_iter(),
            current: None,
            state: self.state.clone(),
            _query: PhantomData,
        }
    }

    /// Walks the view once
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Run `f` on every element from the rayon pool of the calling context
    #[cfg(feature = "parallel")]
    pub fn par_for_each<F>(&self, f: F)
    where
        F: Fn(Q::Item) + Send + Sync,
    {
        self.iter().par_bridge().for_each(f);
    }
}

impl<'a, Q: ViewQuery> IntoIterator for &'a View<Q> {
    type Item = Q::Item;
    type IntoIter = ViewIter<Q>;

    fn into_iter(self) -> ViewIter<Q> {
        self.iter()
    }
}

enum Members {
    Tenant(PoolIter<Entity>),
    Chain(std::vec::IntoIter<Entity>),
}

impl Iterator for Members {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        match self {
            Members::Tenant(iter) => iter.next(),
            Members::Chain(iter) => iter.next(),
        }
    }
}

struct Cursor {
    composition: Arc<Composition>,
    slots: QuerySlots,
    members: Members,
}

/// Lazy, forward-only iterator produced by [`View::iter`]
pub struct ViewIter<Q> {
    pending: std::vec::IntoIter<Arc<Composition>>,
    current: Option<Cursor>,
    state: Option<TypeKey>,
    _query: PhantomData<fn() -> Q>,
}

impl<Q: ViewQuery> ViewIter<Q> {
    fn advance(&mut self) -> bool {
        for composition in self.pending.by_ref() {
            let slots: Option<QuerySlots> = Q::component_types()
                .iter()
                .map(|ty| composition.slot_of(ty.type_id()))
                .collect();
            let Some(slots) = slots else {
                continue;
            };
            let members = match &self.state {
                Some(key) => Members::Chain(composition.state_members(key).into_iter()),
                None => Members::Tenant(composition.entities()),
            };
            self.current = Some(Cursor {
                composition,
                slots,
                members,
            });
            return true;
        }
        self.current = None;
        false
    }
}

impl<Q: ViewQuery> Iterator for ViewIter<Q> {
    type Item = Q::Item;

    fn next(&mut self) -> Option<Q::Item> {
        loop {
            if self.current.is_none() && !self.advance() {
                return None;
            }
            let cursor = self.current.as_mut()?;
            let Some(entity) = cursor.members.next() else {
                self.current = None;
                continue;
            };
            if !entity.is_enabled() {
                continue;
            }
            // The entity may have moved since the cursor was built
            let data = entity.data();
            if !Arc::ptr_eq(&data.composition, &cursor.composition) {
                continue;
            }
            if let Some(key) = &self.state {
                if data.state.as_ref().map(|mark| &mark.key) != Some(key) {
                    continue;
                }
            }
            let Some(cells) = data.components.as_deref() else {
                continue;
            };
            if let Some(item) = Q::fetch(cells, &cursor.slots, entity.clone()) {
                return Some(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;

    #[derive(Debug, Clone, PartialEq)]
    struct Position(i32);
    #[derive(Debug, Clone, PartialEq)]
    struct Velocity(i32);
    #[derive(Debug, Clone, PartialEq)]
    struct Frozen;

    fn repository() -> Repository {
        Repository::new(RepositoryConfig::default()).unwrap()
    }

    #[test]
    fn test_view_spans_compositions() {
        let repo = repository();
        repo.create((Position(1),)).unwrap();
        repo.create((Position(2), Velocity(1))).unwrap();
        repo.create((Velocity(5),)).unwrap();

        let mut seen: Vec<i32> = repo
            .view::<(Position,)>()
            .iter()
            .map(|(pos, _)| pos.get().0)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(repo.view::<(Position, Velocity)>().count(), 1);
        assert_eq!(repo.view::<(Velocity,)>().exclude::<(Position,)>().count(), 1);
        assert_eq!(repo.view::<(Velocity,)>().include::<(Position,)>().count(), 1);
    }

    #[test]
    fn test_view_writes_through_refs() {
        let repo = repository();
        let entity = repo.create((Velocity(3), Position(0))).unwrap();
        for (pos, vel, _) in &repo.view::<(Position, Velocity)>() {
            pos.write().0 += vel.read().0;
        }
        assert!(entity.contains(&Position(3)));
    }

    #[test]
    fn test_view_skips_moved_entities() {
        let repo = repository();
        let a = repo.create((Position(1),)).unwrap();
        let b = repo.create((Position(2),)).unwrap();

        let view = repo.view::<(Position,)>();
        let mut iter = view.iter();
        // Moving `b` out after the view was built hides it from this pass
        b.add(Frozen).unwrap();
        let (_, first) = iter.next().unwrap();
        assert_eq!(first, a);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_view_on_unknown_type_is_empty() {
        let repo = repository();
        repo.create((Position(1),)).unwrap();
        assert_eq!(repo.view::<(Velocity,)>().count(), 0);
        assert_eq!(repo.view::<(Position, Velocity)>().count(), 0);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_par_for_each_visits_all() {
        use std::sync::atomic::{AtomicI32, Ordering};

        let repo = repository();
        for i in 0..1000 {
            repo.create((Position(i),)).unwrap();
        }
        let sum = AtomicI32::new(0);
        repo.view::<(Position,)>().par_for_each(|(pos, _)| {
            sum.fetch_add(pos.get().0, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), (0..1000).sum::<i32>());
    }
}
