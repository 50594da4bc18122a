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

//! Archetype graph and repository
//!
//! Nodes are keyed by [`TypeKey`] and created on first lookup. A single-type
//! node links to itself and to every multi-type node containing its type,
//! which turns "all compositions with X and Y" into a set intersection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use tracing::{debug, warn};

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{Composition, Signature};
use crate::array_pool::ArrayPool;
use crate::component::{Bundle, Component, ComponentBox, ComponentSet, ComponentType, MAX_BUNDLE_COMPONENTS};
use crate::config::{RepositoryConfig, SchedulerConfig};
use crate::entity::Entity;
use crate::error::Result;
use crate::pool::{ChunkedPool, IdSchema};
use crate::scheduler::Scheduler;
use crate::transmute::Transition;
use crate::type_index::{TypeIndex, TypeKey};
use crate::view::{View, ViewQuery};

/// Graph vertex owning at most one composition
pub(crate) struct Node {
    key: TypeKey,
    types: Signature,
    composition: OnceLock<Arc<Composition>>,
    links: DashMap<TypeKey, Weak<Node>, FxBuildHasher>,
}

impl Node {
    fn new(key: TypeKey, types: Signature) -> Self {
        Self {
            key,
            types,
            composition: OnceLock::new(),
            links: DashMap::with_hasher(FxBuildHasher),
        }
    }

    pub(crate) fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Materialized composition, if any
    pub(crate) fn composition(&self) -> Option<Arc<Composition>> {
        self.composition.get().cloned()
    }

    fn link(&self, other: &Arc<Node>) {
        if !self.links.contains_key(&other.key) {
            self.links
                .entry(other.key.clone())
                .or_insert_with(|| Arc::downgrade(other));
        }
    }

    pub(crate) fn is_linked(&self, key: &TypeKey) -> bool {
        self.links.contains_key(key)
    }

    fn linked(&self) -> Vec<Arc<Node>> {
        self.links
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    fn link_keys(&self) -> Vec<TypeKey> {
        self.links.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Node snapshot handed to views
pub(crate) type NodeSet = AHashMap<TypeKey, Arc<Node>>;

pub(crate) struct RepositoryInner {
    pub(crate) config: RepositoryConfig,
    pub(crate) type_index: Arc<TypeIndex>,
    pub(crate) pool: Arc<ChunkedPool<Entity>>,
    pub(crate) arrays: Arc<ArrayPool>,
    nodes: DashMap<TypeKey, Arc<Node>, FxBuildHasher>,
    root: Arc<Composition>,
    pub(crate) transitions: DashMap<(TypeKey, TypeKey), Arc<Transition>, FxBuildHasher>,
    next_composition: AtomicU64,
    /// Tracked, not owned
    schedulers: Mutex<Vec<Weak<Scheduler>>>,
    weak: Weak<RepositoryInner>,
}

impl Drop for RepositoryInner {
    fn drop(&mut self) {
        // Tenants hold entities and entities hold their composition
        self.root.clear();
        for node in self.nodes.iter() {
            if let Some(composition) = node.composition.get() {
                composition.clear();
            }
        }
    }
}

/// Entity repository: owns the archetype graph and the id pool, and tracks
/// schedulers created through it. Cheap to clone.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

/// Composition resolved ahead of time for bundle type `B`
pub struct Prepared<B> {
    composition: Arc<Composition>,
    /// Bundle position to composition slot
    order: SmallVec<[usize; MAX_BUNDLE_COMPONENTS]>,
    _bundle: std::marker::PhantomData<fn(B)>,
}

impl<B> Prepared<B> {
    pub fn composition(&self) -> &Arc<Composition> {
        &self.composition
    }
}

impl Repository {
    pub fn new(config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let schema = IdSchema::from_config(&config)?;
        let type_index = Arc::new(TypeIndex::with_capacity(config.type_index_capacity()));
        let pool = Arc::new(ChunkedPool::new(schema));
        let arrays = Arc::new(ArrayPool::new());

        let inner = Arc::new_cyclic(|weak: &Weak<RepositoryInner>| {
            let root = Arc::new(Composition::new(
                0,
                TypeKey::from_set(&[]),
                Signature::new(),
                &pool,
                Arc::clone(&arrays),
                Arc::clone(&type_index),
                weak.clone(),
            ));
            RepositoryInner {
                config,
                type_index,
                pool,
                arrays,
                nodes: DashMap::with_hasher(FxBuildHasher),
                root,
                transitions: DashMap::with_hasher(FxBuildHasher),
                next_composition: AtomicU64::new(1),
                schedulers: Mutex::new(Vec::new()),
                weak: weak.clone(),
            }
        });
        debug!(name = %inner.config.name, ?schema, "repository created");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<RepositoryInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &RepositoryInner {
        &self.inner
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn type_index(&self) -> &TypeIndex {
        &self.inner.type_index
    }

    pub fn id_schema(&self) -> &IdSchema {
        self.inner.pool.schema()
    }

    /// Composition for entities without components
    pub fn root(&self) -> &Arc<Composition> {
        &self.inner.root
    }

    /// Resolve the composition storing exactly `types`, creating it on first use
    pub fn resolve(&self, types: &[ComponentType]) -> Result<Arc<Composition>> {
        if types.is_empty() {
            return Ok(Arc::clone(&self.inner.root));
        }
        let key = self.inner.type_index.key_for(types)?;
        let existing = self.inner.nodes.get(&key).map(|node| Arc::clone(node.value()));
        let node = match existing {
            Some(node) => {
                if types.len() == 1 && !node.is_linked(&key) {
                    node.link(&node);
                }
                node
            }
            None => self.insert_node(key, types, true),
        };
        Ok(self.materialize(&node))
    }

    /// Insert the node for `key` if absent.
    ///
    /// Nodes created only to hold links to a larger node are not self-linked;
    /// `resolve` links them the first time they are asked for directly.
    fn insert_node(&self, key: TypeKey, types: &[ComponentType], self_link: bool) -> Arc<Node> {
        let type_index = &self.inner.type_index;
        let mut sorted: Signature = types.iter().copied().collect();
        sorted.sort_unstable_by_key(|ty| type_index.index_or_assign(ty.type_id()));

        let mut created = false;
        let node = Arc::clone(
            self.inner
                .nodes
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Node::new(key, sorted))
                })
                .value(),
        );
        if self_link {
            node.link(&node);
        }
        if created && types.len() > 1 {
            for ty in node.types.iter() {
                self.single_node(*ty).link(&node);
            }
        }
        node
    }

    fn single_node(&self, ty: ComponentType) -> Arc<Node> {
        let key = TypeKey::single(self.inner.type_index.index_or_assign(ty.type_id()));
        let existing = self.inner.nodes.get(&key).map(|node| Arc::clone(node.value()));
        match existing {
            Some(node) => node,
            None => self.insert_node(key, &[ty], false),
        }
    }

    fn existing_single(&self, ty: &ComponentType) -> Option<Arc<Node>> {
        let index = self.inner.type_index.index_of(ty.type_id())?;
        self.inner
            .nodes
            .get(&TypeKey::single(index))
            .map(|node| Arc::clone(node.value()))
    }

    fn materialize(&self, node: &Node) -> Arc<Composition> {
        if let Some(composition) = node.composition.get() {
            return Arc::clone(composition);
        }
        let composition = node.composition.get_or_init(|| {
            let id = self.inner.next_composition.fetch_add(1, Ordering::Relaxed);
            debug!(id, types = ?node.types.as_slice(), "composition created");
            Arc::new(Composition::new(
                id,
                node.key.clone(),
                node.types.clone(),
                &self.inner.pool,
                Arc::clone(&self.inner.arrays),
                Arc::clone(&self.inner.type_index),
                self.inner.weak.clone(),
            ))
        });
        Arc::clone(composition)
    }

    /// Nodes whose signature contains every type in `types`
    pub(crate) fn find_nodes(&self, types: &[ComponentType]) -> NodeSet {
        let Some((first, rest)) = types.split_first() else {
            return NodeSet::new();
        };
        let Some(start) = self.existing_single(first) else {
            return NodeSet::new();
        };
        let mut found: NodeSet = start
            .linked()
            .into_iter()
            .map(|node| (node.key.clone(), node))
            .collect();
        self.retain_including(&mut found, rest);
        found
    }

    pub(crate) fn retain_including(&self, found: &mut NodeSet, types: &[ComponentType]) {
        for ty in types {
            if found.is_empty() {
                return;
            }
            match self.existing_single(ty) {
                Some(single) => found.retain(|key, _| single.is_linked(key)),
                None => found.clear(),
            }
        }
    }

    pub(crate) fn remove_excluded(&self, found: &mut NodeSet, types: &[ComponentType]) {
        for ty in types {
            if let Some(single) = self.existing_single(ty) {
                found.remove(&single.key);
                for key in single.link_keys() {
                    found.remove(&key);
                }
            }
        }
    }

    /// Materialized compositions containing every type in `S`
    pub fn find<S: ComponentSet>(&self) -> Vec<Arc<Composition>> {
        self.find_nodes(&S::component_types())
            .values()
            .filter_map(|node| node.composition())
            .collect()
    }

    /// Create an entity from a bundle of components
    pub fn create<B: Bundle>(&self, bundle: B) -> Result<Entity> {
        #[cfg(feature = "profiling")]
        let _span = info_span!("repository.create").entered();

        self.spawn(bundle.into_components())
    }

    fn spawn(&self, boxes: SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]>) -> Result<Entity> {
        let types: Signature = boxes.iter().map(|component| component.ty).collect();
        let composition = self.resolve(&types)?;
        let components = composition.arrange(boxes, false);
        composition.create_entity(components, false)
    }

    /// Resolve the composition for `B` once, for repeated [`emplace_prepared`](Self::emplace_prepared)
    pub fn prepare<B: Bundle>(&self) -> Result<Prepared<B>> {
        let types = B::component_types();
        if types.is_empty() {
            return Err(crate::error::InfernoError::EmptyComponents);
        }
        let composition = self.resolve(&types)?;
        let order = types
            .iter()
            .map(|ty| composition.slot_of(ty.type_id()).unwrap_or_default())
            .collect();
        Ok(Prepared {
            composition,
            order,
            _bundle: std::marker::PhantomData,
        })
    }

    /// Create an entity with a caller-built array that bypasses the array pool
    pub fn emplace<B: Bundle>(&self, bundle: B) -> Result<Entity> {
        let prepared = self.prepare::<B>()?;
        self.emplace_prepared(&prepared, bundle)
    }

    pub fn emplace_prepared<B: Bundle>(&self, prepared: &Prepared<B>, bundle: B) -> Result<Entity> {
        let mut cells: SmallVec<[Option<crate::component::ComponentCell>; MAX_BUNDLE_COMPONENTS]> =
            SmallVec::from_elem(None, prepared.order.len());
        for (component, slot) in bundle.into_components().into_iter().zip(&prepared.order) {
            cells[*slot] = Some(component.cell);
        }
        let array: Vec<_> = cells.into_iter().flatten().collect();
        prepared.composition.create_entity(Some(array), true)
    }

    /// Create an entity sharing the prefab's component cells, plus `bundle`
    pub fn emulate<B: Bundle>(&self, prefab: &Entity, bundle: B) -> Result<Entity> {
        let data = prefab.data();
        let Some(cells) = data.components.as_deref() else {
            return self.create(bundle);
        };
        let mut boxes: SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]> = data
            .composition
            .types()
            .iter()
            .zip(cells)
            .map(|(ty, cell)| ComponentBox {
                ty: *ty,
                cell: Arc::clone(cell),
            })
            .collect();
        boxes.extend(bundle.into_components());
        self.spawn(boxes)
    }

    /// Delete an entity. False if it was already deleted.
    pub fn delete(&self, entity: &Entity) -> bool {
        entity.delete()
    }

    pub fn add<T: Component>(&self, entity: &Entity, component: T) -> Result<bool> {
        self.transmute::<(T,), ()>(entity, (component,))
    }

    pub fn remove<S: ComponentSet>(&self, entity: &Entity) -> Result<bool> {
        self.transmute::<(), S>(entity, ())
    }

    /// Query entities holding every type in `Q`
    pub fn view<Q: ViewQuery>(&self) -> View<Q> {
        View::new(self.clone())
    }

    /// Create a scheduler driven by [`update`](Self::update) and
    /// [`update_at_rate`](Self::update_at_rate).
    ///
    /// The repository only tracks it: the scheduler shuts down once the
    /// returned handle and all its clones are dropped.
    pub fn create_scheduler(&self) -> Result<Arc<Scheduler>> {
        let config = SchedulerConfig::default().with_timeout(self.inner.config.timeout);
        let scheduler = Arc::new(Scheduler::new(config)?);
        self.inner.schedulers.lock().push(Arc::downgrade(&scheduler));
        Ok(scheduler)
    }

    /// Schedulers still alive; dropped ones are forgotten
    fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        let mut schedulers = self.inner.schedulers.lock();
        schedulers.retain(|scheduler| scheduler.strong_count() > 0);
        schedulers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Run every tracked scheduler once
    pub fn update(&self) -> bool {
        let schedulers = self.schedulers();
        schedulers
            .iter()
            .map(|scheduler| scheduler.run_once())
            .fold(true, |ok, ran| ok & ran)
    }

    /// Run every tracked scheduler at `ups` updates per second; 0 stops them
    pub fn update_at_rate(&self, ups: u32) -> bool {
        let schedulers = self.schedulers();
        schedulers
            .iter()
            .map(|scheduler| scheduler.run_at_rate(ups))
            .fold(true, |ok, ran| ok & ran)
    }

    /// Shut down every tracked scheduler and stop tracking them
    pub fn close(&self) -> bool {
        let schedulers = self.schedulers();
        self.inner.schedulers.lock().clear();
        let ok = schedulers
            .iter()
            .map(|scheduler| scheduler.shutdown())
            .fold(true, |ok, done| ok & done);
        if !ok {
            warn!(name = %self.inner.config.name, "not every scheduler terminated in time");
        }
        ok
    }

    /// Live entities across all compositions
    pub fn size(&self) -> usize {
        self.inner.pool.live()
    }

    /// Materialized compositions, including the root
    pub fn composition_count(&self) -> usize {
        1 + self
            .inner
            .nodes
            .iter()
            .filter(|node| node.composition.get().is_some())
            .count()
    }
}
