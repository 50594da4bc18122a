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

//! Component cells, bundles and state tags
//!
//! Components are data attached to entities. Every component value lives in
//! its own shared cell so views can hand out typed references while the
//! owning entity moves between compositions.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::{smallvec, SmallVec};

/// Maximum number of components supported by Bundle implementations
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Type-erased component storage. Always wraps a `RwLock<T>`.
pub type ComponentCell = Arc<dyn Any + Send + Sync>;

/// Ordered component cells of one entity.
pub type ComponentArray = Vec<ComponentCell>;

/// Runtime descriptor of a component type.
#[derive(Clone, Copy)]
pub struct ComponentType {
    type_id: TypeId,
    name: &'static str,
}

impl ComponentType {
    pub fn of<T: Component>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ComponentType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ComponentType {}

impl Hash for ComponentType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Strip the module path for readability
        let short = self.name.rsplit("::").next().unwrap_or(self.name);
        write!(f, "{short}")
    }
}

/// Wrap a value in a fresh component cell.
pub fn new_cell<T: Component>(value: T) -> ComponentCell {
    Arc::new(RwLock::new(value))
}

/// Typed handle to a component cell.
pub struct ComponentRef<T> {
    cell: Arc<RwLock<T>>,
}

impl<T: Component> ComponentRef<T> {
    /// Downcast a type-erased cell; `None` if the cell holds another type.
    pub fn from_cell(cell: &ComponentCell) -> Option<Self> {
        Arc::clone(cell)
            .downcast::<RwLock<T>>()
            .ok()
            .map(|cell| Self { cell })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write()
    }

    /// Copy the current value out.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.cell.read().clone()
    }

    pub fn set(&self, value: T) {
        *self.cell.write() = value;
    }

    /// True when both handles point at the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> Clone for ComponentRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ComponentRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComponentRef").field(&*self.cell.read()).finish()
    }
}

/// A component value paired with its type, ready to be placed into a composition.
#[derive(Clone)]
pub struct ComponentBox {
    pub ty: ComponentType,
    pub cell: ComponentCell,
}

impl ComponentBox {
    pub fn new<T: Component>(value: T) -> Self {
        Self {
            ty: ComponentType::of::<T>(),
            cell: new_cell(value),
        }
    }
}

/// Static list of component types, used for removals and queries.
pub trait ComponentSet: 'static {
    fn component_types() -> SmallVec<[ComponentType; MAX_BUNDLE_COMPONENTS]>;
}

/// Bundle of components
///
/// Allows creating entities with multiple components at once.
pub trait Bundle: ComponentSet + Send + Sync {
    fn into_components(self) -> SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]>;
}

impl ComponentSet for () {
    fn component_types() -> SmallVec<[ComponentType; MAX_BUNDLE_COMPONENTS]> {
        SmallVec::new()
    }
}

impl Bundle for () {
    fn into_components(self) -> SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]> {
        SmallVec::new()
    }
}

// DO NOT implement Bundle for T: Component
// This conflicts with tuple implementations
macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> ComponentSet for ($($T,)*) {
            fn component_types() -> SmallVec<[ComponentType; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(ComponentType::of::<$T>()),*]
            }
        }

        impl<$($T: Component),*> Bundle for ($($T,)*) {
            #[allow(non_snake_case)]
            fn into_components(self) -> SmallVec<[ComponentBox; MAX_BUNDLE_COMPONENTS]> {
                let ($($T,)*) = self;
                smallvec![$(ComponentBox::new($T)),*]
            }
        }
    };
}

// Implement for tuples of 1-8 components
impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);

/// Caller-defined enum-like tag used to group entities into state chains.
///
/// Two tags of the same type with the same ordinal select the same chain.
pub trait StateTag: Component {
    fn ordinal(&self) -> u32;
}
