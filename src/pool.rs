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

//! Chunked pool and id schema
//!
//! Entity ids are 32-bit words laid out as `|FLAGS|CHUNK|SLOT|`. The two high
//! bits are flags, the remaining payload addresses a slot inside a chunk.
//! Chunks are handed out to tenants (one per composition) and grow
//! geometrically up to their fixed capacity.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{validate_chunk_layout, RepositoryConfig};
use crate::error::{InfernoError, Result};

pub const DETACHED_BIT: u32 = 1 << 31;
pub const EXTERNAL_ARRAY_BIT: u32 = 1 << 30;
pub const PAYLOAD_MASK: u32 = EXTERNAL_ARRAY_BIT - 1;

/// Smallest allocation made for a fresh chunk.
const MIN_CHUNK_ALLOCATION: usize = 16;

/// Packed entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(u32);

impl EntityId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn payload(self) -> u32 {
        self.0 & PAYLOAD_MASK
    }

    /// Replace the payload, keeping both flag bits.
    pub const fn with_payload(self, payload: u32) -> Self {
        Self((self.0 & !PAYLOAD_MASK) | (payload & PAYLOAD_MASK))
    }

    pub const fn is_detached(self) -> bool {
        self.0 & DETACHED_BIT != 0
    }

    pub const fn detached(self) -> Self {
        Self(self.0 | DETACHED_BIT)
    }

    pub const fn attached(self) -> Self {
        Self(self.0 & !DETACHED_BIT)
    }

    /// The entity's component array is not owned by the shared array pool.
    pub const fn is_external_array(self) -> bool {
        self.0 & EXTERNAL_ARRAY_BIT != 0
    }

    pub const fn with_external_array(self, external: bool) -> Self {
        if external {
            Self(self.0 | EXTERNAL_ARRAY_BIT)
        } else {
            Self(self.0 & !EXTERNAL_ARRAY_BIT)
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}", self.payload())?;
        if self.is_detached() {
            write!(f, ", detached")?;
        }
        if self.is_external_array() {
            write!(f, ", external")?;
        }
        write!(f, ")")
    }
}

/// Split of the id payload into chunk index and slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdSchema {
    chunk_bits: u32,
    chunk_count_bits: u32,
}

impl IdSchema {
    pub fn new(chunk_bits: u32, chunk_count_bits: u32) -> Result<Self> {
        validate_chunk_layout(chunk_bits, chunk_count_bits)?;
        Ok(Self {
            chunk_bits,
            chunk_count_bits,
        })
    }

    pub fn from_config(config: &RepositoryConfig) -> Result<Self> {
        Self::new(config.chunk_bits, config.chunk_count_bits)
    }

    /// Slots per chunk.
    pub fn chunk_capacity(&self) -> usize {
        1 << self.chunk_bits
    }

    /// Maximum number of chunks.
    pub fn chunk_count(&self) -> usize {
        1 << self.chunk_count_bits
    }

    pub fn create_id(&self, chunk: u32, slot: u32) -> EntityId {
        let chunk = chunk & ((1 << self.chunk_count_bits) - 1);
        let slot = slot & ((1 << self.chunk_bits) - 1);
        EntityId::from_raw((chunk << self.chunk_bits) | slot)
    }

    pub fn chunk_of(&self, id: EntityId) -> u32 {
        (id.payload() >> self.chunk_bits) & ((1 << self.chunk_count_bits) - 1)
    }

    pub fn slot_of(&self, id: EntityId) -> u32 {
        id.payload() & ((1 << self.chunk_bits) - 1)
    }

    /// `|detached:external:chunk:slot|`
    pub fn describe(&self, id: EntityId) -> String {
        format!(
            "|{}:{}:{}:{}|",
            u8::from(id.is_detached()),
            u8::from(id.is_external_array()),
            self.chunk_of(id),
            self.slot_of(id)
        )
    }
}

impl Default for IdSchema {
    fn default() -> Self {
        let config = RepositoryConfig::default();
        Self {
            chunk_bits: config.chunk_bits,
            chunk_count_bits: config.chunk_count_bits,
        }
    }
}

/// Values stored in a pool expose their current id.
pub trait Identifiable {
    fn id(&self) -> EntityId;
}

pub(crate) struct Chunk<T> {
    id: u32,
    capacity: usize,
    entries: RwLock<Vec<Option<T>>>,
}

impl<T> Chunk<T> {
    fn new(id: u32, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn put(&self, slot: usize, value: T) {
        let mut entries = self.entries.write();
        if slot >= entries.len() {
            let grown = (entries.len().max(MIN_CHUNK_ALLOCATION / 2) * 2)
                .max(slot + 1)
                .min(self.capacity);
            entries.resize_with(grown, || None);
        }
        debug_assert!(entries[slot].is_none(), "slot {slot} of chunk {} is occupied", self.id);
        entries[slot] = Some(value);
    }

    fn take(&self, slot: usize) -> Option<T> {
        self.entries.write().get_mut(slot).and_then(Option::take)
    }

    fn get(&self, slot: usize) -> Option<T>
    where
        T: Clone,
    {
        self.entries.read().get(slot).cloned().flatten()
    }
}

/// Shared slab of chunks. Tenants draw chunks from it.
pub struct ChunkedPool<T> {
    schema: IdSchema,
    chunks: RwLock<Vec<Arc<Chunk<T>>>>,
    live: AtomicUsize,
}

impl<T> ChunkedPool<T> {
    pub fn new(schema: IdSchema) -> Self {
        Self {
            schema,
            chunks: RwLock::new(Vec::new()),
            live: AtomicUsize::new(0),
        }
    }

    pub fn schema(&self) -> &IdSchema {
        &self.schema
    }

    /// Open a new tenant backed by this pool.
    pub fn tenant(self: &Arc<Self>) -> Tenant<T> {
        Tenant {
            pool: Arc::clone(self),
            state: Mutex::new(TenantState {
                chunks: Vec::new(),
                next_slot: 0,
                free: Vec::new(),
            }),
            live: AtomicUsize::new(0),
        }
    }

    fn allocate_chunk(&self) -> Result<Arc<Chunk<T>>> {
        let mut chunks = self.chunks.write();
        if chunks.len() >= self.schema.chunk_count() {
            return Err(InfernoError::PoolExhausted {
                chunk_count: self.schema.chunk_count(),
            });
        }
        let chunk = Arc::new(Chunk::new(chunks.len() as u32, self.schema.chunk_capacity()));
        chunks.push(Arc::clone(&chunk));
        Ok(chunk)
    }

    fn chunk(&self, id: u32) -> Option<Arc<Chunk<T>>> {
        self.chunks.read().get(id as usize).cloned()
    }

    /// Value registered under `id`, if it is still live.
    pub fn get(&self, id: EntityId) -> Option<T>
    where
        T: Clone,
    {
        if id.is_detached() {
            return None;
        }
        self.chunk(self.schema.chunk_of(id))?
            .get(self.schema.slot_of(id) as usize)
    }

    /// Values registered across all tenants.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn chunks_allocated(&self) -> usize {
        self.chunks.read().len()
    }
}

struct TenantState<T> {
    chunks: Vec<Arc<Chunk<T>>>,
    next_slot: usize,
    free: Vec<EntityId>,
}

/// The part of the pool owned by a single composition.
pub struct Tenant<T> {
    pool: Arc<ChunkedPool<T>>,
    state: Mutex<TenantState<T>>,
    live: AtomicUsize,
}

impl<T> Tenant<T> {
    /// Reserve a slot. Freed ids are reused before new slots are opened.
    pub fn next_id(&self) -> Result<EntityId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return Ok(id);
        }
        let capacity = self.pool.schema.chunk_capacity();
        let chunk_id = match state.chunks.last() {
            Some(chunk) if state.next_slot < capacity => chunk.id,
            _ => {
                let chunk = self.pool.allocate_chunk()?;
                let id = chunk.id;
                state.chunks.push(chunk);
                state.next_slot = 0;
                id
            }
        };
        let slot = state.next_slot as u32;
        state.next_slot += 1;
        Ok(self.pool.schema.create_id(chunk_id, slot))
    }

    /// Bind `value` to a slot returned by [`next_id`](Self::next_id).
    pub fn register(&self, id: EntityId, value: T) {
        let Some(chunk) = self.pool.chunk(self.pool.schema.chunk_of(id)) else {
            debug_assert!(false, "id {id:?} does not map to an allocated chunk");
            return;
        };
        chunk.put(self.pool.schema.slot_of(id) as usize, value);
        self.live.fetch_add(1, Ordering::AcqRel);
        self.pool.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Release the slot behind `id` and return what it held.
    pub fn free_id(&self, id: EntityId) -> Option<T> {
        let chunk = self.pool.chunk(self.pool.schema.chunk_of(id))?;
        let value = chunk.take(self.pool.schema.slot_of(id) as usize)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
        self.state
            .lock()
            .free
            .push(EntityId::from_raw(id.payload()));
        Some(value)
    }

    /// Iterate registered values, skipping those flagged detached.
    pub fn iter(&self) -> PoolIter<T>
    where
        T: Clone + Identifiable,
    {
        PoolIter {
            chunks: self.state.lock().chunks.clone(),
            chunk: 0,
            slot: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered value.
    pub(crate) fn clear(&self) {
        let chunks = self.state.lock().chunks.clone();
        for chunk in chunks {
            let dropped = std::mem::take(&mut *chunk.entries.write());
            let count = dropped.iter().filter(|entry| entry.is_some()).count();
            self.live.fetch_sub(count, Ordering::AcqRel);
            self.pool.live.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

/// Snapshot iterator over a tenant.
///
/// The chunk list is captured up front; each step takes a short read lock so
/// concurrent frees are observed as skipped entries.
pub struct PoolIter<T> {
    chunks: Vec<Arc<Chunk<T>>>,
    chunk: usize,
    slot: usize,
}

impl<T: Clone + Identifiable> Iterator for PoolIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let chunk = self.chunks.get(self.chunk)?;
            let step = chunk.entries.read().get(self.slot).cloned();
            match step {
                None => {
                    self.chunk += 1;
                    self.slot = 0;
                }
                Some(entry) => {
                    self.slot += 1;
                    if let Some(item) = entry.filter(|item| !item.id().is_detached()) {
                        return Some(item);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        id: EntityId,
        value: u32,
    }

    impl Identifiable for Item {
        fn id(&self) -> EntityId {
            self.id
        }
    }

    fn small_pool() -> Arc<ChunkedPool<Item>> {
        Arc::new(ChunkedPool::new(IdSchema::new(10, 6).unwrap()))
    }

    #[test]
    fn test_payload_update_preserves_flags() {
        let id = EntityId::from_raw(7).detached().with_external_array(true);
        let moved = id.with_payload(42);
        assert_eq!(moved.payload(), 42);
        assert!(moved.is_detached());
        assert!(moved.is_external_array());
        assert!(!moved.attached().is_detached());
        assert!(moved.attached().is_external_array());
    }

    #[test]
    fn test_schema_round_trips_chunk_and_slot() {
        let schema = IdSchema::new(14, 16).unwrap();
        let id = schema.create_id(3, 1025);
        assert_eq!(schema.chunk_of(id), 3);
        assert_eq!(schema.slot_of(id), 1025);
        assert_eq!(schema.chunk_of(id.detached()), 3);
        assert_eq!(schema.describe(id.detached()), "|1:0:3:1025|");
    }

    #[test]
    fn test_schema_rejects_bad_layout() {
        assert!(IdSchema::new(8, 16).is_err());
        assert!(IdSchema::new(24, 20).is_err());
    }

    #[test]
    fn test_tenant_allocates_registers_and_frees() {
        let pool = small_pool();
        let tenant = pool.tenant();

        let a = tenant.next_id().unwrap();
        let b = tenant.next_id().unwrap();
        assert_ne!(a, b);
        tenant.register(a, Item { id: a, value: 1 });
        tenant.register(b, Item { id: b, value: 2 });
        assert_eq!(tenant.len(), 2);
        assert_eq!(pool.get(b).map(|item| item.value), Some(2));

        let freed = tenant.free_id(a).unwrap();
        assert_eq!(freed.value, 1);
        assert_eq!(tenant.len(), 1);
        assert!(pool.get(a).is_none());

        // Freed slots are reused first
        assert_eq!(tenant.next_id().unwrap(), a);
    }

    #[test]
    fn test_growth_keeps_ids_valid() {
        let pool = small_pool();
        let tenant = pool.tenant();
        let ids: Vec<_> = (0..2000)
            .map(|value| {
                let id = tenant.next_id().unwrap();
                tenant.register(id, Item { id, value });
                id
            })
            .collect();

        // 1024 slots per chunk
        assert_eq!(pool.chunks_allocated(), 2);
        for (value, id) in ids.iter().enumerate() {
            assert_eq!(pool.get(*id).unwrap().value, value as u32);
        }
        assert_eq!(tenant.iter().count(), 2000);
    }

    #[test]
    fn test_iterator_skips_detached_and_freed() {
        let pool = small_pool();
        let tenant = pool.tenant();
        let mut ids = Vec::new();
        for value in 0..5 {
            let id = tenant.next_id().unwrap();
            let stored = if value == 3 { id.detached() } else { id };
            tenant.register(id, Item { id: stored, value });
            ids.push(id);
        }
        tenant.free_id(ids[1]);

        let seen: Vec<u32> = tenant.iter().map(|item| item.value).collect();
        assert_eq!(seen, vec![0, 2, 4]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool: Arc<ChunkedPool<Item>> = Arc::new(ChunkedPool::new(IdSchema::new(10, 6).unwrap()));
        let tenants: Vec<_> = (0..64).map(|_| pool.tenant()).collect();
        for tenant in &tenants {
            tenant.next_id().unwrap();
        }
        let extra = pool.tenant();
        assert!(matches!(
            extra.next_id(),
            Err(InfernoError::PoolExhausted { chunk_count: 64 })
        ));
    }
}
