//! Archetype storage.
//!
//! An [`Archetype`] stores all entities that share one exact
//! (component-set, tag-set) combination, identified by an immutable
//! [`ArchetypeKey`]. Components are laid out SoA-style: one
//! [`StructHeap`](crate::storage::StructHeap) per component type, plus a
//! parallel entity-id vector. Archetypes are created lazily and never
//! destroyed, so archetype ids stay stable for the lifetime of the store.

use crate::schema::{ComponentIndex, Schema, TagIndex};
use crate::signature::{ComponentBits, TagBits};
use crate::storage::{StructHeap, CHUNK_SIZE};
use crate::store::EntityId;

use std::sync::Arc;

// ---------------------------------------------------------------------------
// ArchetypeId / ArchetypeKey
// ---------------------------------------------------------------------------

/// Identifies an archetype within the store. Indices into the store's
/// append-only archetype list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    /// The empty archetype, created eagerly at store construction.
    pub(crate) const EMPTY: Self = Self(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The immutable identity of an archetype: which components and tags its
/// entities carry. Used as the directory key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArchetypeKey {
    pub components: ComponentBits,
    pub tags: TagBits,
}

impl ArchetypeKey {
    pub const EMPTY: Self = Self {
        components: ComponentBits::EMPTY,
        tags: TagBits::EMPTY,
    };

    pub fn new(components: ComponentBits, tags: TagBits) -> Self {
        Self { components, tags }
    }

    #[inline]
    pub fn with_component(mut self, index: ComponentIndex) -> Self {
        self.components.add(index);
        self
    }

    #[inline]
    pub fn without_component(mut self, index: ComponentIndex) -> Self {
        self.components.remove(index);
        self
    }

    #[inline]
    pub fn with_tag(mut self, index: TagIndex) -> Self {
        self.tags.add(index);
        self
    }

    #[inline]
    pub fn without_tag(mut self, index: TagIndex) -> Self {
        self.tags.remove(index);
        self
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Storage partition for one [`ArchetypeKey`].
///
/// Heaps are sorted by [`ComponentIndex`] for deterministic order and
/// binary-search lookups. Invariant: every heap and the entity-id vector
/// have the same length.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    key: ArchetypeKey,
    /// One heap per component in the key, sorted by component index.
    heaps: Vec<StructHeap>,
    /// Parallel row -> entity mapping.
    entities: Vec<EntityId>,
    /// Tag display names, for key rendering.
    tag_names: Vec<Arc<str>>,
}

impl Archetype {
    /// Create an empty archetype for `key`, with one heap per component.
    ///
    /// Bit iteration yields ascending indices, so the heap list is sorted by
    /// construction.
    pub(crate) fn new(id: ArchetypeId, key: ArchetypeKey, schema: &Schema) -> Self {
        let heaps = key
            .components
            .bits()
            .map(|c| StructHeap::new(schema.component_info(c)))
            .collect();
        let tag_names = key.tags.bits().map(|t| schema.tag_info(t).name.clone()).collect();
        Self {
            id,
            key,
            heaps,
            entities: Vec::new(),
            tag_names,
        }
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    #[inline]
    pub fn key(&self) -> ArchetypeKey {
        self.key
    }

    /// Number of live rows (entities).
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Row -> entity mapping.
    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Number of chunks holding at least one live row.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.entities.len().div_ceil(CHUNK_SIZE)
    }

    #[inline]
    pub(crate) fn heaps(&self) -> &[StructHeap] {
        &self.heaps
    }

    #[inline]
    pub(crate) fn heaps_mut(&mut self) -> &mut [StructHeap] {
        &mut self.heaps
    }

    /// Binary search for the heap storing `component`.
    #[inline]
    pub(crate) fn heap(&self, component: ComponentIndex) -> Option<&StructHeap> {
        self.heaps
            .binary_search_by_key(&component, |h| h.component())
            .ok()
            .map(|i| &self.heaps[i])
    }

    #[inline]
    pub(crate) fn heap_mut(&mut self, component: ComponentIndex) -> Option<&mut StructHeap> {
        self.heaps
            .binary_search_by_key(&component, |h| h.component())
            .ok()
            .map(move |i| &mut self.heaps[i])
    }

    /// Append a row with default-constructed values for every component.
    pub(crate) fn push_default_row(&mut self, entity: EntityId) -> u32 {
        let row = self.entities.len() as u32;
        for heap in &mut self.heaps {
            heap.push_default();
        }
        self.entities.push(entity);
        row
    }

    /// Append only the entity id; the caller has already filled every heap
    /// for this row.
    pub(crate) fn push_entity_id(&mut self, entity: EntityId) -> u32 {
        let row = self.entities.len() as u32;
        self.entities.push(entity);
        row
    }

    /// Swap-remove the entity id at `row`, returning the entity that moved
    /// into `row`, if any. The caller has already drained every heap.
    pub(crate) fn swap_remove_entity_id(&mut self, row: usize) -> Option<EntityId> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        (row < last).then(|| self.entities[row])
    }

    /// Swap-remove a whole row: drop every component value and compact.
    /// Returns the entity that moved into `row`, if any.
    pub(crate) fn swap_remove_row(&mut self, row: usize) -> Option<EntityId> {
        for heap in &mut self.heaps {
            unsafe { heap.swap_remove(row) };
        }
        self.swap_remove_entity_id(row)
    }

    /// Bracket list of the key's type names: components sorted
    /// alphabetically, then tags sorted alphabetically and prefixed `#`,
    /// e.g. `[EntityName, Position, #TestTag]`.
    pub(crate) fn type_list_string(&self) -> String {
        let mut components: Vec<&str> = self.heaps.iter().map(|h| h.name()).collect();
        components.sort_unstable();
        let mut tags: Vec<&str> = self.tag_names.iter().map(|t| t.as_ref()).collect();
        tags.sort_unstable();

        let mut out = String::from("[");
        let mut first = true;
        for name in components {
            if !first {
                out.push_str(", ");
            }
            out.push_str(name);
            first = false;
        }
        for name in tags {
            if !first {
                out.push_str(", ");
            }
            out.push('#');
            out.push_str(name);
            first = false;
        }
        out.push(']');
        out
    }

    /// Key rendering, e.g. `Key: [Position, Rotation, #Disabled]`. Part of
    /// the debug-string contract.
    pub fn key_string(&self) -> String {
        format!("Key: {}", self.type_list_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
