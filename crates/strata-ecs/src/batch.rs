//! Deferred structural mutation.
//!
//! A [`Batch`] accumulates component/tag additions and removals for one
//! entity and applies the net effect as a single migration. A [`BulkBatch`]
//! holds the same command set but is replayed against many entities,
//! cloning staged values per target. [`EntityList`] is the reusable bulk id
//! list used for tree-wide and import-style tag updates.
//!
//! Staged component values live in a 16-byte-aligned arena that is cleared
//! but never shrunk, so repeated stage/apply cycles allocate nothing once
//! warm.
//!
//! # Safety
//!
//! The arena stores type-erased values; every staged slot is written, moved
//! or dropped through the vtable captured at staging time, and ownership of
//! each value is transferred exactly once.

use crate::archetype::ArchetypeKey;
use crate::schema::{ComponentIndex, ComponentVtable, Schema, TagIndex};
use crate::signature::{ComponentBits, TagBits};
use crate::store::{EntityId, EntityStore};
use crate::EcsError;

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CommandList -- shared staging state
// ---------------------------------------------------------------------------

struct StagedAdd {
    component: ComponentIndex,
    name: Arc<str>,
    vtable: ComponentVtable,
    /// Offset into the arena, in 16-byte slots.
    offset: usize,
}

/// Net-effect command accumulator shared by [`Batch`] and [`BulkBatch`].
///
/// Presence follows the last writer: an add cancels a pending remove of the
/// same type and vice versa; a repeated add keeps only the latest value.
#[derive(Default)]
struct CommandList {
    adds: Vec<StagedAdd>,
    removes: Vec<(ComponentIndex, Arc<str>)>,
    tag_adds: Vec<(TagIndex, Arc<str>)>,
    tag_removes: Vec<(TagIndex, Arc<str>)>,
    /// Value arena; `u128` elements give every slot 16-byte alignment.
    arena: Vec<u128>,
}

impl CommandList {
    fn is_empty(&self) -> bool {
        self.adds.is_empty()
            && self.removes.is_empty()
            && self.tag_adds.is_empty()
            && self.tag_removes.is_empty()
    }

    #[inline]
    fn slot_ptr(&self, offset: usize) -> *const u8 {
        (self.arena.as_ptr() as *const u8).wrapping_add(offset * 16)
    }

    #[inline]
    fn slot_ptr_mut(&mut self, offset: usize) -> *mut u8 {
        (self.arena.as_mut_ptr() as *mut u8).wrapping_add(offset * 16)
    }

    fn alloc_slots(&mut self, size: usize) -> usize {
        let offset = self.arena.len();
        self.arena.resize(offset + size.div_ceil(16), 0);
        offset
    }

    fn stage_add<T: 'static>(&mut self, schema: &Schema, value: T) -> Result<(), EcsError> {
        let index = schema.component_index::<T>()?;
        let info = schema.component_info(index);
        if let Some(pos) = self.removes.iter().position(|(c, _)| *c == index) {
            self.removes.swap_remove(pos);
        }
        let value = ManuallyDrop::new(value);
        let src = &*value as *const T as *const u8;
        let size = info.vtable.size;
        match self.adds.iter().position(|a| a.component == index) {
            Some(i) => {
                // Re-add of the same type: drop the superseded value and
                // reuse its slot.
                let dst = self.slot_ptr_mut(self.adds[i].offset);
                unsafe {
                    (self.adds[i].vtable.drop_fn)(dst);
                    ptr::copy_nonoverlapping(src, dst, size);
                }
            }
            None => {
                let offset = self.alloc_slots(size);
                let dst = self.slot_ptr_mut(offset);
                unsafe { ptr::copy_nonoverlapping(src, dst, size) };
                self.adds.push(StagedAdd {
                    component: index,
                    name: info.name.clone(),
                    vtable: info.vtable.clone(),
                    offset,
                });
            }
        }
        Ok(())
    }

    fn stage_remove<T: 'static>(&mut self, schema: &Schema) -> Result<(), EcsError> {
        let index = schema.component_index::<T>()?;
        if let Some(i) = self.adds.iter().position(|a| a.component == index) {
            let add = self.adds.swap_remove(i);
            unsafe { (add.vtable.drop_fn)(self.slot_ptr_mut(add.offset)) };
        }
        if !self.removes.iter().any(|(c, _)| *c == index) {
            self.removes
                .push((index, schema.component_info(index).name.clone()));
        }
        Ok(())
    }

    fn stage_add_tag<T: 'static>(&mut self, schema: &Schema) -> Result<(), EcsError> {
        let index = schema.tag_index::<T>()?;
        if let Some(pos) = self.tag_removes.iter().position(|(t, _)| *t == index) {
            self.tag_removes.swap_remove(pos);
        }
        if !self.tag_adds.iter().any(|(t, _)| *t == index) {
            self.tag_adds
                .push((index, schema.tag_info(index).name.clone()));
        }
        Ok(())
    }

    fn stage_remove_tag<T: 'static>(&mut self, schema: &Schema) -> Result<(), EcsError> {
        let index = schema.tag_index::<T>()?;
        if let Some(pos) = self.tag_adds.iter().position(|(t, _)| *t == index) {
            self.tag_adds.swap_remove(pos);
        }
        if !self.tag_removes.iter().any(|(t, _)| *t == index) {
            self.tag_removes
                .push((index, schema.tag_info(index).name.clone()));
        }
        Ok(())
    }

    fn staged_component_bits(&self) -> ComponentBits {
        let mut bits = ComponentBits::EMPTY;
        for add in &self.adds {
            bits.add(add.component);
        }
        bits
    }

    /// The key the target entity ends up in: removals first, then adds.
    fn target_key(&self, mut key: ArchetypeKey) -> ArchetypeKey {
        for (component, _) in &self.removes {
            key.components.remove(*component);
        }
        for add in &self.adds {
            key.components.add(add.component);
        }
        for (tag, _) in &self.tag_removes {
            key.tags.remove(*tag);
        }
        for (tag, _) in &self.tag_adds {
            key.tags.add(*tag);
        }
        key
    }

    /// Clear all commands, dropping staged values. Capacity is retained.
    fn clear(&mut self) {
        let base = self.arena.as_mut_ptr() as *mut u8;
        for add in self.adds.drain(..) {
            unsafe { (add.vtable.drop_fn)(base.wrapping_add(add.offset * 16)) };
        }
        self.removes.clear();
        self.tag_adds.clear();
        self.tag_removes.clear();
        self.arena.clear();
    }

    /// Clear after staged values moved into heaps: nothing to drop.
    fn clear_after_move(&mut self) {
        self.adds.clear();
        self.removes.clear();
        self.tag_adds.clear();
        self.tag_removes.clear();
        self.arena.clear();
    }

    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("empty");
        }
        let mut first_section = true;
        let add_components: Vec<&str> = self.adds.iter().map(|a| a.name.as_ref()).collect();
        let add_tags: Vec<&str> = self.tag_adds.iter().map(|(_, n)| n.as_ref()).collect();
        if !add_components.is_empty() || !add_tags.is_empty() {
            render_section(f, "add", add_components, add_tags)?;
            first_section = false;
        }
        let remove_components: Vec<&str> = self.removes.iter().map(|(_, n)| n.as_ref()).collect();
        let remove_tags: Vec<&str> = self.tag_removes.iter().map(|(_, n)| n.as_ref()).collect();
        if !remove_components.is_empty() || !remove_tags.is_empty() {
            if !first_section {
                f.write_str("  ")?;
            }
            render_section(f, "remove", remove_components, remove_tags)?;
        }
        Ok(())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.clear();
    }
}

/// One summary section, e.g. `add: [Pos, #Frozen]`: component names sorted,
/// then tag names sorted and prefixed `#`.
fn render_section(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    mut components: Vec<&str>,
    mut tags: Vec<&str>,
) -> fmt::Result {
    components.sort_unstable();
    tags.sort_unstable();
    write!(f, "{label}: [")?;
    let mut first = true;
    for name in components {
        if !first {
            f.write_str(", ")?;
        }
        f.write_str(name)?;
        first = false;
    }
    for name in tags {
        if !first {
            f.write_str(", ")?;
        }
        write!(f, "#{name}")?;
        first = false;
    }
    f.write_str("]")
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Staged mutation plan for one entity, applied as a single migration.
///
/// After a successful [`apply`](Self::apply) the batch is empty again and
/// can be restaged; its buffers are reused.
pub struct Batch {
    entity: EntityId,
    commands: CommandList,
}

impl Batch {
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            commands: CommandList::default(),
        }
    }

    #[inline]
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Stage a component value. Supersedes an earlier add of the same type
    /// and cancels a pending remove of it.
    pub fn add_component<T: 'static>(
        &mut self,
        store: &EntityStore,
        value: T,
    ) -> Result<&mut Self, EcsError> {
        self.commands.stage_add(store.schema(), value)?;
        Ok(self)
    }

    /// Stage a component removal, cancelling a pending add of the same type.
    pub fn remove_component<T: 'static>(
        &mut self,
        store: &EntityStore,
    ) -> Result<&mut Self, EcsError> {
        self.commands.stage_remove::<T>(store.schema())?;
        Ok(self)
    }

    pub fn add_tag<T: 'static>(&mut self, store: &EntityStore) -> Result<&mut Self, EcsError> {
        self.commands.stage_add_tag::<T>(store.schema())?;
        Ok(self)
    }

    pub fn remove_tag<T: 'static>(&mut self, store: &EntityStore) -> Result<&mut Self, EcsError> {
        self.commands.stage_remove_tag::<T>(store.schema())?;
        Ok(self)
    }

    /// Apply the net effect in one migration. An empty batch is a no-op
    /// success without migration.
    pub fn apply(&mut self, store: &mut EntityStore) -> Result<(), EcsError> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let key = store.entity_key(self.entity)?;
        let dst = self.commands.target_key(key);
        let staged_bits = self.commands.staged_component_bits();
        let base = self.commands.arena.as_ptr() as *const u8;
        let adds = &self.commands.adds;
        store.migrate_with(self.entity, dst, staged_bits, |component| {
            // staged_bits is built from `adds`, so the lookup cannot miss
            let add = adds
                .iter()
                .find(|a| a.component == component)
                .expect("staged component missing from command list");
            base.wrapping_add(add.offset * 16)
        })?;
        self.commands.clear_after_move();
        Ok(())
    }

    /// Discard all staged commands, dropping staged values.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// Deterministic command summary, e.g.
/// `add: [Pos, #Frozen]  remove: [Vel]`, or `empty` when nothing is staged.
/// Part of the debug-string contract.
impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.commands.render(f)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch(entity: {}, {})", self.entity, self)
    }
}

// ---------------------------------------------------------------------------
// BulkBatch
// ---------------------------------------------------------------------------

/// A command set staged once and replayed against many entities. Staged
/// values are cloned per target, so the batch stays intact across
/// [`apply_to`](Self::apply_to) calls.
#[derive(Default)]
pub struct BulkBatch {
    commands: CommandList,
    /// Clone staging area, mirroring the arena layout.
    scratch: Vec<u128>,
}

impl BulkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn add_component<T: 'static>(
        &mut self,
        store: &EntityStore,
        value: T,
    ) -> Result<&mut Self, EcsError> {
        self.commands.stage_add(store.schema(), value)?;
        Ok(self)
    }

    pub fn remove_component<T: 'static>(
        &mut self,
        store: &EntityStore,
    ) -> Result<&mut Self, EcsError> {
        self.commands.stage_remove::<T>(store.schema())?;
        Ok(self)
    }

    pub fn add_tag<T: 'static>(&mut self, store: &EntityStore) -> Result<&mut Self, EcsError> {
        self.commands.stage_add_tag::<T>(store.schema())?;
        Ok(self)
    }

    pub fn remove_tag<T: 'static>(&mut self, store: &EntityStore) -> Result<&mut Self, EcsError> {
        self.commands.stage_remove_tag::<T>(store.schema())?;
        Ok(self)
    }

    /// A bulk batch has no target entity, so a bare apply is always an
    /// error; use [`apply_to`](Self::apply_to).
    pub fn apply(&self) -> Result<(), EcsError> {
        Err(EcsError::BulkBatchWithoutTarget)
    }

    /// Replay the command set against one entity, cloning staged values.
    pub fn apply_to(&mut self, store: &mut EntityStore, entity: EntityId) -> Result<(), EcsError> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let key = store.entity_key(entity)?;
        let dst = self.commands.target_key(key);
        let staged_bits = self.commands.staged_component_bits();
        self.scratch.resize(self.commands.arena.len(), 0);
        let arena = self.commands.arena.as_ptr() as *const u8;
        let scratch = self.scratch.as_mut_ptr() as *mut u8;
        let adds = &self.commands.adds;
        store.migrate_with(entity, dst, staged_bits, |component| {
            let add = adds
                .iter()
                .find(|a| a.component == component)
                .expect("staged component missing from command list");
            unsafe {
                let src = arena.add(add.offset * 16);
                let cloned = scratch.add(add.offset * 16);
                (add.vtable.clone_fn)(src, cloned);
                cloned as *const u8
            }
        })
    }

    /// Discard all staged commands, dropping staged values.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl fmt::Display for BulkBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.commands.render(f)
    }
}

impl fmt::Debug for BulkBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BulkBatch({self})")
    }
}

// ---------------------------------------------------------------------------
// EntityList
// ---------------------------------------------------------------------------

/// A reusable list of entity ids for bulk operations. Stale ids are skipped
/// with a warning rather than failing the whole pass.
#[derive(Debug, Clone, Default)]
pub struct EntityList {
    ids: Vec<EntityId>,
}

impl EntityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entity: EntityId) {
        self.ids.push(entity);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    /// Add every tag in `tags` to every listed entity.
    pub fn add_tags(&self, store: &mut EntityStore, tags: TagBits) {
        for &entity in &self.ids {
            if store.add_tags(entity, tags).is_err() {
                tracing::warn!(entity = entity.raw(), "skipping stale entity in bulk tag add");
            }
        }
    }

    /// Remove every tag in `tags` from every listed entity.
    pub fn remove_tags(&self, store: &mut EntityStore, tags: TagBits) {
        for &entity in &self.ids {
            if store.remove_tags(entity, tags).is_err() {
                tracing::warn!(
                    entity = entity.raw(),
                    "skipping stale entity in bulk tag remove"
                );
            }
        }
    }

    /// Replay a [`BulkBatch`] against every listed entity.
    pub fn apply_batch(&self, store: &mut EntityStore, batch: &mut BulkBatch) {
        for &entity in &self.ids {
            if batch.apply_to(store, entity).is_err() {
                tracing::warn!(
                    entity = entity.raw(),
                    "skipping stale entity in bulk batch apply"
                );
            }
        }
    }
}

impl Extend<EntityId> for EntityList {
    fn extend<I: IntoIterator<Item = EntityId>>(&mut self, iter: I) {
        self.ids.extend(iter);
    }
}

impl FromIterator<EntityId> for EntityList {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityName;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    struct Frozen;

    fn setup_store() -> EntityStore {
        let mut store = EntityStore::new();
        store.register_component::<Pos>("Pos").unwrap();
        store.register_component::<Vel>("Vel").unwrap();
        store.register_tag::<Frozen>("Frozen").unwrap();
        store
    }

    #[test]
    fn empty_batch_apply_is_a_no_op() {
        let mut store = setup_store();
        let e = store.create_entity();
        store.add_component(e, Pos { x: 1.0, y: 1.0 }).unwrap();
        let archetypes_before = store.archetype_count();

        let mut batch = Batch::new(e);
        assert_eq!(batch.to_string(), "empty");
        batch.apply(&mut store).unwrap();

        assert_eq!(store.archetype_count(), archetypes_before);
        assert_eq!(store.get_component::<Pos>(e), Some(&Pos { x: 1.0, y: 1.0 }));
    }

    #[test]
    fn batch_applies_net_effect_in_one_migration() {
        let mut store = setup_store();
        let e = store.create_entity();
        store.add_component(e, Vel::default()).unwrap();
        let arch_before = store.entity_node(e).unwrap().archetype();

        let mut batch = Batch::new(e);
        batch
            .add_component(&store, Pos { x: 2.0, y: 3.0 })
            .unwrap()
            .remove_component::<Vel>(&store)
            .unwrap()
            .add_tag::<Frozen>(&store)
            .unwrap();
        batch.apply(&mut store).unwrap();

        assert_ne!(store.entity_node(e).unwrap().archetype(), arch_before);
        assert_eq!(store.get_component::<Pos>(e), Some(&Pos { x: 2.0, y: 3.0 }));
        assert_eq!(store.get_component::<Vel>(e), None);
        assert!(store.has_tag::<Frozen>(e));
        // The batch is spent and reusable.
        assert!(batch.is_empty());
        assert_eq!(batch.to_string(), "empty");
    }

    #[test]
    fn add_after_remove_resolves_to_add_with_latest_value() {
        let mut store = setup_store();
        let e = store.create_entity();
        store.add_component(e, Pos { x: 0.0, y: 0.0 }).unwrap();

        let mut batch = Batch::new(e);
        batch.remove_component::<Pos>(&store).unwrap();
        batch.add_component(&store, Pos { x: 1.0, y: 0.0 }).unwrap();
        batch.add_component(&store, Pos { x: 2.0, y: 0.0 }).unwrap();
        batch.apply(&mut store).unwrap();

        assert_eq!(store.get_component::<Pos>(e), Some(&Pos { x: 2.0, y: 0.0 }));
    }

    #[test]
    fn remove_after_add_resolves_to_remove() {
        let mut store = setup_store();
        let e = store.create_entity();
        store.add_component(e, Pos { x: 1.0, y: 1.0 }).unwrap();

        let mut batch = Batch::new(e);
        batch.add_component(&store, Pos { x: 9.0, y: 9.0 }).unwrap();
        batch.remove_component::<Pos>(&store).unwrap();
        assert_eq!(batch.to_string(), "remove: [Pos]");
        batch.apply(&mut store).unwrap();

        assert_eq!(store.get_component::<Pos>(e), None);
    }

    #[test]
    fn display_is_type_name_sorted() {
        let store = setup_store();
        let mut batch = Batch::new(EntityId::NONE);
        batch.add_component(&store, Vel::default()).unwrap();
        batch.add_tag::<Frozen>(&store).unwrap();
        batch.add_component(&store, Pos::default()).unwrap();
        batch.remove_component::<EntityName>(&store).unwrap();
        assert_eq!(
            batch.to_string(),
            "add: [Pos, Vel, #Frozen]  remove: [EntityName]"
        );
    }

    #[test]
    fn unregistered_type_fails_at_staging_time() {
        let store = setup_store();
        struct Unknown;
        let mut batch = Batch::new(EntityId::NONE);
        assert!(batch.add_tag::<Unknown>(&store).is_err());
    }

    #[test]
    fn bulk_batch_apply_without_target_fails() {
        let store = setup_store();
        let mut bulk = BulkBatch::new();
        bulk.add_component(&store, Pos::default()).unwrap();
        let err = bulk.apply().unwrap_err();
        assert!(matches!(err, EcsError::BulkBatchWithoutTarget));
        assert!(err.to_string().contains("apply_to"));
    }

    #[test]
    fn bulk_batch_clones_values_per_target() {
        let mut store = setup_store();
        let a = store.create_entity();
        let b = store.create_entity();

        let mut bulk = BulkBatch::new();
        bulk.add_component(&store, EntityName("clone".to_owned()))
            .unwrap()
            .add_tag::<Frozen>(&store)
            .unwrap();
        bulk.apply_to(&mut store, a).unwrap();
        bulk.apply_to(&mut store, b).unwrap();

        // Independent clones on both targets; the batch is still staged.
        assert!(!bulk.is_empty());
        store.get_component_mut::<EntityName>(a).unwrap().0 = "renamed".to_owned();
        assert_eq!(
            store.get_component::<EntityName>(b),
            Some(&EntityName("clone".to_owned()))
        );
        assert!(store.has_tag::<Frozen>(a) && store.has_tag::<Frozen>(b));
    }

    #[test]
    fn entity_list_bulk_tags_skip_stale_entities() {
        let mut store = setup_store();
        let alive = store.create_entity();
        let dead = store.create_entity();
        store.delete_entity(dead).unwrap();

        let list: EntityList = [alive, dead].into_iter().collect();
        let frozen = store.tag_bits::<Frozen>().unwrap();
        list.add_tags(&mut store, frozen);

        assert!(store.has_tag::<Frozen>(alive));
        list.remove_tags(&mut store, frozen);
        assert!(!store.has_tag::<Frozen>(alive));
    }

    #[test]
    fn dropping_an_unapplied_batch_drops_staged_values() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Clone, Default)]
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut store = setup_store();
        store.register_component::<Counted>("Counted").unwrap();
        {
            let mut batch = Batch::new(EntityId::NONE);
            batch.add_component(&store, Counted).unwrap();
            assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }
}
