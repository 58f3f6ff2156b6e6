//! Entity directory and lifecycle.
//!
//! The [`EntityStore`] owns the schema, the append-only archetype list, and
//! the [`EntityNode`] table mapping dense entity ids to their current
//! archetype and row. All structural changes (adding/removing components or
//! tags) go through one migration primitive that moves an entity's row
//! between archetypes with a single swap-remove on the source side.
//!
//! # Safety
//!
//! Migration copies component bytes directly heap-to-heap. Soundness rests
//! on two invariants kept by this module: heaps are only ever accessed with
//! the component index they were created for, and a row is consumed from the
//! source archetype exactly once (moved or dropped, never both).

use crate::archetype::{Archetype, ArchetypeId, ArchetypeKey};
use crate::schema::{ComponentIndex, Schema, TagIndex};
use crate::signature::{ComponentBits, TagBits};
use crate::EcsError;

use std::collections::HashMap;
use std::mem::{self, ManuallyDrop};
use std::ptr;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Dense, non-reusing (within a session) entity id. Id `0` is reserved as
/// "none"; real ids start at 1.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct EntityId(u32);

impl EntityId {
    /// The null id, used for absent parent links.
    pub const NONE: Self = Self(0);

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Built-in types
// ---------------------------------------------------------------------------

/// Built-in display-name component, rendered by
/// [`entity_string`](EntityStore::entity_string).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntityName(pub String);

/// Built-in tag toggled across subtrees by
/// [`enable_tree`](EntityStore::enable_tree) /
/// [`disable_tree`](EntityStore::disable_tree).
pub struct Disabled;

// ---------------------------------------------------------------------------
// EntityNode / events
// ---------------------------------------------------------------------------

/// Directory record of one entity: where it lives and how it is linked into
/// the parent/child tree.
#[derive(Debug)]
pub struct EntityNode {
    pub(crate) archetype: ArchetypeId,
    pub(crate) row: u32,
    pub(crate) parent: EntityId,
    pub(crate) children: Vec<EntityId>,
    pub(crate) pid: Option<u64>,
    pub(crate) alive: bool,
}

impl EntityNode {
    fn placeholder() -> Self {
        Self {
            archetype: ArchetypeId::EMPTY,
            row: 0,
            parent: EntityId::NONE,
            children: Vec::new(),
            pid: None,
            alive: false,
        }
    }

    #[inline]
    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    #[inline]
    pub fn row(&self) -> u32 {
        self.row
    }

    #[inline]
    pub fn parent(&self) -> EntityId {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[EntityId] {
        &self.children
    }

    /// Optional persistent id, assigned by external import tooling.
    #[inline]
    pub fn pid(&self) -> Option<u64> {
        self.pid
    }
}

/// Structural change notification, delivered synchronously to subscribed
/// observers after the change has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    Created { entity: EntityId },
    Deleted { entity: EntityId },
    ComponentAdded { entity: EntityId, component: ComponentIndex },
    ComponentRemoved { entity: EntityId, component: ComponentIndex },
    TagAdded { entity: EntityId, tag: TagIndex },
    TagRemoved { entity: EntityId, tag: TagIndex },
}

type Observer = Box<dyn FnMut(&EntityEvent)>;

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// The entity directory: schema, archetypes, and the node table.
pub struct EntityStore {
    schema: Schema,
    archetypes: Vec<Archetype>,
    archetype_ids: HashMap<ArchetypeKey, ArchetypeId>,
    /// Indexed by entity id; slot 0 is a dead placeholder so ids start at 1.
    nodes: Vec<EntityNode>,
    alive: usize,
    /// Reusable stack for iterative tree walks.
    tree_scratch: Vec<EntityId>,
    observers: Vec<Observer>,
    disabled_tag: TagIndex,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.alive)
            .field("archetypes", &self.archetypes.len())
            .field("components", &self.schema.component_count())
            .field("tags", &self.schema.tag_count())
            .finish()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let mut schema = Schema::new();
        // Built-ins. Registration on an empty schema cannot hit a capacity
        // or duplicate-name error.
        schema
            .register_component::<EntityName>("EntityName")
            .expect("builtin component registration");
        let disabled_tag = schema
            .register_tag::<Disabled>("Disabled")
            .expect("builtin tag registration");

        let mut store = Self {
            schema,
            archetypes: Vec::new(),
            archetype_ids: HashMap::new(),
            nodes: vec![EntityNode::placeholder()],
            alive: 0,
            tree_scratch: Vec::new(),
            observers: Vec::new(),
            disabled_tag,
        };
        // The empty archetype exists eagerly at index 0.
        store.archetype_id(ArchetypeKey::EMPTY);
        store
    }

    // -- schema ---------------------------------------------------------------

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn register_component<T: Clone + Default + Send + Sync + 'static>(
        &mut self,
        name: &str,
    ) -> Result<ComponentIndex, EcsError> {
        self.schema.register_component::<T>(name)
    }

    pub fn register_tag<T: 'static>(&mut self, name: &str) -> Result<TagIndex, EcsError> {
        self.schema.register_tag::<T>(name)
    }

    /// Bit set holding the single registered tag `T`. Convenient for query
    /// filters; combine with `|`.
    pub fn tag_bits<T: 'static>(&self) -> Result<TagBits, EcsError> {
        Ok(TagBits::single(self.schema.tag_index::<T>()?))
    }

    /// The tag index of the built-in [`Disabled`] tag.
    #[inline]
    pub fn disabled_tag(&self) -> TagIndex {
        self.disabled_tag
    }

    // -- archetype directory ----------------------------------------------------

    /// Look up the archetype for `key`, creating it on first reference.
    /// Idempotent per key; archetypes are never destroyed.
    pub fn archetype_id(&mut self, key: ArchetypeKey) -> ArchetypeId {
        if let Some(&id) = self.archetype_ids.get(&key) {
            return id;
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        self.archetypes.push(Archetype::new(id, key, &self.schema));
        self.archetype_ids.insert(key, id);
        id
    }

    #[inline]
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    #[inline]
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    #[inline]
    pub(crate) fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    #[inline]
    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    // -- entity lifecycle ---------------------------------------------------------

    /// Create an entity in the empty archetype.
    pub fn create_entity(&mut self) -> EntityId {
        self.create_entity_in(ArchetypeKey::EMPTY)
    }

    /// Create an entity directly inside the archetype for `key`, with every
    /// component default-constructed.
    pub fn create_entity_in(&mut self, key: ArchetypeKey) -> EntityId {
        let id = EntityId(self.nodes.len() as u32);
        let arch_id = self.archetype_id(key);
        let row = self.archetypes[arch_id.index()].push_default_row(id);
        self.nodes.push(EntityNode {
            archetype: arch_id,
            row,
            parent: EntityId::NONE,
            children: Vec::new(),
            pid: None,
            alive: true,
        });
        self.alive += 1;
        self.emit(EntityEvent::Created { entity: id });
        id
    }

    /// Delete an entity: swap-remove its row, detach it from its parent and
    /// orphan its children.
    pub fn delete_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.node(entity)?;
        self.detach_from_parent(entity)?;
        let children = mem::take(&mut self.nodes[entity.index()].children);
        for child in children {
            self.nodes[child.index()].parent = EntityId::NONE;
        }

        let node = &self.nodes[entity.index()];
        let (arch_id, row) = (node.archetype, node.row as usize);
        if let Some(moved) = self.archetypes[arch_id.index()].swap_remove_row(row) {
            self.nodes[moved.index()].row = row as u32;
        }

        let node = &mut self.nodes[entity.index()];
        node.alive = false;
        node.archetype = ArchetypeId::EMPTY;
        node.row = 0;
        node.pid = None;
        self.alive -= 1;
        self.emit(EntityEvent::Deleted { entity });
        Ok(())
    }

    #[inline]
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.node(entity).is_ok()
    }

    /// Number of live entities.
    #[inline]
    pub fn entity_count(&self) -> usize {
        self.alive
    }

    /// Directory record of a live entity.
    pub fn entity_node(&self, entity: EntityId) -> Result<&EntityNode, EcsError> {
        self.node(entity)
    }

    /// The archetype key a live entity currently belongs to.
    pub fn entity_key(&self, entity: EntityId) -> Result<ArchetypeKey, EcsError> {
        Ok(self.archetypes[self.node(entity)?.archetype.index()].key())
    }

    fn node(&self, entity: EntityId) -> Result<&EntityNode, EcsError> {
        match self.nodes.get(entity.index()) {
            Some(node) if node.alive => Ok(node),
            _ => Err(EcsError::StaleEntity { entity }),
        }
    }

    // -- components and tags -----------------------------------------------------

    /// Add a component, migrating the entity if the component is new to it
    /// or overwriting the value in place if already present.
    pub fn add_component<T: 'static>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let index = self.schema.component_index::<T>()?;
        let dst = self.entity_key(entity)?.with_component(index);
        let value = ManuallyDrop::new(value);
        let value_ptr = &*value as *const T as *const u8;
        self.migrate_with(entity, dst, ComponentBits::single(index), |_| value_ptr)
    }

    /// Remove a component. Removing a component the entity does not have is
    /// a no-op.
    pub fn remove_component<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let index = self.schema.component_index::<T>()?;
        let key = self.entity_key(entity)?;
        if !key.components.has(index) {
            return Ok(());
        }
        let dst = key.without_component(index);
        self.migrate_with(entity, dst, ComponentBits::EMPTY, |_| ptr::null())
    }

    pub fn add_tag<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let tag = self.schema.tag_index::<T>()?;
        self.set_tag_index(entity, tag, true)
    }

    pub fn remove_tag<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let tag = self.schema.tag_index::<T>()?;
        self.set_tag_index(entity, tag, false)
    }

    /// Add every tag in `tags` in one migration.
    pub fn add_tags(&mut self, entity: EntityId, tags: TagBits) -> Result<(), EcsError> {
        let key = self.entity_key(entity)?;
        let dst = ArchetypeKey::new(key.components, key.tags | tags);
        if dst == key {
            return Ok(());
        }
        self.migrate_with(entity, dst, ComponentBits::EMPTY, |_| ptr::null())
    }

    /// Remove every tag in `tags` in one migration.
    pub fn remove_tags(&mut self, entity: EntityId, tags: TagBits) -> Result<(), EcsError> {
        let key = self.entity_key(entity)?;
        let dst = ArchetypeKey::new(key.components, key.tags.difference(&tags));
        if dst == key {
            return Ok(());
        }
        self.migrate_with(entity, dst, ComponentBits::EMPTY, |_| ptr::null())
    }

    fn set_tag_index(
        &mut self,
        entity: EntityId,
        tag: TagIndex,
        on: bool,
    ) -> Result<(), EcsError> {
        let key = self.entity_key(entity)?;
        let dst = if on {
            key.with_tag(tag)
        } else {
            key.without_tag(tag)
        };
        if dst == key {
            return Ok(());
        }
        self.migrate_with(entity, dst, ComponentBits::EMPTY, |_| ptr::null())
    }

    pub fn get_component<T: 'static>(&self, entity: EntityId) -> Option<&T> {
        let index = self.schema.component_index::<T>().ok()?;
        let node = self.node(entity).ok()?;
        let heap = self.archetypes[node.archetype.index()].heap(index)?;
        Some(unsafe { heap.row_ref(node.row as usize) })
    }

    pub fn get_component_mut<T: 'static>(&mut self, entity: EntityId) -> Option<&mut T> {
        let index = self.schema.component_index::<T>().ok()?;
        let (arch_id, row) = {
            let node = self.node(entity).ok()?;
            (node.archetype, node.row as usize)
        };
        let heap = self.archetypes[arch_id.index()].heap_mut(index)?;
        Some(unsafe { heap.row_mut(row) })
    }

    pub fn has_component<T: 'static>(&self, entity: EntityId) -> bool {
        self.get_component::<T>(entity).is_some()
    }

    pub fn has_tag<T: 'static>(&self, entity: EntityId) -> bool {
        let Ok(tag) = self.schema.tag_index::<T>() else {
            return false;
        };
        self.entity_key(entity)
            .map(|key| key.tags.has(tag))
            .unwrap_or(false)
    }

    /// The set of component types the entity currently has.
    pub fn entity_components(&self, entity: EntityId) -> Result<ComponentBits, EcsError> {
        Ok(self.entity_key(entity)?.components)
    }

    /// The set of tags the entity currently has.
    pub fn entity_tags(&self, entity: EntityId) -> Result<TagBits, EcsError> {
        Ok(self.entity_key(entity)?.tags)
    }

    // -- parent/child tree ---------------------------------------------------------

    /// Link `child` under `parent`, detaching it from any previous parent.
    /// Fails when the link would create a cycle.
    pub fn set_parent(&mut self, child: EntityId, parent: EntityId) -> Result<(), EcsError> {
        self.node(child)?;
        self.node(parent)?;
        let mut cursor = parent;
        while !cursor.is_none() {
            if cursor == child {
                return Err(EcsError::ParentCycle { parent, child });
            }
            cursor = self.nodes[cursor.index()].parent;
        }
        self.detach_from_parent(child)?;
        self.nodes[parent.index()].children.push(child);
        self.nodes[child.index()].parent = parent;
        Ok(())
    }

    /// Convenience for [`set_parent`](Self::set_parent) with the arguments
    /// the other way around.
    pub fn add_child(&mut self, parent: EntityId, child: EntityId) -> Result<(), EcsError> {
        self.set_parent(child, parent)
    }

    /// Detach `child` from its parent, making it a root.
    pub fn clear_parent(&mut self, child: EntityId) -> Result<(), EcsError> {
        self.node(child)?;
        self.detach_from_parent(child)
    }

    /// The entity's parent, [`EntityId::NONE`] for roots.
    pub fn parent(&self, entity: EntityId) -> Result<EntityId, EcsError> {
        Ok(self.node(entity)?.parent)
    }

    pub fn child_entities(&self, entity: EntityId) -> Result<&[EntityId], EcsError> {
        Ok(&self.node(entity)?.children)
    }

    fn detach_from_parent(&mut self, child: EntityId) -> Result<(), EcsError> {
        let parent = self.nodes[child.index()].parent;
        if parent.is_none() {
            return Ok(());
        }
        let children = &mut self.nodes[parent.index()].children;
        let pos = children
            .iter()
            .position(|&c| c == child)
            .ok_or(EcsError::ChildLinkMissing { parent, child })?;
        children.remove(pos);
        self.nodes[child.index()].parent = EntityId::NONE;
        Ok(())
    }

    /// Remove the [`Disabled`] tag from `root` and every descendant.
    pub fn enable_tree(&mut self, root: EntityId) -> Result<(), EcsError> {
        self.set_tree_disabled(root, false)
    }

    /// Add the [`Disabled`] tag to `root` and every descendant.
    pub fn disable_tree(&mut self, root: EntityId) -> Result<(), EcsError> {
        self.set_tree_disabled(root, true)
    }

    /// Whether the entity currently carries the [`Disabled`] tag.
    pub fn is_disabled(&self, entity: EntityId) -> bool {
        self.entity_key(entity)
            .map(|key| key.tags.has(self.disabled_tag))
            .unwrap_or(false)
    }

    fn set_tree_disabled(&mut self, root: EntityId, disabled: bool) -> Result<(), EcsError> {
        self.node(root)?;
        let tag = self.disabled_tag;
        // Iterative walk over a reusable stack: no allocation once the stack
        // has grown to the tree's breadth.
        let mut stack = mem::take(&mut self.tree_scratch);
        stack.clear();
        stack.push(root);
        let mut result = Ok(());
        while let Some(id) = stack.pop() {
            if let Err(err) = self.set_tag_index(id, tag, disabled) {
                result = Err(err);
                break;
            }
            stack.extend_from_slice(&self.nodes[id.index()].children);
        }
        stack.clear();
        self.tree_scratch = stack;
        result
    }

    // -- persistent id -------------------------------------------------------------

    pub fn set_pid(&mut self, entity: EntityId, pid: u64) -> Result<(), EcsError> {
        self.node(entity)?;
        self.nodes[entity.index()].pid = Some(pid);
        Ok(())
    }

    pub fn pid(&self, entity: EntityId) -> Result<Option<u64>, EcsError> {
        Ok(self.node(entity)?.pid)
    }

    // -- observers -------------------------------------------------------------------

    /// Subscribe to structural change events. Observers run synchronously,
    /// after the change has been applied, in subscription order.
    pub fn subscribe(&mut self, observer: impl FnMut(&EntityEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn emit(&mut self, event: EntityEvent) {
        if self.observers.is_empty() {
            return;
        }
        let mut observers = mem::take(&mut self.observers);
        for observer in observers.iter_mut() {
            observer(&event);
        }
        self.observers = observers;
    }

    fn emit_structural_events(
        &mut self,
        entity: EntityId,
        src_key: &ArchetypeKey,
        dst_key: &ArchetypeKey,
    ) {
        if self.observers.is_empty() {
            return;
        }
        for component in dst_key.components.difference(&src_key.components).bits() {
            self.emit(EntityEvent::ComponentAdded { entity, component });
        }
        for component in src_key.components.difference(&dst_key.components).bits() {
            self.emit(EntityEvent::ComponentRemoved { entity, component });
        }
        for tag in dst_key.tags.difference(&src_key.tags).bits() {
            self.emit(EntityEvent::TagAdded { entity, tag });
        }
        for tag in src_key.tags.difference(&dst_key.tags).bits() {
            self.emit(EntityEvent::TagRemoved { entity, tag });
        }
    }

    // -- migration ----------------------------------------------------------------

    /// Move `entity` to the archetype for `dst_key`, the single structural
    /// primitive behind every component/tag change.
    ///
    /// `staged` supplies values for exactly the components in `staged_bits`
    /// and is called once per such component; ownership of each supplied
    /// value moves into the destination heap. Components present in both
    /// archetypes and not staged are copied heap-to-heap; components only in
    /// the destination are default-constructed; components only in the
    /// source are dropped. When `dst_key` equals the current key, staged
    /// values overwrite in place and no migration happens.
    pub(crate) fn migrate_with<F>(
        &mut self,
        entity: EntityId,
        dst_key: ArchetypeKey,
        staged_bits: ComponentBits,
        mut staged: F,
    ) -> Result<(), EcsError>
    where
        F: FnMut(ComponentIndex) -> *const u8,
    {
        let node = self.node(entity)?;
        let src_id = node.archetype;
        let row = node.row as usize;
        let src_key = self.archetypes[src_id.index()].key();

        if src_key == dst_key {
            let arch = &mut self.archetypes[src_id.index()];
            for component in staged_bits.bits() {
                let value = staged(component);
                if let Some(heap) = arch.heap_mut(component) {
                    unsafe { heap.overwrite_raw(row, value) };
                }
            }
            return Ok(());
        }

        let dst_id = self.archetype_id(dst_key);
        let (src, dst) = two_archetypes(&mut self.archetypes, src_id, dst_id);

        // Fill the destination row: staged values move in, shared columns
        // copy directly heap-to-heap, the rest default-construct.
        for heap in dst.heaps_mut() {
            let component = heap.component();
            if staged_bits.has(component) {
                unsafe { heap.push_raw(staged(component)) };
            } else if let Some(src_heap) = src.heap(component) {
                unsafe { heap.push_raw(src_heap.ptr_at(row)) };
            } else {
                heap.push_default();
            }
        }

        // Drain the source row. Values that were copied out are forgotten;
        // everything else (dropped columns, superseded staged columns) drops.
        for heap in src.heaps_mut() {
            let component = heap.component();
            let moved_out = dst.heap(component).is_some() && !staged_bits.has(component);
            unsafe {
                if moved_out {
                    heap.forget_swap_remove(row);
                } else {
                    heap.swap_remove(row);
                }
            }
        }

        let new_row = dst.push_entity_id(entity);
        if let Some(moved) = src.swap_remove_entity_id(row) {
            self.nodes[moved.index()].row = row as u32;
        }
        let node = &mut self.nodes[entity.index()];
        node.archetype = dst_id;
        node.row = new_row;

        self.emit_structural_events(entity, &src_key, &dst_key);
        Ok(())
    }

    // -- debug rendering ---------------------------------------------------------------

    /// Human-readable entity state, e.g. `id: 1  "test"  [EntityName,
    /// Position, #TestTag]`. Segments are separated by two spaces; the
    /// quoted name appears only when the entity has an [`EntityName`]. Part
    /// of the debug-string contract.
    pub fn entity_string(&self, entity: EntityId) -> Result<String, EcsError> {
        let node = self.node(entity)?;
        let arch = &self.archetypes[node.archetype.index()];
        let mut out = format!("id: {}", entity.raw());
        if let Some(name) = self.get_component::<EntityName>(entity) {
            out.push_str("  \"");
            out.push_str(&name.0);
            out.push('"');
        }
        out.push_str("  ");
        out.push_str(&arch.type_list_string());
        Ok(out)
    }
}

/// Disjoint mutable references to two different archetypes.
fn two_archetypes(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    let (ai, bi) = (a.index(), b.index());
    debug_assert_ne!(ai, bi);
    if ai < bi {
        let (left, right) = archetypes.split_at_mut(bi);
        (&mut left[ai], &mut right[0])
    } else {
        let (left, right) = archetypes.split_at_mut(ai);
        (&mut right[0], &mut left[bi])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
