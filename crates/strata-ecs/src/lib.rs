//! Strata ECS -- archetype-based entity component storage with chunked
//! iteration.
//!
//! Entities live in archetypes, one per unique (component-set, tag-set)
//! combination, laid out Structure-of-Arrays in fixed 512-row chunks.
//! Structural changes migrate an entity between archetypes; a [`Batch`]
//! collapses several changes into one migration. Queries cache their
//! matching archetypes incrementally and iterate chunk by chunk,
//! sequentially or across the rayon thread pool.
//!
//! Entity ids are dense 32-bit values starting at 1 and are never reused,
//! so a stale id is detected immediately.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut store = EntityStore::new();
//! store.register_component::<Position>("Position").unwrap();
//! store.register_component::<Velocity>("Velocity").unwrap();
//!
//! let entity = store.create_entity();
//! let mut batch = Batch::new(entity);
//! batch.add_component(&store, Position { x: 0.0, y: 0.0 }).unwrap();
//! batch.add_component(&store, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
//! batch.apply(&mut store).unwrap();
//!
//! let mut query = store.query::<(Position, Velocity)>().unwrap();
//! query
//!     .for_each(&mut store, |_, (pos, vel): (&mut Position, &mut Velocity)| {
//!         pos.x += vel.dx;
//!         pos.y += vel.dy;
//!     })
//!     .run();
//!
//! assert_eq!(store.get_component::<Position>(entity), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod batch;
#[allow(unsafe_code)]
pub mod query;
#[allow(unsafe_code)]
pub mod schema;
pub mod signature;
#[allow(unsafe_code)]
pub mod storage;
#[allow(unsafe_code)]
pub mod store;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity was deleted or never created.
    #[error("entity {entity} does not exist (deleted or never created)")]
    StaleEntity { entity: store::EntityId },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// A tag type was referenced that has not been registered.
    #[error("tag type '{name}' not registered. Registered tags: [{registered}]")]
    UnknownTag { name: String, registered: String },

    /// The fixed component-type capacity is exhausted.
    #[error("cannot register component '{name}': all {max} component slots are taken")]
    ComponentCapacityExceeded { name: String, max: usize },

    /// The fixed tag-type capacity is exhausted.
    #[error("cannot register tag '{name}': all {max} tag slots are taken")]
    TagCapacityExceeded { name: String, max: usize },

    /// Two distinct component types were registered under one name.
    #[error("component name '{name}' is already registered to a different type")]
    DuplicateComponentName { name: String },

    /// Two distinct tag types were registered under one name.
    #[error("tag name '{name}' is already registered to a different type")]
    DuplicateTagName { name: String },

    /// The component's alignment exceeds what chunk layout supports.
    #[error("component '{name}' has alignment {align}, above the supported maximum {max}")]
    UnsupportedAlignment { name: String, align: usize, max: usize },

    /// More components than a signature can hold.
    #[error("signature would hold {len} components, above the maximum {max}")]
    SignatureOverflow { len: usize, max: usize },

    /// A signature slot index past the populated (or representable) range.
    #[error("signature slot {index} is out of range (len {len})")]
    SignatureSlotOutOfRange { index: usize, len: usize },

    /// A component or tag index past the fixed bit-set width.
    #[error("index {index} is out of range for a {width}-bit set")]
    IndexOutOfRange { index: usize, width: usize },

    /// Chunk capacity can grow but never shrink below what is allocated.
    #[error("heap '{heap}' has {allocated} chunks allocated; cannot shrink to {requested}")]
    ChunkCapacityShrink {
        heap: String,
        requested: usize,
        allocated: usize,
    },

    /// A bulk batch was applied without naming a target entity.
    #[error("a bulk batch has no target entity of its own; use apply_to")]
    BulkBatchWithoutTarget,

    /// The parent's child list does not contain the entity it should.
    #[error("entity {child} is not a child of {parent}")]
    ChildLinkMissing {
        parent: store::EntityId,
        child: store::EntityId,
    },

    /// Parenting would make an entity its own ancestor.
    #[error("cannot parent {child} to {parent}: it would create a cycle")]
    ParentCycle {
        parent: store::EntityId,
        child: store::EntityId,
    },

    /// A query tuple names the same component type more than once.
    #[error("query '{name}' lists the same component more than once")]
    DuplicateQueryComponent { name: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, ArchetypeKey};
    pub use crate::batch::{Batch, BulkBatch, EntityList};
    pub use crate::query::{ChunkView, Chunks, ForEachJob, Query, QuerySpec};
    pub use crate::schema::{ComponentIndex, ComponentInfo, Schema, TagIndex, TagInfo};
    pub use crate::signature::{
        ComponentBits, SignatureIndexes, TagBits, MAX_COMPONENT_TYPES,
        MAX_SIGNATURE_COMPONENTS, MAX_TAG_TYPES,
    };
    pub use crate::storage::{StructHeap, CHUNK_SIZE};
    pub use crate::store::{
        Disabled, EntityEvent, EntityId, EntityName, EntityNode, EntityStore,
    };
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Health(u32);

    struct TestTag;

    fn setup_store() -> EntityStore {
        let mut store = EntityStore::new();
        store.register_component::<Position>("Position").unwrap();
        store.register_component::<Velocity>("Velocity").unwrap();
        store.register_component::<Health>("Health").unwrap();
        store.register_tag::<TestTag>("TestTag").unwrap();
        store
    }

    #[test]
    fn batched_setup_renders_the_expected_debug_strings() {
        let mut store = setup_store();
        let entity = store.create_entity();

        let mut batch = Batch::new(entity);
        batch
            .add_component(&store, EntityName("test".to_owned()))
            .unwrap()
            .add_component(&store, Position { x: 1.0, y: 2.0 })
            .unwrap()
            .add_tag::<TestTag>(&store)
            .unwrap();
        assert_eq!(
            batch.to_string(),
            "add: [EntityName, Position, #TestTag]"
        );
        batch.apply(&mut store).unwrap();

        assert_eq!(
            store.entity_string(entity).unwrap(),
            "id: 1  \"test\"  [EntityName, Position, #TestTag]"
        );
        let arch = store.archetype(store.entity_node(entity).unwrap().archetype());
        assert_eq!(arch.key_string(), "Key: [EntityName, Position, #TestTag]");
    }

    #[test]
    fn empty_batch_creates_no_archetypes() {
        let mut store = setup_store();
        let entity = store.create_entity();
        let archetypes = store.archetype_count();

        let mut batch = Batch::new(entity);
        batch.apply(&mut store).unwrap();

        assert_eq!(store.archetype_count(), archetypes);
        assert_eq!(store.entity_string(entity).unwrap(), "id: 1  []");
    }

    #[test]
    fn disabled_subtrees_are_filtered_with_the_builtin_tag() {
        let mut store = setup_store();
        let root = store.create_entity();
        let child = store.create_entity();
        store.set_parent(child, root).unwrap();
        for e in [root, child] {
            store.add_component(e, Position::default()).unwrap();
        }
        let loner = store.create_entity();
        store.add_component(loner, Position::default()).unwrap();

        store.disable_tree(root).unwrap();

        let disabled = TagBits::single(store.disabled_tag());
        let mut query = store.query::<(Position,)>().unwrap().without_tags(disabled);
        assert_eq!(query.matched_entity_count(&store), 1);

        store.enable_tree(root).unwrap();
        assert_eq!(query.matched_entity_count(&store), 3);
    }

    #[test]
    fn ten_thousand_entities_across_mixed_archetypes() {
        let mut store = setup_store();
        let mut mover_ids = Vec::new();
        for i in 0..10_000u32 {
            let e = store.create_entity();
            store
                .add_component(
                    e,
                    Position {
                        x: i as f32,
                        y: 0.0,
                    },
                )
                .unwrap();
            if i % 3 == 0 {
                store.add_component(e, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
                mover_ids.push((e, i));
            }
            if i % 5 == 0 {
                store.add_component(e, Health(i)).unwrap();
            }
        }
        assert_eq!(store.entity_count(), 10_000);

        let mut positions = store.query::<(Position,)>().unwrap();
        assert_eq!(positions.matched_entity_count(&store), 10_000);

        let mut movers = store.query::<(Position, Velocity)>().unwrap();
        assert_eq!(movers.matched_entity_count(&store), mover_ids.len());

        movers
            .for_each(&mut store, |_, (pos, vel): (&mut Position, &mut Velocity)| {
                pos.x += vel.dx;
            })
            .run_parallel();

        // Every third entity moved by exactly one unit; the rest stayed put.
        for (e, i) in mover_ids {
            assert_eq!(store.get_component::<Position>(e).unwrap().x, (i + 1) as f32);
        }
    }

    #[test]
    fn deletion_keeps_rows_and_ids_consistent() {
        let mut store = setup_store();
        let ids: Vec<EntityId> = (0..100)
            .map(|i| {
                let e = store.create_entity();
                store
                    .add_component(e, Health(i))
                    .unwrap();
                e
            })
            .collect();

        for e in ids.iter().step_by(2) {
            store.delete_entity(*e).unwrap();
        }
        assert_eq!(store.entity_count(), 50);

        for (i, e) in ids.iter().enumerate() {
            if i % 2 == 0 {
                assert!(!store.is_alive(*e));
                assert!(store.entity_node(*e).is_err());
            } else {
                assert_eq!(store.get_component::<Health>(*e), Some(&Health(i as u32)));
            }
        }
    }
}
