//! Steady-state allocation checks.
//!
//! Warm paths are allocation-free: once archetype chunks, batch arenas and
//! the tree-walk scratch stack have grown to size, repeating the same
//! operations must not touch the allocator. A counting global allocator
//! verifies this directly, which is why this file holds exactly one test.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use strata_ecs::prelude::*;

struct CountingAllocator;

static TRACKING: AtomicBool = AtomicBool::new(false);
static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if TRACKING.load(Ordering::SeqCst) {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        }
        System.alloc(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if TRACKING.load(Ordering::SeqCst) {
            ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        }
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator;

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

/// One full cycle of the operations that must be allocation-free once warm:
/// disable/enable a tree, apply a reusable batch both ways, run a query.
fn cycle(
    store: &mut EntityStore,
    root: EntityId,
    add: &mut Batch,
    remove: &mut Batch,
    query: &mut Query<(Pos, Vel)>,
) {
    store.disable_tree(root).unwrap();
    store.enable_tree(root).unwrap();

    add.add_component(store, Vel { dx: 1.0, dy: 0.0 }).unwrap();
    add.apply(store).unwrap();
    remove.remove_component::<Vel>(store).unwrap();
    remove.apply(store).unwrap();

    query
        .for_each(store, |_, (pos, vel): (&mut Pos, &mut Vel)| {
            pos.x += vel.dx;
        })
        .run();
}

#[test]
fn warm_paths_do_not_allocate() {
    let mut store = EntityStore::new();
    store.register_component::<Pos>("Pos").unwrap();
    store.register_component::<Vel>("Vel").unwrap();

    // A small tree plus a batch target and some query fodder.
    let root = store.create_entity();
    for _ in 0..8 {
        let child = store.create_entity();
        store.set_parent(child, root).unwrap();
        for _ in 0..4 {
            let leaf = store.create_entity();
            store.set_parent(leaf, child).unwrap();
        }
    }
    let target = store.create_entity();
    store.add_component(target, Pos::default()).unwrap();
    for _ in 0..100 {
        let e = store.create_entity();
        store.add_component(e, Pos::default()).unwrap();
        store.add_component(e, Vel { dx: 0.5, dy: 0.0 }).unwrap();
    }

    let mut add = Batch::new(target);
    let mut remove = Batch::new(target);
    let mut query = store.query::<(Pos, Vel)>().unwrap();

    // Warm-up: grow chunks, arenas, caches and the scratch stack.
    for _ in 0..4 {
        cycle(&mut store, root, &mut add, &mut remove, &mut query);
    }

    TRACKING.store(true, Ordering::SeqCst);
    for _ in 0..16 {
        cycle(&mut store, root, &mut add, &mut remove, &mut query);
    }
    TRACKING.store(false, Ordering::SeqCst);

    assert_eq!(
        ALLOCATIONS.load(Ordering::SeqCst),
        0,
        "warm store operations allocated"
    );
}
