//! Component queries.
//!
//! A [`Query`] selects every archetype whose key contains the queried
//! component set and passes the tag filter, then iterates matches chunk by
//! chunk. Because the store's archetype list is append-only, the match
//! cache refreshes incrementally: a cheap length comparison, then only the
//! archetypes added since the last refresh are tested.
//!
//! Iteration is allocation-free once the cache and job buffers are warm.
//! [`ForEachJob::run`] walks chunks sequentially;
//! [`ForEachJob::run_parallel`] partitions whole chunks across the rayon
//! thread pool.
//!
//! # Safety
//!
//! Chunk slices are rebuilt from raw heap pointers. Soundness rests on two
//! facts: a query rejects duplicate component types at construction, so the
//! tuple's slices never alias, and `for_each` holds `&mut EntityStore` for
//! the whole run, so no other access to the heaps exists. Parallel jobs
//! cover disjoint chunks of disjoint heaps.

use crate::archetype::{ArchetypeId, ArchetypeKey};
use crate::schema::{ComponentIndex, Schema};
use crate::signature::{ComponentBits, SignatureIndexes, TagBits, MAX_SIGNATURE_COMPONENTS};
use crate::storage::CHUNK_SIZE;
use crate::store::{EntityId, EntityStore};
use crate::EcsError;

use rayon::prelude::*;

use std::marker::PhantomData;
use std::ptr;

// ---------------------------------------------------------------------------
// QuerySpec
// ---------------------------------------------------------------------------

/// A component tuple that can be queried: `(A,)` through `(A, B, C, D, E)`.
///
/// Implemented by macro below; not meant to be implemented by hand.
pub trait QuerySpec: 'static {
    const COUNT: usize;

    /// Per-chunk shared view, e.g. `(&[A], &[B])`.
    type Slices<'a>;

    /// Per-row exclusive view, e.g. `(&mut A, &mut B)`.
    type RefsMut<'a>;

    /// Resolve the tuple's component indices against the schema, in tuple
    /// order. Fails if any component is unregistered.
    fn signature(schema: &Schema) -> Result<SignatureIndexes, EcsError>;

    /// # Safety
    ///
    /// `ptrs[..COUNT]` must be chunk base pointers of heaps storing the
    /// tuple's types in tuple order, with at least `rows` live rows, and no
    /// mutable access to those rows may exist for `'a`.
    unsafe fn slices<'a>(
        ptrs: &[*const u8; MAX_SIGNATURE_COMPONENTS],
        rows: usize,
    ) -> Self::Slices<'a>;

    /// # Safety
    ///
    /// As for [`slices`](Self::slices), with `row` below the chunk's live
    /// row count and no other access to that row for `'a`.
    unsafe fn refs_mut<'a>(
        ptrs: &[*mut u8; MAX_SIGNATURE_COMPONENTS],
        row: usize,
    ) -> Self::RefsMut<'a>;
}

macro_rules! query_tuple {
    ($count:literal, $(($t:ident, $i:tt)),+) => {
        impl<$($t: Send + Sync + 'static),+> QuerySpec for ($($t,)+) {
            const COUNT: usize = $count;
            type Slices<'a> = ($(&'a [$t],)+);
            type RefsMut<'a> = ($(&'a mut $t,)+);

            fn signature(schema: &Schema) -> Result<SignatureIndexes, EcsError> {
                SignatureIndexes::new(&[$(schema.component_index::<$t>()?),+])
            }

            unsafe fn slices<'a>(
                ptrs: &[*const u8; MAX_SIGNATURE_COMPONENTS],
                rows: usize,
            ) -> Self::Slices<'a> {
                ($(std::slice::from_raw_parts(ptrs[$i] as *const $t, rows),)+)
            }

            unsafe fn refs_mut<'a>(
                ptrs: &[*mut u8; MAX_SIGNATURE_COMPONENTS],
                row: usize,
            ) -> Self::RefsMut<'a> {
                ($(&mut *(ptrs[$i] as *mut $t).add(row),)+)
            }
        }
    };
}

query_tuple!(1, (A, 0));
query_tuple!(2, (A, 0), (B, 1));
query_tuple!(3, (A, 0), (B, 1), (C, 2));
query_tuple!(4, (A, 0), (B, 1), (C, 2), (D, 3));
query_tuple!(5, (A, 0), (B, 1), (C, 2), (D, 3), (E, 4));

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct TagFilter {
    all: TagBits,
    any: TagBits,
    without: TagBits,
}

impl TagFilter {
    fn matches(&self, tags: TagBits) -> bool {
        tags.has_all(&self.all)
            && (self.any.is_empty() || tags.has_any(&self.any))
            && tags.is_disjoint(&self.without)
    }
}

/// One parallel work item: a whole chunk of one archetype.
struct ChunkJob {
    entities: *const EntityId,
    rows: usize,
    ptrs: [*mut u8; MAX_SIGNATURE_COMPONENTS],
}

// Jobs cover disjoint chunks of disjoint heaps, and the store is exclusively
// borrowed for the duration of a run.
unsafe impl Send for ChunkJob {}
unsafe impl Sync for ChunkJob {}

/// A cached query over the component tuple `Q` with optional tag filters.
///
/// Queries are long-lived: keep one and re-run it each frame. The archetype
/// cache and the parallel job buffer retain capacity across runs.
pub struct Query<Q: QuerySpec> {
    required: ComponentBits,
    indexes: [ComponentIndex; MAX_SIGNATURE_COMPONENTS],
    filter: TagFilter,
    matching: Vec<ArchetypeId>,
    archetypes_seen: usize,
    jobs: Vec<ChunkJob>,
    _marker: PhantomData<fn(Q)>,
}

impl<Q: QuerySpec> std::fmt::Debug for Query<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("type", &std::any::type_name::<Q>())
            .field("matching", &self.matching)
            .field("archetypes_seen", &self.archetypes_seen)
            .finish_non_exhaustive()
    }
}

impl<Q: QuerySpec> Query<Q> {
    /// Build a query over `Q`. Fails if a component is unregistered or the
    /// tuple names the same component twice.
    pub fn new(store: &EntityStore) -> Result<Self, EcsError> {
        let sig = Q::signature(store.schema())?;
        if sig.len() != Q::COUNT {
            return Err(EcsError::DuplicateQueryComponent {
                name: std::any::type_name::<Q>().to_owned(),
            });
        }
        let mut indexes = [ComponentIndex::from_raw(0); MAX_SIGNATURE_COMPONENTS];
        for (slot, component) in indexes.iter_mut().zip(sig.iter()) {
            *slot = component;
        }
        Ok(Self {
            required: ComponentBits::from_signature(&sig)?,
            indexes,
            filter: TagFilter::default(),
            matching: Vec::new(),
            archetypes_seen: 0,
            jobs: Vec::new(),
            _marker: PhantomData,
        })
    }

    /// Match only archetypes carrying every tag in `tags`.
    pub fn all_tags(mut self, tags: TagBits) -> Self {
        self.filter.all = self.filter.all | tags;
        self.reset_cache();
        self
    }

    /// Match only archetypes carrying at least one tag in `tags`.
    pub fn any_tags(mut self, tags: TagBits) -> Self {
        self.filter.any = self.filter.any | tags;
        self.reset_cache();
        self
    }

    /// Match only archetypes carrying none of the tags in `tags`.
    pub fn without_tags(mut self, tags: TagBits) -> Self {
        self.filter.without = self.filter.without | tags;
        self.reset_cache();
        self
    }

    fn reset_cache(&mut self) {
        self.matching.clear();
        self.archetypes_seen = 0;
    }

    fn matches(&self, key: ArchetypeKey) -> bool {
        key.components.has_all(&self.required) && self.filter.matches(key.tags)
    }

    /// Fold archetypes created since the last refresh into the match cache.
    fn refresh(&mut self, store: &EntityStore) {
        let archetypes = store.archetypes();
        if archetypes.len() == self.archetypes_seen {
            return;
        }
        for arch in &archetypes[self.archetypes_seen..] {
            if self.matches(arch.key()) {
                self.matching.push(arch.id());
            }
        }
        self.archetypes_seen = archetypes.len();
    }

    /// Matching archetypes after a refresh. Mostly useful in diagnostics.
    pub fn matched_archetype_count(&mut self, store: &EntityStore) -> usize {
        self.refresh(store);
        self.matching.len()
    }

    /// Total live entities across matching archetypes.
    pub fn matched_entity_count(&mut self, store: &EntityStore) -> usize {
        self.refresh(store);
        self.matching
            .iter()
            .map(|&id| store.archetype(id).len())
            .sum()
    }

    /// Iterate matches chunk by chunk, read-only.
    pub fn chunks<'a>(&'a mut self, store: &'a EntityStore) -> Chunks<'a, Q> {
        self.refresh(store);
        Chunks {
            store,
            matching: &self.matching,
            indexes: &self.indexes,
            arch_pos: 0,
            chunk: 0,
            _marker: PhantomData,
        }
    }

    /// Stage `func` to run once per matching entity. Finish with
    /// [`run`](ForEachJob::run) or [`run_parallel`](ForEachJob::run_parallel).
    pub fn for_each<'q, 's, F>(
        &'q mut self,
        store: &'s mut EntityStore,
        func: F,
    ) -> ForEachJob<'q, 's, Q, F> {
        ForEachJob {
            query: self,
            store,
            func,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk iteration
// ---------------------------------------------------------------------------

/// One chunk of one matching archetype: parallel entity ids and component
/// columns, at most [`CHUNK_SIZE`] rows.
pub struct ChunkView<'a, Q: QuerySpec> {
    pub entities: &'a [EntityId],
    pub components: Q::Slices<'a>,
}

/// Iterator over the chunks of every matching archetype.
pub struct Chunks<'a, Q: QuerySpec> {
    store: &'a EntityStore,
    matching: &'a [ArchetypeId],
    indexes: &'a [ComponentIndex; MAX_SIGNATURE_COMPONENTS],
    arch_pos: usize,
    chunk: usize,
    _marker: PhantomData<fn(Q)>,
}

impl<'a, Q: QuerySpec> Iterator for Chunks<'a, Q> {
    type Item = ChunkView<'a, Q>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = *self.matching.get(self.arch_pos)?;
            let arch = self.store.archetype(id);
            if self.chunk >= arch.chunk_count() {
                self.arch_pos += 1;
                self.chunk = 0;
                continue;
            }
            let chunk = self.chunk;
            self.chunk += 1;

            let start = chunk * CHUNK_SIZE;
            let rows = (arch.len() - start).min(CHUNK_SIZE);
            let mut ptrs = [ptr::null::<u8>(); MAX_SIGNATURE_COMPONENTS];
            for (slot, &component) in ptrs.iter_mut().zip(&self.indexes[..Q::COUNT]) {
                let heap = arch.heap(component).expect("matched archetype lacks heap");
                *slot = heap.chunk_ptr(chunk) as *const u8;
            }
            let entities = &arch.entities()[start..start + rows];
            // Matched heaps hold `rows` live rows and the store is not
            // mutably borrowed while 'a lives.
            let components = unsafe { Q::slices(&ptrs, rows) };
            return Some(ChunkView {
                entities,
                components,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// ForEachJob
// ---------------------------------------------------------------------------

/// A staged per-entity pass over a query's matches.
pub struct ForEachJob<'q, 's, Q: QuerySpec, F> {
    query: &'q mut Query<Q>,
    store: &'s mut EntityStore,
    func: F,
}

impl<Q, F> ForEachJob<'_, '_, Q, F>
where
    Q: QuerySpec,
    F: FnMut(EntityId, Q::RefsMut<'_>),
{
    /// Run sequentially, chunk by chunk in cache order.
    pub fn run(self) {
        let ForEachJob {
            query,
            store,
            mut func,
        } = self;
        query.refresh(store);
        for &id in &query.matching {
            let arch = store.archetype(id);
            let len = arch.len();
            for chunk in 0..arch.chunk_count() {
                let start = chunk * CHUNK_SIZE;
                let rows = (len - start).min(CHUNK_SIZE);
                let mut ptrs = [ptr::null_mut::<u8>(); MAX_SIGNATURE_COMPONENTS];
                for (slot, &component) in ptrs.iter_mut().zip(&query.indexes[..Q::COUNT]) {
                    let heap = arch.heap(component).expect("matched archetype lacks heap");
                    *slot = heap.chunk_ptr(chunk);
                }
                // Detach the entity ids from the archetype borrow; heap
                // writes below cannot touch the entity-id vector.
                let entities = arch.entities()[start..].as_ptr();
                for row in 0..rows {
                    let entity = unsafe { *entities.add(row) };
                    unsafe { func(entity, Q::refs_mut(&ptrs, row)) };
                }
            }
        }
    }
}

impl<Q, F> ForEachJob<'_, '_, Q, F>
where
    Q: QuerySpec,
    F: Fn(EntityId, Q::RefsMut<'_>) + Send + Sync,
{
    /// Run with whole chunks partitioned across the rayon thread pool.
    ///
    /// The job list is built sequentially and reused across runs; `func`
    /// must not assume any chunk ordering.
    pub fn run_parallel(self) {
        let ForEachJob { query, store, func } = self;
        query.refresh(store);
        query.jobs.clear();
        for &id in &query.matching {
            let arch = store.archetype(id);
            let len = arch.len();
            for chunk in 0..arch.chunk_count() {
                let start = chunk * CHUNK_SIZE;
                let mut ptrs = [ptr::null_mut::<u8>(); MAX_SIGNATURE_COMPONENTS];
                for (slot, &component) in ptrs.iter_mut().zip(&query.indexes[..Q::COUNT]) {
                    let heap = arch.heap(component).expect("matched archetype lacks heap");
                    *slot = heap.chunk_ptr(chunk);
                }
                query.jobs.push(ChunkJob {
                    entities: arch.entities()[start..].as_ptr(),
                    rows: (len - start).min(CHUNK_SIZE),
                    ptrs,
                });
            }
        }
        query.jobs.par_iter().for_each(|job| {
            for row in 0..job.rows {
                let entity = unsafe { *job.entities.add(row) };
                unsafe { func(entity, Q::refs_mut(&job.ptrs, row)) };
            }
        });
    }
}

impl EntityStore {
    /// Build a [`Query`] over the component tuple `Q` against this store.
    pub fn query<Q: QuerySpec>(&self) -> Result<Query<Q>, EcsError> {
        Query::new(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

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

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Health(u32);

    struct Frozen;
    struct Hidden;

    fn setup_store() -> EntityStore {
        let mut store = EntityStore::new();
        store.register_component::<Pos>("Pos").unwrap();
        store.register_component::<Vel>("Vel").unwrap();
        store.register_component::<Health>("Health").unwrap();
        store.register_tag::<Frozen>("Frozen").unwrap();
        store.register_tag::<Hidden>("Hidden").unwrap();
        store
    }

    fn spawn_with_pos(store: &mut EntityStore, n: usize) -> Vec<EntityId> {
        (0..n)
            .map(|i| {
                let e = store.create_entity();
                store
                    .add_component(
                        e,
                        Pos {
                            x: i as f32,
                            y: 0.0,
                        },
                    )
                    .unwrap();
                e
            })
            .collect()
    }

    #[test]
    fn matches_require_every_queried_component() {
        let mut store = setup_store();
        let pos_only = store.create_entity();
        store.add_component(pos_only, Pos::default()).unwrap();
        let both = store.create_entity();
        store.add_component(both, Pos::default()).unwrap();
        store.add_component(both, Vel::default()).unwrap();

        let mut wide = store.query::<(Pos,)>().unwrap();
        assert_eq!(wide.matched_entity_count(&store), 2);

        let mut narrow = store.query::<(Pos, Vel)>().unwrap();
        let seen: Vec<EntityId> = narrow
            .chunks(&store)
            .flat_map(|view| view.entities.to_vec())
            .collect();
        assert_eq!(seen, vec![both]);
    }

    #[test]
    fn cache_picks_up_archetypes_created_after_first_run() {
        let mut store = setup_store();
        spawn_with_pos(&mut store, 3);

        let mut query = store.query::<(Pos,)>().unwrap();
        assert_eq!(query.matched_entity_count(&store), 3);
        let seen_before = query.archetypes_seen;

        // A new archetype containing Pos appears after the first refresh.
        let e = store.create_entity();
        store.add_component(e, Pos::default()).unwrap();
        store.add_component(e, Health(10)).unwrap();

        assert_eq!(query.matched_entity_count(&store), 4);
        assert!(query.archetypes_seen > seen_before);
    }

    #[test]
    fn refresh_is_a_length_check_when_nothing_changed() {
        let mut store = setup_store();
        spawn_with_pos(&mut store, 2);

        let mut query = store.query::<(Pos,)>().unwrap();
        query.refresh(&store);
        let matched = query.matching.clone();

        // Structural churn inside existing archetypes adds nothing.
        spawn_with_pos(&mut store, 2);
        query.refresh(&store);
        assert_eq!(query.matching, matched);
    }

    #[test]
    fn tag_filters_narrow_matches() {
        let mut store = setup_store();
        let plain = store.create_entity();
        store.add_component(plain, Pos::default()).unwrap();
        let frozen = store.create_entity();
        store.add_component(frozen, Pos::default()).unwrap();
        store.add_tag::<Frozen>(frozen).unwrap();
        let hidden = store.create_entity();
        store.add_component(hidden, Pos::default()).unwrap();
        store.add_tag::<Hidden>(hidden).unwrap();

        let frozen_bits = store.tag_bits::<Frozen>().unwrap();
        let hidden_bits = store.tag_bits::<Hidden>().unwrap();

        let mut all = store.query::<(Pos,)>().unwrap().all_tags(frozen_bits);
        assert_eq!(all.matched_entity_count(&store), 1);

        let mut any = store
            .query::<(Pos,)>()
            .unwrap()
            .any_tags(frozen_bits | hidden_bits);
        assert_eq!(any.matched_entity_count(&store), 2);

        let mut without = store.query::<(Pos,)>().unwrap().without_tags(frozen_bits);
        assert_eq!(without.matched_entity_count(&store), 2);

        let mut none = store
            .query::<(Pos,)>()
            .unwrap()
            .all_tags(frozen_bits)
            .without_tags(frozen_bits);
        assert_eq!(none.matched_entity_count(&store), 0);
    }

    #[test]
    fn iteration_is_chunked_at_512_rows() {
        let mut store = setup_store();
        spawn_with_pos(&mut store, 1200);

        let mut query = store.query::<(Pos,)>().unwrap();
        let sizes: Vec<usize> = query.chunks(&store).map(|view| view.entities.len()).collect();
        assert_eq!(sizes, vec![512, 512, 176]);

        let mut total = 0.0;
        for view in query.chunks(&store) {
            let (positions,) = view.components;
            assert_eq!(positions.len(), view.entities.len());
            total += positions.iter().map(|p| p.x).sum::<f32>();
        }
        assert_eq!(total, (0..1200).sum::<i32>() as f32);
    }

    #[test]
    fn for_each_mutates_in_place() {
        let mut store = setup_store();
        let movers: Vec<EntityId> = (0..10)
            .map(|_| {
                let e = store.create_entity();
                store.add_component(e, Pos { x: 1.0, y: 1.0 }).unwrap();
                store.add_component(e, Vel { dx: 2.0, dy: -1.0 }).unwrap();
                e
            })
            .collect();

        let mut query = store.query::<(Pos, Vel)>().unwrap();
        query
            .for_each(&mut store, |_, (pos, vel): (&mut Pos, &mut Vel)| {
                pos.x += vel.dx;
                pos.y += vel.dy;
            })
            .run();

        for e in movers {
            assert_eq!(store.get_component::<Pos>(e), Some(&Pos { x: 3.0, y: 0.0 }));
        }
    }

    #[test]
    fn run_parallel_visits_every_entity_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut store = setup_store();
        spawn_with_pos(&mut store, 2000);
        let visits = AtomicUsize::new(0);

        let mut query = store.query::<(Pos,)>().unwrap();
        query
            .for_each(&mut store, |_, (pos,): (&mut Pos,)| {
                pos.y = pos.x * 2.0;
                visits.fetch_add(1, Ordering::Relaxed);
            })
            .run_parallel();

        assert_eq!(visits.load(Ordering::Relaxed), 2000);
        let mut check = store.query::<(Pos,)>().unwrap();
        for view in check.chunks(&store) {
            let (positions,) = view.components;
            for p in positions {
                assert_eq!(p.y, p.x * 2.0);
            }
        }
    }

    #[test]
    fn duplicate_component_in_tuple_is_rejected() {
        let store = setup_store();
        let err = store.query::<(Pos, Pos)>().unwrap_err();
        assert!(matches!(err, EcsError::DuplicateQueryComponent { .. }));
    }

    #[test]
    fn unregistered_component_fails_construction() {
        let store = setup_store();
        struct Unknown;
        assert!(store.query::<(Unknown,)>().is_err());
    }
}
