//! Chunked, type-erased component storage.
//!
//! A [`StructHeap`] holds all values of one component type within one
//! archetype, laid out in fixed-size chunks of [`CHUNK_SIZE`] rows. Storage
//! grows by whole chunks only, and chunk addresses are stable while rows
//! move, which is what lets queries hand out per-chunk slices and lets
//! parallel iteration partition work at chunk granularity.
//!
//! # Safety
//!
//! Component data is stored as raw chunk allocations. The safety invariants
//! are maintained by [`Archetype`](crate::archetype::Archetype) and
//! [`EntityStore`](crate::store::EntityStore), which guarantee that every
//! access uses the vtable and concrete type the heap was created with, and
//! that row indices stay below the live row count.

use crate::schema::{ComponentIndex, ComponentInfo, ComponentVtable};
use crate::EcsError;

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

/// Rows per chunk. Store-wide constant: changing it changes the row/chunk
/// arithmetic of every heap in the store.
pub const CHUNK_SIZE: usize = 512;

// ---------------------------------------------------------------------------
// StructHeap
// ---------------------------------------------------------------------------

/// A chunked column of type-erased component values.
///
/// Rows `[0, len)` are live and packed; allocated capacity is always a whole
/// number of chunks. Row `r` lives at `chunks[r / CHUNK_SIZE]` offset
/// `(r % CHUNK_SIZE) * item_size`.
pub struct StructHeap {
    component: ComponentIndex,
    name: Arc<str>,
    chunks: Vec<*mut u8>,
    len: usize,
    item_size: usize,
    item_align: usize,
    vtable: ComponentVtable,
}

// The registration bound on component types is `Send + Sync`, so the erased
// bytes may move between threads.
#[allow(unsafe_code)]
unsafe impl Send for StructHeap {}
#[allow(unsafe_code)]
unsafe impl Sync for StructHeap {}

impl StructHeap {
    /// Create an empty heap for the component described by `info`.
    pub(crate) fn new(info: &ComponentInfo) -> Self {
        Self {
            component: info.index,
            name: info.name.clone(),
            chunks: Vec::new(),
            len: 0,
            item_size: info.vtable.size,
            item_align: info.vtable.align,
            vtable: info.vtable.clone(),
        }
    }

    /// The component index this heap stores.
    #[inline]
    pub fn component(&self) -> ComponentIndex {
        self.component
    }

    /// Display name of the stored component type.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated chunks.
    #[inline]
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks holding at least one live row.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.len.div_ceil(CHUNK_SIZE)
    }

    /// Rows live in `chunk`: [`CHUNK_SIZE`] for full chunks, the remainder
    /// for the last.
    #[inline]
    pub fn chunk_rows(&self, chunk: usize) -> usize {
        self.len.saturating_sub(chunk * CHUNK_SIZE).min(CHUNK_SIZE)
    }

    // -- internal helpers -----------------------------------------------------

    fn chunk_layout(&self) -> Layout {
        Layout::from_size_align(CHUNK_SIZE * self.item_size, self.item_align)
            .expect("chunk layout overflow")
    }

    fn push_chunk(&mut self) {
        let layout = self.chunk_layout();
        let data = unsafe { alloc::alloc(layout) };
        assert!(!data.is_null(), "allocation failed");
        self.chunks.push(data);
    }

    // -- capacity -------------------------------------------------------------

    /// Grow, by whole chunks, until at least `rows` rows fit.
    pub fn ensure_capacity(&mut self, rows: usize) {
        if self.item_size == 0 {
            return;
        }
        while self.chunks.len() * CHUNK_SIZE < rows {
            self.push_chunk();
        }
    }

    /// Set the allocated chunk count. Shrinking below the already-allocated
    /// count is rejected, never silently truncated.
    pub fn set_chunk_capacity(&mut self, chunk_count: usize) -> Result<(), EcsError> {
        if chunk_count < self.chunks.len() {
            return Err(EcsError::ChunkCapacityShrink {
                heap: self.name.to_string(),
                requested: chunk_count,
                allocated: self.chunks.len(),
            });
        }
        if self.item_size == 0 {
            return Ok(());
        }
        while self.chunks.len() < chunk_count {
            self.push_chunk();
        }
        Ok(())
    }

    // -- raw row access ---------------------------------------------------------

    /// Pointer to row `row`. For zero-sized components this is a dangling,
    /// properly aligned pointer.
    ///
    /// # Safety
    ///
    /// `row` must be below the allocated capacity.
    #[inline]
    pub(crate) unsafe fn ptr_at(&self, row: usize) -> *mut u8 {
        if self.item_size == 0 {
            return self.item_align as *mut u8;
        }
        self.chunks[row / CHUNK_SIZE].add((row % CHUNK_SIZE) * self.item_size)
    }

    /// Append a value, growing by one chunk when the last chunk is full.
    ///
    /// # Safety
    ///
    /// `value` must point to a valid, initialized instance of the stored
    /// component type. Ownership moves into the heap; the caller must not
    /// drop the source.
    pub(crate) unsafe fn push_raw(&mut self, value: *const u8) {
        self.ensure_capacity(self.len + 1);
        if self.item_size > 0 {
            ptr::copy_nonoverlapping(value, self.ptr_at(self.len), self.item_size);
        }
        self.len += 1;
    }

    /// Append a default-constructed value.
    pub(crate) fn push_default(&mut self) {
        self.ensure_capacity(self.len + 1);
        unsafe {
            (self.vtable.default_fn)(self.ptr_at(self.len));
        }
        self.len += 1;
    }

    /// Drop the value at `row` and move `value` into its place.
    ///
    /// # Safety
    ///
    /// `row < len`, and `value` as in [`push_raw`](Self::push_raw).
    pub(crate) unsafe fn overwrite_raw(&mut self, row: usize, value: *const u8) {
        debug_assert!(row < self.len);
        let dst = self.ptr_at(row);
        (self.vtable.drop_fn)(dst);
        if self.item_size > 0 {
            ptr::copy_nonoverlapping(value, dst, self.item_size);
        }
    }

    /// Drop the value at `row`, then move the last live row into its place.
    ///
    /// # Safety
    ///
    /// `row < len`.
    pub(crate) unsafe fn swap_remove(&mut self, row: usize) {
        debug_assert!(row < self.len);
        (self.vtable.drop_fn)(self.ptr_at(row));
        self.move_last_into(row);
    }

    /// Like [`swap_remove`](Self::swap_remove) but without dropping the value
    /// at `row`. Used after the value's bytes were moved to another heap.
    ///
    /// # Safety
    ///
    /// `row < len`, and the value at `row` must already have been moved out.
    pub(crate) unsafe fn forget_swap_remove(&mut self, row: usize) {
        debug_assert!(row < self.len);
        self.move_last_into(row);
    }

    unsafe fn move_last_into(&mut self, row: usize) {
        let last = self.len - 1;
        if row != last && self.item_size > 0 {
            ptr::copy_nonoverlapping(self.ptr_at(last), self.ptr_at(row), self.item_size);
        }
        self.len -= 1;
    }

    // -- typed access -----------------------------------------------------------

    /// # Safety
    ///
    /// `T` must be the stored component type and `row < len`.
    #[inline]
    pub(crate) unsafe fn row_ref<T>(&self, row: usize) -> &T {
        debug_assert!(row < self.len);
        &*(self.ptr_at(row) as *const T)
    }

    /// # Safety
    ///
    /// `T` must be the stored component type and `row < len`.
    #[inline]
    pub(crate) unsafe fn row_mut<T>(&mut self, row: usize) -> &mut T {
        debug_assert!(row < self.len);
        &mut *(self.ptr_at(row) as *mut T)
    }

    /// Contiguous view of the first `rows` rows of `chunk`.
    ///
    /// # Safety
    ///
    /// `T` must be the stored component type; `rows <= chunk_rows(chunk)`.
    #[inline]
    pub unsafe fn chunk_slice<T>(&self, chunk: usize, rows: usize) -> &[T] {
        if self.item_size == 0 {
            return slice::from_raw_parts(NonNull::<T>::dangling().as_ptr(), rows);
        }
        slice::from_raw_parts(self.chunks[chunk] as *const T, rows)
    }

    /// Base pointer of `chunk`, for building parallel iteration jobs.
    #[inline]
    pub(crate) fn chunk_ptr(&self, chunk: usize) -> *mut u8 {
        if self.item_size == 0 {
            return self.item_align as *mut u8;
        }
        self.chunks[chunk]
    }
}

impl Drop for StructHeap {
    fn drop(&mut self) {
        unsafe {
            for row in 0..self.len {
                (self.vtable.drop_fn)(self.ptr_at(row));
            }
            if self.item_size > 0 {
                let layout = self.chunk_layout();
                for &chunk in &self.chunks {
                    alloc::dealloc(chunk, layout);
                }
            }
        }
    }
}

impl std::fmt::Debug for StructHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructHeap")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .field("item_size", &self.item_size)
            .finish()
    }
}

/// Storage summary, e.g. `[Position] chunks - Count: 3`. The format is part
/// of the debug-string contract consumed by external tooling.
impl std::fmt::Display for StructHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] chunks - Count: {}", self.name, self.len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
