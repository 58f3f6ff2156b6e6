//! Component and tag schema registry.
//!
//! A [`Schema`] assigns every component/tag type a stable, dense index at
//! first registration and keeps the type-erased [`ComponentVtable`] used by
//! archetype storage. Indices are permanent once assigned; there is no
//! removal. The schema is owned by one [`EntityStore`](crate::store::EntityStore)
//! rather than living in process-global state.
//!
//! # Safety
//!
//! This module declares the `unsafe fn` pointers of [`ComponentVtable`]. The
//! pointers are monomorphized from the concrete component type at
//! registration time; callers in [`storage`](crate::storage) guarantee they
//! are only invoked on values of that type.

use crate::signature::{MAX_COMPONENT_TYPES, MAX_TAG_TYPES};
use crate::EcsError;

use std::any::TypeId;
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

/// Largest supported component alignment. The batch value arena stages
/// component values in 16-byte slots, so larger alignments cannot be staged.
pub const MAX_COMPONENT_ALIGN: usize = 16;

// ---------------------------------------------------------------------------
// Indices
// ---------------------------------------------------------------------------

/// Dense index of a registered component type. Assigned at first
/// registration, stable for the lifetime of the schema.
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
pub struct ComponentIndex(u16);

/// Dense index of a registered tag type.
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
pub struct TagIndex(u16);

impl ComponentIndex {
    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

impl TagIndex {
    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Function pointers for type-erased drop, clone and default-construction of
/// component values, created via [`ComponentVtable::new::<T>()`] and indexed
/// by [`ComponentIndex`].
#[derive(Clone)]
pub struct ComponentVtable {
    /// Drop a single value in place.
    pub(crate) drop_fn: unsafe fn(*mut u8),
    /// Clone a value from `src` into uninitialized, properly aligned `dst`.
    pub(crate) clone_fn: unsafe fn(*const u8, *mut u8),
    /// Write a default-constructed value into uninitialized `dst`.
    pub(crate) default_fn: unsafe fn(*mut u8),
    /// Size of the component type.
    pub(crate) size: usize,
    /// Alignment of the component type.
    pub(crate) align: usize,
}

impl std::fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    pub fn new<T: Clone + Default + Send + Sync + 'static>() -> Self {
        unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        unsafe fn clone_fn_impl<T: Clone>(src: *const u8, dst: *mut u8) {
            let value = &*(src as *const T);
            ptr::write(dst as *mut T, value.clone());
        }

        unsafe fn default_fn_impl<T: Default>(dst: *mut u8) {
            ptr::write(dst as *mut T, T::default());
        }

        Self {
            drop_fn: drop_fn_impl::<T>,
            clone_fn: clone_fn_impl::<T>,
            default_fn: default_fn_impl::<T>,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Descriptor of a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub(crate) index: ComponentIndex,
    pub(crate) name: Arc<str>,
    pub(crate) vtable: ComponentVtable,
}

impl ComponentInfo {
    #[inline]
    pub fn index(&self) -> ComponentIndex {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Descriptor of a registered tag type. Tags carry no storage.
#[derive(Debug, Clone)]
pub struct TagInfo {
    pub(crate) index: TagIndex,
    pub(crate) name: Arc<str>,
}

impl TagInfo {
    #[inline]
    pub fn index(&self) -> TagIndex {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Registry of component and tag types for one store.
#[derive(Debug, Default)]
pub struct Schema {
    components: Vec<ComponentInfo>,
    component_ids: HashMap<TypeId, ComponentIndex>,
    component_names: HashMap<Arc<str>, ComponentIndex>,
    tags: Vec<TagInfo>,
    tag_ids: HashMap<TypeId, TagIndex>,
    tag_names: HashMap<Arc<str>, TagIndex>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under a display name. Idempotent: a second
    /// registration of the same type returns the index assigned first.
    pub fn register_component<T: Clone + Default + Send + Sync + 'static>(
        &mut self,
        name: &str,
    ) -> Result<ComponentIndex, EcsError> {
        let type_id = TypeId::of::<T>();
        if let Some(&index) = self.component_ids.get(&type_id) {
            if self.components[index.0 as usize].name() != name {
                tracing::warn!(
                    name,
                    existing = self.components[index.0 as usize].name(),
                    "component type already registered under a different name"
                );
            }
            return Ok(index);
        }
        if self.components.len() >= MAX_COMPONENT_TYPES {
            return Err(EcsError::ComponentCapacityExceeded {
                name: name.to_owned(),
                max: MAX_COMPONENT_TYPES,
            });
        }
        if self.component_names.contains_key(name) {
            return Err(EcsError::DuplicateComponentName {
                name: name.to_owned(),
            });
        }
        let align = std::mem::align_of::<T>();
        if align > MAX_COMPONENT_ALIGN {
            return Err(EcsError::UnsupportedAlignment {
                name: name.to_owned(),
                align,
                max: MAX_COMPONENT_ALIGN,
            });
        }

        let index = ComponentIndex(self.components.len() as u16);
        let name: Arc<str> = Arc::from(name);
        self.components.push(ComponentInfo {
            index,
            name: name.clone(),
            vtable: ComponentVtable::new::<T>(),
        });
        self.component_ids.insert(type_id, index);
        self.component_names.insert(name.clone(), index);
        tracing::debug!(name = name.as_ref(), index = index.0, "registered component type");
        Ok(index)
    }

    /// Register a tag type under a display name. Idempotent like
    /// [`register_component`](Self::register_component).
    pub fn register_tag<T: 'static>(&mut self, name: &str) -> Result<TagIndex, EcsError> {
        let type_id = TypeId::of::<T>();
        if let Some(&index) = self.tag_ids.get(&type_id) {
            if self.tags[index.0 as usize].name() != name {
                tracing::warn!(
                    name,
                    existing = self.tags[index.0 as usize].name(),
                    "tag type already registered under a different name"
                );
            }
            return Ok(index);
        }
        if self.tags.len() >= MAX_TAG_TYPES {
            return Err(EcsError::TagCapacityExceeded {
                name: name.to_owned(),
                max: MAX_TAG_TYPES,
            });
        }
        if self.tag_names.contains_key(name) {
            return Err(EcsError::DuplicateTagName {
                name: name.to_owned(),
            });
        }

        let index = TagIndex(self.tags.len() as u16);
        let name: Arc<str> = Arc::from(name);
        self.tags.push(TagInfo {
            index,
            name: name.clone(),
        });
        self.tag_ids.insert(type_id, index);
        self.tag_names.insert(name.clone(), index);
        tracing::debug!(name = name.as_ref(), index = index.0, "registered tag type");
        Ok(index)
    }

    /// Look up the index of a registered component type.
    pub fn component_index<T: 'static>(&self) -> Result<ComponentIndex, EcsError> {
        self.component_ids
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or_else(|| EcsError::UnknownComponent {
                name: std::any::type_name::<T>().to_owned(),
                registered: self.component_name_list(),
            })
    }

    /// Look up the index of a registered tag type.
    pub fn tag_index<T: 'static>(&self) -> Result<TagIndex, EcsError> {
        self.tag_ids
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or_else(|| EcsError::UnknownTag {
                name: std::any::type_name::<T>().to_owned(),
                registered: self.tag_name_list(),
            })
    }

    /// Number of registered component types. Also the exclusive upper bound
    /// of assigned component indices.
    #[inline]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Number of registered tag types.
    #[inline]
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Descriptor for an assigned component index.
    #[inline]
    pub fn component_info(&self, index: ComponentIndex) -> &ComponentInfo {
        &self.components[index.0 as usize]
    }

    /// Descriptor for an assigned tag index.
    #[inline]
    pub fn tag_info(&self, index: TagIndex) -> &TagInfo {
        &self.tags[index.0 as usize]
    }

    fn component_name_list(&self) -> String {
        let names: Vec<&str> = self.components.iter().map(|c| c.name()).collect();
        names.join(", ")
    }

    fn tag_name_list(&self) -> String {
        let names: Vec<&str> = self.tags.iter().map(|t| t.name()).collect();
        names.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
