//! Block type registry
//!
//! Every block carries a [`KlassId`] in its header. Recovery has no type
//! information beyond that id, so each heap is opened with a
//! [`KlassRegistry`] that tells it, per id:
//!
//! - a name for diagnostics
//! - how to find the block handles a payload points at (the trace function)
//! - whether blocks of this klass are interned (pooled by content)
//!
//! Ids are part of the on-media format and must stay stable across
//! releases. Id 0 is never used; ids below [`FIRST_USER_KLASS`] are
//! reserved for the heap itself.

use crate::layout::KlassId;
use nvbench_core::{Error, Result};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Handles referenced by a payload (zero words are null and may be kept)
pub type Refs = SmallVec<[u64; 8]>;

/// Lists the block handles a payload refers to
pub type TraceFn = fn(&[u8]) -> Refs;

/// Undo logs of failure-atomic sections
pub const UNDO_LOG: KlassId = KlassId(1);

/// Whole-value blobs written by the heap's users
pub const BLOB: KlassId = KlassId(2);

/// Lowest id available to users of the heap
pub const FIRST_USER_KLASS: u16 = 16;

/// Registration record for one klass
#[derive(Debug, Clone, Copy)]
pub struct KlassInfo {
    /// Diagnostic name
    pub name: &'static str,
    /// Outgoing references; `None` for leaf blocks
    pub trace: Option<TraceFn>,
    /// Blocks are pooled by content and never invalidated by replacement
    pub interned: bool,
}

impl KlassInfo {
    /// Leaf klass (no outgoing references)
    pub const fn leaf(name: &'static str) -> Self {
        KlassInfo {
            name,
            trace: None,
            interned: false,
        }
    }

    /// Interned leaf klass
    pub const fn interned(name: &'static str) -> Self {
        KlassInfo {
            name,
            trace: None,
            interned: true,
        }
    }

    /// Klass whose payload holds references
    pub const fn node(name: &'static str, trace: TraceFn) -> Self {
        KlassInfo {
            name,
            trace: Some(trace),
            interned: false,
        }
    }
}

/// Per-heap klass table
#[derive(Debug, Clone)]
pub struct KlassRegistry {
    klasses: FxHashMap<KlassId, KlassInfo>,
}

impl Default for KlassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KlassRegistry {
    /// Registry holding only the heap's own klasses
    pub fn new() -> Self {
        let mut klasses = FxHashMap::default();
        klasses.insert(UNDO_LOG, KlassInfo::leaf("undo-log"));
        klasses.insert(BLOB, KlassInfo::leaf("blob"));
        KlassRegistry { klasses }
    }

    /// Register a user klass
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a reserved id, or an id or name that is
    /// already taken.
    pub fn register(&mut self, id: KlassId, info: KlassInfo) -> Result<()> {
        if id.0 < FIRST_USER_KLASS {
            return Err(Error::invalid_config(format!(
                "klass id {} is reserved",
                id.0
            )));
        }
        if let Some(existing) = self.klasses.get(&id) {
            return Err(Error::invalid_config(format!(
                "klass id {} already registered as {}",
                id.0, existing.name
            )));
        }
        if self.klasses.values().any(|k| k.name == info.name) {
            return Err(Error::invalid_config(format!(
                "klass name {} already registered",
                info.name
            )));
        }
        self.klasses.insert(id, info);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, id: KlassId, info: KlassInfo) -> Result<Self> {
        self.register(id, info)?;
        Ok(self)
    }

    /// Look up a klass
    pub fn get(&self, id: KlassId) -> Option<&KlassInfo> {
        self.klasses.get(&id)
    }

    /// True if `id` is registered
    pub fn contains(&self, id: KlassId) -> bool {
        self.klasses.contains_key(&id)
    }

    /// True if blocks of `id` are interned
    pub fn is_interned(&self, id: KlassId) -> bool {
        self.klasses.get(&id).map(|k| k.interned).unwrap_or(false)
    }

    /// Non-null handles referenced by a payload of klass `id`
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] for an unregistered id: the image was written
    /// by a program with a different type table.
    pub fn trace(&self, id: KlassId, payload: &[u8]) -> Result<Refs> {
        let info = self
            .klasses
            .get(&id)
            .ok_or_else(|| Error::corruption(format!("unknown klass id {}", id.0)))?;
        Ok(match info.trace {
            Some(trace) => trace(payload).into_iter().filter(|h| *h != 0).collect(),
            None => Refs::new(),
        })
    }
}
