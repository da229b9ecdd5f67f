//! Per-path taint facts. The host threads a `TaintStore` through its own
//! program state; the engine reads and extends it on each visit. Marks are
//! monotonic within a path: nothing ever unmarks a value, only the deferred
//! intent is consumed.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::host::{RegionId, SourceSpan, SymValue, SymbolId};

/// Identity a taint mark attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaintKey {
    /// The symbol itself carries tainted data.
    Value(SymbolId),
    /// The region's content is tainted.
    Region(RegionId),
}

impl TaintKey {
    fn of_value(value: &SymValue) -> Option<TaintKey> {
        match value {
            SymValue::Symbol(s) => Some(TaintKey::Value(*s)),
            SymValue::Region(r) => Some(TaintKey::Region(*r)),
            SymValue::Derived { symbol, .. } => Some(TaintKey::Value(*symbol)),
            SymValue::Constant(_) | SymValue::Unknown => None,
        }
    }
}

/// One step of taint provenance. Walking `parent` links leads back to the
/// call that introduced the taint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintOrigin {
    pub span: SourceSpan,
    pub note: String,
    pub parent: Option<Arc<TaintOrigin>>,
}

impl TaintOrigin {
    /// Provenance root: the point where taint entered the program.
    pub fn root(span: SourceSpan, note: impl Into<String>) -> Arc<Self> {
        Arc::new(TaintOrigin {
            span,
            note: note.into(),
            parent: None,
        })
    }

    /// A propagation step on top of an existing chain.
    pub fn derived(span: SourceSpan, note: impl Into<String>, parent: Arc<TaintOrigin>) -> Arc<Self> {
        Arc::new(TaintOrigin {
            span,
            note: note.into(),
            parent: Some(parent),
        })
    }
}

/// Deferred taint recorded at pre-visit and committed by the post-call
/// resolver. Lifecycle: created for one specific call, carried opaquely in
/// the store, read exactly once via [`TaintStore::take_intent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintIntent {
    indices: SmallVec<[u32; 4]>,
    origin: Arc<TaintOrigin>,
}

impl TaintIntent {
    pub fn new(origin: Arc<TaintOrigin>) -> Self {
        TaintIntent {
            indices: SmallVec::new(),
            origin,
        }
    }

    pub fn push(&mut self, index: u32) {
        if !self.indices.contains(&index) {
            self.indices.push(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn origin(&self) -> &Arc<TaintOrigin> {
        &self.origin
    }
}

/// Per-path taint state. Cloning is cheap: the mark table is shared between
/// clones until one of them writes.
#[derive(Debug, Clone, Default)]
pub struct TaintStore {
    marks: Arc<HashMap<TaintKey, Arc<TaintOrigin>>>,
    intent: Option<TaintIntent>,
}

impl TaintStore {
    pub fn new() -> Self {
        TaintStore::default()
    }

    /// Attach a mark to `value`'s identity. Returns `false` when the value
    /// has no identity to mark (constants, unknowns) or was already marked;
    /// the first recorded origin is kept.
    pub fn mark_value(&mut self, value: &SymValue, origin: Arc<TaintOrigin>) -> bool {
        match TaintKey::of_value(value) {
            Some(key) => self.mark_key(key, origin),
            None => false,
        }
    }

    /// Mark a region's content tainted.
    pub fn mark_region(&mut self, region: RegionId, origin: Arc<TaintOrigin>) -> bool {
        self.mark_key(TaintKey::Region(region), origin)
    }

    fn mark_key(&mut self, key: TaintKey, origin: Arc<TaintOrigin>) -> bool {
        if self.marks.contains_key(&key) {
            return false;
        }
        debug!(target: "taint", "mark {:?}", key);
        Arc::make_mut(&mut self.marks).insert(key, origin);
        true
    }

    pub fn is_value_tainted(&self, value: &SymValue) -> bool {
        match value {
            SymValue::Symbol(s) => self.marks.contains_key(&TaintKey::Value(*s)),
            SymValue::Region(r) => self.is_region_tainted(*r),
            SymValue::Derived { symbol, parent } => {
                self.marks.contains_key(&TaintKey::Value(*symbol))
                    || self.is_region_tainted(*parent)
            }
            SymValue::Constant(_) | SymValue::Unknown => false,
        }
    }

    pub fn is_region_tainted(&self, region: RegionId) -> bool {
        self.marks.contains_key(&TaintKey::Region(region))
    }

    /// Provenance of the mark covering `value`, if any.
    pub fn origin_of(&self, value: &SymValue) -> Option<Arc<TaintOrigin>> {
        match value {
            SymValue::Symbol(s) => self.marks.get(&TaintKey::Value(*s)).cloned(),
            SymValue::Region(r) => self.marks.get(&TaintKey::Region(*r)).cloned(),
            SymValue::Derived { symbol, parent } => self
                .marks
                .get(&TaintKey::Value(*symbol))
                .or_else(|| self.marks.get(&TaintKey::Region(*parent)))
                .cloned(),
            SymValue::Constant(_) | SymValue::Unknown => None,
        }
    }

    pub fn set_intent(&mut self, intent: TaintIntent) {
        debug!(target: "taint", "intent {:?}", intent.indices());
        self.intent = Some(intent);
    }

    /// Consume the pending intent. Second and later calls return `None`
    /// until a new intent is set.
    pub fn take_intent(&mut self) -> Option<TaintIntent> {
        self.intent.take()
    }

    pub fn intent(&self) -> Option<&TaintIntent> {
        self.intent.as_ref()
    }

    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }
}

#[cfg(test)]
use crate::host::mock::{ptr_to, sym};

#[test]
fn clones_do_not_share_new_marks() {
    let mut a = TaintStore::new();
    a.mark_value(&sym(1), TaintOrigin::root(SourceSpan::default(), "src"));

    let mut b = a.clone();
    b.mark_value(&sym(2), TaintOrigin::root(SourceSpan::default(), "src"));

    assert!(a.is_value_tainted(&sym(1)));
    assert!(!a.is_value_tainted(&sym(2)));
    assert!(b.is_value_tainted(&sym(1)));
    assert!(b.is_value_tainted(&sym(2)));
}

#[test]
fn first_origin_wins() {
    let mut store = TaintStore::new();
    assert!(store.mark_value(&sym(7), TaintOrigin::root(SourceSpan::new(1, 2), "first")));
    assert!(!store.mark_value(&sym(7), TaintOrigin::root(SourceSpan::new(3, 4), "second")));

    let origin = store.origin_of(&sym(7)).unwrap();
    assert_eq!(origin.note, "first");
}

#[test]
fn intent_is_read_exactly_once() {
    let mut store = TaintStore::new();
    let mut intent = TaintIntent::new(TaintOrigin::root(SourceSpan::default(), "src"));
    intent.push(0);
    intent.push(0); // dedup
    store.set_intent(intent);

    let taken = store.take_intent().unwrap();
    assert_eq!(taken.indices(), &[0]);
    assert!(store.take_intent().is_none());
    assert!(store.intent().is_none());
}

#[test]
fn constants_and_unknowns_are_never_tainted() {
    let mut store = TaintStore::new();
    assert!(!store.mark_value(&SymValue::Constant(42), TaintOrigin::root(SourceSpan::default(), "x")));
    assert!(!store.mark_value(&SymValue::Unknown, TaintOrigin::root(SourceSpan::default(), "x")));
    assert!(!store.is_value_tainted(&SymValue::Constant(42)));
    assert!(!store.is_value_tainted(&SymValue::Unknown));
    assert_eq!(store.mark_count(), 0);
}

#[test]
fn derived_value_sees_region_taint() {
    let mut store = TaintStore::new();
    store.mark_region(RegionId(9), TaintOrigin::root(SourceSpan::default(), "read"));

    let loaded = SymValue::Derived {
        symbol: SymbolId(100),
        parent: RegionId(9),
    };
    assert!(store.is_value_tainted(&loaded));
    assert!(store.origin_of(&loaded).is_some());

    // A pointer to the same region tests tainted too.
    assert!(store.is_value_tainted(&ptr_to(9)));
}
