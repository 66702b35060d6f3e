//! Raw containers
//!
//! A [`Target`] is a plain container that exists independently of any runtime.
//! Wrapping it through a [`Runtime`](crate::Runtime) produces an
//! [`Observable`](crate::Observable) view whose reads and writes are
//! intercepted; the target itself is never copied, so every view of the same
//! target shares the same data.
//!
//! Identity is the `Rc` allocation: two targets with equal contents are still
//! different targets, which is what the dependency graph and the wrapper cache
//! key on.

use indexmap::{IndexMap, IndexSet};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::{MapKey, Value};

/// Allocate a process-unique identity for targets, reference cells and views
pub(crate) fn next_identity() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Unique identifier of a dependency source (a target or a reference cell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub(crate) u64);

impl TargetId {
    pub(crate) fn new() -> Self {
        Self(next_identity())
    }

    /// Raw numeric form, useful for logging
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

/// The shape of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// String-keyed record
    Record,
    /// Ordered, index-addressed sequence
    Sequence,
    /// Insertion-ordered key/value map with arbitrary keys
    Map,
    /// Insertion-ordered set of values
    Set,
}

impl ContainerKind {
    /// Map and set containers use the collection interception rules
    pub fn is_collection(self) -> bool {
        matches!(self, Self::Map | Self::Set)
    }
}

/// Container storage
#[derive(Debug, Clone)]
pub enum Container {
    Record(IndexMap<Rc<str>, Value>),
    Sequence(Vec<Value>),
    Map(IndexMap<MapKey, Value>),
    Set(IndexSet<MapKey>),
}

impl Container {
    pub fn kind(&self) -> ContainerKind {
        match self {
            Self::Record(_) => ContainerKind::Record,
            Self::Sequence(_) => ContainerKind::Sequence,
            Self::Map(_) => ContainerKind::Map,
            Self::Set(_) => ContainerKind::Set,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Record(fields) => fields.len(),
            Self::Sequence(items) => items.len(),
            Self::Map(entries) => entries.len(),
            Self::Set(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct TargetInner {
    id: TargetId,
    data: RefCell<Container>,
    /// Marked non-observable: wrapping returns the target unchanged
    skip: Cell<bool>,
    frozen: Cell<bool>,
}

/// A raw container
#[derive(Clone)]
pub struct Target(Rc<TargetInner>);

impl Target {
    /// Create a target around existing container storage
    pub fn new(container: Container) -> Self {
        Self(Rc::new(TargetInner {
            id: TargetId::new(),
            data: RefCell::new(container),
            skip: Cell::new(false),
            frozen: Cell::new(false),
        }))
    }

    /// Create a record from `(name, value)` pairs
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<Rc<str>>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::new(Container::Record(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Create a sequence from its items
    pub fn sequence<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Self::new(Container::Sequence(items.into_iter().collect()))
    }

    /// Create a map from `(key, value)` pairs
    pub fn map<I: IntoIterator<Item = (Value, Value)>>(entries: I) -> Self {
        Self::new(Container::Map(
            entries
                .into_iter()
                .map(|(k, v)| (MapKey::new(k), v))
                .collect(),
        ))
    }

    /// Create a set from its values
    pub fn set<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Self::new(Container::Set(values.into_iter().map(MapKey::new).collect()))
    }

    pub fn id(&self) -> TargetId {
        self.0.id
    }

    pub fn kind(&self) -> ContainerKind {
        self.0.data.borrow().kind()
    }

    /// Number of members, read without tracking
    pub fn len(&self) -> usize {
        self.0.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark this target as non-observable; wrapping it becomes a no-op
    pub fn mark_raw(&self) -> &Self {
        self.0.skip.set(true);
        self
    }

    /// Whether [`Target::mark_raw`] has been called
    pub fn is_marked_raw(&self) -> bool {
        self.0.skip.get()
    }

    /// Freeze the target; frozen targets cannot be wrapped
    pub fn freeze(&self) -> &Self {
        self.0.frozen.set(true);
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.get()
    }

    /// Untracked read access to the storage
    ///
    /// The borrow must not escape into code that mutates the same target.
    pub fn with<R>(&self, f: impl FnOnce(&Container) -> R) -> R {
        f(&self.0.data.borrow())
    }

    /// Untracked mutable access to the storage; no subscriber is notified
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Container) -> R) -> R {
        f(&mut self.0.data.borrow_mut())
    }

    pub fn ptr_eq(&self, other: &Target) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakTarget {
        WeakTarget(Rc::downgrade(&self.0))
    }

    /// Liveness token used by the dependency graph to prune dropped targets
    pub(crate) fn liveness(&self) -> Weak<dyn Any> {
        Rc::downgrade(&self.0) as Weak<dyn Any>
    }
}

impl crate::dep::DepSource for Target {
    fn source_id(&self) -> TargetId {
        self.id()
    }

    fn liveness(&self) -> Weak<dyn Any> {
        Target::liveness(self)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Target {}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.data.try_borrow() {
            Ok(data) => write!(f, "Target#{}({:?}, len={})", self.0.id.0, data.kind(), data.len()),
            Err(_) => write!(f, "Target#{}(<borrowed>)", self.0.id.0),
        }
    }
}

/// Non-owning reference to a [`Target`]
#[derive(Clone)]
pub struct WeakTarget(Weak<TargetInner>);

impl WeakTarget {
    pub fn upgrade(&self) -> Option<Target> {
        self.0.upgrade().map(Target)
    }
}

impl fmt::Debug for WeakTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakTarget")
    }
}
