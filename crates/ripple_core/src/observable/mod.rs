//! Observable wrapper layer
//!
//! An [`Observable`] is a view over a [`Target`]. Reads through a tracked
//! view record dependencies for the active effect; writes notify the effects
//! that read the affected members. Read-only views refuse writes and record
//! nothing. Shallow views do neither unwrap reference cells nor wrap nested
//! containers.
//!
//! Views are memoized per target and mode: wrapping the same target twice in
//! the same mode returns the same view. The cache holds weak references, so a
//! view lives exactly as long as something outside the runtime holds it.
//!
//! ```ignore
//! let rt = Runtime::new();
//! let state = rt.reactive_record([
//!     ("todos", Target::sequence([]).into()),
//! ]);
//!
//! let todos = state.get("todos").into_observable().unwrap();
//! todos.push("write docs");      // notifies readers of `length`
//! assert!(rt.is_reactive(&todos.clone().into()));
//! ```

mod base;
mod collection;

pub use base::MAX_SEQUENCE_LEN;

use rustc_hash::FxHashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::dep::{DepKey, TrackOp, Trigger};
use crate::runtime::{Runtime, WeakRuntime};
use crate::target::{next_identity, ContainerKind, Target};
use crate::value::{Key, MapKey, Value};

/// How a view intercepts its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WrapMode {
    pub readonly: bool,
    pub shallow: bool,
}

impl WrapMode {
    pub const TRACKED: Self = Self {
        readonly: false,
        shallow: false,
    };
    pub const READONLY: Self = Self {
        readonly: true,
        shallow: false,
    };
    pub const SHALLOW: Self = Self {
        readonly: false,
        shallow: true,
    };
    pub const SHALLOW_READONLY: Self = Self {
        readonly: true,
        shallow: true,
    };

    fn index(self) -> usize {
        (usize::from(self.readonly) << 1) | usize::from(self.shallow)
    }
}

pub(crate) enum Backing {
    /// A view directly over a target
    Raw(Target),
    /// A read-only view composed over a tracked view
    View(Observable),
}

pub(crate) struct ObservableInner {
    id: u64,
    backing: Backing,
    mode: WrapMode,
    runtime: WeakRuntime,
}

/// A tracked or read-only view over a container
#[derive(Clone)]
pub struct Observable(Rc<ObservableInner>);

/// Smallest cache size that triggers a prune on insert
const PRUNE_THRESHOLD: usize = 64;

/// Weak memo of views, one table per wrap mode
#[derive(Default)]
pub(crate) struct ViewCache {
    tables: [FxHashMap<u64, Weak<ObservableInner>>; 4],
    /// Entry count at which an insert prunes dropped views first
    prune_at: usize,
}

impl ViewCache {
    fn get(&self, mode: WrapMode, backing: u64) -> Option<Observable> {
        self.tables[mode.index()]
            .get(&backing)
            .and_then(Weak::upgrade)
            .map(Observable)
    }

    fn insert(&mut self, mode: WrapMode, backing: u64, view: &Observable) {
        if self.len() >= self.prune_at {
            self.prune();
        }
        self.tables[mode.index()].insert(backing, Rc::downgrade(&view.0));
    }

    fn prune(&mut self) -> usize {
        let mut pruned = 0;
        for table in &mut self.tables {
            let before = table.len();
            table.retain(|_, view| view.strong_count() > 0);
            pruned += before - table.len();
        }
        self.prune_at = (self.len() * 2).max(PRUNE_THRESHOLD);
        pruned
    }

    fn len(&self) -> usize {
        self.tables.iter().map(FxHashMap::len).sum()
    }
}

impl Observable {
    fn new(backing: Backing, mode: WrapMode, runtime: WeakRuntime) -> Self {
        Self(Rc::new(ObservableInner {
            id: next_identity(),
            backing,
            mode,
            runtime,
        }))
    }

    /// Process-unique identity of this view
    pub fn identity(&self) -> u64 {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &Observable) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn mode(&self) -> WrapMode {
        self.0.mode
    }

    pub fn is_readonly(&self) -> bool {
        self.0.mode.readonly
    }

    pub fn is_shallow(&self) -> bool {
        self.0.mode.shallow
    }

    /// Tracked, or read-only over a tracked view
    pub fn is_reactive(&self) -> bool {
        match &self.0.backing {
            Backing::Raw(_) => !self.0.mode.readonly,
            Backing::View(inner) => inner.is_reactive(),
        }
    }

    /// The innermost raw target
    pub fn raw_target(&self) -> Target {
        self.target().clone()
    }

    pub(crate) fn target(&self) -> &Target {
        match &self.0.backing {
            Backing::Raw(target) => target,
            Backing::View(inner) => inner.target(),
        }
    }

    pub fn kind(&self) -> ContainerKind {
        self.target().kind()
    }

    pub(crate) fn runtime(&self) -> Option<Runtime> {
        self.0.runtime.upgrade()
    }

    pub(crate) fn track(&self, op: TrackOp, key: DepKey) {
        if self.is_readonly() {
            return;
        }
        if let Some(rt) = self.runtime() {
            rt.track(self.target(), op, key);
        }
    }

    pub(crate) fn trigger(&self, trigger: Trigger) {
        if let Some(rt) = self.runtime() {
            rt.trigger(trigger);
        }
    }

    pub(crate) fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.runtime() {
            Some(rt) => rt.untracked(f),
            None => f(),
        }
    }

    /// Wrap a member read through this view
    pub(crate) fn wrap_nested(&self, value: Value) -> Value {
        if self.is_shallow() {
            return value;
        }
        match self.runtime() {
            Some(rt) => rt.wrap_quiet(value, self.0.mode),
            None => value,
        }
    }

    fn warn_readonly(&self, op: &str, key: Option<&Key>) {
        if self
            .runtime()
            .is_some_and(|rt| rt.config().warn_readonly_mutation)
        {
            tracing::warn!(op, ?key, target = ?self.target(), "operation failed: target is readonly");
        }
    }

    pub(crate) fn warn_identity_keys(&self) -> bool {
        self.runtime()
            .is_some_and(|rt| rt.config().warn_identity_keys)
    }

    /// The raw target when this view accepts writes
    fn writable(&self, op: &str, key: Option<&Key>) -> Option<&Target> {
        match &self.0.backing {
            Backing::Raw(target) if !self.is_readonly() => Some(target),
            _ => {
                self.warn_readonly(op, key);
                None
            }
        }
    }

    // =========================================================================
    // COMMON OPERATIONS
    // =========================================================================

    /// Read a member
    ///
    /// Records and sequences take names and indices; maps and sets accept any
    /// value as key. Missing members read as `Undefined`.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        match &self.0.backing {
            Backing::View(inner) => self.wrap_nested(inner.get(key)),
            Backing::Raw(target) => match target.kind() {
                ContainerKind::Record => base::record_get(self, target, &key),
                ContainerKind::Sequence => base::sequence_get(self, target, &key),
                ContainerKind::Map | ContainerKind::Set => collection::get(self, target, key),
            },
        }
    }

    /// Write a member; returns false when the key or value is rejected
    ///
    /// Writes through a read-only view are ignored and report success.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let Some(target) = self.writable("set", Some(&key)) else {
            return true;
        };
        let value = value.into();
        match target.kind() {
            ContainerKind::Record => base::record_set(self, target, &key, value),
            ContainerKind::Sequence => base::sequence_set(self, target, &key, value),
            ContainerKind::Map => collection::set(self, target, key, value),
            ContainerKind::Set => {
                tracing::warn!(?key, "`set` is not supported on set containers, use `add`");
                false
            }
        }
    }

    /// Whether a member exists
    pub fn has(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        match &self.0.backing {
            Backing::View(inner) => inner.has(key),
            Backing::Raw(target) => match target.kind() {
                ContainerKind::Record => base::record_has(self, target, &key),
                ContainerKind::Sequence => base::sequence_has(self, target, &key),
                ContainerKind::Map | ContainerKind::Set => collection::has(self, target, key),
            },
        }
    }

    /// Remove a member; returns whether it existed
    ///
    /// Deleting a sequence index leaves a hole (`Undefined`) in place. On a
    /// read-only view the delete is ignored; records and sequences report
    /// success like [`Observable::set`], maps and sets report `false`.
    pub fn delete(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        let Some(target) = self.writable("delete", Some(&key)) else {
            return !self.kind().is_collection();
        };
        match target.kind() {
            ContainerKind::Record => base::record_delete(self, target, &key),
            ContainerKind::Sequence => base::sequence_delete(self, target, &key),
            ContainerKind::Map | ContainerKind::Set => collection::delete(self, target, key),
        }
    }

    /// Member keys: field names, indices, map keys or set members
    pub fn keys(&self) -> Vec<Value> {
        match &self.0.backing {
            Backing::View(inner) => inner
                .keys()
                .into_iter()
                .map(|key| self.wrap_nested(key))
                .collect(),
            Backing::Raw(target) => match target.kind() {
                ContainerKind::Record => base::record_keys(self, target),
                ContainerKind::Sequence => base::sequence_keys(self, target),
                ContainerKind::Map | ContainerKind::Set => collection::keys(self, target),
            },
        }
    }

    /// Member values, wrapped like [`Observable::get`] results
    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    /// `(key, value)` pairs; set members pair with themselves
    pub fn entries(&self) -> Vec<(Value, Value)> {
        match &self.0.backing {
            Backing::View(inner) => inner
                .entries()
                .into_iter()
                .map(|(key, value)| (self.wrap_nested(key), self.wrap_nested(value)))
                .collect(),
            Backing::Raw(target) => match target.kind() {
                ContainerKind::Record | ContainerKind::Sequence => self
                    .keys()
                    .into_iter()
                    .map(|key| {
                        let value = self.get(&key);
                        (key, value)
                    })
                    .collect(),
                ContainerKind::Map | ContainerKind::Set => collection::entries(self, target),
            },
        }
    }

    /// Member count (sequence length, collection size)
    pub fn len(&self) -> usize {
        match &self.0.backing {
            Backing::View(inner) => inner.len(),
            Backing::Raw(target) => {
                match target.kind() {
                    ContainerKind::Sequence => self.track(TrackOp::Get, DepKey::Length),
                    _ => self.track(TrackOp::Iterate, DepKey::Iterate),
                }
                target.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // SEQUENCE OPERATIONS
    // =========================================================================

    fn sequence_target(&self, op: &str) -> Option<&Target> {
        let target = self.writable(op, None)?;
        if target.kind() == ContainerKind::Sequence {
            Some(target)
        } else {
            tracing::warn!(op, kind = ?target.kind(), "operation requires a sequence");
            None
        }
    }

    /// Append an item; returns the new length
    pub fn push(&self, value: impl Into<Value>) -> usize {
        match self.sequence_target("push") {
            Some(target) => base::push(self, target, value.into()),
            None => self.target().len(),
        }
    }

    /// Remove and return the last item
    pub fn pop(&self) -> Value {
        match self.sequence_target("pop") {
            Some(target) => base::pop(self, target),
            None => Value::Undefined,
        }
    }

    /// Insert an item at `index`, shifting later items up
    pub fn insert(&self, index: usize, value: impl Into<Value>) {
        if let Some(target) = self.sequence_target("insert") {
            base::insert(self, target, index, value.into());
        }
    }

    /// Remove the item at `index`, shifting later items down
    pub fn remove(&self, index: usize) -> Value {
        match self.sequence_target("remove") {
            Some(target) => base::remove(self, target, index),
            None => Value::Undefined,
        }
    }

    /// Grow (with `Undefined` holes) or shrink the sequence
    ///
    /// Returns false when `len` exceeds [`MAX_SEQUENCE_LEN`] or the storage
    /// cannot be reserved; read-only views ignore the call and return true.
    pub fn set_len(&self, len: usize) -> bool {
        match self.sequence_target("set_len") {
            Some(target) => base::set_len(self, target, len),
            None => self.is_readonly(),
        }
    }

    pub fn truncate(&self, len: usize) {
        if let Some(target) = self.sequence_target("truncate") {
            if len < target.len() {
                base::set_len(self, target, len);
            }
        }
    }

    /// Whether the sequence holds `value` (same-value-zero)
    pub fn contains(&self, value: &Value) -> bool {
        base::search(self, value, base::SearchMode::Contains).is_some()
    }

    /// Index of the first item strictly equal to `value`
    pub fn position(&self, value: &Value) -> Option<usize> {
        base::search(self, value, base::SearchMode::Position)
    }

    // =========================================================================
    // COLLECTION OPERATIONS
    // =========================================================================

    fn collection_target(&self, op: &str, key: Option<&Key>) -> Option<&Target> {
        let target = self.writable(op, key)?;
        if target.kind().is_collection() {
            Some(target)
        } else {
            tracing::warn!(op, kind = ?target.kind(), "operation requires a map or set");
            None
        }
    }

    /// Add a member to a set; returns whether it was newly inserted
    pub fn add(&self, value: impl Into<Value>) -> bool {
        let value = value.into();
        let key = Key::Value(value.clone());
        match self.collection_target("add", Some(&key)) {
            Some(target) if target.kind() == ContainerKind::Set => collection::add(self, target, value),
            Some(_) => {
                tracing::warn!("`add` is not supported on map containers, use `set`");
                false
            }
            None => false,
        }
    }

    /// Remove every entry of a map or set
    pub fn clear(&self) {
        if let Some(target) = self.collection_target("clear", None) {
            collection::clear(self, target);
        }
    }

    /// Visit every `(value, key)` pair
    pub fn for_each(&self, mut f: impl FnMut(Value, Value)) {
        for (key, value) in self.entries() {
            f(value, key);
        }
    }
}

impl PartialEq for Observable {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Observable {}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match (self.is_readonly(), self.is_shallow()) {
            (false, false) => "reactive",
            (true, false) => "readonly",
            (false, true) => "shallow_reactive",
            (true, true) => "shallow_readonly",
        };
        write!(f, "Observable#{}({mode}, {:?})", self.0.id, self.target())
    }
}

/// Whether `value` is a tracked view (or read-only over one)
pub fn is_reactive(value: &Value) -> bool {
    value.as_observable().is_some_and(Observable::is_reactive)
}

pub fn is_readonly(value: &Value) -> bool {
    value.as_observable().is_some_and(Observable::is_readonly)
}

/// Whether `value` is any kind of view
pub fn is_observable(value: &Value) -> bool {
    value.as_observable().is_some()
}

/// Strip every layer of wrapping
pub fn to_raw(value: &Value) -> Value {
    value.to_raw()
}

/// Mark a raw target as non-observable; other values are returned unchanged
pub fn mark_raw(value: Value) -> Value {
    if let Value::Target(target) = &value {
        target.mark_raw();
    }
    value
}

impl Runtime {
    // =========================================================================
    // WRAPPING
    // =========================================================================

    /// Tracked view of a container value
    pub fn reactive(&self, value: impl Into<Value>) -> Value {
        self.wrap(value.into(), WrapMode::TRACKED)
    }

    /// Read-only view; nested containers are read-only too
    pub fn readonly(&self, value: impl Into<Value>) -> Value {
        self.wrap(value.into(), WrapMode::READONLY)
    }

    /// Tracked at the top level only
    pub fn shallow_reactive(&self, value: impl Into<Value>) -> Value {
        self.wrap(value.into(), WrapMode::SHALLOW)
    }

    /// Read-only at the top level only
    pub fn shallow_readonly(&self, value: impl Into<Value>) -> Value {
        self.wrap(value.into(), WrapMode::SHALLOW_READONLY)
    }

    /// Wrap a value in `mode`
    ///
    /// Values that cannot be wrapped (scalars, reference cells, targets marked
    /// raw or frozen) are returned unchanged with a warning. A read-only view
    /// is returned as is; a tracked view is returned as is unless a read-only
    /// mode is requested, in which case a read-only view is composed over it.
    pub fn wrap(&self, value: Value, mode: WrapMode) -> Value {
        self.wrap_value(value, mode, true)
    }

    pub(crate) fn wrap_quiet(&self, value: Value, mode: WrapMode) -> Value {
        self.wrap_value(value, mode, false)
    }

    fn wrap_value(&self, value: Value, mode: WrapMode, diagnose: bool) -> Value {
        match value {
            Value::Target(target) => match self.view_of(&target, mode, diagnose) {
                Some(view) => Value::Observable(view),
                None => Value::Target(target),
            },
            Value::Observable(view) => Value::Observable(self.compose(view, mode)),
            other => {
                if diagnose && self.config().warn_ineligible_wrap {
                    tracing::warn!(value = ?other, "value cannot be made reactive");
                }
                other
            }
        }
    }

    /// View of `target` in `mode`, or `None` when the target cannot be wrapped
    pub fn observe(&self, target: &Target, mode: WrapMode) -> Option<Observable> {
        self.view_of(target, mode, true)
    }

    fn view_of(&self, target: &Target, mode: WrapMode, diagnose: bool) -> Option<Observable> {
        let key = target.id().to_raw();
        if let Some(view) = self.inner.views.borrow().get(mode, key) {
            return Some(view);
        }
        if target.is_marked_raw() || target.is_frozen() {
            if diagnose && self.config().warn_ineligible_wrap {
                tracing::warn!(?target, "target is marked raw or frozen and cannot be wrapped");
            }
            return None;
        }
        Some(self.create_view(Backing::Raw(target.clone()), mode, key))
    }

    fn compose(&self, view: Observable, mode: WrapMode) -> Observable {
        if view.is_readonly() || !mode.readonly {
            return view;
        }
        let key = view.identity();
        if let Some(existing) = self.inner.views.borrow().get(mode, key) {
            return existing;
        }
        self.create_view(Backing::View(view), mode, key)
    }

    fn create_view(&self, backing: Backing, mode: WrapMode, key: u64) -> Observable {
        let view = Observable::new(backing, mode, self.downgrade());
        self.inner.views.borrow_mut().insert(mode, key, &view);
        view
    }

    fn fresh_view(&self, target: Target, mode: WrapMode) -> Observable {
        let key = target.id().to_raw();
        self.create_view(Backing::Raw(target), mode, key)
    }

    /// Tracked record built from `(name, value)` pairs
    pub fn reactive_record<K, I>(&self, fields: I) -> Observable
    where
        K: Into<Rc<str>>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.fresh_view(Target::record(fields), WrapMode::TRACKED)
    }

    /// Tracked sequence built from its items
    pub fn reactive_sequence<I: IntoIterator<Item = Value>>(&self, items: I) -> Observable {
        self.fresh_view(Target::sequence(items), WrapMode::TRACKED)
    }

    /// Tracked map built from `(key, value)` pairs
    pub fn reactive_map<I: IntoIterator<Item = (Value, Value)>>(&self, entries: I) -> Observable {
        self.fresh_view(Target::map(entries), WrapMode::TRACKED)
    }

    /// Tracked set built from its members
    pub fn reactive_set<I: IntoIterator<Item = Value>>(&self, values: I) -> Observable {
        self.fresh_view(Target::set(values), WrapMode::TRACKED)
    }

    pub fn is_reactive(&self, value: &Value) -> bool {
        is_reactive(value)
    }

    pub fn is_readonly(&self, value: &Value) -> bool {
        is_readonly(value)
    }

    pub fn is_observable(&self, value: &Value) -> bool {
        is_observable(value)
    }

    pub fn to_raw(&self, value: &Value) -> Value {
        value.to_raw()
    }

    /// Number of live cached views
    pub fn view_count(&self) -> usize {
        self.inner.views.borrow().len()
    }

    pub(crate) fn prune_views(&self) {
        let pruned = self.inner.views.borrow_mut().prune();
        if pruned > 0 {
            tracing::trace!(pruned, "pruned dropped views");
        }
    }
}

/// Normalize a collection key
pub(crate) fn entry_value(key: Key) -> Value {
    match key {
        Key::Name(name) => Value::Str(name),
        Key::Index(index) => Value::from(index),
        Key::Value(value) => value,
    }
}

pub(crate) fn entry_key(value: &Value) -> DepKey {
    DepKey::Entry(MapKey::new(value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectOptions;
    use std::cell::{Cell, RefCell};

    #[test]
    fn test_wrap_is_memoized() {
        let rt = Runtime::new();
        let target = Target::record([("a", Value::from(1))]);

        let first = rt.reactive(target.clone());
        let second = rt.reactive(target.clone());
        assert_eq!(first, second);
        assert!(first.as_observable().unwrap().ptr_eq(second.as_observable().unwrap()));

        let readonly = rt.readonly(target.clone());
        assert_ne!(first, readonly);
        assert_eq!(readonly, rt.readonly(target));
    }

    #[test]
    fn test_wrap_ineligible_values() {
        let rt = Runtime::new();
        assert_eq!(rt.reactive(1), Value::from(1));
        assert_eq!(rt.reactive("text"), Value::from("text"));

        let skipped = Target::record::<&str, _>([]);
        skipped.mark_raw();
        assert!(!rt.is_reactive(&rt.reactive(skipped.clone())));

        let frozen = Target::sequence([]);
        frozen.freeze();
        assert_eq!(rt.reactive(frozen.clone()), Value::Target(frozen));
    }

    #[test]
    fn test_mark_raw_helper() {
        let rt = Runtime::new();
        let value = mark_raw(Value::from(Target::map([])));
        assert!(!is_observable(&rt.reactive(value)));
    }

    #[test]
    fn test_rewrapping_views() {
        let rt = Runtime::new();
        let target = Target::record([("a", Value::from(1))]);
        let tracked = rt.reactive(target.clone());
        let readonly = rt.readonly(target.clone());

        // Tracked view wrapped again as tracked is itself
        assert_eq!(rt.reactive(tracked.clone()), tracked);
        // Read-only view wrapped as tracked stays read-only
        assert_eq!(rt.reactive(readonly.clone()), readonly);

        // Read-only over tracked composes and is still reactive
        let composed = rt.readonly(tracked.clone());
        assert!(is_readonly(&composed));
        assert!(is_reactive(&composed));
        assert_ne!(composed, readonly);
        assert_eq!(rt.readonly(tracked), composed);

        assert!(!is_reactive(&readonly));
        assert_eq!(to_raw(&composed), Value::Target(target));
    }

    #[test]
    fn test_readonly_refuses_writes() {
        let rt = Runtime::new();
        let target = Target::record([("a", Value::from(1))]);
        let readonly = rt.readonly(target.clone()).into_observable().unwrap();

        assert!(readonly.set("a", 2));
        assert!(readonly.delete("a"));
        assert!(readonly.delete("missing"));
        assert_eq!(readonly.get("a"), Value::from(1));
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn test_readonly_records_no_dependencies() {
        let rt = Runtime::new();
        let target = Target::record([("a", Value::from(1))]);
        let readonly = rt.readonly(target).into_observable().unwrap();
        let runs = Rc::new(Cell::new(0));

        let runs_clone = runs.clone();
        let effect = rt.effect(
            move |_| {
                readonly.get("a");
                readonly.keys();
                runs_clone.set(runs_clone.get() + 1);
                Ok(())
            },
            EffectOptions::default(),
        );
        assert_eq!(rt.effect_dep_count(effect), 0);
    }

    #[test]
    fn test_readonly_over_tracked_still_tracks() {
        let rt = Runtime::new();
        let tracked = rt.reactive_record([("a", 1.into())]);
        let composed = rt
            .readonly(tracked.clone())
            .into_observable()
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_clone = seen.clone();
        rt.effect(
            move |_| {
                seen_clone.borrow_mut().push(composed.get("a"));
                Ok(())
            },
            EffectOptions::default(),
        );
        tracked.set("a", 2);
        assert_eq!(*seen.borrow(), vec![Value::from(1), Value::from(2)]);
    }

    #[test]
    fn test_nested_values_wrapped_in_same_mode() {
        let rt = Runtime::new();
        let inner = Target::record([("x", Value::from(1))]);
        let outer = Target::record([("inner", Value::from(inner.clone()))]);

        let tracked = rt.reactive(outer.clone()).into_observable().unwrap();
        let nested = tracked.get("inner");
        assert!(is_reactive(&nested));
        assert_eq!(nested, rt.reactive(inner.clone()));

        let readonly = rt.readonly(outer.clone()).into_observable().unwrap();
        assert!(is_readonly(&readonly.get("inner")));

        let shallow = rt.shallow_reactive(outer).into_observable().unwrap();
        assert_eq!(shallow.get("inner"), Value::Target(inner));
    }

    #[test]
    fn test_views_are_weakly_cached() {
        let rt = Runtime::new();
        let target = Target::sequence([]);
        let view = rt.reactive(target.clone());
        let id = view.as_observable().unwrap().identity();
        assert_eq!(rt.view_count(), 1);

        drop(view);
        rt.prune_views();
        assert_eq!(rt.view_count(), 0);
        let again = rt.reactive(target);
        assert_ne!(again.as_observable().unwrap().identity(), id);
    }

    #[test]
    fn test_view_cache_prunes_as_it_grows() {
        let rt = Runtime::new();
        for n in 0..1000 {
            rt.reactive(Target::record([("n", Value::from(n))]));
        }
        assert!(rt.view_count() <= PRUNE_THRESHOLD);

        let kept: Vec<Value> = (0..100).map(|_| rt.reactive(Target::sequence([]))).collect();
        assert!(rt.view_count() >= kept.len());
    }
}
