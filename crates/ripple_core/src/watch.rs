//! Watch binding
//!
//! [`Runtime::watch`] pairs a read step (the source) with a callback that
//! receives the new and previous values whenever the source changes.
//! [`Runtime::watch_effect`] re-runs a single closure instead. Both are lazy
//! effects whose scheduler decides *when* the work runs:
//!
//! - [`FlushTiming::Sync`]: inside the triggering write
//! - [`FlushTiming::Pre`]: in the pre phase of the next flush, or right away
//!   while the owning [`Owner`] has not mounted yet
//! - [`FlushTiming::Post`]: in the post phase of the next flush (default)

use rustc_hash::FxHashSet;
use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::effect::{DebuggerHook, Effect, EffectOptions};
use crate::error::{ErrorContext, ReactiveError};
use crate::observable::Observable;
use crate::reference::Ref;
use crate::runtime::{Runtime, WeakRuntime};
use crate::scheduler::{Job, RecursionPolicy};
use crate::target::{Container, ContainerKind, Target};
use crate::value::{has_changed, Value};

/// A watch getter
pub type Getter = Rc<dyn Fn(&Runtime) -> anyhow::Result<Value>>;

type Cleanup = Box<dyn FnOnce(&Runtime) -> anyhow::Result<()>>;
type WatchCallback = Box<dyn FnMut(&Runtime, &Value, &Value, &OnCleanup) -> anyhow::Result<()>>;

/// What a watcher reads
#[derive(Clone)]
pub enum WatchSource {
    /// A reference cell; every write that changes it re-runs the callback
    Ref(Ref),
    /// A tracked view, read deeply
    Observable(Observable),
    Getter(Getter),
    /// Several sources; the value is a sequence of their values
    Many(Vec<WatchSource>),
    /// Anything else; reads as `Undefined`
    Invalid(Value),
}

impl WatchSource {
    pub fn getter(f: impl Fn(&Runtime) -> anyhow::Result<Value> + 'static) -> Self {
        Self::Getter(Rc::new(f))
    }
}

impl From<Ref> for WatchSource {
    fn from(cell: Ref) -> Self {
        Self::Ref(cell)
    }
}

impl From<Observable> for WatchSource {
    fn from(view: Observable) -> Self {
        Self::Observable(view)
    }
}

impl From<Vec<WatchSource>> for WatchSource {
    fn from(sources: Vec<WatchSource>) -> Self {
        Self::Many(sources)
    }
}

impl From<Value> for WatchSource {
    fn from(value: Value) -> Self {
        match value {
            Value::Ref(cell) => Self::Ref(cell),
            Value::Observable(view) => Self::Observable(view),
            other => Self::Invalid(other),
        }
    }
}

impl fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(cell) => f.debug_tuple("Ref").field(cell).finish(),
            Self::Observable(view) => f.debug_tuple("Observable").field(view).finish(),
            Self::Getter(_) => f.write_str("Getter"),
            Self::Many(sources) => f.debug_tuple("Many").field(sources).finish(),
            Self::Invalid(value) => f.debug_tuple("Invalid").field(value).finish(),
        }
    }
}

/// When a watcher's job runs after its source changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlushTiming {
    Sync,
    Pre,
    #[default]
    Post,
}

/// Options for [`Runtime::watch`] and [`Runtime::watch_effect`]
#[derive(Clone, Default)]
pub struct WatchOptions {
    /// Invoke the callback once right away
    pub immediate: bool,
    /// Read the source deeply and always invoke the callback on change
    pub deep: bool,
    pub flush: FlushTiming,
    pub owner: Option<Owner>,
    pub on_track: Option<DebuggerHook>,
    pub on_trigger: Option<DebuggerHook>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn deep(mut self) -> Self {
        self.deep = true;
        self
    }

    pub fn flush(mut self, timing: FlushTiming) -> Self {
        self.flush = timing;
        self
    }

    pub fn owner(mut self, owner: &Owner) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn on_track(mut self, hook: impl Fn(&crate::dep::DebuggerEvent) + 'static) -> Self {
        self.on_track = Some(Rc::new(hook));
        self
    }

    pub fn on_trigger(mut self, hook: impl Fn(&crate::dep::DebuggerEvent) + 'static) -> Self {
        self.on_trigger = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("immediate", &self.immediate)
            .field("deep", &self.deep)
            .field("flush", &self.flush)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Registers the cleanup that runs before the next invocation or on stop
///
/// Registering again replaces the pending cleanup. A registered cleanup runs
/// at most once.
#[derive(Clone, Default)]
pub struct OnCleanup {
    slot: Rc<RefCell<Option<Cleanup>>>,
}

impl OnCleanup {
    pub fn register(&self, cleanup: impl FnOnce(&Runtime) -> anyhow::Result<()> + 'static) {
        *self.slot.borrow_mut() = Some(Box::new(cleanup));
    }

    fn run(&self, rt: &Runtime) {
        let cleanup = self.slot.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            if let Err(err) = cleanup(rt) {
                rt.handle_error(ReactiveError::computation(ErrorContext::WatchCleanup, err));
            }
        }
    }
}

impl fmt::Debug for OnCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.slot.try_borrow().map(|slot| slot.is_some()).unwrap_or(true);
        f.debug_struct("OnCleanup").field("pending", &pending).finish()
    }
}

#[derive(Default)]
struct OwnerState {
    mounted: Cell<bool>,
    unmounted: Cell<bool>,
    effects: RefCell<Vec<Effect>>,
}

/// A scope that owns watchers
///
/// Pre-timed watchers run synchronously until the owner is mounted, and
/// unmounting stops every watcher the owner still holds.
#[derive(Clone, Default)]
pub struct Owner(Rc<OwnerState>);

impl Owner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_mounted(&self) {
        self.0.mounted.set(true);
    }

    pub fn is_mounted(&self) -> bool {
        self.0.mounted.get()
    }

    pub fn is_unmounted(&self) -> bool {
        self.0.unmounted.get()
    }

    /// Mark the owner unmounted and dispose of its watchers
    pub fn unmount(&self, rt: &Runtime) {
        self.0.unmounted.set(true);
        let effects = std::mem::take(&mut *self.0.effects.borrow_mut());
        tracing::debug!(watchers = effects.len(), "owner unmounted");
        for effect in effects {
            rt.dispose_effect(effect);
        }
    }

    /// Watchers still registered with this owner
    pub fn watcher_count(&self) -> usize {
        self.0.effects.borrow().len()
    }

    fn register(&self, effect: Effect) {
        self.0.effects.borrow_mut().push(effect);
    }

    fn forget(&self, effect: Effect) {
        self.0.effects.borrow_mut().retain(|owned| *owned != effect);
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("mounted", &self.is_mounted())
            .field("unmounted", &self.is_unmounted())
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

/// Returned by [`Runtime::watch`]; dropping it does not stop the watcher
#[derive(Debug, Clone)]
pub struct WatchHandle {
    runtime: WeakRuntime,
    effect: Effect,
    owner: Option<Owner>,
}

impl WatchHandle {
    /// Stop watching and release the watcher; the pending cleanup runs
    pub fn stop(&self) {
        if let Some(rt) = self.runtime.upgrade() {
            rt.dispose_effect(self.effect);
        }
        if let Some(owner) = &self.owner {
            owner.forget(self.effect);
        }
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    pub fn is_active(&self) -> bool {
        self.runtime
            .upgrade()
            .is_some_and(|rt| rt.is_effect_active(self.effect))
    }
}

/// How a watcher decides that its callback is due
struct Comparison {
    deep: bool,
    /// Reference-cell sources notify on every change of the cell
    force: bool,
    initial_old: Option<Value>,
}

fn is_valid_element(source: &WatchSource) -> bool {
    match source {
        WatchSource::Ref(_) | WatchSource::Getter(_) => true,
        WatchSource::Observable(view) => view.is_reactive(),
        WatchSource::Many(_) | WatchSource::Invalid(_) => false,
    }
}

fn warn_invalid(source: &WatchSource) {
    let invalid = |source: &WatchSource| {
        tracing::warn!(
            ?source,
            "invalid watch source: a source can only be a getter, a reference cell, \
             a reactive observable, or a list of these"
        );
    };
    match source {
        WatchSource::Many(sources) => sources
            .iter()
            .filter(|source| !is_valid_element(source))
            .for_each(invalid),
        WatchSource::Invalid(_) => invalid(source),
        WatchSource::Observable(view) if !view.is_reactive() => invalid(source),
        _ => {}
    }
}

fn call_getter(rt: &Runtime, getter: &Getter) -> Value {
    getter(rt).unwrap_or_else(|err| {
        rt.handle_error(ReactiveError::computation(ErrorContext::WatchGetter, err));
        Value::Undefined
    })
}

fn read_source(rt: &Runtime, source: &WatchSource) -> Value {
    match source {
        WatchSource::Ref(cell) => cell.get(),
        WatchSource::Observable(view) if view.is_reactive() => Value::Observable(view.clone()),
        WatchSource::Getter(getter) => call_getter(rt, getter),
        WatchSource::Many(sources) => {
            let values: Vec<Value> = sources
                .iter()
                .map(|source| match source {
                    WatchSource::Ref(cell) => cell.get(),
                    WatchSource::Observable(view) if view.is_reactive() => {
                        traverse(&Value::Observable(view.clone()))
                    }
                    WatchSource::Getter(getter) => call_getter(rt, getter),
                    _ => Value::Undefined,
                })
                .collect();
            Value::Target(Target::sequence(values))
        }
        _ => Value::Undefined,
    }
}

/// Read every member reachable from `value` so the active effect depends on
/// all of them; returns `value`
pub fn traverse(value: &Value) -> Value {
    let mut seen = FxHashSet::default();
    visit(value, &mut seen);
    value.clone()
}

fn visit(value: &Value, seen: &mut FxHashSet<u64>) {
    match value {
        Value::Ref(cell) => {
            if seen.insert(cell.id().to_raw()) {
                visit(&cell.get(), seen);
            }
        }
        Value::Observable(view) => {
            if !seen.insert(view.identity()) {
                return;
            }
            match view.kind() {
                ContainerKind::Record => {
                    for key in view.keys() {
                        visit(&view.get(&key), seen);
                    }
                }
                ContainerKind::Sequence => {
                    for index in 0..view.len() {
                        visit(&view.get(index), seen);
                    }
                }
                ContainerKind::Map => {
                    for (key, _) in view.entries() {
                        visit(&view.get(key), seen);
                    }
                }
                ContainerKind::Set => {
                    for member in view.values() {
                        visit(&member, seen);
                    }
                }
            }
        }
        Value::Target(target) => {
            if !seen.insert(target.id().to_raw()) {
                return;
            }
            let members: Vec<Value> = target.with(|container| match container {
                Container::Record(fields) => fields.values().cloned().collect(),
                Container::Sequence(items) => items.clone(),
                Container::Map(entries) => entries.values().cloned().collect(),
                Container::Set(members) => members.iter().map(|m| m.value().clone()).collect(),
            });
            for member in &members {
                visit(member, seen);
            }
        }
        _ => {}
    }
}

impl Runtime {
    // =========================================================================
    // WATCH
    // =========================================================================

    /// Watch `source` and invoke `callback(new, old)` when it changes
    ///
    /// The callback is skipped when the new value equals the old one
    /// (same-value-zero), except for deep watchers and reference-cell
    /// sources. `old` is `Undefined` the first time, or an empty sequence for
    /// list sources.
    pub fn watch<F>(&self, source: impl Into<WatchSource>, callback: F, options: WatchOptions) -> WatchHandle
    where
        F: FnMut(&Runtime, &Value, &Value, &OnCleanup) -> anyhow::Result<()> + 'static,
    {
        let source = source.into();
        warn_invalid(&source);

        let comparison = Comparison {
            deep: options.deep || matches!(source, WatchSource::Observable(_)),
            force: matches!(source, WatchSource::Ref(_)),
            initial_old: matches!(source, WatchSource::Many(_))
                .then(|| Value::Target(Target::sequence([]))),
        };
        let deep = comparison.deep;
        let getter = move |rt: &Runtime| -> anyhow::Result<Value> {
            let value = read_source(rt, &source);
            Ok(if deep { traverse(&value) } else { value })
        };

        self.watch_inner(getter, Some(Box::new(callback)), OnCleanup::default(), comparison, options)
    }

    /// Run `f` now and again whenever anything it read changes
    ///
    /// Runs stop once the owner (if any) is unmounted. A registered cleanup
    /// runs before each re-run and when the watcher stops.
    pub fn watch_effect<F>(&self, mut f: F, options: WatchOptions) -> WatchHandle
    where
        F: FnMut(&Runtime, &OnCleanup) -> anyhow::Result<()> + 'static,
    {
        if options.immediate {
            tracing::warn!("the `immediate` option is only respected by `watch`");
        }
        if options.deep {
            tracing::warn!("the `deep` option is only respected by `watch`");
        }

        let cleanup = OnCleanup::default();
        let owner = options.owner.clone();
        let body_cleanup = cleanup.clone();
        let getter = move |rt: &Runtime| -> anyhow::Result<Value> {
            if owner.as_ref().is_some_and(Owner::is_unmounted) {
                return Ok(Value::Undefined);
            }
            body_cleanup.run(rt);
            if let Err(err) = f(rt, &body_cleanup) {
                rt.handle_error(ReactiveError::computation(ErrorContext::WatchCallback, err));
            }
            Ok(Value::Undefined)
        };

        let comparison = Comparison {
            deep: false,
            force: false,
            initial_old: None,
        };
        self.watch_inner(getter, None, cleanup, comparison, options)
    }

    fn watch_inner<G>(
        &self,
        getter: G,
        callback: Option<WatchCallback>,
        cleanup: OnCleanup,
        comparison: Comparison,
        options: WatchOptions,
    ) -> WatchHandle
    where
        G: FnMut(&Runtime) -> anyhow::Result<Value> + 'static,
    {
        let runner: Rc<OnceCell<Effect>> = Rc::default();
        let old_value = Rc::new(RefCell::new(comparison.initial_old.clone()));
        let has_callback = callback.is_some();

        let job = {
            let runner = runner.clone();
            let old_value = old_value.clone();
            let cleanup = cleanup.clone();
            let mut callback = callback;
            let label = if has_callback { "watch" } else { "watch_effect" };
            Job::new(label, move |rt| {
                let Some(&effect) = runner.get() else {
                    return Ok(());
                };
                if !rt.is_effect_active(effect) {
                    return Ok(());
                }
                let Some(callback) = callback.as_mut() else {
                    if let Err(err) = rt.run_effect(effect) {
                        rt.handle_error(err);
                    }
                    return Ok(());
                };

                let new_value = match rt.run_effect(effect) {
                    Ok(Some(value)) => value,
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        rt.handle_error(err);
                        return Ok(());
                    }
                };
                let previous = old_value.borrow_mut().take();
                let changed = comparison.deep
                    || comparison.force
                    || previous.as_ref().map_or(true, |old| has_changed(&new_value, old));
                if !changed {
                    *old_value.borrow_mut() = previous;
                    return Ok(());
                }

                cleanup.run(rt);
                let old = previous.unwrap_or_default();
                let result = callback(rt, &new_value, &old, &cleanup);
                *old_value.borrow_mut() = Some(new_value);
                if let Err(err) = result {
                    rt.handle_error(ReactiveError::computation(ErrorContext::WatchCallback, err));
                }
                Ok(())
            })
            .with_policy(if has_callback {
                RecursionPolicy::AllowDeferred
            } else {
                RecursionPolicy::Deny
            })
        };

        let scheduled = job.clone();
        let mut effect_options = match options.flush {
            FlushTiming::Sync => EffectOptions::new().scheduler(move |rt, _| rt.run_job(&scheduled)),
            FlushTiming::Pre => {
                let owner = options.owner.clone();
                EffectOptions::new().scheduler(move |rt, _| {
                    if owner.as_ref().map_or(true, Owner::is_mounted) {
                        rt.enqueue_pre(scheduled.clone());
                    } else {
                        rt.run_job(&scheduled);
                    }
                })
            }
            FlushTiming::Post => {
                EffectOptions::new().scheduler(move |rt, _| rt.enqueue_post(scheduled.clone()))
            }
        }
        .lazy();

        let stop_cleanup = cleanup.clone();
        effect_options = effect_options.on_stop(move |rt| {
            stop_cleanup.run(rt);
            Ok(())
        });
        if let Some(hook) = options.on_track.clone() {
            effect_options = effect_options.on_track(move |event| hook(event));
        }
        if let Some(hook) = options.on_trigger.clone() {
            effect_options = effect_options.on_trigger(move |event| hook(event));
        }

        let effect = self.effect(getter, effect_options);
        runner.get_or_init(|| effect);
        if let Some(owner) = &options.owner {
            owner.register(effect);
        }

        if has_callback && options.immediate {
            self.run_job(&job);
        } else {
            match self.run_effect(effect) {
                Ok(value) if has_callback => *old_value.borrow_mut() = value,
                Ok(_) => {}
                Err(err) => self.handle_error(err),
            }
        }
        tracing::trace!(order = effect.order(), flush = ?options.flush, "watcher created");

        WatchHandle {
            runtime: self.downgrade(),
            effect,
            owner: options.owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Calls = Rc<RefCell<Vec<(Value, Value)>>>;

    fn recorder() -> (Calls, impl FnMut(&Runtime, &Value, &Value, &OnCleanup) -> anyhow::Result<()>) {
        let calls: Calls = Rc::default();
        let calls_clone = calls.clone();
        let callback = move |_: &Runtime, new: &Value, old: &Value, _: &OnCleanup| -> anyhow::Result<()> {
            calls_clone.borrow_mut().push((new.clone(), old.clone()));
            Ok(())
        };
        (calls, callback)
    }

    #[test]
    fn test_watch_ref_defaults_to_post_flush() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(1);
        let (calls, callback) = recorder();
        rt.watch(cell.clone(), callback, WatchOptions::default());

        cell.set(2);
        assert!(calls.borrow().is_empty());
        assert_eq!(rt.stats().queued_post, 1);

        rt.flush().unwrap();
        assert_eq!(*calls.borrow(), vec![(Value::from(2), Value::from(1))]);
    }

    #[test]
    fn test_getter_result_unchanged_skips_callback() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("n", 1.into())]);
        let reader = state.clone();
        let (calls, callback) = recorder();
        rt.watch(
            WatchSource::getter(move |_| {
                let n = reader.get("n").as_number().unwrap_or(0.0);
                Ok(Value::from(n % 2.0))
            }),
            callback,
            WatchOptions::new().flush(FlushTiming::Sync),
        );

        state.set("n", 3);
        assert!(calls.borrow().is_empty());
        state.set("n", 4);
        assert_eq!(*calls.borrow(), vec![(Value::from(0), Value::from(1))]);
    }

    #[test]
    fn test_immediate_passes_undefined_old_value() {
        let rt = Runtime::new();
        let cell = rt.ref_cell("a");
        let (calls, callback) = recorder();
        rt.watch(cell, callback, WatchOptions::new().immediate());
        assert_eq!(*calls.borrow(), vec![(Value::from("a"), Value::Undefined)]);
    }

    #[test]
    fn test_many_source_starts_with_empty_sequence() {
        let rt = Runtime::new();
        let a = rt.ref_cell(1);
        let b = rt.ref_cell(2);
        let (calls, callback) = recorder();
        rt.watch(
            vec![WatchSource::from(a.clone()), WatchSource::from(b)],
            callback,
            WatchOptions::new().immediate().flush(FlushTiming::Sync),
        );

        let (new, old) = calls.borrow()[0].clone();
        assert_eq!(new.as_target().map(Target::len), Some(2));
        assert_eq!(old.as_target().map(Target::len), Some(0));

        a.set(10);
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn test_observable_source_is_deep() {
        let rt = Runtime::new();
        let nested = Target::record([("x", Value::from(1))]);
        let state = rt.reactive_record([("nested", nested.into())]);
        let (calls, callback) = recorder();
        rt.watch(state.clone(), callback, WatchOptions::new().flush(FlushTiming::Sync));

        let inner = state.get("nested").into_observable().unwrap();
        inner.set("x", 2);
        assert_eq!(calls.borrow().len(), 1);
        // Deep watchers report the same container as new and old
        let (new, old) = calls.borrow()[0].clone();
        assert_eq!(new, Value::Observable(state.clone()));
        assert_eq!(old, Value::Observable(state));
    }

    #[test]
    fn test_cleanup_runs_before_callback_and_on_stop() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        let log_clone = log.clone();
        let handle = rt.watch(
            cell.clone(),
            move |_, new, _, on_cleanup| {
                let n = new.as_number().unwrap_or(0.0);
                log_clone.borrow_mut().push(format!("run {n}"));
                let log = log_clone.clone();
                on_cleanup.register(move |_| {
                    log.borrow_mut().push(format!("cleanup {n}"));
                    Ok(())
                });
                Ok(())
            },
            WatchOptions::new().flush(FlushTiming::Sync),
        );

        cell.set(1);
        cell.set(2);
        handle.stop();
        handle.stop();
        assert_eq!(
            *log.borrow(),
            vec!["run 1", "cleanup 1", "run 2", "cleanup 2"]
        );
        assert!(!handle.is_active());
    }

    #[test]
    fn test_pre_flush_is_synchronous_until_mounted() {
        let rt = Runtime::new();
        let owner = Owner::new();
        let cell = rt.ref_cell(0);
        let (calls, callback) = recorder();
        rt.watch(
            cell.clone(),
            callback,
            WatchOptions::new().flush(FlushTiming::Pre).owner(&owner),
        );

        cell.set(1);
        assert_eq!(calls.borrow().len(), 1);

        owner.mark_mounted();
        cell.set(2);
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(rt.stats().queued_pre, 1);
        rt.flush().unwrap();
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn test_stopped_watcher_ignores_changes() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(0);
        let (calls, callback) = recorder();
        let handle = rt.watch(cell.clone(), callback, WatchOptions::default());

        cell.set(1);
        handle.stop();
        rt.flush().unwrap();
        cell.set(2);
        rt.flush().unwrap();
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_callback_may_update_its_source() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(1);
        let calls = Rc::new(Cell::new(0));

        let calls_clone = calls.clone();
        let target = cell.clone();
        rt.watch(
            cell.clone(),
            move |_, new, _, _| {
                calls_clone.set(calls_clone.get() + 1);
                let n = new.as_number().unwrap_or(0.0);
                target.set((n + 1.0).min(3.0));
                Ok(())
            },
            WatchOptions::default(),
        );

        cell.set(2);
        rt.flush().unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(cell.get_untracked(), Value::from(3));
    }

    #[test]
    fn test_watch_effect_and_owner_unmount() {
        let rt = Runtime::new();
        let owner = Owner::new();
        let cell = rt.ref_cell(0);
        let runs = Rc::new(Cell::new(0));

        let reader = cell.clone();
        let runs_clone = runs.clone();
        rt.watch_effect(
            move |_, _| {
                reader.get();
                runs_clone.set(runs_clone.get() + 1);
                Ok(())
            },
            WatchOptions::new().owner(&owner),
        );
        assert_eq!(runs.get(), 1);
        assert_eq!(owner.watcher_count(), 1);

        cell.set(1);
        rt.flush().unwrap();
        assert_eq!(runs.get(), 2);

        owner.unmount(&rt);
        cell.set(2);
        rt.flush().unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(owner.watcher_count(), 0);
        assert_eq!(rt.stats().effect_count, 0);
    }

    #[test]
    fn test_stopped_watchers_are_released() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(0);
        let owner = Owner::new();
        let captured = Rc::new(());

        for _ in 0..100 {
            let held = captured.clone();
            let handle = rt.watch(
                cell.clone(),
                move |_, _, _, _| {
                    let _held = &held;
                    Ok(())
                },
                WatchOptions::default(),
            );
            cell.set(cell.get_untracked().as_number().unwrap_or(0.0) + 1.0);
            handle.stop();
        }
        for _ in 0..10 {
            let reader = cell.clone();
            rt.watch_effect(
                move |_, _| {
                    reader.get();
                    Ok(())
                },
                WatchOptions::new().owner(&owner),
            );
        }
        assert_eq!(rt.stats().effect_count, 10);

        owner.unmount(&rt);
        rt.flush().unwrap();
        let stats = rt.stats();
        assert_eq!(stats.effect_count, 0);
        assert_eq!(stats.dep_count, 0);
        assert_eq!(Rc::strong_count(&captured), 1);
    }

    #[test]
    fn test_getter_errors_are_routed() {
        let rt = Runtime::new();
        let contexts = Rc::new(RefCell::new(Vec::new()));
        let contexts_clone = contexts.clone();
        rt.set_error_handler(move |err| contexts_clone.borrow_mut().push(err.context()));

        let (calls, callback) = recorder();
        rt.watch(
            WatchSource::getter(|_| anyhow::bail!("no value")),
            callback,
            WatchOptions::new().immediate(),
        );

        assert_eq!(*contexts.borrow(), vec![Some(ErrorContext::WatchGetter)]);
        assert_eq!(*calls.borrow(), vec![(Value::Undefined, Value::Undefined)]);
    }

    #[test]
    fn test_invalid_source_reads_undefined() {
        let rt = Runtime::new();
        let (calls, callback) = recorder();
        rt.watch(Value::from(5), callback, WatchOptions::new().immediate());
        assert_eq!(*calls.borrow(), vec![(Value::Undefined, Value::Undefined)]);
    }

    #[test]
    fn test_traverse_handles_cycles() {
        let rt = Runtime::new();
        let target = Target::record::<&str, _>([]);
        target.with_mut(|container| {
            if let Container::Record(fields) = container {
                fields.insert("me".into(), Value::Target(target.clone()));
            }
        });
        let view = rt.reactive(target);
        assert_eq!(traverse(&view), view);
    }
}
