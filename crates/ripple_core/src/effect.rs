//! Effect runner
//!
//! An effect wraps a computation. Running it records every tracked read as a
//! dependency; before each re-run the effect detaches from all of its previous
//! dependencies so stale branches stop notifying it.
//!
//! ```ignore
//! let rt = Runtime::new();
//! let state = rt.reactive_record([("count", 0.into())]);
//!
//! let s = state.clone();
//! let effect = rt.effect(move |_| {
//!     println!("count = {:?}", s.get("count"));
//!     Ok(())
//! }, EffectOptions::default());
//!
//! state.set("count", 1); // prints again
//! rt.stop_effect(effect);
//! state.set("count", 2); // silent
//! ```

use slotmap::new_key_type;
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;

use crate::dep::{DebuggerEvent, DepKey};
use crate::error::{ErrorContext, ReactiveError, Result};
use crate::runtime::{Runtime, RuntimeInner};
use crate::scheduler::{Job, RecursionPolicy};
use crate::target::TargetId;
use crate::value::Value;

new_key_type! {
    /// Unique identifier for an effect
    pub struct EffectId;
}

/// An effect handle (cheap to copy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Effect {
    id: EffectId,
    order: u64,
}

impl Effect {
    pub fn id(&self) -> EffectId {
        self.id
    }

    /// Creation order; effects created earlier run first
    pub fn order(&self) -> u64 {
        self.order
    }
}

/// A type-erased effect computation
pub type Computation = Box<dyn FnMut(&Runtime) -> anyhow::Result<Value>>;

/// Custom scheduler, invoked instead of running the effect when it is notified
pub type EffectScheduler = Rc<dyn Fn(&Runtime, Effect)>;

/// Callback invoked once when an effect is stopped
pub type StopHook = Box<dyn FnOnce(&Runtime) -> anyhow::Result<()>>;

/// Debugger hook receiving track or trigger events
pub type DebuggerHook = Rc<dyn Fn(&DebuggerEvent)>;

/// Options for [`Runtime::effect`]
#[derive(Default)]
pub struct EffectOptions {
    /// Do not run the computation on creation
    pub lazy: bool,
    pub scheduler: Option<EffectScheduler>,
    /// Lets the effect's scheduler job re-queue itself while it is running
    pub allow_recurse: bool,
    pub on_stop: Option<StopHook>,
    pub on_track: Option<DebuggerHook>,
    pub on_trigger: Option<DebuggerHook>,
}

impl EffectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn scheduler(mut self, scheduler: impl Fn(&Runtime, Effect) + 'static) -> Self {
        self.scheduler = Some(Rc::new(scheduler));
        self
    }

    /// Defer re-runs to the main phase of the next flush, ordered by creation
    pub fn queued(self) -> Self {
        self.scheduler(|rt, effect| {
            if let Some(job) = rt.effect_job(effect) {
                rt.enqueue_main(job);
            }
        })
    }

    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    pub fn on_stop(mut self, hook: impl FnOnce(&Runtime) -> anyhow::Result<()> + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn on_track(mut self, hook: impl Fn(&DebuggerEvent) + 'static) -> Self {
        self.on_track = Some(Rc::new(hook));
        self
    }

    pub fn on_trigger(mut self, hook: impl Fn(&DebuggerEvent) + 'static) -> Self {
        self.on_trigger = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for EffectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectOptions")
            .field("lazy", &self.lazy)
            .field("scheduler", &self.scheduler.is_some())
            .field("allow_recurse", &self.allow_recurse)
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

/// Internal effect node storage
pub(crate) struct EffectNode {
    order: u64,
    pub(crate) active: bool,
    /// Taken out while the computation runs
    computation: Option<Computation>,
    /// Every dependency set this effect belongs to
    pub(crate) deps: SmallVec<[(TargetId, DepKey); 4]>,
    /// Created with a custom scheduler; stays set after the scheduler is released
    scheduled: bool,
    pub(crate) scheduler: Option<EffectScheduler>,
    allow_recurse: bool,
    on_stop: Option<StopHook>,
    pub(crate) on_track: Option<DebuggerHook>,
    pub(crate) on_trigger: Option<DebuggerHook>,
    /// Scheduler job for this effect, created on first use
    job: Option<Job>,
}

/// Closures a stopped scheduled effect can never call again
type Released = (
    Option<Computation>,
    Option<EffectScheduler>,
    Option<DebuggerHook>,
    Option<DebuggerHook>,
    Option<Job>,
);

impl EffectNode {
    pub(crate) fn handle(&self, id: EffectId) -> Effect {
        Effect {
            id,
            order: self.order,
        }
    }

    fn release(&mut self) -> Released {
        (
            self.computation.take(),
            self.scheduler.take(),
            self.on_track.take(),
            self.on_trigger.take(),
            self.job.take(),
        )
    }
}

/// Restores the effect and tracking stacks when a run ends, also on unwind
struct RunGuard<'a> {
    inner: &'a RuntimeInner,
}

impl<'a> RunGuard<'a> {
    fn enter(inner: &'a RuntimeInner, id: EffectId) -> Self {
        inner.track_stack.borrow_mut().push(inner.should_track.get());
        inner.should_track.set(true);
        inner.effect_stack.borrow_mut().push(id);
        inner.active_effect.set(Some(id));
        Self { inner }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.inner.effect_stack.borrow_mut();
        stack.pop();
        self.inner.active_effect.set(stack.last().copied());
        drop(stack);
        reset_tracking(self.inner);
    }
}

fn reset_tracking(inner: &RuntimeInner) {
    let last = inner.track_stack.borrow_mut().pop();
    inner.should_track.set(last.unwrap_or(true));
}

/// Resets tracking when dropped
struct PauseGuard<'a> {
    inner: &'a RuntimeInner,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        reset_tracking(self.inner);
    }
}

impl Runtime {
    // =========================================================================
    // EFFECTS
    // =========================================================================

    /// Create an effect
    ///
    /// Unless `options.lazy` is set the computation runs immediately; an error
    /// from that first run is routed to the error handler.
    pub fn effect<F, R>(&self, mut computation: F, options: EffectOptions) -> Effect
    where
        F: FnMut(&Runtime) -> anyhow::Result<R> + 'static,
        R: Into<Value>,
    {
        let order = self.inner.next_effect_order.get();
        self.inner.next_effect_order.set(order + 1);

        let lazy = options.lazy;
        let computation: Computation = Box::new(move |rt: &Runtime| computation(rt).map(Into::into));
        let id = self.inner.effects.borrow_mut().insert(EffectNode {
            order,
            active: true,
            computation: Some(computation),
            deps: SmallVec::new(),
            scheduled: options.scheduler.is_some(),
            scheduler: options.scheduler,
            allow_recurse: options.allow_recurse,
            on_stop: options.on_stop,
            on_track: options.on_track,
            on_trigger: options.on_trigger,
            job: None,
        });
        let effect = Effect { id, order };
        tracing::trace!(order, lazy, "effect created");

        if !lazy {
            if let Err(err) = self.run_effect(effect) {
                self.handle_error(err);
            }
        }
        effect
    }

    /// Run an effect now
    ///
    /// Returns `Ok(None)` when nothing ran: the effect is stopped and has a
    /// custom scheduler, is already running further up the stack, or no longer
    /// exists. A stopped effect without a scheduler runs its computation
    /// untracked.
    pub fn run_effect(&self, effect: Effect) -> Result<Option<Value>> {
        let id = effect.id;
        let (active, has_scheduler) = match self.inner.effects.borrow().get(id) {
            Some(node) => (node.active, node.scheduled),
            None => return Ok(None),
        };

        if !active {
            return if has_scheduler {
                Ok(None)
            } else {
                self.call_computation(id)
            };
        }

        if self.inner.effect_stack.borrow().contains(&id) {
            tracing::trace!(order = effect.order, "skipping re-entrant effect run");
            return Ok(None);
        }

        self.cleanup_effect(id);
        let _guard = RunGuard::enter(&self.inner, id);
        self.call_computation(id)
    }

    fn call_computation(&self, id: EffectId) -> Result<Option<Value>> {
        let taken = self
            .inner
            .effects
            .borrow_mut()
            .get_mut(id)
            .and_then(|node| node.computation.take());
        let Some(mut computation) = taken else {
            return Ok(None);
        };

        let result = computation(self);

        // Stopped or disposed during the run: a scheduled effect never runs again
        let unused = match self.inner.effects.borrow_mut().get_mut(id) {
            Some(node) if node.active || !node.scheduled => {
                node.computation.get_or_insert(computation);
                None
            }
            _ => Some(computation),
        };
        drop(unused);
        result
            .map(Some)
            .map_err(|err| ReactiveError::computation(ErrorContext::EffectRun, err))
    }

    /// Detach an effect from every dependency set it joined
    fn cleanup_effect(&self, id: EffectId) {
        let deps = match self.inner.effects.borrow_mut().get_mut(id) {
            Some(node) => std::mem::take(&mut node.deps),
            None => return,
        };
        if deps.is_empty() {
            return;
        }
        let mut graph = self.inner.graph.borrow_mut();
        for (target, key) in &deps {
            graph.unsubscribe(*target, key, id);
        }
    }

    /// Stop an effect
    ///
    /// Idempotent. The effect detaches from all dependencies, its `on_stop`
    /// hook runs, and it never runs reactively again. Pending scheduler jobs
    /// of a stopped effect do nothing. An effect with a custom scheduler also
    /// drops its computation, scheduler and hooks.
    pub fn stop_effect(&self, effect: Effect) {
        let (hook, released) = {
            let mut effects = self.inner.effects.borrow_mut();
            let Some(node) = effects.get_mut(effect.id) else {
                return;
            };
            if !node.active {
                return;
            }
            node.active = false;
            let released = node.scheduled.then(|| node.release());
            (node.on_stop.take(), released)
        };
        drop(released);
        self.cleanup_effect(effect.id);
        tracing::debug!(order = effect.order, "effect stopped");

        if let Some(hook) = hook {
            if let Err(err) = hook(self) {
                self.handle_error(ReactiveError::computation(ErrorContext::StopHook, err));
            }
        }
    }

    /// Stop an effect and remove it from the runtime
    pub fn dispose_effect(&self, effect: Effect) {
        self.stop_effect(effect);
        let removed = self.inner.effects.borrow_mut().remove(effect.id);
        drop(removed);
    }

    /// Whether the effect exists and has not been stopped
    pub fn is_effect_active(&self, effect: Effect) -> bool {
        self.inner
            .effects
            .borrow()
            .get(effect.id)
            .is_some_and(|node| node.active)
    }

    /// Number of dependency sets the effect currently belongs to
    pub fn effect_dep_count(&self, effect: Effect) -> usize {
        self.inner
            .effects
            .borrow()
            .get(effect.id)
            .map_or(0, |node| node.deps.len())
    }

    /// The effect currently executing, if any
    pub fn active_effect(&self) -> Option<Effect> {
        let id = self.inner.active_effect.get()?;
        self.inner.effects.borrow().get(id).map(|node| node.handle(id))
    }

    /// Scheduler job that re-runs `effect`
    ///
    /// The job is created once per effect, ordered by the effect's creation
    /// order, and allowed to recurse when the effect was created with
    /// `allow_recurse`.
    pub fn effect_job(&self, effect: Effect) -> Option<Job> {
        let mut effects = self.inner.effects.borrow_mut();
        let node = effects.get_mut(effect.id).filter(|node| node.active)?;
        let policy = if node.allow_recurse {
            RecursionPolicy::AllowDeferred
        } else {
            RecursionPolicy::Deny
        };
        Some(
            node.job
                .get_or_insert_with(|| Job::for_effect(effect, policy))
                .clone(),
        )
    }

    // =========================================================================
    // TRACKING CONTROL
    // =========================================================================

    /// Suspend dependency tracking until the matching [`Runtime::reset_tracking`]
    pub fn pause_tracking(&self) {
        let inner = &self.inner;
        inner.track_stack.borrow_mut().push(inner.should_track.get());
        inner.should_track.set(false);
    }

    /// Force dependency tracking on until the matching [`Runtime::reset_tracking`]
    pub fn enable_tracking(&self) {
        let inner = &self.inner;
        inner.track_stack.borrow_mut().push(inner.should_track.get());
        inner.should_track.set(true);
    }

    /// Restore the tracking state saved by the last pause or enable
    pub fn reset_tracking(&self) {
        reset_tracking(&self.inner);
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.should_track.get() && self.inner.active_effect.get().is_some()
    }

    /// Run `f` without recording dependencies
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.pause_tracking();
        let _guard = PauseGuard { inner: &self.inner };
        f()
    }
}
