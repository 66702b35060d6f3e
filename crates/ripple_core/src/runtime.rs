//! Runtime context
//!
//! Every registry the engine needs (dependency graph, effect arena, wrapper
//! caches, scheduler queues, tracking stacks) lives in a [`Runtime`]. The
//! handle is cheap to clone; observables and reference cells keep a
//! [`WeakRuntime`] so the data they wrap never keeps the runtime alive.

use slotmap::SlotMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::config::RuntimeConfig;
use crate::dep::DepGraph;
use crate::effect::{EffectId, EffectNode};
use crate::error::ReactiveError;
use crate::observable::ViewCache;
use crate::scheduler::{FlushRequest, SchedulerState};

/// Host callback asked to defer a flush
pub type FlushHook = Rc<dyn Fn(FlushRequest)>;

/// Receives every error routed through the runtime
pub type ErrorHandler = Rc<dyn Fn(&ReactiveError)>;

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) graph: RefCell<DepGraph>,
    pub(crate) effects: RefCell<SlotMap<EffectId, EffectNode>>,
    pub(crate) next_effect_order: Cell<u64>,
    /// Effects currently executing, innermost last
    pub(crate) effect_stack: RefCell<Vec<EffectId>>,
    pub(crate) active_effect: Cell<Option<EffectId>>,
    pub(crate) should_track: Cell<bool>,
    pub(crate) track_stack: RefCell<Vec<bool>>,
    pub(crate) views: RefCell<ViewCache>,
    pub(crate) scheduler: RefCell<SchedulerState>,
    pub(crate) flush_hook: RefCell<Option<FlushHook>>,
    pub(crate) error_handler: RefCell<Option<ErrorHandler>>,
}

/// The reactive runtime
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the standard configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        tracing::debug!(recursion_limit = config.recursion_limit, "creating reactive runtime");
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                graph: RefCell::new(DepGraph::default()),
                effects: RefCell::new(SlotMap::with_key()),
                next_effect_order: Cell::new(0),
                effect_stack: RefCell::new(Vec::new()),
                active_effect: Cell::new(None),
                should_track: Cell::new(true),
                track_stack: RefCell::new(Vec::new()),
                views: RefCell::new(ViewCache::default()),
                scheduler: RefCell::new(SchedulerState::default()),
                flush_hook: RefCell::new(None),
                error_handler: RefCell::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Replace the error handler
    ///
    /// The default handler logs with `tracing::error!`. Errors reach the
    /// handler from effects triggered outside a flush, scheduler jobs, watch
    /// getters, callbacks and cleanups, and hook-driven flushes that abort.
    pub fn set_error_handler(&self, handler: impl Fn(&ReactiveError) + 'static) {
        *self.inner.error_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Restore the default logging error handler
    pub fn clear_error_handler(&self) {
        self.inner.error_handler.borrow_mut().take();
    }

    pub(crate) fn handle_error(&self, error: ReactiveError) {
        let handler = self.inner.error_handler.borrow().clone();
        match handler {
            Some(handler) => handler(&error),
            None => match error.context() {
                Some(context) => tracing::error!(%context, "{error}"),
                None => tracing::error!("{error}"),
            },
        }
    }

    /// Snapshot of the runtime's bookkeeping
    pub fn stats(&self) -> ReactiveStats {
        let graph = self.inner.graph.borrow();
        let effects = self.inner.effects.borrow();
        let scheduler = self.inner.scheduler.borrow();
        ReactiveStats {
            target_count: graph.target_count(),
            dep_count: graph.dep_count(),
            effect_count: effects.len(),
            active_effects: effects.values().filter(|node| node.active).count(),
            queued_pre: scheduler.pending_pre_len(),
            queued_main: scheduler.queued_main_len(),
            queued_post: scheduler.pending_post_len(),
            flush_count: scheduler.flush_count(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Non-owning runtime handle
#[derive(Clone)]
pub struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for WeakRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakRuntime")
    }
}

/// Statistics about the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactiveStats {
    /// Dependency sources (targets and reference cells) with at least one entry
    pub target_count: usize,
    /// Non-empty dependency sets
    pub dep_count: usize,
    pub effect_count: usize,
    pub active_effects: usize,
    pub queued_pre: usize,
    pub queued_main: usize,
    pub queued_post: usize,
    /// Completed flush generations
    pub flush_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectOptions;
    use crate::error::ErrorContext;

    #[test]
    fn test_weak_runtime() {
        let rt = Runtime::new();
        let weak = rt.downgrade();
        assert!(weak.upgrade().is_some_and(|other| other.ptr_eq(&rt)));
        drop(rt);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_error_handler_receives_errors() {
        let rt = Runtime::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        rt.set_error_handler(move |err| seen_clone.borrow_mut().push(err.context()));

        rt.effect(|_| -> anyhow::Result<()> { anyhow::bail!("boom") }, EffectOptions::default());

        assert_eq!(*seen.borrow(), vec![Some(ErrorContext::EffectRun)]);
    }

    #[test]
    fn test_stats() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("count", 0.into())]);
        let _effect = rt.effect(
            move |_| {
                state.get("count");
                Ok(())
            },
            EffectOptions::default(),
        );

        let stats = rt.stats();
        assert_eq!(stats.effect_count, 1);
        assert_eq!(stats.active_effects, 1);
        assert_eq!(stats.target_count, 1);
        assert_eq!(stats.dep_count, 1);
        assert_eq!(stats.flush_count, 0);
    }
}
