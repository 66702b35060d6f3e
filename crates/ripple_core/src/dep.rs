//! Dependency graph
//!
//! Maps `(source, member key)` to the set of effects that read it. Sources are
//! raw targets and reference cells. Entries are created lazily on the first
//! tracked read and removed when an effect detaches (before every re-run, on
//! stop) or when the source itself has been dropped.

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::rc::{Rc, Weak};

use crate::effect::{Effect, EffectId};
use crate::runtime::Runtime;
use crate::target::{ContainerKind, TargetId};
use crate::value::{MapKey, Value};

/// Member key of a dependency source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepKey {
    /// Named record member
    Field(Rc<str>),
    /// Sequence index
    Index(usize),
    /// Map entry or set member
    Entry(MapKey),
    /// Sequence length
    Length,
    /// Enumeration of a record, map or set
    Iterate,
    /// Enumeration of map keys only
    KeyIterate,
    /// The value of a reference cell
    RefValue,
}

/// Kind of read being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOp {
    Get,
    Has,
    Iterate,
}

/// Kind of mutation being triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Set,
    Add,
    Delete,
    Clear,
}

/// Operation reported to debugger hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugOp {
    Track(TrackOp),
    Trigger(TriggerOp),
}

/// Event passed to `on_track` / `on_trigger` hooks
#[derive(Debug, Clone)]
pub struct DebuggerEvent {
    pub effect: Effect,
    pub target: TargetId,
    pub op: DebugOp,
    pub key: Option<DepKey>,
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

/// Something effects can depend on
pub(crate) trait DepSource {
    fn source_id(&self) -> TargetId;

    /// Dead once the source has been dropped
    fn liveness(&self) -> Weak<dyn Any>;
}

/// A mutation to propagate
#[derive(Debug, Clone)]
pub(crate) struct Trigger {
    pub target: TargetId,
    /// `None` for reference cells
    pub kind: Option<ContainerKind>,
    pub op: TriggerOp,
    pub key: Option<DepKey>,
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
}

impl Trigger {
    pub fn new(target: TargetId, kind: Option<ContainerKind>, op: TriggerOp) -> Self {
        Self {
            target,
            kind,
            op,
            key: None,
            new_value: None,
            old_value: None,
        }
    }

    pub fn key(mut self, key: DepKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn new_value(mut self, value: Value) -> Self {
        self.new_value = Some(value);
        self
    }

    pub fn old_value(mut self, value: Value) -> Self {
        self.old_value = Some(value);
        self
    }
}

struct SourceDeps {
    liveness: Weak<dyn Any>,
    keys: FxHashMap<DepKey, IndexSet<EffectId>>,
}

/// Smallest source count that triggers a prune on growth
const PRUNE_THRESHOLD: usize = 64;

#[derive(Default)]
pub(crate) struct DepGraph {
    sources: FxHashMap<TargetId, SourceDeps>,
    /// Source count at which tracking prunes dropped sources
    prune_at: usize,
}

impl DepGraph {
    /// Add `effect` to the set for `(source, key)`; false if already present
    fn subscribe(&mut self, source: &dyn DepSource, key: DepKey, effect: EffectId) -> bool {
        self.sources
            .entry(source.source_id())
            .or_insert_with(|| SourceDeps {
                liveness: source.liveness(),
                keys: FxHashMap::default(),
            })
            .keys
            .entry(key)
            .or_default()
            .insert(effect)
    }

    pub(crate) fn unsubscribe(&mut self, target: TargetId, key: &DepKey, effect: EffectId) {
        if let Some(deps) = self.sources.get_mut(&target) {
            if let Some(set) = deps.keys.get_mut(key) {
                set.shift_remove(&effect);
                if set.is_empty() {
                    deps.keys.remove(key);
                }
            }
            if deps.keys.is_empty() {
                self.sources.remove(&target);
            }
        }
    }

    /// Resolve the effects a mutation notifies
    fn collect(&self, trigger: &Trigger) -> IndexSet<EffectId> {
        let mut effects = IndexSet::new();
        let Some(deps) = self.sources.get(&trigger.target) else {
            return effects;
        };
        let mut add = |key: &DepKey| {
            if let Some(set) = deps.keys.get(key) {
                effects.extend(set.iter().copied());
            }
        };

        let is_sequence = trigger.kind == Some(ContainerKind::Sequence);
        let is_collection = trigger.kind.is_some_and(ContainerKind::is_collection);

        if trigger.op == TriggerOp::Clear {
            for key in deps.keys.keys() {
                add(key);
            }
        } else if is_sequence && trigger.key == Some(DepKey::Length) {
            let new_len = trigger
                .new_value
                .as_ref()
                .and_then(Value::as_number)
                .unwrap_or(0.0);
            for key in deps.keys.keys() {
                match key {
                    DepKey::Length => add(key),
                    DepKey::Index(index) if *index as f64 >= new_len => add(key),
                    _ => {}
                }
            }
        } else {
            if let Some(key) = &trigger.key {
                add(key);
            }

            let iteration = match trigger.op {
                TriggerOp::Add => !is_sequence || matches!(trigger.key, Some(DepKey::Index(_))),
                TriggerOp::Delete => !is_sequence,
                _ => false,
            };
            if iteration || (trigger.op == TriggerOp::Set && trigger.kind == Some(ContainerKind::Map)) {
                add(if is_sequence {
                    &DepKey::Length
                } else {
                    &DepKey::Iterate
                });
            }
            if iteration && is_collection {
                add(&DepKey::KeyIterate);
            }
        }

        effects
    }

    /// Drop entries whose source no longer exists
    ///
    /// Returns each dropped source with the effects that were subscribed to
    /// it, so their back-references can be removed too.
    pub(crate) fn prune(&mut self) -> Vec<(TargetId, Vec<EffectId>)> {
        let mut pruned = Vec::new();
        self.sources.retain(|target, deps| {
            if deps.liveness.strong_count() > 0 {
                return true;
            }
            let subscribers = deps.keys.values().flatten().copied().collect();
            pruned.push((*target, subscribers));
            false
        });
        self.prune_at = (self.sources.len() * 2).max(PRUNE_THRESHOLD);
        pruned
    }

    fn needs_prune(&self) -> bool {
        self.sources.len() >= self.prune_at
    }

    pub(crate) fn target_count(&self) -> usize {
        self.sources.len()
    }

    pub(crate) fn dep_count(&self) -> usize {
        self.sources.values().map(|deps| deps.keys.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn subscribers(&self, target: TargetId, key: &DepKey) -> Vec<EffectId> {
        self.sources
            .get(&target)
            .and_then(|deps| deps.keys.get(key))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Runtime {
    /// Record that the active effect read `key` of `source`
    pub(crate) fn track(&self, source: &dyn DepSource, op: TrackOp, key: DepKey) {
        let inner = &self.inner;
        if !inner.should_track.get() {
            return;
        }
        let Some(effect_id) = inner.active_effect.get() else {
            return;
        };

        let added = inner
            .graph
            .borrow_mut()
            .subscribe(source, key.clone(), effect_id);
        if !added {
            return;
        }
        if inner.graph.borrow().needs_prune() {
            self.prune_graph();
        }

        let hook = {
            let mut effects = inner.effects.borrow_mut();
            let Some(node) = effects.get_mut(effect_id) else {
                return;
            };
            node.deps.push((source.source_id(), key.clone()));
            if inner.config.debugger_hooks {
                node.on_track.clone().map(|hook| (hook, node.handle(effect_id)))
            } else {
                None
            }
        };

        tracing::trace!(target_id = source.source_id().to_raw(), ?op, ?key, "track");

        if let Some((hook, effect)) = hook {
            hook(&DebuggerEvent {
                effect,
                target: source.source_id(),
                op: DebugOp::Track(op),
                key: Some(key),
                new_value: None,
                old_value: None,
            });
        }
    }

    /// Notify every effect affected by a mutation
    ///
    /// The effect currently running is never notified of its own writes.
    /// Affected effects are resolved up front, then each runs its scheduler
    /// (or runs directly) in creation order.
    pub(crate) fn trigger(&self, trigger: Trigger) {
        let inner = &self.inner;
        let resolved = inner.graph.borrow().collect(&trigger);
        if resolved.is_empty() {
            return;
        }

        let active = inner.active_effect.get();
        let mut targets: Vec<_> = {
            let effects = inner.effects.borrow();
            resolved
                .into_iter()
                .filter(|id| Some(*id) != active)
                .filter_map(|id| {
                    effects.get(id).map(|node| {
                        let on_trigger = if inner.config.debugger_hooks {
                            node.on_trigger.clone()
                        } else {
                            None
                        };
                        (node.handle(id), node.scheduler.clone(), on_trigger)
                    })
                })
                .collect()
        };
        targets.sort_by_key(|(effect, _, _)| effect.order());

        tracing::trace!(
            target_id = trigger.target.to_raw(),
            op = ?trigger.op,
            key = ?trigger.key,
            effects = targets.len(),
            "trigger"
        );

        for (effect, scheduler, on_trigger) in targets {
            if let Some(hook) = on_trigger {
                hook(&DebuggerEvent {
                    effect,
                    target: trigger.target,
                    op: DebugOp::Trigger(trigger.op),
                    key: trigger.key.clone(),
                    new_value: trigger.new_value.clone(),
                    old_value: trigger.old_value.clone(),
                });
            }
            match scheduler {
                Some(scheduler) => scheduler(self, effect),
                None => {
                    if let Err(err) = self.run_effect(effect) {
                        self.handle_error(err);
                    }
                }
            }
        }
    }

    /// Forget graph entries of dropped sources, on both sides of the graph
    pub(crate) fn prune_graph(&self) {
        let pruned = self.inner.graph.borrow_mut().prune();
        if pruned.is_empty() {
            return;
        }
        let mut effects = self.inner.effects.borrow_mut();
        for (target, subscribers) in &pruned {
            for id in subscribers {
                if let Some(node) = effects.get_mut(*id) {
                    node.deps.retain(|(source, _)| source != target);
                }
            }
        }
        tracing::debug!(pruned = pruned.len(), "pruned dependency entries of dropped sources");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectOptions;
    use crate::target::Target;
    use std::cell::RefCell;

    fn counting_effect(rt: &Runtime, read: impl Fn() + 'static) -> (Effect, Rc<RefCell<u32>>) {
        let runs = Rc::new(RefCell::new(0));
        let runs_clone = runs.clone();
        let effect = rt.effect(
            move |_| {
                read();
                *runs_clone.borrow_mut() += 1;
                Ok(())
            },
            EffectOptions::default(),
        );
        (effect, runs)
    }

    #[test]
    fn test_track_records_back_reference() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("a", 1.into()), ("b", 2.into())]);
        let target = state.raw_target();
        let state_clone = state.clone();
        let (effect, _) = counting_effect(&rt, move || {
            state_clone.get("a");
        });

        let graph = rt.inner.graph.borrow();
        assert_eq!(
            graph.subscribers(target.id(), &DepKey::Field("a".into())),
            vec![effect.id()]
        );
        assert!(graph
            .subscribers(target.id(), &DepKey::Field("b".into()))
            .is_empty());
        drop(graph);
        assert_eq!(rt.effect_dep_count(effect), 1);
    }

    #[test]
    fn test_no_tracking_without_active_effect() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("a", 1.into())]);
        state.get("a");
        assert_eq!(rt.stats().target_count, 0);
    }

    #[test]
    fn test_sequence_length_trigger_reaches_truncated_indices() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into(), 2.into(), 3.into()]);

        let list_a = list.clone();
        let (_, low) = counting_effect(&rt, move || {
            list_a.get(0);
        });
        let list_b = list.clone();
        let (_, high) = counting_effect(&rt, move || {
            list_b.get(2);
        });

        list.set_len(1);
        assert_eq!(*low.borrow(), 1);
        assert_eq!(*high.borrow(), 2);
    }

    #[test]
    fn test_map_set_notifies_iteration() {
        let rt = Runtime::new();
        let map = rt.reactive_map([("k".into(), 1.into())]);
        let map_clone = map.clone();
        let (_, runs) = counting_effect(&rt, move || {
            map_clone.values();
        });

        map.set("k", 2);
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    fn test_map_value_update_skips_key_iteration() {
        let rt = Runtime::new();
        let map = rt.reactive_map([("k".into(), 1.into())]);
        let map_clone = map.clone();
        let (_, runs) = counting_effect(&rt, move || {
            map_clone.keys();
        });

        map.set("k", 2);
        assert_eq!(*runs.borrow(), 1);
        map.set("j", 3);
        assert_eq!(*runs.borrow(), 2);
        map.delete("j");
        assert_eq!(*runs.borrow(), 3);
    }

    #[test]
    fn test_debugger_hooks() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("a", 1.into())]);
        let events = Rc::new(RefCell::new(Vec::new()));

        let track_events = events.clone();
        let trigger_events = events.clone();
        let state_clone = state.clone();
        rt.effect(
            move |_| {
                state_clone.get("a");
                Ok(())
            },
            EffectOptions::default()
                .on_track(move |event| track_events.borrow_mut().push(event.op))
                .on_trigger(move |event| trigger_events.borrow_mut().push(event.op)),
        );
        state.set("a", 2);

        assert_eq!(
            *events.borrow(),
            vec![
                DebugOp::Track(TrackOp::Get),
                DebugOp::Trigger(TriggerOp::Set),
                DebugOp::Track(TrackOp::Get),
            ]
        );
    }

    #[test]
    fn test_prune_dropped_sources() {
        let rt = Runtime::new();
        let holder = Rc::new(RefCell::new(Some(rt.reactive_record([("a", 1.into())]))));
        let holder_clone = holder.clone();
        let effect = rt.effect(
            move |_| {
                if let Some(state) = holder_clone.borrow().as_ref() {
                    state.get("a");
                }
                Ok(())
            },
            EffectOptions::default(),
        );
        assert_eq!(rt.stats().target_count, 1);
        assert_eq!(rt.effect_dep_count(effect), 1);

        holder.borrow_mut().take();
        rt.prune_graph();
        assert_eq!(rt.stats().target_count, 0);
        assert_eq!(rt.effect_dep_count(effect), 0);
    }

    #[test]
    fn test_dropped_sources_are_pruned_without_flush() {
        let rt = Runtime::new();
        let mut effects = Vec::new();
        for n in 0..200 {
            effects.push(rt.effect(
                move |rt| {
                    let scratch = rt.reactive_record([("n", Value::from(n))]);
                    Ok(scratch.get("n"))
                },
                EffectOptions::default(),
            ));
        }

        let stats = rt.stats();
        assert!(stats.target_count <= PRUNE_THRESHOLD);
        assert_eq!(stats.flush_count, 0);
        let stale: usize = effects.iter().map(|e| rt.effect_dep_count(*e)).sum();
        assert_eq!(stale, stats.dep_count);
    }

    #[test]
    fn test_trigger_on_untracked_target_is_noop() {
        let rt = Runtime::new();
        let target = Target::record::<&str, _>([]);
        rt.trigger(Trigger::new(target.id(), Some(ContainerKind::Record), TriggerOp::Clear));
        assert_eq!(rt.stats().target_count, 0);
    }
}
