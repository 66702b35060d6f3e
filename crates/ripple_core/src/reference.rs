//! Reference cells
//!
//! A [`Ref`] is a single observable slot. Reading it through [`Ref::get`]
//! records a dependency on the cell; writing a changed value notifies every
//! effect that read it. Container values written into a deep cell are stored
//! as tracked views, so members read through the cell are tracked too.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::dep::{DepKey, DepSource, TrackOp, Trigger, TriggerOp};
use crate::observable::WrapMode;
use crate::runtime::{Runtime, WeakRuntime};
use crate::target::TargetId;
use crate::value::{has_changed, Value};

struct RefInner {
    id: TargetId,
    /// Raw form of the current value, used for change detection
    raw: RefCell<Value>,
    value: RefCell<Value>,
    shallow: bool,
    runtime: WeakRuntime,
}

/// An observable single-value cell
#[derive(Clone)]
pub struct Ref(Rc<RefInner>);

impl Ref {
    fn new(rt: &Runtime, value: Value, shallow: bool) -> Self {
        let raw = value.to_raw();
        let value = convert(rt, value, shallow);
        Self(Rc::new(RefInner {
            id: TargetId::new(),
            raw: RefCell::new(raw),
            value: RefCell::new(value),
            shallow,
            runtime: rt.downgrade(),
        }))
    }

    pub fn id(&self) -> TargetId {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &Ref) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_shallow(&self) -> bool {
        self.0.shallow
    }

    /// Read the value, recording a dependency for the active effect
    pub fn get(&self) -> Value {
        if let Some(rt) = self.0.runtime.upgrade() {
            rt.track(self, TrackOp::Get, DepKey::RefValue);
        }
        self.get_untracked()
    }

    /// Read the value without recording a dependency
    pub fn get_untracked(&self) -> Value {
        self.0.value.borrow().clone()
    }

    /// Write a value; readers are notified only when the raw value changed
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        let raw = value.to_raw();
        if !has_changed(&raw, &self.0.raw.borrow()) {
            return;
        }

        let rt = self.0.runtime.upgrade();
        let stored = match &rt {
            Some(rt) => convert(rt, value, self.0.shallow),
            None => value,
        };
        *self.0.raw.borrow_mut() = raw;
        let old = self.0.value.replace(stored.clone());

        if let Some(rt) = rt {
            rt.trigger(
                Trigger::new(self.0.id, None, TriggerOp::Set)
                    .key(DepKey::RefValue)
                    .new_value(stored)
                    .old_value(old),
            );
        }
    }

    /// Replace the value with `f(current)`
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let next = f(&self.get_untracked());
        self.set(next);
    }
}

fn convert(rt: &Runtime, value: Value, shallow: bool) -> Value {
    if shallow {
        value
    } else {
        rt.wrap_quiet(value, WrapMode::TRACKED)
    }
}

impl DepSource for Ref {
    fn source_id(&self) -> TargetId {
        self.0.id
    }

    fn liveness(&self) -> Weak<dyn Any> {
        let weak: Weak<dyn Any> = Rc::downgrade(&self.0) as Weak<dyn Any>;
        weak
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Ref {}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.value.try_borrow() {
            Ok(value) => write!(f, "Ref#{}({:?})", self.0.id.to_raw(), *value),
            Err(_) => write!(f, "Ref#{}(<borrowed>)", self.0.id.to_raw()),
        }
    }
}

impl Runtime {
    /// Create a deep reference cell
    ///
    /// Passing an existing cell returns that cell.
    pub fn ref_cell(&self, value: impl Into<Value>) -> Ref {
        match value.into() {
            Value::Ref(cell) => cell,
            value => Ref::new(self, value, false),
        }
    }

    /// Create a cell that stores its value as given
    pub fn shallow_ref(&self, value: impl Into<Value>) -> Ref {
        match value.into() {
            Value::Ref(cell) => cell,
            value => Ref::new(self, value, true),
        }
    }

    /// Notify readers of `cell` without changing it
    ///
    /// Useful after mutating a container stored raw in a shallow cell.
    pub fn trigger_ref(&self, cell: &Ref) {
        let value = cell.get_untracked();
        self.trigger(
            Trigger::new(cell.id(), None, TriggerOp::Set)
                .key(DepKey::RefValue)
                .new_value(value),
        );
    }

    pub fn is_ref(&self, value: &Value) -> bool {
        matches!(value, Value::Ref(_))
    }

    /// The value of a cell, or the value itself
    pub fn unref(&self, value: &Value) -> Value {
        match value {
            Value::Ref(cell) => cell.get(),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectOptions;
    use crate::target::Target;

    fn watch_cell(rt: &Runtime, cell: &Ref) -> Rc<RefCell<Vec<Value>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let cell = cell.clone();
        rt.effect(
            move |_| {
                log_clone.borrow_mut().push(cell.get());
                Ok(())
            },
            EffectOptions::default(),
        );
        log
    }

    #[test]
    fn test_ref_notifies_on_change() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(1);
        let log = watch_cell(&rt, &cell);

        cell.set(2);
        cell.set(2);
        cell.set(f64::NAN);
        cell.set(f64::NAN);
        assert_eq!(log.borrow().len(), 3);
        assert_eq!(log.borrow()[1], Value::from(2));
    }

    #[test]
    fn test_ref_of_ref_is_same_cell() {
        let rt = Runtime::new();
        let cell = rt.ref_cell("a");
        let again = rt.ref_cell(cell.clone());
        assert!(again.ptr_eq(&cell));
    }

    #[test]
    fn test_deep_ref_wraps_containers() {
        let rt = Runtime::new();
        let target = Target::record([("n", Value::from(1))]);
        let cell = rt.ref_cell(target.clone());
        let value = cell.get_untracked();
        assert!(rt.is_reactive(&value));

        // Setting the raw form of the same container is not a change
        let log = watch_cell(&rt, &cell);
        cell.set(target);
        cell.set(value);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_shallow_ref_and_trigger_ref() {
        let rt = Runtime::new();
        let target = Target::sequence([]);
        let cell = rt.shallow_ref(target.clone());
        assert_eq!(cell.get_untracked(), Value::Target(target.clone()));

        let log = watch_cell(&rt, &cell);
        target.with_mut(|container| {
            if let crate::target::Container::Sequence(items) = container {
                items.push(Value::from(1));
            }
        });
        assert_eq!(log.borrow().len(), 1);
        rt.trigger_ref(&cell);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_unref_and_update() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(2);
        assert_eq!(rt.unref(&cell.clone().into()), Value::from(2));
        assert_eq!(rt.unref(&Value::from(3)), Value::from(3));
        assert!(rt.is_ref(&cell.clone().into()));

        cell.update(|value| Value::from(value.as_number().unwrap_or(0.0) * 10.0));
        assert_eq!(cell.get_untracked(), Value::from(20));
    }
}
