//! Record and sequence handlers

use std::rc::Rc;

use super::Observable;
use crate::dep::{DepKey, TrackOp, Trigger, TriggerOp};
use crate::target::{Container, ContainerKind, Target};
use crate::value::{has_changed, same_value_zero, Key, Value};

// ============================================================================
// Records
// ============================================================================

fn field_name(key: &Key) -> Option<Rc<str>> {
    match key {
        Key::Name(name) => Some(name.clone()),
        Key::Index(index) => Some(index.to_string().into()),
        Key::Value(Value::Str(name)) => Some(name.clone()),
        Key::Value(Value::Number(n)) => Some(n.to_string().into()),
        Key::Value(_) => None,
    }
}

fn field(target: &Target, name: &str) -> Option<Value> {
    target.with(|container| match container {
        Container::Record(fields) => fields.get(name).cloned(),
        _ => None,
    })
}

fn record_trigger(target: &Target, op: TriggerOp, name: Rc<str>) -> Trigger {
    Trigger::new(target.id(), Some(ContainerKind::Record), op).key(DepKey::Field(name))
}

pub(super) fn record_get(view: &Observable, target: &Target, key: &Key) -> Value {
    let Some(name) = field_name(key) else {
        tracing::warn!(?key, "unsupported record key");
        return Value::Undefined;
    };
    let value = field(target, &name).unwrap_or_default();
    view.track(TrackOp::Get, DepKey::Field(name));

    if view.is_shallow() {
        return value;
    }
    match value {
        Value::Ref(cell) if view.is_readonly() => view.wrap_nested(cell.get_untracked()),
        Value::Ref(cell) => view.wrap_nested(cell.get()),
        other => view.wrap_nested(other),
    }
}

pub(super) fn record_set(view: &Observable, target: &Target, key: &Key, value: Value) -> bool {
    let Some(name) = field_name(key) else {
        tracing::warn!(?key, "unsupported record key");
        return false;
    };
    let value = if view.is_shallow() { value } else { value.to_raw() };
    let old = field(target, &name);

    // A field holding a reference cell takes plain writes into the cell
    if !view.is_shallow() {
        if let (Some(Value::Ref(cell)), false) = (&old, matches!(value, Value::Ref(_))) {
            cell.set(value);
            return true;
        }
    }

    target.with_mut(|container| {
        if let Container::Record(fields) = container {
            fields.insert(name.clone(), value.clone());
        }
    });

    match old {
        None => view.trigger(record_trigger(target, TriggerOp::Add, name).new_value(value)),
        Some(old) if has_changed(&value, &old) => view.trigger(
            record_trigger(target, TriggerOp::Set, name)
                .new_value(value)
                .old_value(old),
        ),
        Some(_) => {}
    }
    true
}

pub(super) fn record_has(view: &Observable, target: &Target, key: &Key) -> bool {
    let Some(name) = field_name(key) else {
        return false;
    };
    let found = field(target, &name).is_some();
    view.track(TrackOp::Has, DepKey::Field(name));
    found
}

pub(super) fn record_delete(view: &Observable, target: &Target, key: &Key) -> bool {
    let Some(name) = field_name(key) else {
        return false;
    };
    let removed = target.with_mut(|container| match container {
        Container::Record(fields) => fields.shift_remove(&name),
        _ => None,
    });
    match removed {
        Some(old) => {
            view.trigger(record_trigger(target, TriggerOp::Delete, name).old_value(old));
            true
        }
        None => false,
    }
}

pub(super) fn record_keys(view: &Observable, target: &Target) -> Vec<Value> {
    view.track(TrackOp::Iterate, DepKey::Iterate);
    target.with(|container| match container {
        Container::Record(fields) => fields.keys().map(|name| Value::Str(name.clone())).collect(),
        _ => Vec::new(),
    })
}

// ============================================================================
// Sequences
// ============================================================================

/// Longest allowed sequence; valid indices lie below it
pub const MAX_SEQUENCE_LEN: usize = u32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Index(usize),
    Length,
}

fn parse_slot(text: &str) -> Option<Slot> {
    if text == "length" {
        Some(Slot::Length)
    } else {
        text.parse().ok().and_then(index_slot)
    }
}

fn index_slot(index: usize) -> Option<Slot> {
    (index < MAX_SEQUENCE_LEN).then_some(Slot::Index(index))
}

fn slot(key: &Key) -> Option<Slot> {
    match key {
        Key::Index(index) => index_slot(*index),
        Key::Name(name) => parse_slot(name),
        Key::Value(Value::Str(text)) => parse_slot(text),
        Key::Value(Value::Number(n))
            if *n >= 0.0 && n.fract() == 0.0 && *n < MAX_SEQUENCE_LEN as f64 =>
        {
            Some(Slot::Index(*n as usize))
        }
        Key::Value(_) => None,
    }
}

/// Resize to `len`, filling new slots with `Undefined`; false when the
/// storage cannot be reserved
fn resize(items: &mut Vec<Value>, len: usize) -> bool {
    if let Some(extra) = len.checked_sub(items.len()) {
        if items.try_reserve(extra).is_err() {
            return false;
        }
    }
    items.resize(len, Value::Undefined);
    true
}

fn item(target: &Target, index: usize) -> Option<Value> {
    target.with(|container| match container {
        Container::Sequence(items) => items.get(index).cloned(),
        _ => None,
    })
}

fn tail(target: &Target, from: usize) -> Vec<Value> {
    target.with(|container| match container {
        Container::Sequence(items) => items.get(from..).map(<[Value]>::to_vec).unwrap_or_default(),
        _ => Vec::new(),
    })
}

fn index_trigger(target: &Target, op: TriggerOp, index: usize) -> Trigger {
    Trigger::new(target.id(), Some(ContainerKind::Sequence), op).key(DepKey::Index(index))
}

fn length_trigger(target: &Target, new_len: usize, old_len: usize) -> Trigger {
    Trigger::new(target.id(), Some(ContainerKind::Sequence), TriggerOp::Set)
        .key(DepKey::Length)
        .new_value(Value::from(new_len))
        .old_value(Value::from(old_len))
}

/// Notify index writes between two snapshots of the same range
fn trigger_shifted(view: &Observable, target: &Target, from: usize, before: &[Value], after: &[Value]) {
    for (offset, (old, new)) in before.iter().zip(after).enumerate() {
        if has_changed(new, old) {
            view.trigger(
                index_trigger(target, TriggerOp::Set, from + offset)
                    .new_value(new.clone())
                    .old_value(old.clone()),
            );
        }
    }
}

pub(super) fn sequence_get(view: &Observable, target: &Target, key: &Key) -> Value {
    match slot(key) {
        Some(Slot::Length) => {
            let len = target.len();
            view.track(TrackOp::Get, DepKey::Length);
            Value::from(len)
        }
        Some(Slot::Index(index)) => {
            let value = item(target, index).unwrap_or_default();
            view.track(TrackOp::Get, DepKey::Index(index));
            // Index reads never unwrap reference cells
            view.wrap_nested(value)
        }
        None => {
            tracing::warn!(?key, "unsupported sequence key");
            Value::Undefined
        }
    }
}

pub(super) fn sequence_set(view: &Observable, target: &Target, key: &Key, value: Value) -> bool {
    match slot(key) {
        Some(Slot::Length) => match value.as_number() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= MAX_SEQUENCE_LEN as f64 => {
                set_len(view, target, n as usize)
            }
            _ => {
                tracing::warn!(value = ?value, "invalid sequence length");
                false
            }
        },
        Some(Slot::Index(index)) => set_index(view, target, index, value),
        None => {
            tracing::warn!(?key, "unsupported sequence key");
            false
        }
    }
}

enum IndexWrite {
    Replaced(Value),
    Added,
    Rejected,
}

/// Write one item, growing the sequence with holes; false when rejected
fn set_index(view: &Observable, target: &Target, index: usize, value: Value) -> bool {
    if index >= MAX_SEQUENCE_LEN {
        tracing::warn!(index, "sequence index out of range");
        return false;
    }
    let value = if view.is_shallow() { value } else { value.to_raw() };
    let write = target.with_mut(|container| {
        let Container::Sequence(items) = container else {
            return IndexWrite::Rejected;
        };
        if index < items.len() {
            IndexWrite::Replaced(std::mem::replace(&mut items[index], value.clone()))
        } else if resize(items, index) && items.try_reserve(1).is_ok() {
            items.push(value.clone());
            IndexWrite::Added
        } else {
            IndexWrite::Rejected
        }
    });

    match write {
        IndexWrite::Added => {
            view.trigger(index_trigger(target, TriggerOp::Add, index).new_value(value));
        }
        IndexWrite::Replaced(old) => {
            if has_changed(&value, &old) {
                view.trigger(
                    index_trigger(target, TriggerOp::Set, index)
                        .new_value(value)
                        .old_value(old),
                );
            }
        }
        IndexWrite::Rejected => {
            tracing::warn!(index, "could not grow sequence");
            return false;
        }
    }
    true
}

/// Grow (with holes) or shrink the sequence; false when rejected
pub(super) fn set_len(view: &Observable, target: &Target, len: usize) -> bool {
    if len > MAX_SEQUENCE_LEN {
        tracing::warn!(len, "sequence length out of range");
        return false;
    }
    let old_len = target.with_mut(|container| match container {
        Container::Sequence(items) => {
            let old_len = items.len();
            resize(items, len).then_some(old_len)
        }
        _ => None,
    });
    let Some(old_len) = old_len else {
        tracing::warn!(len, "could not resize sequence");
        return false;
    };
    if len != old_len {
        view.trigger(length_trigger(target, len, old_len));
    }
    true
}

pub(super) fn sequence_has(view: &Observable, target: &Target, key: &Key) -> bool {
    match slot(key) {
        Some(Slot::Length) => true,
        Some(Slot::Index(index)) => {
            let found = index < target.len();
            view.track(TrackOp::Has, DepKey::Index(index));
            found
        }
        None => false,
    }
}

pub(super) fn sequence_delete(view: &Observable, target: &Target, key: &Key) -> bool {
    let Some(Slot::Index(index)) = slot(key) else {
        return false;
    };
    let old = target.with_mut(|container| match container {
        Container::Sequence(items) if index < items.len() => {
            Some(std::mem::take(&mut items[index]))
        }
        _ => None,
    });
    match old {
        Some(old) => {
            view.trigger(index_trigger(target, TriggerOp::Delete, index).old_value(old));
            true
        }
        None => false,
    }
}

pub(super) fn sequence_keys(view: &Observable, target: &Target) -> Vec<Value> {
    view.track(TrackOp::Iterate, DepKey::Length);
    (0..target.len()).map(Value::from).collect()
}

pub(super) fn push(view: &Observable, target: &Target, value: Value) -> usize {
    view.untracked(|| {
        let index = target.len();
        if set_index(view, target, index, value) {
            index + 1
        } else {
            index
        }
    })
}

pub(super) fn pop(view: &Observable, target: &Target) -> Value {
    view.untracked(|| {
        let len = target.len();
        if len == 0 {
            return Value::Undefined;
        }
        let last = sequence_get(view, target, &Key::Index(len - 1));
        set_len(view, target, len - 1);
        last
    })
}

pub(super) fn insert(view: &Observable, target: &Target, index: usize, value: Value) {
    view.untracked(|| {
        let value = if view.is_shallow() { value } else { value.to_raw() };
        let index = index.min(target.len());
        let before = tail(target, index);
        target.with_mut(|container| {
            if let Container::Sequence(items) = container {
                items.insert(index, value);
            }
        });
        let after = tail(target, index);

        trigger_shifted(view, target, index, &before, &after);
        let added = index + before.len();
        view.trigger(
            index_trigger(target, TriggerOp::Add, added)
                .new_value(after.last().cloned().unwrap_or_default()),
        );
    });
}

pub(super) fn remove(view: &Observable, target: &Target, index: usize) -> Value {
    view.untracked(|| {
        let old_len = target.len();
        if index >= old_len {
            return Value::Undefined;
        }
        let before = tail(target, index);
        let removed = target.with_mut(|container| match container {
            Container::Sequence(items) => items.remove(index),
            _ => Value::Undefined,
        });
        let after = tail(target, index);

        trigger_shifted(view, target, index, &before, &after);
        view.trigger(length_trigger(target, old_len - 1, old_len));
        view.wrap_nested(removed)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SearchMode {
    /// Same-value-zero, so `NaN` is found
    Contains,
    /// Strict equality
    Position,
}

fn find(target: &Target, needle: &Value, mode: SearchMode) -> Option<usize> {
    target.with(|container| {
        let Container::Sequence(items) = container else {
            return None;
        };
        items.iter().position(|item| match mode {
            SearchMode::Contains => same_value_zero(item, needle),
            SearchMode::Position => item == needle && !matches!(needle, Value::Number(n) if n.is_nan()),
        })
    })
}

/// Identity-sensitive search that tracks every index
///
/// The needle is compared as given first, then as its raw target, so a
/// search with a wrapped member finds the raw member stored underneath.
pub(super) fn search(view: &Observable, needle: &Value, mode: SearchMode) -> Option<usize> {
    let target = view.target();
    if target.kind() != ContainerKind::Sequence {
        tracing::warn!(kind = ?target.kind(), "search requires a sequence");
        return None;
    }
    let len = target.len();
    view.track(TrackOp::Get, DepKey::Length);
    for index in 0..len {
        view.track(TrackOp::Get, DepKey::Index(index));
    }

    find(target, needle, mode).or_else(|| {
        let raw = needle.to_raw();
        if has_changed(&raw, needle) {
            find(target, &raw, mode)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::effect::EffectOptions;
    use crate::runtime::Runtime;
    use crate::target::Target;
    use crate::value::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn record_log(rt: &Runtime, read: impl Fn() -> Value + 'static) -> Rc<RefCell<Vec<Value>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        rt.effect(
            move |_| {
                log_clone.borrow_mut().push(read());
                Ok(())
            },
            EffectOptions::default(),
        );
        log
    }

    #[test]
    fn test_record_get_set() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("count", 0.into())]);
        let reader = state.clone();
        let log = record_log(&rt, move || reader.get("count"));

        state.set("count", 1);
        state.set("count", 1);
        state.set("count", 2);
        assert_eq!(*log.borrow(), vec![Value::from(0), Value::from(1), Value::from(2)]);
    }

    #[test]
    fn test_record_add_and_delete_notify_keys() {
        let rt = Runtime::new();
        let state = rt.reactive_record([("a", 1.into())]);
        let reader = state.clone();
        let log = record_log(&rt, move || Value::from(reader.keys().len()));

        state.set("b", 2);
        state.set("b", 3);
        assert!(state.delete("a"));
        assert!(!state.delete("missing"));
        assert_eq!(*log.borrow(), vec![Value::from(1), Value::from(2), Value::from(1)]);
    }

    #[test]
    fn test_record_has_tracks_field() {
        let rt = Runtime::new();
        let state = rt.reactive_record::<&str, _>([]);
        let reader = state.clone();
        let log = record_log(&rt, move || Value::from(reader.has("flag")));

        state.set("flag", true);
        state.set("flag", false);
        assert_eq!(
            *log.borrow(),
            vec![Value::from(false), Value::from(true), Value::from(true)]
        );
    }

    #[test]
    fn test_record_unwraps_reference_cells() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(1);
        let state = rt.reactive_record([("cell", cell.clone().into())]);

        assert_eq!(state.get("cell"), Value::from(1));
        state.set("cell", 5);
        assert_eq!(cell.get_untracked(), Value::from(5));

        let replacement = rt.ref_cell(9);
        state.set("cell", replacement.clone());
        assert_eq!(state.get("cell"), Value::from(9));
        assert_eq!(cell.get_untracked(), Value::from(5));
    }

    #[test]
    fn test_record_write_through_ref_notifies_readers() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(1);
        let state = rt.reactive_record([("cell", cell.clone().into())]);
        let reader = state.clone();
        let log = record_log(&rt, move || reader.get("cell"));

        cell.set(2);
        assert_eq!(*log.borrow(), vec![Value::from(1), Value::from(2)]);
    }

    #[test]
    fn test_record_stores_raw_values() {
        let rt = Runtime::new();
        let state = rt.reactive_record::<&str, _>([]);
        let child = rt.reactive_record([("x", 1.into())]);
        state.set("child", child.clone());

        let raw = state.raw_target();
        let stored = raw.with(|container| match container {
            crate::target::Container::Record(fields) => fields.get("child").cloned(),
            _ => None,
        });
        assert_eq!(stored, Some(Value::Target(child.raw_target())));
        assert_eq!(state.get("child"), Value::Observable(child));
    }

    #[test]
    fn test_sequence_index_reads_keep_reference_cells() {
        let rt = Runtime::new();
        let cell = rt.ref_cell(1);
        let list = rt.reactive_sequence([cell.clone().into()]);
        assert_eq!(list.get(0), Value::Ref(cell));
    }

    #[test]
    fn test_sequence_push_notifies_length_readers() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([]);
        let reader = list.clone();
        let log = record_log(&rt, move || Value::from(reader.len()));

        assert_eq!(list.push(1), 1);
        assert_eq!(list.push(2), 2);
        assert_eq!(*log.borrow(), vec![Value::from(0), Value::from(1), Value::from(2)]);
    }

    #[test]
    fn test_push_inside_effect_does_not_loop() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([]);
        let runs = Rc::new(RefCell::new(0));

        for _ in 0..2 {
            let list = list.clone();
            let runs = runs.clone();
            rt.effect(
                move |_| {
                    list.push(1);
                    *runs.borrow_mut() += 1;
                    Ok(())
                },
                EffectOptions::default(),
            );
        }
        assert_eq!(*runs.borrow(), 2);
        assert_eq!(list.raw_target().len(), 2);
    }

    #[test]
    fn test_sequence_set_beyond_length() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into()]);
        let reader = list.clone();
        let log = record_log(&rt, move || reader.get("length"));

        list.set(3, "x");
        assert_eq!(list.get(1), Value::Undefined);
        assert_eq!(list.get(3), Value::from("x"));
        assert_eq!(*log.borrow(), vec![Value::from(1), Value::from(4)]);
    }

    #[test]
    fn test_pop_and_remove() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into(), 2.into(), 3.into()]);
        let reader = list.clone();
        let log = record_log(&rt, move || reader.get(1));

        assert_eq!(list.remove(0), Value::from(1));
        assert_eq!(list.pop(), Value::from(3));
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop(), Value::from(2));
        assert_eq!(list.pop(), Value::Undefined);
        assert_eq!(
            *log.borrow(),
            vec![Value::from(2), Value::from(3), Value::Undefined, Value::Undefined]
        );
    }

    #[test]
    fn test_insert_shifts_items() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into(), 3.into()]);
        let reader = list.clone();
        let log = record_log(&rt, move || reader.get(1));

        list.insert(1, 2);
        assert_eq!(list.values(), vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(*log.borrow(), vec![Value::from(3), Value::from(2)]);
    }

    #[test]
    fn test_search_with_wrapped_needle() {
        let rt = Runtime::new();
        let member = Target::record([("id", Value::from(1))]);
        let list = rt.reactive_sequence([member.clone().into()]);

        let wrapped = list.get(0);
        assert!(rt.is_reactive(&wrapped));
        assert!(list.contains(&wrapped));
        assert_eq!(list.position(&wrapped), Some(0));
        assert_eq!(list.position(&Value::Target(member)), Some(0));
    }

    #[test]
    fn test_search_nan() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([f64::NAN.into()]);
        assert!(list.contains(&Value::from(f64::NAN)));
        assert_eq!(list.position(&Value::from(f64::NAN)), None);
    }

    #[test]
    fn test_search_tracks_mutation() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into()]);
        let reader = list.clone();
        let log = record_log(&rt, move || Value::from(reader.contains(&Value::from(2))));

        list.set(0, 2);
        assert_eq!(*log.borrow(), vec![Value::from(false), Value::from(true)]);
    }

    #[test]
    fn test_delete_leaves_hole() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into(), 2.into()]);
        assert!(list.delete(0));
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0), Value::Undefined);
    }
    #[test]
    fn test_out_of_range_writes_are_rejected() {
        let rt = Runtime::new();
        let list = rt.reactive_sequence([1.into()]);
        let reader = list.clone();
        let log = record_log(&rt, move || Value::from(reader.len()));

        assert!(!list.set(Value::from(1e20), 5));
        assert!(!list.set(super::MAX_SEQUENCE_LEN, 5));
        assert!(!list.set("length", 1e20));
        assert!(!list.set_len(usize::MAX));
        assert_eq!(list.get(Value::from(1e20)), Value::Undefined);
        assert!(!list.has(usize::MAX));

        assert_eq!(list.len(), 1);
        assert_eq!(*log.borrow(), vec![Value::from(1)]);

        assert!(list.set(Value::from(3), 4));
        assert_eq!(list.len(), 4);
    }
}
