//! Map and set handlers
//!
//! Keys are compared by identity for containers, so a wrapped key and its
//! raw target are distinct keys. Lookups try the key as given first and then
//! its raw form; writes store raw keys.

use super::{entry_key, entry_value, Observable};
use crate::dep::{DepKey, TrackOp, Trigger, TriggerOp};
use crate::target::{Container, ContainerKind, Target};
use crate::value::{has_changed, Key, MapKey, Value};

fn trigger(target: &Target, op: TriggerOp) -> Trigger {
    Trigger::new(target.id(), Some(target.kind()), op)
}

/// Look up `key`, then its raw form; returns the stored key and value
fn lookup(target: &Target, key: &Value) -> Option<(Value, Value)> {
    let find = |needle: &MapKey| {
        target.with(|container| match container {
            Container::Map(entries) => entries
                .get_key_value(needle)
                .map(|(k, v)| (k.value().clone(), v.clone())),
            Container::Set(members) => members
                .get(needle)
                .map(|k| (k.value().clone(), k.value().clone())),
            _ => None,
        })
    };
    let raw = key.to_raw();
    find(&MapKey::new(key.clone())).or_else(|| {
        if has_changed(&raw, key) {
            find(&MapKey::new(raw))
        } else {
            None
        }
    })
}

fn track_key(view: &Observable, op: TrackOp, key: &Value) {
    let raw = key.to_raw();
    if has_changed(&raw, key) {
        view.track(op, entry_key(key));
    }
    view.track(op, entry_key(&raw));
}

/// Warn when both a wrapped key and its raw target are present
fn check_identity_keys(view: &Observable, target: &Target, key: &Value) {
    let raw = key.to_raw();
    if !has_changed(&raw, key) || !view.warn_identity_keys() {
        return;
    }
    let raw_present = target.with(|container| match container {
        Container::Map(entries) => entries.contains_key(&MapKey::new(raw.clone())),
        Container::Set(members) => members.contains(&MapKey::new(raw.clone())),
        _ => false,
    });
    if raw_present {
        tracing::warn!(
            key = ?key,
            "collection holds both the raw and the wrapped form of a key; \
             store raw keys only to avoid ambiguity"
        );
    }
}

pub(super) fn get(view: &Observable, target: &Target, key: Key) -> Value {
    let key = entry_value(key);
    track_key(view, TrackOp::Get, &key);
    match lookup(target, &key) {
        Some((_, value)) => view.wrap_nested(value),
        None => Value::Undefined,
    }
}

pub(super) fn has(view: &Observable, target: &Target, key: Key) -> bool {
    let key = entry_value(key);
    track_key(view, TrackOp::Has, &key);
    lookup(target, &key).is_some()
}

pub(super) fn set(view: &Observable, target: &Target, key: Key, value: Value) -> bool {
    let key = entry_value(key);
    let value = value.to_raw();

    let stored_key = match lookup(target, &key) {
        Some((stored, _)) => {
            if !has_changed(&stored, &key) {
                check_identity_keys(view, target, &key);
            }
            stored
        }
        None => key.to_raw(),
    };
    let old = target.with_mut(|container| match container {
        Container::Map(entries) => entries.insert(MapKey::new(stored_key.clone()), value.clone()),
        _ => None,
    });

    match old {
        None => view.trigger(
            trigger(target, TriggerOp::Add)
                .key(entry_key(&stored_key))
                .new_value(value),
        ),
        Some(old) if has_changed(&value, &old) => view.trigger(
            trigger(target, TriggerOp::Set)
                .key(entry_key(&stored_key))
                .new_value(value)
                .old_value(old),
        ),
        Some(_) => {}
    }
    true
}

pub(super) fn add(view: &Observable, target: &Target, value: Value) -> bool {
    let value = value.to_raw();
    let inserted = target.with_mut(|container| match container {
        Container::Set(members) => members.insert(MapKey::new(value.clone())),
        _ => false,
    });
    if inserted {
        view.trigger(
            trigger(target, TriggerOp::Add)
                .key(entry_key(&value))
                .new_value(value),
        );
    }
    inserted
}

pub(super) fn delete(view: &Observable, target: &Target, key: Key) -> bool {
    let key = entry_value(key);
    let Some((stored_key, _)) = lookup(target, &key) else {
        return false;
    };
    if !has_changed(&stored_key, &key) {
        check_identity_keys(view, target, &key);
    }

    let needle = MapKey::new(stored_key.clone());
    let old = target.with_mut(|container| match container {
        Container::Map(entries) => entries.shift_remove(&needle),
        Container::Set(members) => members.shift_remove(&needle).then_some(stored_key.clone()),
        _ => None,
    });
    match old {
        Some(old) => {
            view.trigger(
                trigger(target, TriggerOp::Delete)
                    .key(DepKey::Entry(needle))
                    .old_value(old),
            );
            true
        }
        None => false,
    }
}

pub(super) fn clear(view: &Observable, target: &Target) {
    let old = target.with_mut(|container| match container {
        Container::Map(entries) => {
            let old = std::mem::take(entries);
            (!old.is_empty()).then(|| Value::Target(Target::new(Container::Map(old))))
        }
        Container::Set(members) => {
            let old = std::mem::take(members);
            (!old.is_empty()).then(|| Value::Target(Target::new(Container::Set(old))))
        }
        _ => None,
    });
    if let Some(old) = old {
        view.trigger(trigger(target, TriggerOp::Clear).old_value(old));
    }
}

pub(super) fn keys(view: &Observable, target: &Target) -> Vec<Value> {
    let stored: Vec<Value> = target.with(|container| match container {
        Container::Map(entries) => entries.keys().map(|k| k.value().clone()).collect(),
        Container::Set(members) => members.iter().map(|k| k.value().clone()).collect(),
        _ => Vec::new(),
    });
    let dep = match target.kind() {
        ContainerKind::Map => DepKey::KeyIterate,
        _ => DepKey::Iterate,
    };
    view.track(TrackOp::Iterate, dep);
    stored.into_iter().map(|key| view.wrap_nested(key)).collect()
}

pub(super) fn entries(view: &Observable, target: &Target) -> Vec<(Value, Value)> {
    let stored: Vec<(Value, Value)> = target.with(|container| match container {
        Container::Map(entries) => entries
            .iter()
            .map(|(k, v)| (k.value().clone(), v.clone()))
            .collect(),
        Container::Set(members) => members
            .iter()
            .map(|k| (k.value().clone(), k.value().clone()))
            .collect(),
        _ => Vec::new(),
    });
    view.track(TrackOp::Iterate, DepKey::Iterate);
    stored
        .into_iter()
        .map(|(key, value)| (view.wrap_nested(key), view.wrap_nested(value)))
        .collect()
}
