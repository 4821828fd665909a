//! Field-preserving merge
//!
//! Desired-state functions overwrite objects declaratively. Some fields are
//! written by other actors (an injected CA bundle, the server-assigned
//! resourceVersion) and must survive that overwrite once they hold a value.
//! Those fields are declared per resource as JSON pointers into the
//! serialized object.

use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::Result;

/// Set of JSON pointers preserved from the previously observed object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StickyFields(&'static [&'static str]);

impl StickyFields {
    pub const NONE: StickyFields = StickyFields(&[]);

    pub const fn new(paths: &'static [&'static str]) -> Self {
        Self(paths)
    }

    pub fn paths(&self) -> &'static [&'static str] {
        self.0
    }

    /// Run `overwrite` against `obj`, then restore every sticky field that
    /// was non-empty before the overwrite.
    pub fn apply<F>(&self, obj: &mut DynamicObject, overwrite: F) -> Result<()>
    where
        F: FnOnce(&mut DynamicObject) -> Result<()>,
    {
        if self.0.is_empty() {
            return overwrite(obj);
        }
        let previous = serde_json::to_value(&*obj)?;
        overwrite(obj)?;
        let merged = merge_preserving(self.0, &previous, serde_json::to_value(&*obj)?);
        *obj = serde_json::from_value(merged)?;
        Ok(())
    }
}

/// Return `desired` with every path in `sticky` taken from `previous` when
/// `previous` holds a non-empty value there.
pub fn merge_preserving(sticky: &[&str], previous: &Value, mut desired: Value) -> Value {
    for path in sticky {
        if let Some(kept) = previous.pointer(path).filter(|v| !is_empty(v)) {
            set_pointer(&mut desired, path, kept.clone());
        }
    }
    desired
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Write `value` at `pointer`, creating missing object members on the way.
/// Array elements are never invented; a pointer through a missing index is
/// left unapplied.
fn set_pointer(target: &mut Value, pointer: &str, value: Value) -> bool {
    let Some(rest) = pointer.strip_prefix('/') else {
        return false;
    };
    let tokens: Vec<String> = rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        return false;
    };

    let mut cursor = target;
    for token in parents {
        if cursor.is_null() {
            *cursor = Value::Object(Default::default());
        }
        cursor = match cursor {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => {
                match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(item) => item,
                    None => return false,
                }
            }
            _ => return false,
        };
    }

    if cursor.is_null() {
        *cursor = Value::Object(Default::default());
    }
    match cursor {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            true
        }
        Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// Replace the whole object with `desired`, keeping only its identity
pub fn replace_with(obj: &mut DynamicObject, desired: DynamicObject) {
    *obj = desired;
}

/// Overlay `desired` onto `obj`.
///
/// Fields `desired` carries win; fields it leaves out keep their observed
/// value, so apiserver defaults and server-populated metadata survive.
/// Labels and annotations are merged key by key.
pub fn overlay(obj: &mut DynamicObject, desired: DynamicObject) {
    if obj.data.is_null() {
        obj.data = Value::Object(Default::default());
    }
    merge_into(&mut obj.data, desired.data);
    if let Some(labels) = desired.metadata.labels {
        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
    }
    if let Some(annotations) = desired.metadata.annotations {
        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(annotations);
    }
}

/// Objects merge member by member and arrays of equal length element by
/// element. Anything else in `desired` replaces the observed value.
fn merge_into(current: &mut Value, desired: Value) {
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => {
            for (key, value) in desired {
                match current.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(current), Value::Array(desired)) if current.len() == desired.len() => {
            for (slot, value) in current.iter_mut().zip(desired) {
                merge_into(slot, value);
            }
        }
        (current, desired) => *current = desired,
    }
}
