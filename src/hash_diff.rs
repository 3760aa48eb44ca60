//! Order-insensitive record fingerprints.
//!
//! Two JSON payloads describing the same record may list their keys in a different order, which makes naive
//! serialized comparison report changes that never happened. [`structural_hash`] flattens a record into dotted paths,
//! sorts them and folds the values into a 32-bit fingerprint. The fingerprint is lossy; it is only meant to tell
//! "probably the same" from "certainly different" for datasets of a few thousand records.
//!
//! [`DatasetComparator`] indexes a previous dataset by key and classifies candidates from a new one.

use crate::table::KeyField;
use serde_json::Value;
use std::collections::HashMap;

/// Number of unequal records a [`DatasetComparator`] tolerates before giving up on per-record diffing.
pub const DEFAULT_UNEQUAL_THRESHOLD: usize = 3;

/// Flatten nested objects into a single level map with dotted keys. Arrays and scalars are leaves.
pub fn flatten(record: &Value) -> Vec<(String, &Value)> {
    let mut flat = Vec::new();
    if let Value::Object(map) = record {
        flatten_into(&mut flat, None, map);
    }
    flat
}

fn flatten_into<'a>(
    flat: &mut Vec<(String, &'a Value)>,
    prefix: Option<&str>,
    map: &'a serde_json::Map<String, Value>,
) {
    for (key, value) in map {
        let path = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(flat, Some(&path), inner),
            _ => flat.push((path, value)),
        }
    }
}

// String form of a leaf value. Arrays are joined with commas; objects found inside arrays are written as their
// sorted `path:value` pairs so that key order does not matter at any depth.
fn leaf_string(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // `1.0` and `1` describe the same value.
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => out.push_str(&(f as i64).to_string()),
            _ => out.push_str(&n.to_string()),
        },
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                if !item.is_null() {
                    leaf_string(item, out);
                }
            }
        }
        Value::Object(_) => object_string(value, out),
    }
}

fn object_string(value: &Value, out: &mut String) {
    let mut flat = flatten(value);
    flat.sort_by(|a, b| a.0.cmp(&b.0));
    out.push('{');
    for (idx, (path, leaf)) in flat.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&path);
        out.push(':');
        leaf_string(leaf, out);
    }
    out.push('}');
}

/// Fold a string into a 32-bit signed integer with `hash * 31 + code_unit`, wrapping at every step.
pub fn fold_str(s: &str) -> i32 {
    s.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(unit as i32)
    })
}

/// Order-insensitive fingerprint of a record.
///
/// Non-object values are fingerprinted by their string form.
pub fn structural_hash(record: &Value) -> i32 {
    let mut concatenated = String::new();
    if record.is_object() {
        let mut flat = flatten(record);
        flat.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, value) in flat {
            leaf_string(value, &mut concatenated);
        }
    }
    else {
        leaf_string(record, &mut concatenated);
    }
    fold_str(&concatenated)
}

/// Compares candidate records against an indexed previous dataset.
///
/// Once more than `threshold` unequal candidates have been seen the comparator trips: [`ok()`](Self::ok) turns
/// `false` and every further [`compare()`](Self::compare) reports inequality without looking at the record. Callers
/// are expected to fall back to treating the whole dataset as changed.
#[derive(Debug)]
pub struct DatasetComparator<'k> {
    key_field: &'k KeyField,
    index:     HashMap<String, i32>,
    unequal:   Vec<Value>,
    threshold: usize,
    ok:        bool,
}

impl<'k> DatasetComparator<'k> {
    pub fn new<'a, I>(key_field: &'k KeyField, previous: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let index = previous
            .into_iter()
            .filter_map(|record| key_field.key_of(record).map(|key| (key, structural_hash(record))))
            .collect();

        Self {
            key_field,
            index,
            unequal: Vec::new(),
            threshold: DEFAULT_UNEQUAL_THRESHOLD,
            ok: true,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Returns `true` if the candidate is structurally equal to the previous record with the same key.
    pub fn compare(&mut self, candidate: &Value) -> bool {
        if !self.ok {
            return false;
        }

        let previous = self
            .key_field
            .key_of(candidate)
            .and_then(|key| self.index.get(&key).copied());

        if previous == Some(structural_hash(candidate)) {
            return true;
        }

        self.unequal.push(candidate.clone());
        if self.unequal.len() > self.threshold {
            self.ok = false;
        }
        false
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Whether the previous dataset had a record with the same key as `record`.
    pub fn knows(&self, record: &Value) -> bool {
        self.key_field
            .key_of(record)
            .is_some_and(|key| self.index.contains_key(&key))
    }

    pub fn unequal(&self) -> &[Value] {
        &self.unequal
    }

    pub fn into_unequal(self) -> Vec<Value> {
        self.unequal
    }
}
