//! Reconciliation of externally sourced state into the local document.
//!
//! Values merge shallowly (incoming field replaces the local one);
//! metadata merges deeply per field so a partial update keeps nested keys it
//! does not mention. Fields the caller reports as protected are left alone.

use serde_json::Value;

use crate::protocol::{FieldKind, FieldMap};

/// Fields to write into the document store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergePlan {
    pub values: FieldMap,
    pub meta: FieldMap,
    /// Fields that differed but were protected by a recent local edit.
    pub skipped: Vec<(FieldKind, String)>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.meta.is_empty()
    }
}

/// `existing ⊕ incoming`: objects merge key by key, anything else is a leaf
/// and the incoming side wins.
pub fn deep_merge(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                let next = match old.get(key) {
                    Some(current) => deep_merge(current, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

/// Work out which fields change when `incoming` is merged over the current
/// document. Unchanged fields are left out, so planning against the result
/// of a previous merge yields an empty plan.
pub fn plan_merge(
    current_values: &FieldMap,
    current_meta: &FieldMap,
    incoming_values: Option<&FieldMap>,
    incoming_meta: Option<&FieldMap>,
    is_protected: impl Fn(FieldKind, &str) -> bool,
) -> MergePlan {
    let mut plan = MergePlan::default();

    for (handle, value) in incoming_values.into_iter().flatten() {
        if current_values.get(handle) == Some(value) {
            continue;
        }
        if is_protected(FieldKind::Value, handle) {
            plan.skipped.push((FieldKind::Value, handle.clone()));
            continue;
        }
        plan.values.insert(handle.clone(), value.clone());
    }

    for (handle, value) in incoming_meta.into_iter().flatten() {
        let merged = match current_meta.get(handle) {
            Some(existing) => deep_merge(existing, value),
            None => value.clone(),
        };
        if current_meta.get(handle) == Some(&merged) {
            continue;
        }
        if is_protected(FieldKind::Meta, handle) {
            plan.skipped.push((FieldKind::Meta, handle.clone()));
            continue;
        }
        plan.meta.insert(handle.clone(), merged);
    }

    plan
}

/// Apply a plan to plain maps (what a store does with it).
pub fn apply_plan(values: &mut FieldMap, meta: &mut FieldMap, plan: &MergePlan) {
    for (handle, value) in &plan.values {
        values.insert(handle.clone(), value.clone());
    }
    for (handle, value) in &plan.meta {
        meta.insert(handle.clone(), value.clone());
    }
}

/// Metadata with the given keys removed, for snapshots sent to peers.
pub fn filter_meta(meta: &FieldMap, private_keys: &[String]) -> FieldMap {
    meta.iter()
        .filter(|(k, _)| !private_keys.iter().any(|p| p == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
