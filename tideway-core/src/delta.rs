//! JSON delta application for compressed revision bodies.
//!
//! The patch grammar matches the external diff producer: a nested object
//! patches the corresponding sub-object, an array encodes an edit
//! (`[]` delete, `[new]` insert/replace, `[old, new]` replace), and a bare
//! scalar replaces the value outright.

use std::fmt;

use serde_json::Value;

use crate::Body;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaApplyError;

impl fmt::Display for DeltaApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to apply JSON delta")
    }
}

impl std::error::Error for DeltaApplyError {}

/// Applies `patch` to `target` in place.
///
/// # Errors
///
/// Returns [`DeltaApplyError`] on an edit array of unsupported arity.
pub fn apply(target: &mut Body, patch: &Body) -> Result<(), DeltaApplyError> {
    for (key, op) in patch {
        match op {
            Value::Object(nested) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Body::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Body::new());
                }
                if let Value::Object(inner) = slot {
                    apply(inner, nested)?;
                }
            }
            Value::Array(edit) => match edit.as_slice() {
                [] => {
                    target.remove(key);
                }
                [new] => {
                    target.insert(key.clone(), new.clone());
                }
                [_, new] => {
                    target.insert(key.clone(), new.clone());
                }
                _ => return Err(DeltaApplyError),
            },
            scalar => {
                target.insert(key.clone(), scalar.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn body(value: serde_json::Value) -> Body {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn replaces_scalar_via_single_element_edit() {
        let mut target = body(json!({"x": 1}));
        apply(&mut target, &body(json!({"x": [2]}))).unwrap();
        assert_eq!(Value::Object(target), json!({"x": 2}));
    }

    #[test]
    fn replaces_via_old_new_pair() {
        let mut target = body(json!({"x": 1, "y": "keep"}));
        apply(&mut target, &body(json!({"x": [1, 3]}))).unwrap();
        assert_eq!(Value::Object(target), json!({"x": 3, "y": "keep"}));
    }

    #[test]
    fn empty_edit_deletes_key() {
        let mut target = body(json!({"x": 1, "y": 2}));
        apply(&mut target, &body(json!({"y": []}))).unwrap();
        assert_eq!(Value::Object(target), json!({"x": 1}));
    }

    #[test]
    fn nested_object_patches_recursively() {
        let mut target = body(json!({"a": {"b": 1, "c": 2}}));
        apply(&mut target, &body(json!({"a": {"b": [9]}}))).unwrap();
        assert_eq!(Value::Object(target), json!({"a": {"b": 9, "c": 2}}));
    }

    #[test]
    fn nested_patch_vivifies_missing_map() {
        let mut target = body(json!({}));
        apply(&mut target, &body(json!({"a": {"b": [1]}}))).unwrap();
        assert_eq!(Value::Object(target), json!({"a": {"b": 1}}));
    }

    #[test]
    fn scalar_in_patch_replaces_directly() {
        let mut target = body(json!({"x": {"deep": true}}));
        apply(&mut target, &body(json!({"x": "flat"}))).unwrap();
        assert_eq!(Value::Object(target), json!({"x": "flat"}));
    }

    #[test]
    fn oversized_edit_array_is_rejected() {
        let mut target = body(json!({"x": 1}));
        let err = apply(&mut target, &body(json!({"x": [1, 2, 3]}))).unwrap_err();
        assert_eq!(err, DeltaApplyError);
    }

    #[test]
    fn new_key_inserted() {
        let mut target = body(json!({"x": 1}));
        apply(&mut target, &body(json!({"y": ["hello"]}))).unwrap();
        assert_eq!(Value::Object(target), json!({"x": 1, "y": "hello"}));
    }
}
