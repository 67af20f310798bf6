// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

/// Error raised when [`deep_merge`] meets incompatible shapes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("type mismatch at {path}: cannot merge {left} into {right}")]
    TypeMismatch {
        path: String,
        left: &'static str,
        right: &'static str,
    },
}

/// Recursively merge `patch` into `base`.
///
/// Merge rules:
/// - object + object: merge key-by-key, recursing on shared keys
/// - array + array: concatenate (`base` first)
/// - scalar / null patch values replace the base value
/// - array vs object (either direction) is a type mismatch
pub fn deep_merge(base: &Value, patch: &Value) -> Result<Value, MergeError> {
    merge_at("$", base, patch)
}

fn merge_at(path: &str, base: &Value, patch: &Value) -> Result<Value, MergeError> {
    match (base, patch) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, patch_value) in b {
                let entry = match a.get(key) {
                    Some(base_value) => {
                        merge_at(&format!("{path}.{key}"), base_value, patch_value)?
                    }
                    None => patch_value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Ok(Value::Object(merged))
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.clone();
            merged.extend(b.iter().cloned());
            Ok(Value::Array(merged))
        }
        (Value::Array(_), Value::Object(_)) | (Value::Object(_), Value::Array(_)) => {
            Err(MergeError::TypeMismatch {
                path: path.to_string(),
                left: kind(patch),
                right: kind(base),
            })
        }
        // Scalars (and null) replace whatever was there.
        (_, replacement) => Ok(replacement.clone()),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn objects_merge_key_by_key() {
        let base = json!({"a": 1, "b": {"x": 1}});
        let patch = json!({"b": {"y": 2}, "c": 3});
        let merged = deep_merge(&base, &patch).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3}));
    }

    #[test]
    fn arrays_concatenate() {
        let merged = deep_merge(&json!([1, 2]), &json!([3])).unwrap();
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn scalars_replace() {
        assert_eq!(deep_merge(&json!(1), &json!(2)).unwrap(), json!(2));
        assert_eq!(deep_merge(&json!("a"), &json!(null)).unwrap(), json!(null));
        assert_eq!(deep_merge(&json!({"a": 1}), &json!("s")).unwrap(), json!("s"));
    }

    #[test]
    fn array_vs_object_is_a_type_mismatch() {
        let err = deep_merge(&json!({"a": [1]}), &json!({"a": {"b": 2}})).unwrap_err();
        match err {
            MergeError::TypeMismatch { path, .. } => assert_eq!(path, "$.a"),
        }
    }

    #[test]
    fn merge_preserves_shape_for_compatible_inputs() {
        let base = json!({"usage": {"input": 1}, "tags": ["a"]});
        let patch = json!({"usage": {"output": 2}, "tags": ["b"]});
        let merged = deep_merge(&base, &patch).unwrap();
        assert!(merged.is_object());
        assert_eq!(merged["tags"], json!(["a", "b"]));
        assert_eq!(merged["usage"], json!({"input": 1, "output": 2}));
    }
}
