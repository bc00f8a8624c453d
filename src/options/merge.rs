//! Recursive dict-merge for JSON config values (spec §4.6).
//!
//! Mirrors `original_source/launcher/options.py`'s `merge(a, b, path=[])`:
//! object-valued keys recurse, anything else is overwritten by `b`.

use serde_json::Value;

/// Merges `incoming` into `base` in place. `incoming` wins on any leaf
/// conflict; object-valued keys merge recursively rather than overwrite.
pub fn merge_json(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, incoming_value) => {
            *base_slot = incoming_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_overwrite() {
        let mut base = json!({"a": 1, "b": 2});
        merge_json(&mut base, json!({"b": 3}));
        assert_eq!(base, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn nested_objects_deep_merge() {
        let mut base = json!({"backend_options": {"local": {"run": "$CMD $ARGS"}}});
        merge_json(
            &mut base,
            json!({"backend_options": {"mpi": {"run": "mpirun $CMD"}}}),
        );
        assert_eq!(
            base,
            json!({
                "backend_options": {
                    "local": {"run": "$CMD $ARGS"},
                    "mpi": {"run": "mpirun $CMD"},
                }
            })
        );
    }

    #[test]
    fn arrays_are_replaced_not_merged() {
        let mut base = json!({"backends": ["local"]});
        merge_json(&mut base, json!({"backends": ["local", "mpi"]}));
        assert_eq!(base, json!({"backends": ["local", "mpi"]}));
    }
}
