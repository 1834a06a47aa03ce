//! Result filtering.
//!
//! Values set by executing code flow back to the LLM as feedback, so any
//! mapping key that names a registered environment variable has its value
//! replaced with a mask before serialization.  This keeps secrets handed to
//! the runtime (API keys, tokens) out of the model's context.

use std::collections::HashSet;

use serde_json::Value;

/// Replacement for values whose key matches a registered env-var name.
pub const MASKED: &str = "<masked>";

/// Produce a filtered copy of a result value.
///
/// At any depth, if an object key matches one of `env_names` the value is
/// replaced with [`MASKED`]; arrays and nested objects are walked
/// recursively.  Scalars pass through unchanged (non-serializable leaves are
/// already stringified by the interpreter harness).
pub fn filter_result(value: &Value, env_names: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => {
            let filtered = map
                .iter()
                .map(|(k, v)| {
                    if env_names.contains(k) {
                        (k.clone(), Value::String(MASKED.to_owned()))
                    } else {
                        (k.clone(), filter_result(v, env_names))
                    }
                })
                .collect();
            Value::Object(filtered)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| filter_result(v, env_names)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn masks_top_level_env_key() {
        let value = json!({"API_KEY": "sk-secret", "count": 3});
        let filtered = filter_result(&value, &names(&["API_KEY"]));
        assert_eq!(filtered["API_KEY"], MASKED);
        assert_eq!(filtered["count"], 3);
    }

    #[test]
    fn masks_nested_env_key() {
        let value = json!({
            "outer": {
                "API_KEY": "sk-secret",
                "inner": [{"TOKEN": "t0", "ok": true}]
            }
        });
        let filtered = filter_result(&value, &names(&["API_KEY", "TOKEN"]));
        assert_eq!(filtered["outer"]["API_KEY"], MASKED);
        assert_eq!(filtered["outer"]["inner"][0]["TOKEN"], MASKED);
        assert_eq!(filtered["outer"]["inner"][0]["ok"], true);
    }

    #[test]
    fn secret_value_never_survives_serialization() {
        let value = json!({"API_KEY": "sk-secret", "note": "plain"});
        let filtered = filter_result(&value, &names(&["API_KEY"]));
        let rendered = serde_json::to_string(&filtered).unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("plain"));
    }

    #[test]
    fn no_env_names_is_identity() {
        let value = json!({"a": [1, 2, {"b": null}]});
        assert_eq!(filter_result(&value, &HashSet::new()), value);
    }
}
