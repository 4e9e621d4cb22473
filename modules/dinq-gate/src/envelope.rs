//! The `{data, stream}` card output envelope and the operations that grow it.
//!
//! Everything here is pure: no I/O, no knowledge of Postgres or Redis. Every
//! function returns a brand-new `Value` rather than mutating in place — the
//! "JSON mutation trap" the source code guarded against (§9) means callers
//! must always write the returned value back wholesale.

use serde_json::{json, Map, Value};

fn coerce_object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Normalize arbitrary legacy/raw card output into the `{data, stream}` envelope.
///
/// - A value that already looks like an envelope (has `data` or `stream`) is
///   kept, with `stream` coerced to an object if it's missing or malformed.
/// - Anything else (a plain object, a string, `null`, ...) becomes `data`
///   with an empty `stream`.
///
/// Idempotent: `ensure_output_envelope(ensure_output_envelope(x)) == ensure_output_envelope(x)`.
pub fn ensure_output_envelope(value: &Value) -> Value {
    if let Value::Object(map) = value {
        if map.contains_key("data") || map.contains_key("stream") {
            let data = map.get("data").cloned().unwrap_or(Value::Null);
            let stream = coerce_object(map.get("stream"));
            return json!({"data": data, "stream": stream});
        }
    }
    json!({"data": value.clone(), "stream": {}})
}

/// Split a normalized envelope into its `(data, stream)` parts.
pub fn extract_output_parts(value: &Value) -> (Value, Map<String, Value>) {
    let env = ensure_output_envelope(value);
    let data = env.get("data").cloned().unwrap_or(Value::Null);
    let stream = coerce_object(env.get("stream"));
    (data, stream)
}

/// Apply a `card.delta` chunk: append `text_chunk` to `stream[field].sections[section]`.
///
/// Returns the full new envelope (value-replacement only — never mutate the
/// caller's `Value` through a reference held across an await point).
pub fn apply_delta(envelope: &Value, field: &str, section: &str, format: &str, text_chunk: &str) -> Value {
    let (data, mut stream) = extract_output_parts(envelope);

    let mut field_entry = match stream.get(field) {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };

    if !field_entry.contains_key("format") {
        field_entry.insert("format".to_string(), Value::String(format.to_string()));
    }

    let mut sections = match field_entry.get("sections") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };

    let existing = sections.get(section).and_then(Value::as_str).unwrap_or("");
    let mut combined = String::with_capacity(existing.len() + text_chunk.len());
    combined.push_str(existing);
    combined.push_str(text_chunk);
    sections.insert(section.to_string(), Value::String(combined));

    field_entry.insert("sections".to_string(), Value::Object(sections));
    stream.insert(field.to_string(), Value::Object(field_entry));

    json!({"data": data, "stream": stream})
}

/// Merge `items` into `data[field]`, deduping by `dedup_key` when present.
///
/// - If `data[field]` is absent or not a list, it is treated as empty and
///   **overwritten with a new list** built from `items` alone — documented
///   edge case (§9 open questions), matching the source's behavior.
/// - With `dedup_key`, the result is the unique-by-key union of prior items
///   then incoming items, in order: a later item with a key already seen is
///   dropped, not merged over the earlier one.
pub fn merge_append_field(data: &Value, field: &str, items: &[Value], dedup_key: Option<&str>) -> Value {
    let mut data = match data {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };

    let existing: Vec<Value> = match data.get(field) {
        Some(Value::Array(arr)) => arr.clone(),
        _ => Vec::new(),
    };

    let merged = match dedup_key {
        Some(key) => dedup_union(&existing, items, key),
        None => existing.into_iter().chain(items.iter().cloned()).collect(),
    };

    data.insert(field.to_string(), Value::Array(merged));
    Value::Object(data)
}

/// Full envelope variant of [`merge_append_field`]: reads/writes `data.{field}`
/// inside a `{data, stream}` envelope.
pub fn apply_append(envelope: &Value, field: &str, items: &[Value], dedup_key: Option<&str>) -> Value {
    let (data, stream) = extract_output_parts(envelope);
    let data = merge_append_field(&data, field, items, dedup_key);
    json!({"data": data, "stream": stream})
}

fn dedup_union(existing: &[Value], incoming: &[Value], dedup_key: &str) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(existing.len() + incoming.len());

    for item in existing.iter().chain(incoming.iter()) {
        let key = item.get(dedup_key).map(|v| v.to_string());
        match key {
            Some(k) => {
                if seen.insert(k) {
                    out.push(item.clone());
                }
            }
            None => out.push(item.clone()),
        }
    }
    out
}

/// For internal cards (`full_report`, `resource.*`) only: drop empty-valued
/// fields from a JSON object so internal snapshots don't bloat storage.
/// Business cards must never be pruned — callers enforce that by only
/// calling this for internal card types.
pub fn prune_empty_fields(data: &Value) -> Value {
    match data {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .iter()
                .filter(|(_, v)| !is_empty(v))
                .map(|(k, v)| (k.clone(), prune_empty_fields(v)))
                .collect();
            Value::Object(pruned)
        }
        other => other.clone(),
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_output_envelope_is_idempotent() {
        let raw = json!({"name": "ada"});
        let once = ensure_output_envelope(&raw);
        let twice = ensure_output_envelope(&once);
        assert_eq!(once, twice);
        assert_eq!(once, json!({"data": {"name": "ada"}, "stream": {}}));
    }

    #[test]
    fn ensure_output_envelope_keeps_existing_shape() {
        let env = json!({"data": {"a": 1}, "stream": {"about": {"format": "markdown", "sections": {"intro": "hi"}}}});
        assert_eq!(ensure_output_envelope(&env), env);
    }

    #[test]
    fn delta_concatenates_in_order() {
        let mut env = json!({"data": null, "stream": {}});
        for chunk in ["Hello", ", ", "world"] {
            env = apply_delta(&env, "about", "intro", "markdown", chunk);
        }
        assert_eq!(env["stream"]["about"]["sections"]["intro"], "Hello, world");
    }

    #[test]
    fn append_dedups_by_key_preserving_order() {
        let data = json!({"repos": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]});
        let incoming = vec![json!({"id": 2, "name": "b-updated"}), json!({"id": 3, "name": "c"})];
        let merged = merge_append_field(&data, "repos", &incoming, Some("id"));
        let ids: Vec<_> = merged["repos"].as_array().unwrap().iter().map(|v| v["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(merged["repos"][1]["name"], "b");
    }

    #[test]
    fn append_onto_non_list_field_overwrites() {
        let data = json!({"repos": "not-a-list"});
        let merged = merge_append_field(&data, "repos", &[json!({"id": 1})], Some("id"));
        assert_eq!(merged["repos"], json!([{"id": 1}]));
    }

    #[test]
    fn prune_drops_empty_business_fields() {
        let data = json!({"a": "", "b": "x", "c": [], "d": {"e": null}});
        let pruned = prune_empty_fields(&data);
        assert_eq!(pruned, json!({"b": "x", "d": {}}));
    }
}
