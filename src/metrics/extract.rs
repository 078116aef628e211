// Value extractor
//
// Structural search over arbitrary JSON. The metrics API nests its data
// points at varying depths depending on the selector, so nothing here is
// schema-aware.

use serde_json::Value;

/// Collects every value stored under `key`, at any depth, in document order
///
/// Objects contribute the value of a matching key; every other object or
/// array value is searched recursively. A matched value is returned as-is
/// and not searched further. Scalars and inputs without the key yield an
/// empty vector.
pub fn extract_values<'a>(data: &'a Value, key: &str) -> Vec<&'a Value> {
    let mut found = Vec::new();
    walk(data, key, &mut found);
    found
}

/// Recursive step of `extract_values`, pushing matches onto `found`
fn walk<'a>(data: &'a Value, key: &str, found: &mut Vec<&'a Value>) {
    match data {
        Value::Object(map) => {
            // serde_json keeps insertion order, so matches follow the document
            for (k, v) in map {
                if k == key {
                    found.push(v);
                } else if v.is_object() || v.is_array() {
                    walk(v, key, found);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, key, found);
            }
        }
        _ => {}
    }
}
