//! Submission payload assembly.
//!
//! The remote platform expects nested JSON mirroring the survey's group
//! structure. Accepted rows carry a flat `path → value` list; this module
//! turns it into the tree.

use serde_json::{Map, Value};

/// Sets `value` at a slash-delimited `path`, creating intermediate objects
/// for absent segments. Setting the same path twice overwrites the leaf; a
/// non-object intermediate is replaced by an object.
pub fn set_nested_value(target: &mut Map<String, Value>, path: &str, value: String) {
    let mut segments = path.split('/').peekable();
    let mut node = target;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            node.insert(segment.to_string(), Value::String(value));
            return;
        }
        let entry = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else { return };
        node = next;
    }
}

/// Builds the nested submission object from accepted `(path, value)` pairs.
pub fn to_nested(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut root = Map::new();
    for (path, value) in pairs {
        set_nested_value(&mut root, &path, value);
    }
    root
}

/// Builds the flat map used by bulk patches, where keys stay slash-delimited.
pub fn to_flat(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut map = Map::new();
    for (path, value) in pairs {
        map.insert(path, Value::String(value));
    }
    map
}
