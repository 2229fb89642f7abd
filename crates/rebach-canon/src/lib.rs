//! Metadata canonicalization and version fingerprinting.
//!
//! The *version fingerprint* is the MD5 of a canonical byte rendering of the
//! reduced item-version metadata. Canonicalization makes the digest
//! independent of the map/list ordering the catalog happens to return:
//! values are normalized (the literal string `"null"` and JSON null both
//! become the empty string), maps are walked in lexicographic key order,
//! lists are sorted (except any list under a key named `authors`, which
//! keeps its input order at every depth), and the leaf values are
//! concatenated in post-order before hashing.
//!
//! Only `{description, funding_list, related_materials}` participate for
//! articles, so title or tag edits do not change preservation identity while
//! substantive metadata changes do. Collections hash their full record.

use md5::{Digest, Md5};
use serde_json::{Map, Value};

use rebach_types::Fingerprint;

/// The article fields that participate in the fingerprint.
pub const REDUCED_FIELDS: &[&str] = &["description", "funding_list", "related_materials"];

/// Project a full item-version record down to the reduced field set.
/// Fields absent from the record are simply omitted; an omitted field and an
/// empty one canonicalize identically.
pub fn reduce(record: &Value) -> Value {
    let mut out = Map::new();
    if let Value::Object(map) = record {
        for &field in REDUCED_FIELDS {
            if let Some(v) = map.get(field) {
                out.insert(field.to_string(), v.clone());
            }
        }
    }
    Value::Object(out)
}

/// Canonicalize a value: normalize null-ish leaves, sort maps and lists.
pub fn canonicalize(value: &Value) -> Value {
    canonicalize_under_key(value, None)
}

fn canonicalize_under_key(value: &Value, parent_key: Option<&str>) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::String(s) if s == "null" => Value::String(String::new()),
        Value::Object(map) => {
            // serde_json's default map is already key-ordered; rebuilding
            // through a fresh Map keeps that guarantee explicit and survives
            // preserve_order builds.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(
                    key.clone(),
                    canonicalize_under_key(&map[key.as_str()], Some(key.as_str())),
                );
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut canon: Vec<Value> = items
                .iter()
                .map(|v| canonicalize_under_key(v, parent_key))
                .collect();
            if parent_key != Some("authors") {
                sort_list(&mut canon);
            }
            Value::Array(canon)
        }
        other => other.clone(),
    }
}

/// Sort a canonicalized list. Lists of maps order by the tuple of their
/// values (as strings) over the union of keys; anything else orders by the
/// stringified element.
fn sort_list(items: &mut [Value]) {
    let all_maps = !items.is_empty() && items.iter().all(Value::is_object);
    if all_maps {
        let mut union_keys: Vec<String> = Vec::new();
        for item in items.iter() {
            if let Value::Object(map) = item {
                for key in map.keys() {
                    if !union_keys.contains(key) {
                        union_keys.push(key.clone());
                    }
                }
            }
        }
        union_keys.sort();
        items.sort_by_key(|item| {
            let Value::Object(map) = item else {
                return Vec::new();
            };
            union_keys
                .iter()
                .map(|key| map.get(key).map(render_into_string).unwrap_or_default())
                .collect::<Vec<String>>()
        });
    } else {
        items.sort_by_key(render_into_string);
    }
}

fn render_into_string(value: &Value) -> String {
    let mut out = String::new();
    stringify(value, &mut out);
    out
}

/// Concatenate all leaf values in post-order. Map keys do not participate;
/// only the values do.
pub fn stringify(value: &Value, out: &mut String) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for item in items {
                stringify(item, out);
            }
        }
        Value::Object(map) => {
            for (_, v) in map {
                stringify(v, out);
            }
        }
    }
}

fn digest(canonical: &Value) -> Fingerprint {
    let mut bytes = String::new();
    stringify(canonical, &mut bytes);
    let mut hasher = Md5::new();
    hasher.update(bytes.as_bytes());
    Fingerprint::from_digest(hex::encode(hasher.finalize()))
}

/// Fingerprint of an article item-version: reduced projection, canonicalized.
pub fn fingerprint_reduced(record: &Value) -> Fingerprint {
    digest(&canonicalize(&reduce(record)))
}

/// Fingerprint of a full record (collections hash everything, including the
/// embedded article list).
pub fn fingerprint_full(record: &Value) -> Fingerprint {
    digest(&canonicalize(record))
}
