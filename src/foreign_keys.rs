//! Foreign-key discovery over JSON table schemas.
//!
//! A schema property annotated with `x-scratch-foreign-key` links to records of
//! another data folder. The annotation is either the linked folder id as a bare
//! string or `{ "linkedTableId": "...", "map": "..." }`, where `map` names the
//! sub-field of an object value that carries the reference.

use serde_json::Value;

pub const FOREIGN_KEY_ANNOTATION: &str = "x-scratch-foreign-key";

/// Path segment meaning "every element of this array".
pub const ARRAY_SEGMENT: &str = "[]";

const COMBINATORS: [&str; 3] = ["oneOf", "anyOf", "allOf"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyPath {
    pub path: Vec<String>,
    pub target_folder_id: String,
    pub map: Option<String>,
}

pub fn extract_foreign_keys(schema: &Value) -> Vec<ForeignKeyPath> {
    let mut found = Vec::new();
    let mut path = Vec::new();
    walk_schema(schema, &mut path, &mut found);
    found
}

fn walk_schema(node: &Value, path: &mut Vec<String>, found: &mut Vec<ForeignKeyPath>) {
    let Value::Object(obj) = node else {
        return;
    };

    if !path.is_empty() {
        if let Some((target_folder_id, map)) = obj.get(FOREIGN_KEY_ANNOTATION).and_then(parse_annotation) {
            found.push(ForeignKeyPath {
                path: path.clone(),
                target_folder_id,
                map,
            });
        }
    }

    if let Some(Value::Object(properties)) = obj.get("properties") {
        for (key, child) in properties {
            path.push(key.clone());
            walk_schema(child, path, found);
            path.pop();
        }
    }

    // Tuple-form `items` (an array of schemas) has no uniform element shape.
    if let Some(items @ Value::Object(_)) = obj.get("items") {
        path.push(ARRAY_SEGMENT.to_string());
        walk_schema(items, path, found);
        path.pop();
    }

    for combinator in COMBINATORS {
        if let Some(Value::Array(branches)) = obj.get(combinator) {
            for branch in branches {
                walk_schema(branch, path, found);
            }
        }
    }
}

fn parse_annotation(value: &Value) -> Option<(String, Option<String>)> {
    match value {
        Value::String(folder_id) if !folder_id.is_empty() => Some((folder_id.clone(), None)),
        Value::Object(obj) => {
            let folder_id = obj.get("linkedTableId").and_then(Value::as_str)?;
            let map = obj
                .get("map")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            Some((folder_id.to_string(), map))
        }
        _ => None,
    }
}

pub fn reference_values<'a>(content: &'a Value, fk: &ForeignKeyPath) -> Vec<&'a str> {
    let mut values = Vec::new();
    collect_at(content, &fk.path, fk.map.as_deref(), &mut values);
    values
}

fn collect_at<'a>(node: &'a Value, path: &[String], map: Option<&str>, out: &mut Vec<&'a str>) {
    let Some((segment, rest)) = path.split_first() else {
        collect_leaf(node, map, out);
        return;
    };

    if segment == ARRAY_SEGMENT {
        if let Value::Array(items) = node {
            for item in items {
                collect_at(item, rest, map, out);
            }
        }
    } else if let Some(child) = node.get(segment.as_str()) {
        collect_at(child, rest, map, out);
    }
}

fn collect_leaf<'a>(node: &'a Value, map: Option<&str>, out: &mut Vec<&'a str>) {
    match node {
        Value::Array(items) => {
            for item in items {
                if let Some(value) = leaf_reference(item, map) {
                    out.push(value);
                }
            }
        }
        other => {
            if let Some(value) = leaf_reference(other, map) {
                out.push(value);
            }
        }
    }
}

/// The reference held by a single leaf: the string itself, or `leaf[map]` for objects.
pub fn leaf_reference<'a>(leaf: &'a Value, map: Option<&str>) -> Option<&'a str> {
    match (leaf, map) {
        (Value::String(s), _) => Some(s.as_str()),
        (Value::Object(obj), Some(key)) => obj.get(key).and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn paths(found: &[ForeignKeyPath]) -> Vec<String> {
        let mut out: Vec<String> = found.iter().map(|fk| fk.path.join(".")).collect();
        out.sort();
        out
    }

    #[test]
    fn finds_scalar_and_array_foreign_keys() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "publisher": { "type": "string", "x-scratch-foreign-key": "fld_publishers" },
                "tags": {
                    "type": "array",
                    "items": { "type": "string", "x-scratch-foreign-key": "fld_tags" }
                }
            }
        });

        let found = extract_foreign_keys(&schema);
        assert_eq!(paths(&found), vec!["publisher", "tags.[]"]);
        let tags = found.iter().find(|fk| fk.path[0] == "tags").expect("tags fk");
        assert_eq!(tags.target_folder_id, "fld_tags");
        assert_eq!(tags.map, None);
    }

    #[test]
    fn combinators_do_not_extend_the_path() {
        let schema = json!({
            "properties": {
                "owner": {
                    "oneOf": [
                        { "type": "null" },
                        { "type": "object", "properties": {
                            "ref": { "x-scratch-foreign-key": { "linkedTableId": "fld_people", "map": "id" } }
                        } }
                    ]
                },
                "meta": { "allOf": [ { "properties": { "editor": { "x-scratch-foreign-key": "fld_people" } } } ] }
            }
        });

        let found = extract_foreign_keys(&schema);
        assert_eq!(paths(&found), vec!["meta.editor", "owner.ref"]);
        let owner = found.iter().find(|fk| fk.path[0] == "owner").expect("owner fk");
        assert_eq!(owner.map.as_deref(), Some("id"));
    }

    #[test]
    fn tuple_items_and_malformed_annotations_are_ignored() {
        let schema = json!({
            "properties": {
                "pair": { "items": [ { "x-scratch-foreign-key": "fld_a" } ] },
                "broken": { "x-scratch-foreign-key": 42 },
                "empty": { "x-scratch-foreign-key": "" }
            }
        });
        assert!(extract_foreign_keys(&schema).is_empty());
        assert!(extract_foreign_keys(&Value::Null).is_empty());
    }

    #[test]
    fn reference_values_walks_arrays_and_mapped_objects() {
        let content = json!({
            "tags": ["t1", "t2", 3],
            "sections": [
                { "author": { "id": "a1", "name": "x" } },
                { "author": { "name": "no id" } }
            ]
        });
        let tags = ForeignKeyPath {
            path: vec!["tags".into()],
            target_folder_id: "fld_tags".into(),
            map: None,
        };
        let authors = ForeignKeyPath {
            path: vec!["sections".into(), ARRAY_SEGMENT.into(), "author".into()],
            target_folder_id: "fld_authors".into(),
            map: Some("id".into()),
        };
        assert_eq!(reference_values(&content, &tags), vec!["t1", "t2"]);
        assert_eq!(reference_values(&content, &authors), vec!["a1"]);
    }
}
