use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use serde_json::Value;

use crate::{
    file_index::{lookup_key, FileIndex},
    foreign_keys::{leaf_reference, reference_values, ForeignKeyPath, ARRAY_SEGMENT},
    pseudo_ref::{parse_pseudo_ref, pseudo_ref_path},
};

/// Which kinds of reference a stripping pass removes.
///
/// Placeholders whose target path is in the pass's path set are stripped in every
/// mode; the modes differ in what else goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripMode {
    /// Ids in the strip set, and placeholders with no file index entry.
    All,
    /// Ids in the strip set only.
    IdsOnly,
    /// Placeholders with no file index entry only.
    PseudoOnly,
}

impl StripMode {
    fn strips_ids(self) -> bool {
        matches!(self, Self::All | Self::IdsOnly)
    }

    fn strips_dangling(self) -> bool {
        matches!(self, Self::All | Self::PseudoOnly)
    }
}

#[derive(Clone)]
pub struct RefCleaner {
    file_index: FileIndex,
}

impl RefCleaner {
    pub fn new(file_index: FileIndex) -> Self {
        Self { file_index }
    }

    /// Returns a copy of `content` with the offending references at `foreign_keys`
    /// nulled (scalar fields) or filtered out (array fields). `content` is untouched.
    pub fn strip_references_with_schema(
        &self,
        workbook_id: &str,
        content: &Value,
        foreign_keys: &[ForeignKeyPath],
        paths: &HashSet<String>,
        ids_to_strip: &HashSet<String>,
        mode: StripMode,
    ) -> Result<Value> {
        if foreign_keys.is_empty() {
            return Ok(content.clone());
        }

        let indexed = if mode.strips_dangling() {
            self.indexed_placeholders(workbook_id, content, foreign_keys)?
        } else {
            HashSet::new()
        };

        Ok(strip_with(content, foreign_keys, |value| {
            if let Some(target) = pseudo_ref_path(value) {
                if paths.contains(target) {
                    return true;
                }
                return mode.strips_dangling() && !indexed.contains(value);
            }
            mode.strips_ids() && ids_to_strip.contains(value)
        }))
    }

    fn indexed_placeholders(
        &self,
        workbook_id: &str,
        content: &Value,
        foreign_keys: &[ForeignKeyPath],
    ) -> Result<HashSet<String>> {
        let mut placeholders = BTreeSet::new();
        for fk in foreign_keys {
            for value in reference_values(content, fk) {
                if pseudo_ref_path(value).is_some() {
                    placeholders.insert(value);
                }
            }
        }
        if placeholders.is_empty() {
            return Ok(HashSet::new());
        }

        let lookups: Vec<(String, String)> = placeholders
            .iter()
            .filter_map(|p| parse_pseudo_ref(p))
            .map(|(folder, file)| (folder.to_string(), file.to_string()))
            .collect();
        let found = self.file_index.get_record_ids(workbook_id, &lookups)?;

        Ok(placeholders
            .into_iter()
            .filter(|p| {
                parse_pseudo_ref(p)
                    .map(|(folder, file)| found.contains_key(&lookup_key(folder, file)))
                    .unwrap_or(false)
            })
            .map(str::to_string)
            .collect())
    }
}

pub fn strip_with(
    content: &Value,
    foreign_keys: &[ForeignKeyPath],
    should_strip: impl Fn(&str) -> bool,
) -> Value {
    let mut copy = content.clone();
    for fk in foreign_keys {
        strip_at(&mut copy, &fk.path, fk.map.as_deref(), &should_strip);
    }
    copy
}

fn strip_at(node: &mut Value, path: &[String], map: Option<&str>, should_strip: &impl Fn(&str) -> bool) {
    let Some((segment, rest)) = path.split_first() else {
        strip_leaf(node, map, should_strip);
        return;
    };

    if segment == ARRAY_SEGMENT {
        let Value::Array(items) = node else {
            return;
        };
        if rest.is_empty() {
            items.retain(|item| !leaf_reference(item, map).is_some_and(should_strip));
        } else {
            for item in items.iter_mut() {
                strip_at(item, rest, map, should_strip);
            }
        }
    } else if let Some(child) = node.get_mut(segment.as_str()) {
        strip_at(child, rest, map, should_strip);
    }
}

fn strip_leaf(node: &mut Value, map: Option<&str>, should_strip: &impl Fn(&str) -> bool) {
    match node {
        Value::Array(items) => {
            items.retain(|item| !leaf_reference(item, map).is_some_and(should_strip));
        }
        other => {
            if leaf_reference(other, map).is_some_and(should_strip) {
                *other = Value::Null;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{db::Database, file_index::FileIndexUpsert, foreign_keys::extract_foreign_keys};

    fn schema() -> Vec<ForeignKeyPath> {
        extract_foreign_keys(&json!({
            "properties": {
                "tags": { "type": "array", "items": { "type": "string", "x-scratch-foreign-key": "fld_tags" } },
                "mentor": { "type": "string", "x-scratch-foreign-key": "fld_authors" },
                "editor": { "x-scratch-foreign-key": { "linkedTableId": "fld_authors", "map": "id" } },
                "title": { "type": "string" }
            }
        }))
    }

    fn cleaner() -> RefCleaner {
        let index = FileIndex::new(Database::open_in_memory().expect("db"));
        index
            .upsert_batch(&[FileIndexUpsert {
                workbook_id: "wb1".into(),
                folder_path: "authors".into(),
                filename: "known.json".into(),
                record_id: "rec_known".into(),
            }])
            .expect("upsert");
        RefCleaner::new(index)
    }

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn ids_only_strips_deleted_ids_and_listed_placeholders() {
        let content = json!({
            "title": "tag1Id",
            "tags": ["tag1Id", "tag2Id", "@/tags/gone.json", "@/tags/new.json"],
            "mentor": "@/authors/nowhere.json",
            "editor": { "id": "tag1Id" }
        });
        let out = cleaner()
            .strip_references_with_schema(
                "wb1",
                &content,
                &schema(),
                &set(&["tags/gone.json"]),
                &set(&["tag1Id"]),
                StripMode::IdsOnly,
            )
            .expect("strip");

        assert_eq!(
            out,
            json!({
                "title": "tag1Id",
                "tags": ["tag2Id", "@/tags/new.json"],
                "mentor": "@/authors/nowhere.json",
                "editor": null
            })
        );
        assert_eq!(content["tags"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn pseudo_only_strips_added_and_dangling_placeholders() {
        let content = json!({
            "tags": ["tag1Id", "@/tags/new.json"],
            "mentor": "@/authors/known.json",
            "editor": { "id": "@/authors/dangling.json" }
        });
        let out = cleaner()
            .strip_references_with_schema(
                "wb1",
                &content,
                &schema(),
                &set(&["tags/new.json"]),
                &set(&["tag1Id"]),
                StripMode::PseudoOnly,
            )
            .expect("strip");

        assert_eq!(
            out,
            json!({
                "tags": ["tag1Id"],
                "mentor": "@/authors/known.json",
                "editor": null
            })
        );
    }

    #[test]
    fn stripping_is_idempotent() {
        let cleaner = cleaner();
        let content = json!({
            "tags": ["tag1Id", "@/tags/new.json", "@/authors/known.json"],
            "mentor": "tag1Id",
            "editor": { "id": "@/authors/dangling.json" }
        });
        for mode in [StripMode::All, StripMode::IdsOnly, StripMode::PseudoOnly] {
            let once = cleaner
                .strip_references_with_schema("wb1", &content, &schema(), &set(&["tags/new.json"]), &set(&["tag1Id"]), mode)
                .expect("strip");
            let twice = cleaner
                .strip_references_with_schema("wb1", &once, &schema(), &set(&["tags/new.json"]), &set(&["tag1Id"]), mode)
                .expect("strip");
            assert_eq!(once, twice, "mode {mode:?}");
        }
    }

    #[test]
    fn array_sentinel_inside_nested_objects() {
        let fks = vec![ForeignKeyPath {
            path: vec!["sections".into(), ARRAY_SEGMENT.into(), "refs".into(), ARRAY_SEGMENT.into()],
            target_folder_id: "fld_x".into(),
            map: None,
        }];
        let content = json!({ "sections": [ { "refs": ["a", "b"] }, { "refs": ["b"] }, { "other": 1 } ] });
        let out = strip_with(&content, &fks, |v| v == "b");
        assert_eq!(out, json!({ "sections": [ { "refs": ["a"] }, { "refs": [] }, { "other": 1 } ] }));
    }
}
