//! Placeholder references (`@/<folderPath>/<filename>`).
//!
//! A placeholder stands in for the remote id of the record that a draft file will
//! become. Before any content reaches a connector every placeholder is either
//! replaced by the real id from the file index or stripped.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use serde_json::Value;

use crate::{
    error::PipelineError,
    file_index::{lookup_key, FileIndex},
    models::{split_file_path, PSEUDO_REF_PREFIX},
};

pub fn pseudo_ref_path(value: &str) -> Option<&str> {
    value
        .strip_prefix(PSEUDO_REF_PREFIX)
        .map(|path| path.trim_matches('/'))
        .filter(|path| !path.is_empty())
}

pub fn parse_pseudo_ref(value: &str) -> Option<(&str, &str)> {
    pseudo_ref_path(value).map(split_file_path)
}

pub fn collect_pseudo_refs<'a>(value: &'a Value, out: &mut BTreeSet<&'a str>) {
    match value {
        Value::String(s) if pseudo_ref_path(s).is_some() => {
            out.insert(s.as_str());
        }
        Value::Array(items) => {
            for item in items {
                collect_pseudo_refs(item, out);
            }
        }
        Value::Object(map) => {
            for child in map.values() {
                collect_pseudo_refs(child, out);
            }
        }
        _ => {}
    }
}

/// Replaces each placeholder in `value` with its entry in `record_ids`
/// (keyed by [`lookup_key`]). Fails on the first placeholder with no mapping.
pub fn substitute_pseudo_refs(value: &mut Value, record_ids: &HashMap<String, String>) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some((folder_path, filename)) = parse_pseudo_ref(s) {
                let Some(record_id) = record_ids.get(&lookup_key(folder_path, filename)) else {
                    return Err(PipelineError::UnresolvedReference {
                        folder_path: folder_path.to_string(),
                        filename: filename.to_string(),
                    }
                    .into());
                };
                *s = record_id.clone();
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_pseudo_refs(item, record_ids)?;
            }
        }
        Value::Object(map) => {
            for child in map.values_mut() {
                substitute_pseudo_refs(child, record_ids)?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub fn resolve_pseudo_refs(
    file_index: &FileIndex,
    workbook_id: &str,
    operations: &mut [Value],
) -> Result<()> {
    let mut refs = BTreeSet::new();
    for operation in operations.iter() {
        collect_pseudo_refs(operation, &mut refs);
    }
    if refs.is_empty() {
        return Ok(());
    }

    let lookups: Vec<(String, String)> = refs
        .iter()
        .filter_map(|r| parse_pseudo_ref(r))
        .map(|(folder, file)| (folder.to_string(), file.to_string()))
        .collect();
    let record_ids = file_index.get_record_ids(workbook_id, &lookups)?;

    for operation in operations.iter_mut() {
        substitute_pseudo_refs(operation, &record_ids)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{db::Database, file_index::FileIndexUpsert};

    #[test]
    fn parses_placeholder_paths() {
        assert_eq!(pseudo_ref_path("@/tags/tag1.json"), Some("tags/tag1.json"));
        assert_eq!(parse_pseudo_ref("@/a/b/c.json"), Some(("a/b", "c.json")));
        assert_eq!(pseudo_ref_path("rec_123"), None);
        assert_eq!(pseudo_ref_path("@/"), None);
    }

    #[test]
    fn resolves_placeholders_in_nested_positions() {
        let index = FileIndex::new(Database::open_in_memory().expect("db"));
        index
            .upsert_batch(&[FileIndexUpsert {
                workbook_id: "wb1".into(),
                folder_path: "folder".into(),
                filename: "file.json".into(),
                record_id: "rec_123".into(),
            }])
            .expect("upsert");

        let mut operations = vec![json!({
            "owner": "@/folder/file.json",
            "list": ["x", "@/folder/file.json"],
            "nested": { "deep": [{ "ref": "@/folder/file.json" }] }
        })];
        resolve_pseudo_refs(&index, "wb1", &mut operations).expect("resolve");

        assert_eq!(
            operations[0],
            json!({
                "owner": "rec_123",
                "list": ["x", "rec_123"],
                "nested": { "deep": [{ "ref": "rec_123" }] }
            })
        );
    }

    #[test]
    fn unmapped_placeholder_names_folder_and_file() {
        let index = FileIndex::new(Database::open_in_memory().expect("db"));
        let mut operations = vec![json!({ "tag": "@/tags/missing.json" })];
        let err = resolve_pseudo_refs(&index, "wb1", &mut operations).expect_err("unresolved");
        let text = err.to_string();
        assert!(text.contains("tags"), "{text}");
        assert!(text.contains("missing.json"), "{text}");
    }
}
