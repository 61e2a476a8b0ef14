use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use rusqlite::{params, params_from_iter};
use serde_json::Value;

use crate::{
    db::{placeholders, Database, SQLITE_BATCH_LIMIT},
    foreign_keys::reference_values,
    models::{Branch, FileReference, RefSource, RefTarget},
    pseudo_ref::parse_pseudo_ref,
    schema_resolver::{ResolvedSchema, SchemaCache, SchemaResolver},
};

/// Targets per `find_refs_to_files` query; each binds three parameters.
const TARGETS_PER_QUERY: usize = 50;

#[derive(Clone)]
pub struct FileReferenceIndex {
    db: Database,
    schemas: SchemaResolver,
}

impl FileReferenceIndex {
    pub fn new(db: Database, schemas: SchemaResolver) -> Self {
        Self { db, schemas }
    }

    /// Replaces the edges of `files` on `branch` with those extracted from their content.
    /// Without an explicit `schema` each file's schema is resolved from its folder.
    pub fn update_refs_for_files(
        &self,
        cache: &mut SchemaCache,
        workbook_id: &str,
        branch: Branch,
        files: &[(String, Value)],
        schema: Option<&ResolvedSchema>,
    ) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }

        let mut edges = Vec::new();
        for (path, content) in files {
            let resolved;
            let file_schema = match schema {
                Some(schema) => Some(schema),
                None => {
                    resolved = self.schemas.for_file(cache, workbook_id, path)?;
                    resolved.as_deref()
                }
            };
            if let Some(file_schema) = file_schema {
                edges.extend(self.extract_edges(cache, workbook_id, branch, path, content, file_schema)?);
            }
        }

        let paths: Vec<String> = files.iter().map(|(path, _)| path.clone()).collect();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for chunk in paths.chunks(SQLITE_BATCH_LIMIT) {
                let sql = format!(
                    "DELETE FROM file_references WHERE workbook_id=?1 AND branch=?2 AND source_file_path IN ({})",
                    placeholders(2, chunk.len())
                );
                let mut bind: Vec<&str> = vec![workbook_id, branch.as_str()];
                bind.extend(chunk.iter().map(String::as_str));
                tx.execute(&sql, params_from_iter(bind))?;
            }
            for edge in &edges {
                tx.execute(
                    "INSERT INTO file_references(workbook_id,branch,source_file_path,target_folder_path,target_file_name,target_file_record_id)
                     VALUES(?1,?2,?3,?4,?5,?6)",
                    params![
                        edge.workbook_id,
                        edge.branch.as_str(),
                        edge.source_file_path,
                        edge.target_folder_path,
                        edge.target_file_name,
                        edge.target_file_record_id
                    ],
                )?;
            }
            tx.commit()?;
            Ok(edges.len())
        })
    }

    fn extract_edges(
        &self,
        cache: &mut SchemaCache,
        workbook_id: &str,
        branch: Branch,
        source_file_path: &str,
        content: &Value,
        schema: &ResolvedSchema,
    ) -> Result<Vec<FileReference>> {
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        for fk in &schema.foreign_keys {
            for value in reference_values(content, fk) {
                let edge = match parse_pseudo_ref(value) {
                    Some((folder_path, filename)) => FileReference {
                        workbook_id: workbook_id.to_string(),
                        branch,
                        source_file_path: source_file_path.to_string(),
                        target_folder_path: folder_path.to_string(),
                        target_file_name: Some(filename.to_string()),
                        target_file_record_id: None,
                    },
                    None => {
                        let target_folder_path = self
                            .schemas
                            .for_folder_id(cache, &fk.target_folder_id)?
                            .map(|target| target.folder.path.clone())
                            .unwrap_or_default();
                        FileReference {
                            workbook_id: workbook_id.to_string(),
                            branch,
                            source_file_path: source_file_path.to_string(),
                            target_folder_path,
                            target_file_name: None,
                            target_file_record_id: Some(value.to_string()),
                        }
                    }
                };
                if seen.insert(edge.clone()) {
                    edges.push(edge);
                }
            }
        }
        Ok(edges)
    }

    /// Sources on any of `branches` whose edges match a target by
    /// `(folder, filename)` or by record id.
    pub fn find_refs_to_files(
        &self,
        workbook_id: &str,
        targets: &[RefTarget],
        branches: &[Branch],
    ) -> Result<Vec<RefSource>> {
        if targets.is_empty() || branches.is_empty() {
            return Ok(Vec::new());
        }

        self.db.with_conn(|conn| {
            let mut found = BTreeSet::new();
            for chunk in targets.chunks(TARGETS_PER_QUERY) {
                let mut bind: Vec<String> = vec![workbook_id.to_string()];
                bind.extend(branches.iter().map(|b| b.as_str().to_string()));
                let branch_clause = placeholders(1, branches.len());

                let mut matchers = Vec::new();
                for target in chunk {
                    if let Some(file_name) = &target.file_name {
                        bind.push(target.folder_path.clone());
                        let folder_idx = bind.len();
                        bind.push(file_name.clone());
                        matchers.push(format!(
                            "(target_folder_path=?{folder_idx} AND target_file_name=?{})",
                            bind.len()
                        ));
                    }
                    if let Some(record_id) = &target.record_id {
                        bind.push(record_id.clone());
                        matchers.push(format!("target_file_record_id=?{}", bind.len()));
                    }
                }
                if matchers.is_empty() {
                    continue;
                }

                let sql = format!(
                    "SELECT DISTINCT source_file_path, branch FROM file_references
                     WHERE workbook_id=?1 AND branch IN ({branch_clause}) AND ({})",
                    matchers.join(" OR ")
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (source_file_path, branch) = row?;
                    if let Some(branch) = Branch::parse(&branch) {
                        found.insert(RefSource {
                            source_file_path,
                            branch,
                        });
                    }
                }
            }
            Ok(found.into_iter().collect())
        })
    }

    pub fn delete_refs_for_sources(&self, workbook_id: &str, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        self.db.with_conn(|conn| {
            let mut removed = 0;
            for chunk in paths.chunks(SQLITE_BATCH_LIMIT) {
                let sql = format!(
                    "DELETE FROM file_references WHERE workbook_id=?1 AND source_file_path IN ({})",
                    placeholders(1, chunk.len())
                );
                let mut bind: Vec<&str> = vec![workbook_id];
                bind.extend(chunk.iter().map(String::as_str));
                removed += conn.execute(&sql, params_from_iter(bind))?;
            }
            Ok(removed)
        })
    }

    #[cfg(test)]
    pub fn refs_from(&self, workbook_id: &str, branch: Branch, source_file_path: &str) -> Result<Vec<FileReference>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT target_folder_path,target_file_name,target_file_record_id FROM file_references
                 WHERE workbook_id=?1 AND branch=?2 AND source_file_path=?3 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![workbook_id, branch.as_str(), source_file_path], |row| {
                Ok(FileReference {
                    workbook_id: workbook_id.to_string(),
                    branch,
                    source_file_path: source_file_path.to_string(),
                    target_folder_path: row.get(0)?,
                    target_file_name: row.get(1)?,
                    target_file_record_id: row.get(2)?,
                })
            })?;
            let mut refs = Vec::new();
            for row in rows {
                refs.push(row?);
            }
            Ok(refs)
        })
    }
}
