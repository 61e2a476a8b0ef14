use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};

use crate::{
    db::{decode_timestamp, encode_timestamp, placeholders, Database, SQLITE_BATCH_LIMIT},
    models::FileIndexEntry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndexUpsert {
    pub workbook_id: String,
    pub folder_path: String,
    pub filename: String,
    pub record_id: String,
}

pub fn lookup_key(folder_path: &str, filename: &str) -> String {
    format!("{folder_path}:{filename}")
}

#[derive(Clone)]
pub struct FileIndex {
    db: Database,
}

impl FileIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upserts keyed by `(workbook, folder, record id)`. A renamed file keeps its row and
    /// only its filename changes; a filename taken over by a new record id drops the old row.
    pub fn upsert_batch(&self, entries: &[FileIndexUpsert]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let now = encode_timestamp(&Utc::now());
        self.db.with_conn(|conn| {
            let mut written = 0;
            for chunk in entries.chunks(SQLITE_BATCH_LIMIT) {
                let tx = conn.transaction()?;
                for entry in chunk {
                    tx.execute(
                        "DELETE FROM file_index WHERE workbook_id=?1 AND folder_path=?2 AND filename=?3 AND record_id<>?4",
                        params![entry.workbook_id, entry.folder_path, entry.filename, entry.record_id],
                    )?;
                    tx.execute(
                        "INSERT INTO file_index(workbook_id,folder_path,filename,record_id,last_seen_at) VALUES(?1,?2,?3,?4,?5)
                         ON CONFLICT(workbook_id,folder_path,record_id) DO UPDATE SET filename=excluded.filename, last_seen_at=excluded.last_seen_at",
                        params![entry.workbook_id, entry.folder_path, entry.filename, entry.record_id, now],
                    )?;
                    written += 1;
                }
                tx.commit()?;
            }
            Ok(written)
        })
    }

    pub fn get_record_ids(
        &self,
        workbook_id: &str,
        lookups: &[(String, String)],
    ) -> Result<HashMap<String, String>> {
        let mut by_folder: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (folder_path, filename) in lookups {
            by_folder
                .entry(folder_path.as_str())
                .or_default()
                .push(filename.as_str());
        }

        let mut found = HashMap::new();
        if by_folder.is_empty() {
            return Ok(found);
        }

        self.db.with_conn(|conn| {
            for (folder_path, filenames) in by_folder {
                for chunk in filenames.chunks(SQLITE_BATCH_LIMIT) {
                    let sql = format!(
                        "SELECT filename, record_id FROM file_index WHERE workbook_id=?1 AND folder_path=?2 AND filename IN ({})",
                        placeholders(2, chunk.len())
                    );
                    let mut bind: Vec<&str> = vec![workbook_id, folder_path];
                    bind.extend(chunk.iter().copied());

                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(bind), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    for row in rows {
                        let (filename, record_id) = row?;
                        found.insert(lookup_key(folder_path, &filename), record_id);
                    }
                }
            }
            Ok(found)
        })
    }

    pub fn get_record_id(
        &self,
        workbook_id: &str,
        folder_path: &str,
        filename: &str,
    ) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT record_id FROM file_index WHERE workbook_id=?1 AND folder_path=?2 AND filename=?3",
                    params![workbook_id, folder_path, filename],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_filename(
        &self,
        workbook_id: &str,
        folder_path: &str,
        record_id: &str,
    ) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT filename FROM file_index WHERE workbook_id=?1 AND folder_path=?2 AND record_id=?3",
                    params![workbook_id, folder_path, record_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Entries not seen since `before`, oldest first, for reconciliation against
    /// records deleted upstream.
    pub fn find_stale_entries(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<FileIndexEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT workbook_id,folder_path,filename,record_id,last_seen_at FROM file_index
                 WHERE last_seen_at < ?1 ORDER BY last_seen_at ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![encode_timestamp(&before), limit as i64], |row| {
                let last_seen_at: String = row.get(4)?;
                Ok(FileIndexEntry {
                    workbook_id: row.get(0)?,
                    folder_path: row.get(1)?,
                    filename: row.get(2)?,
                    record_id: row.get(3)?,
                    last_seen_at: decode_timestamp(&last_seen_at),
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    pub fn delete_by_record_ids(
        &self,
        workbook_id: &str,
        folder_path: &str,
        record_ids: &[String],
    ) -> Result<usize> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        self.db.with_conn(|conn| {
            let mut removed = 0;
            for chunk in record_ids.chunks(SQLITE_BATCH_LIMIT) {
                let sql = format!(
                    "DELETE FROM file_index WHERE workbook_id=?1 AND folder_path=?2 AND record_id IN ({})",
                    placeholders(2, chunk.len())
                );
                let mut bind: Vec<&str> = vec![workbook_id, folder_path];
                bind.extend(chunk.iter().map(String::as_str));
                removed += conn.execute(&sql, params_from_iter(bind))?;
            }
            Ok(removed)
        })
    }

    pub fn delete_folder(&self, workbook_id: &str, folder_path: &str) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM file_index WHERE workbook_id=?1 AND folder_path=?2",
                params![workbook_id, folder_path],
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn upsert(folder: &str, filename: &str, record_id: &str) -> FileIndexUpsert {
        FileIndexUpsert {
            workbook_id: "wb1".into(),
            folder_path: folder.into(),
            filename: filename.into(),
            record_id: record_id.into(),
        }
    }

    fn index() -> FileIndex {
        FileIndex::new(Database::open_in_memory().expect("db"))
    }

    #[test]
    fn lookups_work_in_both_directions() {
        let index = index();
        index
            .upsert_batch(&[upsert("tags", "tag1.json", "rec_1"), upsert("tags", "tag2.json", "rec_2")])
            .expect("upsert");

        assert_eq!(
            index.get_record_id("wb1", "tags", "tag1.json").expect("lookup"),
            Some("rec_1".to_string())
        );
        assert_eq!(
            index.get_filename("wb1", "tags", "rec_2").expect("lookup"),
            Some("tag2.json".to_string())
        );
        assert_eq!(index.get_record_id("wb2", "tags", "tag1.json").expect("lookup"), None);
    }

    #[test]
    fn rename_updates_filename_in_place() {
        let index = index();
        index.upsert_batch(&[upsert("tags", "old.json", "rec_1")]).expect("upsert");
        index.upsert_batch(&[upsert("tags", "new.json", "rec_1")]).expect("upsert");

        assert_eq!(index.get_record_id("wb1", "tags", "old.json").expect("lookup"), None);
        assert_eq!(
            index.get_filename("wb1", "tags", "rec_1").expect("lookup"),
            Some("new.json".to_string())
        );
    }

    #[test]
    fn batched_lookup_spans_folders_and_chunks() {
        let index = index();
        let mut entries: Vec<FileIndexUpsert> = (0..(SQLITE_BATCH_LIMIT + 5))
            .map(|i| upsert("people", &format!("p{i}.json"), &format!("rec_p{i}")))
            .collect();
        entries.push(upsert("tags", "tag1.json", "rec_t1"));
        index.upsert_batch(&entries).expect("upsert");

        let mut lookups: Vec<(String, String)> = (0..(SQLITE_BATCH_LIMIT + 5))
            .map(|i| ("people".to_string(), format!("p{i}.json")))
            .collect();
        lookups.push(("tags".into(), "tag1.json".into()));
        lookups.push(("tags".into(), "missing.json".into()));

        let found = index.get_record_ids("wb1", &lookups).expect("lookup");
        assert_eq!(found.len(), SQLITE_BATCH_LIMIT + 6);
        assert_eq!(found.get("tags:tag1.json").map(String::as_str), Some("rec_t1"));
        assert!(!found.contains_key("tags:missing.json"));
    }

    #[test]
    fn stale_entries_and_deletes() {
        let index = index();
        index
            .upsert_batch(&[upsert("tags", "tag1.json", "rec_1"), upsert("tags", "tag2.json", "rec_2")])
            .expect("upsert");

        let future = Utc::now() + Duration::minutes(5);
        assert_eq!(index.find_stale_entries(future, 10).expect("stale").len(), 2);
        assert_eq!(index.find_stale_entries(future, 1).expect("stale").len(), 1);
        let past = Utc::now() - Duration::minutes(5);
        assert!(index.find_stale_entries(past, 10).expect("stale").is_empty());

        assert_eq!(
            index.delete_by_record_ids("wb1", "tags", &["rec_1".to_string()]).expect("delete"),
            1
        );
        assert_eq!(index.delete_folder("wb1", "tags").expect("teardown"), 1);
        assert!(index.find_stale_entries(future, 10).expect("stale").is_empty());
    }
}
