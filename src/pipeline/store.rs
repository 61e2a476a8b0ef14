use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    db::{decode_timestamp, encode_timestamp, placeholders, Database, SQLITE_BATCH_LIMIT},
    error::PipelineError,
    models::{
        EntryCounts, EntryStatus, Phase, PhaseSummary, PlanStatus, PlannedEntry, PublishPlan,
        PublishPlanEntry, PublishPlanInfo,
    },
};

const PLAN_COLUMNS: &str =
    "id,workbook_id,user_id,connector_account_id,branch_name,status,phases_json,error,created_at,updated_at";

const ENTRY_COLUMNS: &str =
    "id,plan_id,seq,file_path,phase,operation_json,raw,remote_record_id,data_folder_id,status,error";

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<PublishPlan> {
    let status: String = row.get(5)?;
    let phases_json: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(PublishPlan {
        id: row.get(0)?,
        workbook_id: row.get(1)?,
        user_id: row.get(2)?,
        connector_account_id: row.get(3)?,
        branch_name: row.get(4)?,
        status: PlanStatus::parse(&status).unwrap_or(PlanStatus::Failed),
        phases: serde_json::from_str(&phases_json).unwrap_or_default(),
        error: row.get(7)?,
        created_at: decode_timestamp(&created_at),
        updated_at: decode_timestamp(&updated_at),
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<PublishPlanEntry> {
    let phase: String = row.get(4)?;
    let operation_json: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(PublishPlanEntry {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        seq: row.get(2)?,
        file_path: row.get(3)?,
        phase: Phase::parse(&phase).unwrap_or(Phase::Edit),
        operation: serde_json::from_str(&operation_json).unwrap_or(Value::Null),
        raw: row.get::<_, i64>(6)? != 0,
        remote_record_id: row.get(7)?,
        data_folder_id: row.get(8)?,
        status: EntryStatus::parse(&status).unwrap_or(EntryStatus::Failed),
        error: row.get(10)?,
    })
}

#[derive(Clone)]
pub struct PlanStore {
    db: Database,
}

impl PlanStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_plan(
        &self,
        workbook_id: &str,
        user_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<PublishPlan> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let plan = PublishPlan {
            branch_name: format!("publish/{id}"),
            id,
            workbook_id: workbook_id.to_string(),
            user_id: user_id.to_string(),
            connector_account_id: connector_account_id.map(str::to_string),
            status: PlanStatus::Planning,
            phases: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO publish_plans({PLAN_COLUMNS}) VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)"),
                params![
                    plan.id,
                    plan.workbook_id,
                    plan.user_id,
                    plan.connector_account_id,
                    plan.branch_name,
                    plan.status.as_str(),
                    "[]",
                    plan.error,
                    encode_timestamp(&plan.created_at),
                    encode_timestamp(&plan.updated_at)
                ],
            )?;
            Ok(())
        })?;
        Ok(plan)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<PublishPlan> {
        let plan = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {PLAN_COLUMNS} FROM publish_plans WHERE id=?1"),
                    params![plan_id],
                    plan_from_row,
                )
                .optional()?)
        })?;
        plan.ok_or_else(|| PipelineError::PlanNotFound(plan_id.to_string()).into())
    }

    pub fn set_status(&self, plan_id: &str, status: PlanStatus, error: Option<&str>) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE publish_plans SET status=?2, error=?3, updated_at=?4 WHERE id=?1",
                params![plan_id, status.as_str(), error, encode_timestamp(&Utc::now())],
            )?)
        })?;
        if changed == 0 {
            return Err(PipelineError::PlanNotFound(plan_id.to_string()).into());
        }
        Ok(())
    }

    pub fn replace_entries(&self, plan_id: &str, entries: &[PlannedEntry]) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM publish_plan_entries WHERE plan_id=?1",
                params![plan_id],
            )?;
            let mut seq: i64 = 0;
            for chunk in entries.chunks(SQLITE_BATCH_LIMIT) {
                let tx = conn.transaction()?;
                for entry in chunk {
                    seq += 1;
                    tx.execute(
                        &format!("INSERT INTO publish_plan_entries({ENTRY_COLUMNS}) VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)"),
                        params![
                            Uuid::new_v4().to_string(),
                            plan_id,
                            seq,
                            entry.file_path,
                            entry.phase.as_str(),
                            entry.operation.to_string(),
                            entry.raw as i64,
                            entry.remote_record_id,
                            entry.data_folder_id,
                            EntryStatus::Pending.as_str(),
                            Option::<String>::None
                        ],
                    )?;
                }
                tx.commit()?;
            }
            Ok(entries.len())
        })
    }

    pub fn finalize_plan(&self, plan_id: &str, phases: &[PhaseSummary]) -> Result<()> {
        let phases_json = serde_json::to_string(phases)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE publish_plans SET phases_json=?2, status=?3, error=NULL, updated_at=?4 WHERE id=?1",
                params![
                    plan_id,
                    phases_json,
                    PlanStatus::Planned.as_str(),
                    encode_timestamp(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    /// Distinct data folders among entries of `phase` in `status`; `None` groups
    /// entries outside any known folder.
    pub fn folder_ids_with_status(
        &self,
        plan_id: &str,
        phase: Phase,
        status: EntryStatus,
    ) -> Result<Vec<Option<String>>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data_folder_id, MIN(seq) AS first_seq FROM publish_plan_entries
                 WHERE plan_id=?1 AND phase=?2 AND status=?3
                 GROUP BY data_folder_id ORDER BY first_seq",
            )?;
            let rows = stmt.query_map(params![plan_id, phase.as_str(), status.as_str()], |row| {
                row.get::<_, Option<String>>(0)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Entries of one phase in `status`, in plan order. `folder` narrows to one
    /// data folder (`Some(None)` selects entries without a folder).
    pub fn entries_with_status(
        &self,
        plan_id: &str,
        phase: Phase,
        status: EntryStatus,
        folder: Option<Option<&str>>,
    ) -> Result<Vec<PublishPlanEntry>> {
        self.db.with_conn(|conn| {
            let base = format!(
                "SELECT {ENTRY_COLUMNS} FROM publish_plan_entries WHERE plan_id=?1 AND phase=?2 AND status=?3"
            );
            let mut entries = Vec::new();
            match folder {
                None => {
                    let mut stmt = conn.prepare(&format!("{base} ORDER BY seq"))?;
                    let rows = stmt.query_map(
                        params![plan_id, phase.as_str(), status.as_str()],
                        entry_from_row,
                    )?;
                    for row in rows {
                        entries.push(row?);
                    }
                }
                Some(Some(folder_id)) => {
                    let mut stmt =
                        conn.prepare(&format!("{base} AND data_folder_id=?4 ORDER BY seq"))?;
                    let rows = stmt.query_map(
                        params![plan_id, phase.as_str(), status.as_str(), folder_id],
                        entry_from_row,
                    )?;
                    for row in rows {
                        entries.push(row?);
                    }
                }
                Some(None) => {
                    let mut stmt =
                        conn.prepare(&format!("{base} AND data_folder_id IS NULL ORDER BY seq"))?;
                    let rows = stmt.query_map(
                        params![plan_id, phase.as_str(), status.as_str()],
                        entry_from_row,
                    )?;
                    for row in rows {
                        entries.push(row?);
                    }
                }
            }
            Ok(entries)
        })
    }

    pub fn mark_entries(&self, entry_ids: &[String], status: EntryStatus, error: Option<&str>) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for chunk in entry_ids.chunks(SQLITE_BATCH_LIMIT) {
                let sql = format!(
                    "UPDATE publish_plan_entries SET status=?1, error=?2 WHERE id IN ({})",
                    placeholders(2, chunk.len())
                );
                let mut bind: Vec<Option<&str>> = vec![Some(status.as_str()), error];
                bind.extend(chunk.iter().map(|id| Some(id.as_str())));
                tx.execute(&sql, params_from_iter(bind))?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn paths_with_pending_backfill(&self, plan_id: &str, paths: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        if paths.is_empty() {
            return Ok(found);
        }
        self.db.with_conn(|conn| {
            for chunk in paths.chunks(SQLITE_BATCH_LIMIT) {
                let sql = format!(
                    "SELECT DISTINCT file_path FROM publish_plan_entries
                     WHERE plan_id=?1 AND phase=?2 AND status=?3 AND file_path IN ({})",
                    placeholders(3, chunk.len())
                );
                let mut bind: Vec<&str> =
                    vec![plan_id, Phase::Backfill.as_str(), EntryStatus::Pending.as_str()];
                bind.extend(chunk.iter().map(String::as_str));
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(bind), |row| row.get::<_, String>(0))?;
                for row in rows {
                    found.insert(row?);
                }
            }
            Ok(found)
        })
    }

    pub fn list_entries(&self, plan_id: &str) -> Result<Vec<PublishPlanEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM publish_plan_entries WHERE plan_id=?1 ORDER BY seq"
            ))?;
            let rows = stmt.query_map(params![plan_id], entry_from_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    pub fn entry_counts(&self, plan_id: &str) -> Result<EntryCounts> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM publish_plan_entries WHERE plan_id=?1 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![plan_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = EntryCounts::default();
            for row in rows {
                let (status, count) = row?;
                let count = count.max(0) as usize;
                match EntryStatus::parse(&status) {
                    Some(EntryStatus::Pending) => counts.pending = count,
                    Some(EntryStatus::Success) => counts.success = count,
                    Some(EntryStatus::FailedBatch) => counts.failed_batch = count,
                    Some(EntryStatus::Failed) | None => counts.failed += count,
                }
            }
            Ok(counts)
        })
    }

    pub fn info(&self, plan_id: &str) -> Result<PublishPlanInfo> {
        let plan = self.get_plan(plan_id)?;
        let entry_counts = self.entry_counts(plan_id)?;
        Ok(PublishPlanInfo { plan, entry_counts })
    }

    pub fn list_plans(
        &self,
        workbook_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<Vec<PublishPlanInfo>> {
        let plans = self.db.with_conn(|conn| {
            let mut plans = Vec::new();
            match connector_account_id {
                Some(account) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {PLAN_COLUMNS} FROM publish_plans WHERE workbook_id=?1 AND connector_account_id=?2 ORDER BY created_at DESC"
                    ))?;
                    let rows = stmt.query_map(params![workbook_id, account], plan_from_row)?;
                    for row in rows {
                        plans.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {PLAN_COLUMNS} FROM publish_plans WHERE workbook_id=?1 ORDER BY created_at DESC"
                    ))?;
                    let rows = stmt.query_map(params![workbook_id], plan_from_row)?;
                    for row in rows {
                        plans.push(row?);
                    }
                }
            }
            Ok(plans)
        })?;

        plans
            .into_iter()
            .map(|plan| {
                let entry_counts = self.entry_counts(&plan.id)?;
                Ok(PublishPlanInfo { plan, entry_counts })
            })
            .collect()
    }

    pub fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let cutoff = encode_timestamp(&cutoff);
            let finished = [PlanStatus::Completed.as_str(), PlanStatus::Failed.as_str()];
            tx.execute(
                "DELETE FROM publish_plan_entries WHERE plan_id IN (
                    SELECT id FROM publish_plans WHERE status IN (?1,?2) AND updated_at < ?3)",
                params![finished[0], finished[1], cutoff],
            )?;
            let removed = tx.execute(
                "DELETE FROM publish_plans WHERE status IN (?1,?2) AND updated_at < ?3",
                params![finished[0], finished[1], cutoff],
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }
}
