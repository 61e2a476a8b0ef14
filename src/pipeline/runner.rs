use std::{
    collections::{BTreeMap, HashMap, HashSet},
    slice,
    sync::Arc,
};

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::store::PlanStore;
use crate::{
    connector::{Connector, ConnectorResolver, TableSpec},
    error::PipelineError,
    file_index::{lookup_key, FileIndex, FileIndexUpsert},
    file_references::FileReferenceIndex,
    file_store::VersionedFileStore,
    models::{
        split_file_path, Branch, EntryStatus, FileWrite, Phase, PlanStatus, PublishPlan,
        PublishPlanEntry, PublishPlanInfo, TEMP_ID_PREFIX,
    },
    pseudo_ref::resolve_pseudo_refs,
    schema_resolver::{SchemaCache, SchemaResolver},
};

struct TableTarget {
    spec: TableSpec,
    connector: Arc<dyn Connector>,
}

#[derive(Default)]
struct RunContext {
    cache: SchemaCache,
    tables: HashMap<String, Arc<TableTarget>>,
}

#[derive(Clone)]
pub struct PlanRunner {
    store: PlanStore,
    files: Arc<dyn VersionedFileStore>,
    file_index: FileIndex,
    refs: FileReferenceIndex,
    schemas: SchemaResolver,
    connectors: Arc<dyn ConnectorResolver>,
}

impl PlanRunner {
    pub fn new(
        store: PlanStore,
        files: Arc<dyn VersionedFileStore>,
        file_index: FileIndex,
        refs: FileReferenceIndex,
        schemas: SchemaResolver,
        connectors: Arc<dyn ConnectorResolver>,
    ) -> Self {
        Self {
            store,
            files,
            file_index,
            refs,
            schemas,
            connectors,
        }
    }

    pub async fn run_pipeline(&self, plan_id: &str, phase: Option<Phase>) -> Result<PublishPlanInfo> {
        let plan = self.store.get_plan(plan_id)?;
        if plan.status == PlanStatus::Planning {
            return Err(PipelineError::InvalidPlanState {
                plan_id: plan.id.clone(),
                action: "run",
                status: plan.status.as_str().to_string(),
            }
            .into());
        }

        info!(
            plan_id,
            workbook_id = %plan.workbook_id,
            phase = phase.map(|p| p.as_str()).unwrap_or("all"),
            "Running publish plan"
        );
        if let Err(err) = self.run_phases(&plan, phase).await {
            let message = format!("{err:#}");
            error!(plan_id, error = %message, "Publish run failed");
            self.store
                .set_status(plan_id, PlanStatus::Failed, Some(&message))?;
            return Err(err);
        }
        self.store.info(plan_id)
    }

    async fn run_phases(&self, plan: &PublishPlan, only: Option<Phase>) -> Result<()> {
        let phases: Vec<Phase> = match only {
            Some(phase) => vec![phase],
            None => Phase::ORDERED.to_vec(),
        };

        let mut ctx = RunContext::default();
        for phase in phases {
            self.store
                .set_status(&plan.id, phase.running_status(), None)?;
            self.run_phase(plan, phase, &mut ctx).await?;

            let done = if only.is_none() && phase == Phase::Backfill {
                PlanStatus::Completed
            } else {
                phase.completed_status()
            };
            self.store.set_status(&plan.id, done, None)?;
        }

        self.files.rebase_dirty(&plan.workbook_id).await?;
        Ok(())
    }

    async fn run_phase(&self, plan: &PublishPlan, phase: Phase, ctx: &mut RunContext) -> Result<()> {
        let folder_ids = self
            .store
            .folder_ids_with_status(&plan.id, phase, EntryStatus::Pending)?;

        for folder_id in folder_ids {
            let entries = self.store.entries_with_status(
                &plan.id,
                phase,
                EntryStatus::Pending,
                Some(folder_id.as_deref()),
            )?;
            let Some(folder_id) = folder_id else {
                for entry in &entries {
                    let reason = PipelineError::NoDataFolder(entry.file_path.clone()).to_string();
                    self.store
                        .mark_entries(slice::from_ref(&entry.id), EntryStatus::Failed, Some(&reason))?;
                }
                continue;
            };

            let table = match self.table_target(ctx, plan, &folder_id).await? {
                Ok(table) => table,
                Err(reason) => {
                    warn!(plan_id = %plan.id, folder_id = %folder_id, error = %reason, "Table unavailable");
                    let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
                    self.store
                        .mark_entries(&ids, EntryStatus::Failed, Some(&reason.to_string()))?;
                    continue;
                }
            };

            let batch_size = table.connector.batch_size(phase.operation_kind()).max(1);
            info!(
                plan_id = %plan.id,
                phase = phase.as_str(),
                table = %table.spec.name,
                entries = entries.len(),
                batch_size,
                "Publishing table"
            );
            for batch in entries.chunks(batch_size) {
                self.process_batch(plan, phase, &table, batch, &mut ctx.cache, EntryStatus::FailedBatch)
                    .await?;
            }
        }

        let retries = self
            .store
            .entries_with_status(&plan.id, phase, EntryStatus::FailedBatch, None)?;
        if !retries.is_empty() {
            info!(plan_id = %plan.id, phase = phase.as_str(), entries = retries.len(), "Retrying failed batches one entry at a time");
        }
        for entry in retries {
            let Some(folder_id) = entry.data_folder_id.clone() else {
                let reason = PipelineError::NoDataFolder(entry.file_path.clone()).to_string();
                self.store
                    .mark_entries(slice::from_ref(&entry.id), EntryStatus::Failed, Some(&reason))?;
                continue;
            };
            match self.table_target(ctx, plan, &folder_id).await? {
                Ok(table) => {
                    self.process_batch(
                        plan,
                        phase,
                        &table,
                        slice::from_ref(&entry),
                        &mut ctx.cache,
                        EntryStatus::Failed,
                    )
                    .await?;
                }
                Err(reason) => {
                    self.store.mark_entries(
                        slice::from_ref(&entry.id),
                        EntryStatus::Failed,
                        Some(&reason.to_string()),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Outer error: the run cannot continue. Inner error: only this folder's
    /// entries are affected.
    async fn table_target(
        &self,
        ctx: &mut RunContext,
        plan: &PublishPlan,
        folder_id: &str,
    ) -> Result<std::result::Result<Arc<TableTarget>, PipelineError>> {
        if let Some(table) = ctx.tables.get(folder_id) {
            return Ok(Ok(table.clone()));
        }

        let Some(resolved) = self.schemas.for_folder_id(&mut ctx.cache, folder_id)? else {
            return Ok(Err(PipelineError::FolderNotFound(folder_id.to_string())));
        };
        let Some(account_id) = resolved
            .folder
            .connector_account_id
            .clone()
            .or_else(|| plan.connector_account_id.clone())
        else {
            return Ok(Err(PipelineError::ConnectorAccountNotFound(format!(
                "no account configured for folder {folder_id}"
            ))));
        };

        let connector = self.connectors.connector_for_account(&account_id).await?;
        let table = Arc::new(TableTarget {
            spec: TableSpec::from_folder(&resolved.folder),
            connector,
        });
        ctx.tables.insert(folder_id.to_string(), table.clone());
        Ok(Ok(table))
    }

    async fn process_batch(
        &self,
        plan: &PublishPlan,
        phase: Phase,
        table: &TableTarget,
        batch: &[PublishPlanEntry],
        cache: &mut SchemaCache,
        failure: EntryStatus,
    ) -> Result<()> {
        let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
        match self.dispatch(plan, phase, table, batch, cache).await {
            Ok(()) => self.store.mark_entries(&ids, EntryStatus::Success, None),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(
                    plan_id = %plan.id,
                    phase = phase.as_str(),
                    table = %table.spec.name,
                    entries = batch.len(),
                    error = %message,
                    "Batch failed"
                );
                self.store.mark_entries(&ids, failure, Some(&message))
            }
        }
    }

    async fn dispatch(
        &self,
        plan: &PublishPlan,
        phase: Phase,
        table: &TableTarget,
        batch: &[PublishPlanEntry],
        cache: &mut SchemaCache,
    ) -> Result<()> {
        match phase {
            Phase::Edit | Phase::Backfill => self.dispatch_update(plan, phase, table, batch, cache).await,
            Phase::Create => self.dispatch_create(plan, table, batch, cache).await,
            Phase::Delete => self.dispatch_delete(plan, table, batch).await,
        }
    }

    async fn dispatch_update(
        &self,
        plan: &PublishPlan,
        phase: Phase,
        table: &TableTarget,
        batch: &[PublishPlanEntry],
        cache: &mut SchemaCache,
    ) -> Result<()> {
        let mut payloads = self.resolved_payloads(&plan.workbook_id, batch)?;
        let record_ids = self.known_record_ids(&plan.workbook_id, batch)?;
        let id_field = table.spec.id_field();
        for (payload, entry) in payloads.iter_mut().zip(batch) {
            if let (Value::Object(map), Some(record_id)) = (payload, record_ids.get(&entry.file_path)) {
                map.entry(id_field.to_string())
                    .or_insert_with(|| Value::String(record_id.clone()));
            }
        }

        table.connector.update_records(&table.spec, &payloads).await?;
        self.write_back(plan, phase, batch, &payloads, cache).await
    }

    async fn dispatch_create(
        &self,
        plan: &PublishPlan,
        table: &TableTarget,
        batch: &[PublishPlanEntry],
        cache: &mut SchemaCache,
    ) -> Result<()> {
        let workbook_id = &plan.workbook_id;
        let id_field = table.spec.id_field();
        let mut payloads = self.resolved_payloads(workbook_id, batch)?;
        for payload in payloads.iter_mut() {
            strip_temp_id(payload, id_field);
        }

        // A retried create whose record already landed in the index is not sent again.
        let already_created = self.known_record_ids(workbook_id, batch)?;
        let to_send: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, entry)| !already_created.contains_key(&entry.file_path))
            .map(|(pos, _)| pos)
            .collect();
        let sent: Vec<Value> = to_send.iter().map(|&pos| payloads[pos].clone()).collect();

        let created = if sent.is_empty() {
            Vec::new()
        } else {
            table.connector.create_records(&table.spec, &sent).await?
        };
        let mut authoritative = payloads;
        if created.len() == sent.len() {
            for (&pos, record) in to_send.iter().zip(created) {
                authoritative[pos] = record;
            }
        } else if !created.is_empty() {
            warn!(
                table = %table.spec.name,
                sent = sent.len(),
                returned = created.len(),
                "Create returned a different number of records; keeping sent payloads"
            );
        }
        for (content, entry) in authoritative.iter_mut().zip(batch) {
            if let (Value::Object(map), Some(record_id)) = (content, already_created.get(&entry.file_path)) {
                map.entry(id_field.to_string())
                    .or_insert_with(|| Value::String(record_id.clone()));
            }
        }

        let mut upserts = Vec::with_capacity(batch.len());
        for (content, entry) in authoritative.iter().zip(batch) {
            let Some(record_id) = record_id_of(content, id_field) else {
                warn!(path = %entry.file_path, "Created record carries no id; file index not updated");
                continue;
            };
            let (folder_path, filename) = split_file_path(&entry.file_path);
            upserts.push(FileIndexUpsert {
                workbook_id: workbook_id.clone(),
                folder_path: folder_path.to_string(),
                filename: filename.to_string(),
                record_id,
            });
        }
        self.file_index.upsert_batch(&upserts)?;

        self.write_back(plan, Phase::Create, batch, &authoritative, cache).await
    }

    async fn dispatch_delete(
        &self,
        plan: &PublishPlan,
        table: &TableTarget,
        batch: &[PublishPlanEntry],
    ) -> Result<()> {
        let workbook_id = &plan.workbook_id;
        let id_field = table.spec.id_field();

        let filters: Vec<Value> = batch
            .iter()
            .filter_map(|entry| entry.remote_record_id.as_ref())
            .map(|record_id| {
                let mut filter = Map::new();
                filter.insert(id_field.to_string(), Value::String(record_id.clone()));
                Value::Object(filter)
            })
            .collect();
        if filters.is_empty() {
            debug!(table = %table.spec.name, entries = batch.len(), "Nothing to delete remotely");
        } else {
            table.connector.delete_records(&table.spec, &filters).await?;
        }

        let paths: Vec<String> = batch.iter().map(|e| e.file_path.clone()).collect();
        self.refs.delete_refs_for_sources(workbook_id, &paths)?;

        let mut by_folder: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for entry in batch {
            if let Some(record_id) = &entry.remote_record_id {
                let (folder_path, _) = split_file_path(&entry.file_path);
                by_folder
                    .entry(folder_path)
                    .or_default()
                    .push(record_id.clone());
            }
        }
        for (folder_path, record_ids) in by_folder {
            self.file_index
                .delete_by_record_ids(workbook_id, folder_path, &record_ids)?;
        }

        let message = commit_message(plan, Phase::Delete, paths.len());
        self.files
            .delete_files_from_branch(workbook_id, Branch::Main, &paths, &message)
            .await?;
        self.files
            .delete_files_from_branch(workbook_id, Branch::Dirty, &paths, &message)
            .await?;
        Ok(())
    }

    fn resolved_payloads(&self, workbook_id: &str, batch: &[PublishPlanEntry]) -> Result<Vec<Value>> {
        let mut records: Vec<Value> = batch
            .iter()
            .filter(|e| !e.raw)
            .map(|e| e.operation.clone())
            .collect();
        resolve_pseudo_refs(&self.file_index, workbook_id, &mut records)?;

        let mut records = records.into_iter();
        Ok(batch
            .iter()
            .map(|entry| {
                if entry.raw {
                    entry.operation.clone()
                } else {
                    records.next().unwrap_or(Value::Null)
                }
            })
            .collect())
    }

    /// Remote ids per file path: from the entry when the plan knew it, otherwise
    /// from the file index (records created earlier in this run).
    fn known_record_ids(&self, workbook_id: &str, batch: &[PublishPlanEntry]) -> Result<HashMap<String, String>> {
        let mut known = HashMap::new();
        let mut lookups = Vec::new();
        for entry in batch {
            match &entry.remote_record_id {
                Some(record_id) => {
                    known.insert(entry.file_path.clone(), record_id.clone());
                }
                None => {
                    let (folder_path, filename) = split_file_path(&entry.file_path);
                    lookups.push((folder_path.to_string(), filename.to_string()));
                }
            }
        }
        if lookups.is_empty() {
            return Ok(known);
        }

        let found = self.file_index.get_record_ids(workbook_id, &lookups)?;
        for entry in batch.iter().filter(|e| e.remote_record_id.is_none()) {
            let (folder_path, filename) = split_file_path(&entry.file_path);
            if let Some(record_id) = found.get(&lookup_key(folder_path, filename)) {
                known.insert(entry.file_path.clone(), record_id.clone());
            }
        }
        Ok(known)
    }

    async fn write_back(
        &self,
        plan: &PublishPlan,
        phase: Phase,
        batch: &[PublishPlanEntry],
        contents: &[Value],
        cache: &mut SchemaCache,
    ) -> Result<()> {
        let workbook_id = &plan.workbook_id;
        let mut records = Vec::new();
        let mut writes = Vec::with_capacity(batch.len());
        for (entry, content) in batch.iter().zip(contents) {
            if !entry.raw {
                records.push((entry.file_path.clone(), content.clone()));
            }
            writes.push(FileWrite {
                path: entry.file_path.clone(),
                content: render_content(content, entry.raw)?,
            });
        }

        self.refs
            .update_refs_for_files(cache, workbook_id, Branch::Main, &records, None)?;
        let message = commit_message(plan, phase, writes.len());
        self.files
            .commit_files_to_branch(workbook_id, Branch::Main, &writes, &message)
            .await?;

        self.sync_to_dirty_if_final(plan, phase, writes, records, cache)
            .await
    }

    async fn sync_to_dirty_if_final(
        &self,
        plan: &PublishPlan,
        phase: Phase,
        writes: Vec<FileWrite>,
        records: Vec<(String, Value)>,
        cache: &mut SchemaCache,
    ) -> Result<()> {
        let deferred: HashSet<String> = match phase {
            Phase::Backfill | Phase::Delete => HashSet::new(),
            Phase::Edit | Phase::Create => {
                let paths: Vec<String> = writes.iter().map(|w| w.path.clone()).collect();
                self.store.paths_with_pending_backfill(&plan.id, &paths)?
            }
        };

        let writes: Vec<FileWrite> = writes
            .into_iter()
            .filter(|w| !deferred.contains(&w.path))
            .collect();
        if writes.is_empty() {
            return Ok(());
        }
        let records: Vec<(String, Value)> = records
            .into_iter()
            .filter(|(path, _)| !deferred.contains(path))
            .collect();

        let message = commit_message(plan, phase, writes.len());
        self.files
            .commit_files_to_branch(&plan.workbook_id, Branch::Dirty, &writes, &message)
            .await?;
        self.refs
            .update_refs_for_files(cache, &plan.workbook_id, Branch::Dirty, &records, None)?;
        if !deferred.is_empty() {
            debug!(plan_id = %plan.id, deferred = deferred.len(), "Draft sync waits for backfill");
        }
        Ok(())
    }
}

fn commit_message(plan: &PublishPlan, phase: Phase, files: usize) -> String {
    format!("publish {}: {} {} file(s)", plan.id, phase.as_str(), files)
}

pub fn render_content(content: &Value, raw: bool) -> Result<String> {
    match content {
        Value::String(text) if raw => Ok(text.clone()),
        other => Ok(serde_json::to_string_pretty(other)?),
    }
}

fn strip_temp_id(payload: &mut Value, id_field: &str) {
    if let Value::Object(map) = payload {
        let is_temp = map
            .get(id_field)
            .and_then(Value::as_str)
            .is_some_and(|id| id.starts_with(TEMP_ID_PREFIX));
        if is_temp {
            map.remove(id_field);
        }
    }
}

fn record_id_of(content: &Value, id_field: &str) -> Option<String> {
    match content.get(id_field)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn temp_ids_are_removed_before_create() {
        let mut payload = json!({ "id": "scratch_temp_42", "name": "x" });
        strip_temp_id(&mut payload, "id");
        assert_eq!(payload, json!({ "name": "x" }));

        let mut real = json!({ "recordId": "rec_1" });
        strip_temp_id(&mut real, "recordId");
        assert_eq!(real, json!({ "recordId": "rec_1" }));
    }

    #[test]
    fn record_ids_accept_strings_and_numbers() {
        assert_eq!(record_id_of(&json!({ "id": "rec_1" }), "id").as_deref(), Some("rec_1"));
        assert_eq!(record_id_of(&json!({ "pk": 17 }), "pk").as_deref(), Some("17"));
        assert_eq!(record_id_of(&json!({ "id": "" }), "id"), None);
        assert_eq!(record_id_of(&json!("text"), "id"), None);
    }

    #[test]
    fn raw_content_is_written_verbatim() {
        assert_eq!(
            render_content(&Value::String("# notes".into()), true).expect("render"),
            "# notes"
        );
        assert_eq!(
            render_content(&json!({ "a": 1 }), false).expect("render"),
            "{\n  \"a\": 1\n}"
        );
    }
}
