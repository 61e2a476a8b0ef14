use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::store::PlanStore;
use crate::{
    error::PipelineError,
    file_index::{lookup_key, FileIndex},
    file_references::FileReferenceIndex,
    file_store::VersionedFileStore,
    folders::{normalize_folder_path, FolderStore},
    foreign_keys::ForeignKeyPath,
    models::{
        split_file_path, Branch, ChangeStatus, Phase, PhaseSummary, PlanStatus, PlannedEntry,
        PublishPlan, PublishPlanInfo, RefTarget, RepoChange,
    },
    ref_cleaner::{RefCleaner, StripMode},
    schema_resolver::{SchemaCache, SchemaResolver},
};

#[derive(Debug, Default)]
struct ChangeSet {
    modified: Vec<String>,
    added: Vec<String>,
    deleted: Vec<String>,
    /// Every deletion in the draft, including ones outside the connector scope.
    draft_deleted: HashSet<String>,
    /// Folder prefixes (`"path/"`) of the connector scope; `None` when unscoped.
    scope: Option<Vec<String>>,
}

impl ChangeSet {
    fn in_scope(&self, path: &str) -> bool {
        match &self.scope {
            None => true,
            Some(prefixes) => prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())),
        }
    }
}

#[derive(Debug, Default)]
struct DeletedTargets {
    paths: HashSet<String>,
    record_ids: HashSet<String>,
    record_by_path: HashMap<String, String>,
}

struct Stripped {
    /// Deleted targets removed; placeholders to records created in this plan kept.
    publishable_later: Value,
    /// Safe to send now.
    publishable_now: Value,
}

#[derive(Clone)]
pub struct PlanBuilder {
    store: PlanStore,
    files: Arc<dyn VersionedFileStore>,
    file_index: FileIndex,
    refs: FileReferenceIndex,
    schemas: SchemaResolver,
    folders: FolderStore,
    cleaner: RefCleaner,
}

impl PlanBuilder {
    pub fn new(
        store: PlanStore,
        files: Arc<dyn VersionedFileStore>,
        file_index: FileIndex,
        refs: FileReferenceIndex,
        schemas: SchemaResolver,
        folders: FolderStore,
    ) -> Self {
        let cleaner = RefCleaner::new(file_index.clone());
        Self {
            store,
            files,
            file_index,
            refs,
            schemas,
            folders,
            cleaner,
        }
    }

    pub async fn build_pipeline(
        &self,
        workbook_id: &str,
        user_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<PublishPlanInfo> {
        let plan = self
            .store
            .create_plan(workbook_id, user_id, connector_account_id)?;
        self.build_into(&plan).await
    }

    pub async fn build_existing(&self, plan_id: &str) -> Result<PublishPlanInfo> {
        let plan = self.store.get_plan(plan_id)?;
        if plan.status != PlanStatus::Planning {
            return Err(PipelineError::InvalidPlanState {
                plan_id: plan.id.clone(),
                action: "planned",
                status: plan.status.as_str().to_string(),
            }
            .into());
        }
        self.build_into(&plan).await
    }

    async fn build_into(&self, plan: &PublishPlan) -> Result<PublishPlanInfo> {
        let entries = match self
            .plan_entries(&plan.workbook_id, plan.connector_account_id.as_deref())
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(plan_id = %plan.id, error = %format!("{err:#}"), "Plan build failed");
                self.store
                    .set_status(&plan.id, PlanStatus::Failed, Some(&format!("{err:#}")))?;
                return Err(err);
            }
        };

        self.store.replace_entries(&plan.id, &entries)?;
        let phases = phase_summaries(&entries);
        self.store.finalize_plan(&plan.id, &phases)?;
        info!(
            plan_id = %plan.id,
            workbook_id = %plan.workbook_id,
            entries = entries.len(),
            "Publish plan built"
        );
        self.store.info(&plan.id)
    }

    pub async fn plan_entries(
        &self,
        workbook_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<Vec<PlannedEntry>> {
        let changes = self.scoped_changes(workbook_id, connector_account_id).await?;
        if changes.modified.is_empty() && changes.added.is_empty() && changes.deleted.is_empty() {
            return Ok(Vec::new());
        }

        let deleted = self.deleted_targets(workbook_id, &changes.deleted)?;
        let added_paths: HashSet<String> = changes.added.iter().cloned().collect();
        let candidates = self.ref_clearing_candidates(workbook_id, &changes, &deleted)?;

        let mut cache = SchemaCache::default();
        let mut edits = Vec::new();
        let mut backfills = Vec::new();

        let user_modified: HashSet<&str> = changes.modified.iter().map(String::as_str).collect();
        let edit_paths: Vec<String> = changes
            .modified
            .iter()
            .cloned()
            .chain(candidates.into_iter())
            .collect();
        let edit_contents = self.read_draft_or_published(workbook_id, &edit_paths).await?;
        let edit_record_ids = self.record_ids_for(workbook_id, &edit_paths)?;

        for path in &edit_paths {
            let modified = user_modified.contains(path.as_str());
            let Some(text) = edit_contents.get(path) else {
                warn!(workbook_id, path = %path, "File missing on both branches; skipping edit");
                continue;
            };
            let schema = self.schemas.for_file(&mut cache, workbook_id, path)?;
            let data_folder_id = schema.as_ref().map(|s| s.folder.id.clone());
            let remote_record_id = edit_record_ids.get(path).cloned();

            let content = match serde_json::from_str::<Value>(text) {
                Ok(content) => content,
                Err(err) if modified => {
                    debug!(path = %path, error = %err, "Passing non-JSON edit through unchanged");
                    edits.push(PlannedEntry {
                        file_path: path.clone(),
                        phase: Phase::Edit,
                        operation: Value::String(text.clone()),
                        raw: true,
                        remote_record_id,
                        data_folder_id,
                    });
                    continue;
                }
                Err(err) => {
                    debug!(path = %path, error = %err, "Skipping non-JSON reference holder");
                    continue;
                }
            };

            let foreign_keys = schema.as_ref().map(|s| s.foreign_keys.as_slice()).unwrap_or(&[]);
            let stripped =
                self.strip_two_pass(workbook_id, &content, foreign_keys, &deleted, &added_paths)?;
            let needs_backfill = stripped.publishable_now != stripped.publishable_later;

            if modified || stripped.publishable_later != content || needs_backfill {
                edits.push(PlannedEntry {
                    file_path: path.clone(),
                    phase: Phase::Edit,
                    operation: stripped.publishable_now,
                    raw: false,
                    remote_record_id: remote_record_id.clone(),
                    data_folder_id: data_folder_id.clone(),
                });
            }
            if needs_backfill {
                backfills.push(PlannedEntry {
                    file_path: path.clone(),
                    phase: Phase::Backfill,
                    operation: stripped.publishable_later,
                    raw: false,
                    remote_record_id,
                    data_folder_id,
                });
            }
        }

        let mut creates = Vec::new();
        let created_contents = self.read_branch(workbook_id, Branch::Dirty, &changes.added).await?;
        for path in &changes.added {
            let Some(text) = created_contents.get(path) else {
                warn!(workbook_id, path = %path, "Added file vanished from draft; skipping create");
                continue;
            };
            let schema = self.schemas.for_file(&mut cache, workbook_id, path)?;
            let data_folder_id = schema.as_ref().map(|s| s.folder.id.clone());

            let Ok(content) = serde_json::from_str::<Value>(text) else {
                debug!(path = %path, "Passing non-JSON create through unchanged");
                creates.push(PlannedEntry {
                    file_path: path.clone(),
                    phase: Phase::Create,
                    operation: Value::String(text.clone()),
                    raw: true,
                    remote_record_id: None,
                    data_folder_id,
                });
                continue;
            };

            let foreign_keys = schema.as_ref().map(|s| s.foreign_keys.as_slice()).unwrap_or(&[]);
            let stripped =
                self.strip_two_pass(workbook_id, &content, foreign_keys, &deleted, &added_paths)?;
            let needs_backfill = stripped.publishable_now != stripped.publishable_later;

            creates.push(PlannedEntry {
                file_path: path.clone(),
                phase: Phase::Create,
                operation: stripped.publishable_now,
                raw: false,
                remote_record_id: None,
                data_folder_id: data_folder_id.clone(),
            });
            if needs_backfill {
                backfills.push(PlannedEntry {
                    file_path: path.clone(),
                    phase: Phase::Backfill,
                    operation: stripped.publishable_later,
                    raw: false,
                    remote_record_id: None,
                    data_folder_id,
                });
            }
        }

        let mut deletes = Vec::with_capacity(changes.deleted.len());
        for path in &changes.deleted {
            let schema = self.schemas.for_file(&mut cache, workbook_id, path)?;
            deletes.push(PlannedEntry {
                file_path: path.clone(),
                phase: Phase::Delete,
                operation: json!({}),
                raw: false,
                remote_record_id: deleted.record_by_path.get(path).cloned(),
                data_folder_id: schema.as_ref().map(|s| s.folder.id.clone()),
            });
        }

        debug!(
            workbook_id,
            edits = edits.len(),
            creates = creates.len(),
            deletes = deletes.len(),
            backfills = backfills.len(),
            "Planned publish entries"
        );

        let mut entries = edits;
        entries.extend(creates);
        entries.extend(deletes);
        entries.extend(backfills);
        Ok(entries)
    }

    async fn scoped_changes(
        &self,
        workbook_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<ChangeSet> {
        let changes = self.files.get_repo_status(workbook_id).await?;
        let scope = match connector_account_id {
            None => None,
            Some(account) => {
                let prefixes: Vec<String> = self
                    .folders
                    .list_for_connector(workbook_id, account)?
                    .iter()
                    .map(|folder| normalize_folder_path(&folder.path))
                    .filter(|prefix| !prefix.is_empty())
                    .map(|prefix| format!("{prefix}/"))
                    .collect();
                if prefixes.is_empty() {
                    debug!(workbook_id, connector_account_id = account, "Connector owns no folders");
                    return Ok(ChangeSet::default());
                }
                Some(prefixes)
            }
        };

        let mut set = ChangeSet {
            scope,
            ..ChangeSet::default()
        };
        for change in changes {
            let path = change.path.trim_matches('/').to_string();
            if change.status == ChangeStatus::Deleted {
                set.draft_deleted.insert(path.clone());
            }
            if !set.in_scope(&path) {
                continue;
            }
            match change.status {
                ChangeStatus::Modified => set.modified.push(path),
                ChangeStatus::Added => set.added.push(path),
                ChangeStatus::Deleted => set.deleted.push(path),
            }
        }
        Ok(set)
    }

    fn deleted_targets(&self, workbook_id: &str, deleted: &[String]) -> Result<DeletedTargets> {
        let record_by_path = self.record_ids_for(workbook_id, deleted)?;
        Ok(DeletedTargets {
            paths: deleted.iter().cloned().collect(),
            record_ids: record_by_path.values().cloned().collect(),
            record_by_path,
        })
    }

    /// Files on either branch whose references a deletion breaks, that no other
    /// phase already covers, that the draft still keeps, and that sit inside
    /// the connector scope.
    fn ref_clearing_candidates(
        &self,
        workbook_id: &str,
        changes: &ChangeSet,
        deleted: &DeletedTargets,
    ) -> Result<BTreeSet<String>> {
        if changes.deleted.is_empty() {
            return Ok(BTreeSet::new());
        }

        let targets: Vec<RefTarget> = changes
            .deleted
            .iter()
            .map(|path| {
                let (folder_path, file_name) = split_file_path(path);
                RefTarget {
                    folder_path: folder_path.to_string(),
                    file_name: Some(file_name.to_string()),
                    record_id: deleted.record_by_path.get(path).cloned(),
                }
            })
            .collect();
        let sources =
            self.refs
                .find_refs_to_files(workbook_id, &targets, &[Branch::Main, Branch::Dirty])?;

        let covered: HashSet<&str> = changes
            .modified
            .iter()
            .chain(changes.added.iter())
            .chain(changes.deleted.iter())
            .map(String::as_str)
            .collect();
        let candidates: BTreeSet<String> = sources
            .into_iter()
            .map(|source| source.source_file_path.trim_matches('/').to_string())
            .filter(|path| !covered.contains(path.as_str()))
            .filter(|path| !changes.draft_deleted.contains(path))
            .filter(|path| changes.in_scope(path))
            .collect();
        if !candidates.is_empty() {
            debug!(workbook_id, candidates = candidates.len(), "Deletions cascade into unmodified files");
        }
        Ok(candidates)
    }

    fn strip_two_pass(
        &self,
        workbook_id: &str,
        content: &Value,
        foreign_keys: &[ForeignKeyPath],
        deleted: &DeletedTargets,
        added_paths: &HashSet<String>,
    ) -> Result<Stripped> {
        let publishable_later = self.cleaner.strip_references_with_schema(
            workbook_id,
            content,
            foreign_keys,
            &deleted.paths,
            &deleted.record_ids,
            StripMode::IdsOnly,
        )?;
        let publishable_now = self.cleaner.strip_references_with_schema(
            workbook_id,
            &publishable_later,
            foreign_keys,
            added_paths,
            &HashSet::new(),
            StripMode::PseudoOnly,
        )?;
        Ok(Stripped {
            publishable_later,
            publishable_now,
        })
    }

    fn record_ids_for(&self, workbook_id: &str, paths: &[String]) -> Result<HashMap<String, String>> {
        let lookups: Vec<(String, String)> = paths
            .iter()
            .map(|path| {
                let (folder, file) = split_file_path(path);
                (folder.to_string(), file.to_string())
            })
            .collect();
        let found = self.file_index.get_record_ids(workbook_id, &lookups)?;
        Ok(paths
            .iter()
            .filter_map(|path| {
                let (folder, file) = split_file_path(path);
                found
                    .get(&lookup_key(folder, file))
                    .map(|id| (path.clone(), id.clone()))
            })
            .collect())
    }

    async fn read_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
    ) -> Result<HashMap<String, String>> {
        let files = self
            .files
            .read_repo_files_by_folder(workbook_id, branch, paths)
            .await?;
        Ok(files
            .into_iter()
            .filter_map(|file| file.content.map(|content| (file.path.trim_matches('/').to_string(), content)))
            .collect())
    }

    async fn read_draft_or_published(
        &self,
        workbook_id: &str,
        paths: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut contents = self.read_branch(workbook_id, Branch::Dirty, paths).await?;
        let missing: Vec<String> = paths
            .iter()
            .filter(|path| !contents.contains_key(path.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            contents.extend(self.read_branch(workbook_id, Branch::Main, &missing).await?);
        }
        Ok(contents)
    }
}

fn phase_summaries(entries: &[PlannedEntry]) -> Vec<PhaseSummary> {
    [Phase::Edit, Phase::Create, Phase::Delete]
        .into_iter()
        .filter_map(|phase| {
            let record_count = entries.iter().filter(|e| e.phase == phase).count();
            (record_count > 0).then_some(PhaseSummary {
                phase,
                record_count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        db::Database,
        file_index::FileIndexUpsert,
        file_store::memory::InMemoryFileStore,
        models::{DataFolder, EntryStatus},
    };

    const WB: &str = "wb1";

    struct Fixture {
        files: Arc<InMemoryFileStore>,
        store: PlanStore,
        file_index: FileIndex,
        refs: FileReferenceIndex,
        folders: FolderStore,
        builder: PlanBuilder,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().expect("db");
        let files = Arc::new(InMemoryFileStore::default());
        let store = PlanStore::new(db.clone());
        let folders = FolderStore::new(db.clone());
        let schemas = SchemaResolver::new(folders.clone());
        let file_index = FileIndex::new(db.clone());
        let refs = FileReferenceIndex::new(db, schemas.clone());
        let builder = PlanBuilder::new(
            store.clone(),
            files.clone(),
            file_index.clone(),
            refs.clone(),
            schemas,
            folders.clone(),
        );
        folders
            .upsert_folder(&folder("fld_tags", "tags", "acct_1", json!({
                "type": "object",
                "properties": { "name": { "type": "string" } }
            })))
            .expect("tags");
        folders
            .upsert_folder(&folder("fld_authors", "authors", "acct_1", json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "tags": {
                        "type": "array",
                        "items": { "type": "string", "x-scratch-foreign-key": "fld_tags" }
                    },
                    "mentor": { "type": "string", "x-scratch-foreign-key": "fld_authors" }
                }
            })))
            .expect("authors");
        Fixture {
            files,
            store,
            file_index,
            refs,
            folders,
            builder,
        }
    }

    fn folder(id: &str, path: &str, account: &str, schema: Value) -> DataFolder {
        DataFolder {
            id: id.into(),
            workbook_id: WB.into(),
            name: path.into(),
            path: path.into(),
            connector_account_id: Some(account.into()),
            schema,
            id_column_remote_id: None,
        }
    }

    fn index(fx: &Fixture, folder_path: &str, filename: &str, record_id: &str) {
        fx.file_index
            .upsert_batch(&[FileIndexUpsert {
                workbook_id: WB.into(),
                folder_path: folder_path.into(),
                filename: filename.into(),
                record_id: record_id.into(),
            }])
            .expect("index");
    }

    fn index_refs(fx: &Fixture, branch: Branch, path: &str, content: &Value) {
        let mut cache = SchemaCache::default();
        fx.refs
            .update_refs_for_files(&mut cache, WB, branch, &[(path.to_string(), content.clone())], None)
            .expect("refs");
    }

    #[tokio::test]
    async fn deleting_a_tag_cascades_into_the_author_that_references_it() {
        let fx = fixture();
        let author = json!({ "name": "Ada", "tags": ["tag1Id", "tag2Id"] });
        fx.files.seed_published(WB, "authors/author1.json", &author.to_string());
        fx.files.seed_published(WB, "tags/tag1.json", r#"{"name":"one"}"#);
        fx.files.seed_published(WB, "tags/tag2.json", r#"{"name":"two"}"#);
        index(&fx, "authors", "author1.json", "author1Id");
        index(&fx, "tags", "tag1.json", "tag1Id");
        index(&fx, "tags", "tag2.json", "tag2Id");
        index_refs(&fx, Branch::Main, "authors/author1.json", &author);
        fx.files.delete_draft(WB, "tags/tag1.json");

        let info = fx.builder.build_pipeline(WB, "user1", None).await.expect("build");
        assert_eq!(info.plan.status, PlanStatus::Planned);

        let entries = fx.store.list_entries(&info.plan.id).expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase, Phase::Edit);
        assert_eq!(entries[0].file_path, "authors/author1.json");
        assert_eq!(entries[0].operation, json!({ "name": "Ada", "tags": ["tag2Id"] }));
        assert_eq!(entries[0].remote_record_id.as_deref(), Some("author1Id"));
        assert_eq!(entries[1].phase, Phase::Delete);
        assert_eq!(entries[1].file_path, "tags/tag1.json");
        assert_eq!(entries[1].remote_record_id.as_deref(), Some("tag1Id"));
        assert_eq!(entries[1].data_folder_id.as_deref(), Some("fld_tags"));
        assert!(entries.iter().all(|e| e.status == EntryStatus::Pending));

        assert_eq!(
            info.plan.phases,
            vec![
                PhaseSummary { phase: Phase::Edit, record_count: 1 },
                PhaseSummary { phase: Phase::Delete, record_count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn references_to_new_files_are_deferred_to_a_backfill() {
        let fx = fixture();
        fx.files.write_draft(WB, "tags/new.json", r#"{"name":"new"}"#);
        fx.files.write_draft(
            WB,
            "authors/fresh.json",
            &json!({ "name": "Grace", "tags": ["@/tags/new.json"], "mentor": "@/authors/gone.json" })
                .to_string(),
        );

        let entries = fx.builder.plan_entries(WB, None).await.expect("plan");
        let phases: Vec<(Phase, &str)> =
            entries.iter().map(|e| (e.phase, e.file_path.as_str())).collect();
        assert_eq!(
            phases,
            vec![
                (Phase::Create, "authors/fresh.json"),
                (Phase::Create, "tags/new.json"),
                (Phase::Backfill, "authors/fresh.json"),
            ]
        );
        // The dangling mentor placeholder never reaches the connector.
        assert_eq!(entries[0].operation, json!({ "name": "Grace", "tags": [], "mentor": null }));
        assert_eq!(
            entries[2].operation,
            json!({ "name": "Grace", "tags": ["@/tags/new.json"], "mentor": "@/authors/gone.json" })
        );
    }

    #[tokio::test]
    async fn modified_files_keep_backfills_for_placeholders_to_new_records() {
        let fx = fixture();
        fx.files.seed_published(WB, "authors/a.json", r#"{"name":"A","tags":[]}"#);
        index(&fx, "authors", "a.json", "aId");
        fx.files.write_draft(
            WB,
            "authors/a.json",
            &json!({ "name": "A", "tags": ["@/tags/t.json"] }).to_string(),
        );
        fx.files.write_draft(WB, "tags/t.json", r#"{"name":"t"}"#);

        let entries = fx.builder.plan_entries(WB, None).await.expect("plan");
        let edit = entries.iter().find(|e| e.phase == Phase::Edit).expect("edit");
        assert_eq!(edit.operation, json!({ "name": "A", "tags": [] }));
        let backfill = entries.iter().find(|e| e.phase == Phase::Backfill).expect("backfill");
        assert_eq!(backfill.operation["tags"], json!(["@/tags/t.json"]));
        assert_eq!(backfill.remote_record_id.as_deref(), Some("aId"));
        assert_eq!(entries.last().map(|e| e.phase), Some(Phase::Backfill));
    }

    #[tokio::test]
    async fn non_json_files_pass_through_only_when_user_modified() {
        let fx = fixture();
        fx.files.seed_published(WB, "authors/notes.md", "old");
        fx.files.write_draft(WB, "authors/notes.md", "# new notes");
        fx.files.seed_published(WB, "authors/broken.json", "{not json");
        fx.files.seed_published(WB, "tags/tag1.json", r#"{"name":"one"}"#);
        index(&fx, "tags", "tag1.json", "tag1Id");
        // A stale edge from a file that no longer parses.
        index_refs(&fx, Branch::Main, "authors/broken.json", &json!({ "tags": ["tag1Id"] }));
        fx.files.delete_draft(WB, "tags/tag1.json");

        let entries = fx.builder.plan_entries(WB, None).await.expect("plan");
        let edits: Vec<&PlannedEntry> = entries.iter().filter(|e| e.phase == Phase::Edit).collect();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].file_path, "authors/notes.md");
        assert!(edits[0].raw);
        assert_eq!(edits[0].operation, Value::String("# new notes".into()));
    }

    #[tokio::test]
    async fn connector_scope_limits_the_plan_to_its_folders() {
        let fx = fixture();
        fx.folders
            .upsert_folder(&folder("fld_a", "folder_a", "acct_a", json!({})))
            .expect("folder a");
        fx.folders
            .upsert_folder(&folder("fld_b", "folder_b", "acct_b", json!({})))
            .expect("folder b");
        fx.files.write_draft(WB, "folder_a/one.json", r#"{"n":1}"#);
        fx.files.write_draft(WB, "folder_b/two.json", r#"{"n":2}"#);
        fx.files.write_draft(WB, "folder_ab/three.json", r#"{"n":3}"#);

        let info = fx
            .builder
            .build_pipeline(WB, "user1", Some("acct_a"))
            .await
            .expect("build");
        let entries = fx.store.list_entries(&info.plan.id).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_path, "folder_a/one.json");
        assert_eq!(entries[0].data_folder_id.as_deref(), Some("fld_a"));

        let unowned = fx
            .builder
            .plan_entries(WB, Some("acct_without_folders"))
            .await
            .expect("plan");
        assert!(unowned.is_empty());
    }

    #[tokio::test]
    async fn rebuilding_an_existing_plan_requires_planning_status() {
        let fx = fixture();
        fx.files.write_draft(WB, "tags/new.json", r#"{"name":"new"}"#);
        let plan = fx.store.create_plan(WB, "user1", None).expect("plan");

        let info = fx.builder.build_existing(&plan.id).await.expect("build");
        assert_eq!(info.entry_counts.pending, 1);

        let err = fx.builder.build_existing(&plan.id).await.expect_err("already planned");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidPlanState { .. })
        ));
    }
    #[tokio::test]
    async fn scoped_cascades_skip_files_deleted_or_owned_elsewhere() {
        let fx = fixture();
        fx.folders
            .upsert_folder(&folder("fld_authors", "authors", "acct_2", json!({
                "type": "object",
                "properties": {
                    "tags": {
                        "type": "array",
                        "items": { "type": "string", "x-scratch-foreign-key": "fld_tags" }
                    }
                }
            })))
            .expect("authors");
        let author = json!({ "id": "author1Id", "name": "Ada", "tags": ["tag1Id"] });
        fx.files.seed_published(WB, "authors/author1.json", &author.to_string());
        fx.files.seed_published(WB, "authors/author2.json", &author.to_string());
        fx.files.seed_published(WB, "tags/tag1.json", r#"{"name":"one"}"#);
        index(&fx, "authors", "author1.json", "author1Id");
        index(&fx, "authors", "author2.json", "author2Id");
        index(&fx, "tags", "tag1.json", "tag1Id");
        index_refs(&fx, Branch::Main, "authors/author1.json", &author);
        index_refs(&fx, Branch::Main, "authors/author2.json", &author);
        fx.files.delete_draft(WB, "tags/tag1.json");
        fx.files.delete_draft(WB, "authors/author1.json");

        let scoped = fx.builder.plan_entries(WB, Some("acct_1")).await.expect("plan");
        let phases: Vec<(Phase, &str)> =
            scoped.iter().map(|e| (e.phase, e.file_path.as_str())).collect();
        assert_eq!(phases, vec![(Phase::Delete, "tags/tag1.json")]);

        let unscoped = fx.builder.plan_entries(WB, None).await.expect("plan");
        let phases: Vec<(Phase, &str)> =
            unscoped.iter().map(|e| (e.phase, e.file_path.as_str())).collect();
        assert_eq!(
            phases,
            vec![
                (Phase::Edit, "authors/author2.json"),
                (Phase::Delete, "authors/author1.json"),
                (Phase::Delete, "tags/tag1.json"),
            ]
        );
    }
}
