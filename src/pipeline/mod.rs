mod builder;
mod runner;
mod store;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::{
    connector::ConnectorResolver,
    db::Database,
    file_index::FileIndex,
    file_references::FileReferenceIndex,
    file_store::VersionedFileStore,
    folders::FolderStore,
    models::{Phase, PublishPlan, PublishPlanEntry, PublishPlanInfo},
    schema_resolver::SchemaResolver,
};

pub use builder::PlanBuilder;
pub use runner::PlanRunner;
pub use store::PlanStore;

#[derive(Clone)]
pub struct PublishPipeline {
    store: PlanStore,
    builder: PlanBuilder,
    runner: PlanRunner,
}

impl PublishPipeline {
    pub fn new(
        db: Database,
        files: Arc<dyn VersionedFileStore>,
        connectors: Arc<dyn ConnectorResolver>,
    ) -> Self {
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
            schemas.clone(),
            folders,
        );
        let runner = PlanRunner::new(store.clone(), files, file_index, refs, schemas, connectors);
        Self {
            store,
            builder,
            runner,
        }
    }

    pub async fn plan(
        &self,
        workbook_id: &str,
        user_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<PublishPlanInfo> {
        self.builder
            .build_pipeline(workbook_id, user_id, connector_account_id)
            .await
    }

    pub fn open_plan(
        &self,
        workbook_id: &str,
        user_id: &str,
        connector_account_id: Option<&str>,
    ) -> Result<PublishPlan> {
        self.store
            .create_plan(workbook_id, user_id, connector_account_id)
    }

    pub async fn build(&self, plan_id: &str) -> Result<PublishPlanInfo> {
        self.builder.build_existing(plan_id).await
    }

    pub async fn run(&self, plan_id: &str, phase: Option<Phase>) -> Result<PublishPlanInfo> {
        self.runner.run_pipeline(plan_id, phase).await
    }

    pub fn list(&self, workbook_id: &str, connector_account_id: Option<&str>) -> Result<Vec<PublishPlanInfo>> {
        self.store.list_plans(workbook_id, connector_account_id)
    }

    pub fn get(&self, plan_id: &str) -> Result<PublishPlanInfo> {
        self.store.info(plan_id)
    }

    pub fn entries(&self, plan_id: &str) -> Result<Vec<PublishPlanEntry>> {
        self.store.get_plan(plan_id)?;
        self.store.list_entries(plan_id)
    }

    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store.delete_finished_before(cutoff)
    }
}
