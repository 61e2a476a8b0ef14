use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{Connector, ConnectorResolver, TableSpec};
use crate::{
    error::PipelineError,
    folders::FolderStore,
    http_client::execute_curl_json,
    models::{ConnectorAccount, OperationKind},
};

#[derive(Debug, Clone)]
pub struct HttpConnector {
    account: ConnectorAccount,
    timeout_seconds: u64,
}

impl HttpConnector {
    pub fn new(account: ConnectorAccount, timeout_seconds: u64) -> Self {
        Self {
            account,
            timeout_seconds,
        }
    }

    fn records_url(&self, spec: &TableSpec, action: &str) -> String {
        format!(
            "{}/tables/{}/records/{action}",
            self.account.base_url.trim_end_matches('/'),
            spec.name
        )
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        execute_curl_json(
            "POST",
            url,
            Some(&self.account.api_key),
            Some(&body),
            self.timeout_seconds,
        )
        .await
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn create_records(&self, spec: &TableSpec, contents: &[Value]) -> Result<Vec<Value>> {
        let url = self.records_url(spec, "create");
        debug!(table = %spec.name, records = contents.len(), "Creating remote records");
        let response = self.post(&url, json!({ "records": contents })).await?;
        let records = response
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(records)
    }

    async fn update_records(&self, spec: &TableSpec, contents: &[Value]) -> Result<()> {
        let url = self.records_url(spec, "update");
        debug!(table = %spec.name, records = contents.len(), "Updating remote records");
        self.post(&url, json!({ "records": contents }))
            .await
            .with_context(|| format!("Update of {} records in {} failed", contents.len(), spec.name))?;
        Ok(())
    }

    async fn delete_records(&self, spec: &TableSpec, filters: &[Value]) -> Result<()> {
        let url = self.records_url(spec, "delete");
        debug!(table = %spec.name, records = filters.len(), "Deleting remote records");
        self.post(&url, json!({ "filters": filters }))
            .await
            .with_context(|| format!("Delete of {} records in {} failed", filters.len(), spec.name))?;
        Ok(())
    }

    fn batch_size(&self, kind: OperationKind) -> usize {
        let size = match kind {
            OperationKind::Create => self.account.create_batch_size,
            OperationKind::Update => self.account.update_batch_size,
            OperationKind::Delete => self.account.delete_batch_size,
        };
        size.max(1)
    }
}

#[derive(Clone)]
pub struct AccountConnectorResolver {
    folders: FolderStore,
    timeout_seconds: u64,
}

impl AccountConnectorResolver {
    pub fn new(folders: FolderStore, timeout_seconds: u64) -> Self {
        Self {
            folders,
            timeout_seconds,
        }
    }
}

#[async_trait]
impl ConnectorResolver for AccountConnectorResolver {
    async fn connector_for_account(&self, connector_account_id: &str) -> Result<Arc<dyn Connector>> {
        let account = self
            .folders
            .get_account(connector_account_id)?
            .ok_or_else(|| PipelineError::ConnectorAccountNotFound(connector_account_id.to_string()))?;
        Ok(Arc::new(HttpConnector::new(account, self.timeout_seconds)))
    }
}
