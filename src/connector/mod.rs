#[cfg(test)]
pub mod fake;
mod http;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{DataFolder, OperationKind};

pub use http::AccountConnectorResolver;

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub schema: Value,
    pub id_column_remote_id: Option<String>,
}

impl TableSpec {
    pub fn from_folder(folder: &DataFolder) -> Self {
        Self {
            name: folder.name.clone(),
            schema: folder.schema.clone(),
            id_column_remote_id: folder.id_column_remote_id.clone(),
        }
    }

    pub fn id_field(&self) -> &str {
        self.id_column_remote_id.as_deref().unwrap_or("id")
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Creates `contents` and returns the records as stored remotely, in order.
    /// An empty result means the service echoed nothing back.
    async fn create_records(&self, spec: &TableSpec, contents: &[Value]) -> Result<Vec<Value>>;

    async fn update_records(&self, spec: &TableSpec, contents: &[Value]) -> Result<()>;

    /// Each filter is `{ <idField>: <remote id> }`.
    async fn delete_records(&self, spec: &TableSpec, filters: &[Value]) -> Result<()>;

    fn batch_size(&self, kind: OperationKind) -> usize;
}

#[async_trait]
pub trait ConnectorResolver: Send + Sync {
    async fn connector_for_account(&self, connector_account_id: &str) -> Result<Arc<dyn Connector>>;
}
