use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{Connector, ConnectorResolver, TableSpec};
use crate::models::OperationKind;

/// Records carrying `"poison": true` make the whole call fail.
pub const POISON_FIELD: &str = "poison";

#[derive(Debug, Clone)]
pub struct ConnectorCall {
    pub kind: OperationKind,
    pub table: String,
    pub records: Vec<Value>,
}

#[derive(Debug)]
pub struct FakeConnector {
    calls: Mutex<Vec<ConnectorCall>>,
    next_id: AtomicUsize,
    batch_size: usize,
    echo_created: bool,
}

impl FakeConnector {
    pub fn new(batch_size: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            batch_size,
            echo_created: true,
        }
    }

    /// Create calls return nothing, so the sent payload has to stand in.
    pub fn without_create_echo(mut self) -> Self {
        self.echo_created = false;
        self
    }

    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_of(&self, kind: OperationKind) -> Vec<ConnectorCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    fn record(&self, kind: OperationKind, spec: &TableSpec, records: &[Value]) -> Result<()> {
        self.calls.lock().expect("calls").push(ConnectorCall {
            kind,
            table: spec.name.clone(),
            records: records.to_vec(),
        });
        if records
            .iter()
            .any(|r| r.get(POISON_FIELD).and_then(Value::as_bool).unwrap_or(false))
        {
            return Err(anyhow!("remote rejected a poisoned record"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn create_records(&self, spec: &TableSpec, contents: &[Value]) -> Result<Vec<Value>> {
        self.record(OperationKind::Create, spec, contents)?;
        let mut created = Vec::with_capacity(contents.len());
        for content in contents {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut record = content.clone();
            if let Value::Object(map) = &mut record {
                map.insert(spec.id_field().to_string(), Value::String(format!("rec_{id}")));
            }
            created.push(record);
        }
        if self.echo_created {
            Ok(created)
        } else {
            Ok(Vec::new())
        }
    }

    async fn update_records(&self, spec: &TableSpec, contents: &[Value]) -> Result<()> {
        self.record(OperationKind::Update, spec, contents)
    }

    async fn delete_records(&self, spec: &TableSpec, filters: &[Value]) -> Result<()> {
        self.record(OperationKind::Delete, spec, filters)
    }

    fn batch_size(&self, _kind: OperationKind) -> usize {
        self.batch_size
    }
}

pub struct FakeResolver {
    pub connector: Arc<FakeConnector>,
    pub unavailable: bool,
}

#[async_trait]
impl ConnectorResolver for FakeResolver {
    async fn connector_for_account(&self, connector_account_id: &str) -> Result<Arc<dyn Connector>> {
        if self.unavailable {
            return Err(anyhow!("credentials for {connector_account_id} could not be loaded"));
        }
        Ok(self.connector.clone())
    }
}
