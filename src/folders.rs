use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use crate::{
    db::Database,
    models::{ConnectorAccount, DataFolder},
};

pub fn normalize_folder_path(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}

#[derive(Clone)]
pub struct FolderStore {
    db: Database,
}

const FOLDER_COLUMNS: &str =
    "id,workbook_id,name,path,connector_account_id,schema_json,id_column_remote_id";

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<DataFolder> {
    let schema_json: String = row.get(5)?;
    Ok(DataFolder {
        id: row.get(0)?,
        workbook_id: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        connector_account_id: row.get(4)?,
        schema: serde_json::from_str(&schema_json).unwrap_or(Value::Null),
        id_column_remote_id: row.get(6)?,
    })
}

impl FolderStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn upsert_folder(&self, folder: &DataFolder) -> Result<()> {
        let path = normalize_folder_path(&folder.path);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO data_folders(id,workbook_id,name,path,connector_account_id,schema_json,id_column_remote_id)
                 VALUES(?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(id) DO UPDATE SET workbook_id=excluded.workbook_id, name=excluded.name, path=excluded.path,
                   connector_account_id=excluded.connector_account_id, schema_json=excluded.schema_json,
                   id_column_remote_id=excluded.id_column_remote_id",
                params![
                    folder.id,
                    folder.workbook_id,
                    folder.name,
                    path,
                    folder.connector_account_id,
                    folder.schema.to_string(),
                    folder.id_column_remote_id
                ],
            )
            .with_context(|| format!("Failed saving data folder {}", folder.id))?;
            Ok(())
        })
    }

    pub fn get_folder(&self, folder_id: &str) -> Result<Option<DataFolder>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {FOLDER_COLUMNS} FROM data_folders WHERE id=?1"),
                    params![folder_id],
                    folder_from_row,
                )
                .optional()?)
        })
    }

    pub fn find_by_path(&self, workbook_id: &str, folder_path: &str) -> Result<Option<DataFolder>> {
        let path = normalize_folder_path(folder_path);
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {FOLDER_COLUMNS} FROM data_folders WHERE workbook_id=?1 AND path=?2"),
                    params![workbook_id, path],
                    folder_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_for_connector(
        &self,
        workbook_id: &str,
        connector_account_id: &str,
    ) -> Result<Vec<DataFolder>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FOLDER_COLUMNS} FROM data_folders WHERE workbook_id=?1 AND connector_account_id=?2 ORDER BY path"
            ))?;
            let rows = stmt.query_map(params![workbook_id, connector_account_id], folder_from_row)?;
            let mut folders = Vec::new();
            for row in rows {
                folders.push(row?);
            }
            Ok(folders)
        })
    }

    pub fn remove_folder(&self, workbook_id: &str, folder_id: &str) -> Result<Option<DataFolder>> {
        let Some(folder) = self.get_folder(folder_id)?.filter(|f| f.workbook_id == workbook_id) else {
            return Ok(None);
        };
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM data_folders WHERE id=?1", params![folder_id])?;
            Ok(())
        })?;
        Ok(Some(folder))
    }

    pub fn upsert_account(&self, account: &ConnectorAccount) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connector_accounts(id,service,base_url,api_key,create_batch_size,update_batch_size,delete_batch_size)
                 VALUES(?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(id) DO UPDATE SET service=excluded.service, base_url=excluded.base_url, api_key=excluded.api_key,
                   create_batch_size=excluded.create_batch_size, update_batch_size=excluded.update_batch_size,
                   delete_batch_size=excluded.delete_batch_size",
                params![
                    account.id,
                    account.service,
                    account.base_url,
                    account.api_key,
                    account.create_batch_size as i64,
                    account.update_batch_size as i64,
                    account.delete_batch_size as i64
                ],
            )
            .with_context(|| format!("Failed saving connector account {}", account.id))?;
            Ok(())
        })
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<ConnectorAccount>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id,service,base_url,api_key,create_batch_size,update_batch_size,delete_batch_size
                     FROM connector_accounts WHERE id=?1",
                    params![account_id],
                    |row| {
                        Ok(ConnectorAccount {
                            id: row.get(0)?,
                            service: row.get(1)?,
                            base_url: row.get(2)?,
                            api_key: row.get(3)?,
                            create_batch_size: row.get::<_, i64>(4)?.max(1) as usize,
                            update_batch_size: row.get::<_, i64>(5)?.max(1) as usize,
                            delete_batch_size: row.get::<_, i64>(6)?.max(1) as usize,
                        })
                    },
                )
                .optional()?)
        })
    }
}
