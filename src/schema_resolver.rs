use std::{collections::HashMap, sync::Arc};

use anyhow::Result;

use crate::{
    folders::{normalize_folder_path, FolderStore},
    foreign_keys::{extract_foreign_keys, ForeignKeyPath},
    models::{split_file_path, DataFolder},
};

#[derive(Debug)]
pub struct ResolvedSchema {
    pub folder: DataFolder,
    pub foreign_keys: Vec<ForeignKeyPath>,
}

/// Lookups memoized for a single plan build or run. Misses are cached too.
#[derive(Debug, Default)]
pub struct SchemaCache {
    by_path: HashMap<(String, String), Option<Arc<ResolvedSchema>>>,
    by_id: HashMap<String, Option<Arc<ResolvedSchema>>>,
}

#[derive(Clone)]
pub struct SchemaResolver {
    folders: FolderStore,
}

impl SchemaResolver {
    pub fn new(folders: FolderStore) -> Self {
        Self { folders }
    }

    pub fn for_folder_path(
        &self,
        cache: &mut SchemaCache,
        workbook_id: &str,
        folder_path: &str,
    ) -> Result<Option<Arc<ResolvedSchema>>> {
        let key = (workbook_id.to_string(), normalize_folder_path(folder_path));
        if let Some(hit) = cache.by_path.get(&key) {
            return Ok(hit.clone());
        }

        let resolved = self
            .folders
            .find_by_path(workbook_id, &key.1)?
            .map(|folder| Arc::new(resolve(folder)));
        if let Some(schema) = &resolved {
            cache
                .by_id
                .insert(schema.folder.id.clone(), Some(schema.clone()));
        }
        cache.by_path.insert(key, resolved.clone());
        Ok(resolved)
    }

    pub fn for_file(
        &self,
        cache: &mut SchemaCache,
        workbook_id: &str,
        file_path: &str,
    ) -> Result<Option<Arc<ResolvedSchema>>> {
        let (folder_path, _) = split_file_path(file_path);
        self.for_folder_path(cache, workbook_id, folder_path)
    }

    pub fn for_folder_id(
        &self,
        cache: &mut SchemaCache,
        folder_id: &str,
    ) -> Result<Option<Arc<ResolvedSchema>>> {
        if let Some(hit) = cache.by_id.get(folder_id) {
            return Ok(hit.clone());
        }

        let resolved = self
            .folders
            .get_folder(folder_id)?
            .map(|folder| Arc::new(resolve(folder)));
        if let Some(schema) = &resolved {
            cache.by_path.insert(
                (schema.folder.workbook_id.clone(), schema.folder.path.clone()),
                Some(schema.clone()),
            );
        }
        cache.by_id.insert(folder_id.to_string(), resolved.clone());
        Ok(resolved)
    }
}

fn resolve(folder: DataFolder) -> ResolvedSchema {
    let foreign_keys = extract_foreign_keys(&folder.schema);
    ResolvedSchema {
        folder,
        foreign_keys,
    }
}
