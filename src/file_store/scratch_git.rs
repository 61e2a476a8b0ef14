use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::VersionedFileStore;
use crate::{
    http_client::execute_curl_json,
    models::{Branch, FileWrite, RepoChange, RepoFile},
};

#[derive(Debug, Deserialize)]
struct StatusResponse {
    changes: Vec<RepoChange>,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    files: Vec<RepoFile>,
}

#[derive(Debug, Clone)]
pub struct ScratchGitClient {
    base_url: String,
    api_key: Option<String>,
    timeout_seconds: u64,
}

impl ScratchGitClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout_seconds: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_seconds,
        }
    }

    fn repo_url(&self, workbook_id: &str, suffix: &str) -> String {
        format!("{}/repos/{}/{}", self.base_url, workbook_id, suffix)
    }

    async fn call(&self, method: &str, url: &str, body: Option<&Value>) -> Result<Value> {
        execute_curl_json(
            method,
            url,
            self.api_key.as_deref(),
            body,
            self.timeout_seconds,
        )
        .await
    }
}

#[async_trait]
impl VersionedFileStore for ScratchGitClient {
    async fn get_repo_status(&self, workbook_id: &str) -> Result<Vec<RepoChange>> {
        let url = self.repo_url(workbook_id, "status");
        let response = self.call("GET", &url, None).await?;
        let parsed: StatusResponse = serde_json::from_value(response)
            .with_context(|| format!("Failed to decode repo status for {workbook_id}"))?;
        Ok(parsed.changes)
    }

    async fn get_repo_file(
        &self,
        workbook_id: &str,
        branch: Branch,
        path: &str,
    ) -> Result<Option<String>> {
        let files = self
            .read_repo_files_by_folder(workbook_id, branch, &[path.to_string()])
            .await?;
        Ok(files.into_iter().find(|f| f.path == path).and_then(|f| f.content))
    }

    async fn read_repo_files_by_folder(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
    ) -> Result<Vec<RepoFile>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.repo_url(workbook_id, &format!("branches/{}/read", branch.as_str()));
        let response = self
            .call("POST", &url, Some(&json!({ "paths": paths })))
            .await?;
        let parsed: ReadResponse = serde_json::from_value(response).with_context(|| {
            format!("Failed to decode {} file read for {workbook_id}", branch.as_str())
        })?;
        Ok(parsed.files)
    }

    async fn commit_files_to_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        files: &[FileWrite],
        message: &str,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let url = self.repo_url(workbook_id, &format!("branches/{}/commit", branch.as_str()));
        self.call(
            "POST",
            &url,
            Some(&json!({ "files": files, "message": message })),
        )
        .await
        .with_context(|| format!("Failed to commit {} files to {}", files.len(), branch.as_str()))?;
        Ok(())
    }

    async fn delete_files_from_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
        message: &str,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let url = self.repo_url(workbook_id, &format!("branches/{}/delete", branch.as_str()));
        self.call(
            "POST",
            &url,
            Some(&json!({ "paths": paths, "message": message })),
        )
        .await
        .with_context(|| format!("Failed to delete {} files from {}", paths.len(), branch.as_str()))?;
        Ok(())
    }

    async fn rebase_dirty(&self, workbook_id: &str) -> Result<()> {
        let url = self.repo_url(workbook_id, "rebase-dirty");
        self.call("POST", &url, None).await?;
        Ok(())
    }
}
