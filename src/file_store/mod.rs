#[cfg(test)]
pub mod memory;
mod scratch_git;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Branch, FileWrite, RepoChange, RepoFile};

pub use scratch_git::ScratchGitClient;

#[async_trait]
pub trait VersionedFileStore: Send + Sync {
    async fn get_repo_status(&self, workbook_id: &str) -> Result<Vec<RepoChange>>;

    async fn get_repo_file(
        &self,
        workbook_id: &str,
        branch: Branch,
        path: &str,
    ) -> Result<Option<String>>;

    /// Batched read; missing files come back with `content: None`.
    async fn read_repo_files_by_folder(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
    ) -> Result<Vec<RepoFile>>;

    async fn commit_files_to_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        files: &[FileWrite],
        message: &str,
    ) -> Result<()>;

    async fn delete_files_from_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
        message: &str,
    ) -> Result<()>;

    /// Replays the draft on top of the published branch so published changes
    /// drop out of the pending diff.
    async fn rebase_dirty(&self, workbook_id: &str) -> Result<()>;
}
