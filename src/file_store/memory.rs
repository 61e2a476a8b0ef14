use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::VersionedFileStore;
use crate::models::{Branch, ChangeStatus, FileWrite, RepoChange, RepoFile};

#[derive(Debug, Default, Clone)]
struct Repo {
    main: BTreeMap<String, String>,
    dirty: BTreeMap<String, String>,
}

impl Repo {
    fn branch(&self, branch: Branch) -> &BTreeMap<String, String> {
        match branch {
            Branch::Main => &self.main,
            Branch::Dirty => &self.dirty,
        }
    }

    fn branch_mut(&mut self, branch: Branch) -> &mut BTreeMap<String, String> {
        match branch {
            Branch::Main => &mut self.main,
            Branch::Dirty => &mut self.dirty,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    repos: Mutex<HashMap<String, Repo>>,
    rebases: AtomicUsize,
    failing_commits: Mutex<BTreeSet<String>>,
}

impl InMemoryFileStore {
    fn with_repo<T>(&self, workbook_id: &str, f: impl FnOnce(&mut Repo) -> T) -> Result<T> {
        let mut repos = self
            .repos
            .lock()
            .map_err(|_| anyhow!("file store lock poisoned"))?;
        Ok(f(repos.entry(workbook_id.to_string()).or_default()))
    }

    pub fn seed_published(&self, workbook_id: &str, path: &str, content: &str) {
        self.with_repo(workbook_id, |repo| {
            repo.main.insert(path.to_string(), content.to_string());
            repo.dirty.insert(path.to_string(), content.to_string());
        })
        .expect("seed");
    }

    pub fn write_draft(&self, workbook_id: &str, path: &str, content: &str) {
        self.with_repo(workbook_id, |repo| {
            repo.dirty.insert(path.to_string(), content.to_string());
        })
        .expect("write draft");
    }

    pub fn delete_draft(&self, workbook_id: &str, path: &str) {
        self.with_repo(workbook_id, |repo| {
            repo.dirty.remove(path);
        })
        .expect("delete draft");
    }

    pub fn read(&self, workbook_id: &str, branch: Branch, path: &str) -> Option<String> {
        self.with_repo(workbook_id, |repo| repo.branch(branch).get(path).cloned())
            .expect("read")
    }

    pub fn rebase_count(&self) -> usize {
        self.rebases.load(Ordering::SeqCst)
    }

    /// Makes every commit that includes `path` fail.
    pub fn fail_commits_for(&self, path: &str) {
        self.failing_commits
            .lock()
            .expect("failing commits")
            .insert(path.to_string());
    }
}

#[async_trait]
impl VersionedFileStore for InMemoryFileStore {
    async fn get_repo_status(&self, workbook_id: &str) -> Result<Vec<RepoChange>> {
        self.with_repo(workbook_id, |repo| {
            let mut changes = Vec::new();
            for (path, content) in &repo.dirty {
                match repo.main.get(path) {
                    None => changes.push(RepoChange {
                        path: path.clone(),
                        status: ChangeStatus::Added,
                    }),
                    Some(published) if published != content => changes.push(RepoChange {
                        path: path.clone(),
                        status: ChangeStatus::Modified,
                    }),
                    Some(_) => {}
                }
            }
            for path in repo.main.keys() {
                if !repo.dirty.contains_key(path) {
                    changes.push(RepoChange {
                        path: path.clone(),
                        status: ChangeStatus::Deleted,
                    });
                }
            }
            changes.sort_by(|a, b| a.path.cmp(&b.path));
            changes
        })
    }

    async fn get_repo_file(
        &self,
        workbook_id: &str,
        branch: Branch,
        path: &str,
    ) -> Result<Option<String>> {
        self.with_repo(workbook_id, |repo| repo.branch(branch).get(path).cloned())
    }

    async fn read_repo_files_by_folder(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
    ) -> Result<Vec<RepoFile>> {
        self.with_repo(workbook_id, |repo| {
            paths
                .iter()
                .map(|path| RepoFile {
                    path: path.clone(),
                    content: repo.branch(branch).get(path).cloned(),
                })
                .collect()
        })
    }

    async fn commit_files_to_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        files: &[FileWrite],
        _message: &str,
    ) -> Result<()> {
        {
            let failing = self
                .failing_commits
                .lock()
                .map_err(|_| anyhow!("file store lock poisoned"))?;
            if let Some(file) = files.iter().find(|f| failing.contains(&f.path)) {
                return Err(anyhow!("commit rejected for {}", file.path));
            }
        }
        self.with_repo(workbook_id, |repo| {
            let target = repo.branch_mut(branch);
            for file in files {
                target.insert(file.path.clone(), file.content.clone());
            }
        })
    }

    async fn delete_files_from_branch(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
        _message: &str,
    ) -> Result<()> {
        self.with_repo(workbook_id, |repo| {
            let target = repo.branch_mut(branch);
            for path in paths {
                target.remove(path);
            }
        })
    }

    async fn rebase_dirty(&self, _workbook_id: &str) -> Result<()> {
        self.rebases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
