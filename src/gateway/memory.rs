//! In-memory repository gateway.
//!
//! Models branches as full file snapshots with per-file revisions, which is
//! enough to exercise branch collisions, sha preconditions and unreadable
//! directories. Used by the test suite, the benches and `apply --dry-run`.

use super::{
    DirEntry, FileContent, GatewayError, GatewayResult, RepoInfo, RepositoryGateway,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredFile {
    content: String,
    sha: String,
}

#[derive(Debug, Clone)]
struct Branch {
    head: String,
    files: BTreeMap<String, StoredFile>,
}

/// A pull request opened against the in-memory repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub url: String,
}

/// A commit made through `create_file` / `update_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub branch: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct State {
    branches: HashMap<String, Branch>,
    failing_dirs: HashSet<String>,
    pull_requests: Vec<RecordedPullRequest>,
    commits: Vec<RecordedCommit>,
}

#[derive(Debug)]
pub struct MemoryGateway {
    name: String,
    description: Option<String>,
    default_branch: String,
    state: Mutex<State>,
}

fn new_revision() -> String {
    Uuid::new_v4().simple().to_string()
}

impl MemoryGateway {
    pub fn new(default_branch: &str) -> Self {
        let mut state = State::default();
        state.branches.insert(
            default_branch.to_string(),
            Branch {
                head: new_revision(),
                files: BTreeMap::new(),
            },
        );
        Self {
            name: "memory".to_string(),
            description: None,
            default_branch: default_branch.to_string(),
            state: Mutex::new(state),
        }
    }

    pub fn with_name(mut self, name: &str, description: Option<&str>) -> Self {
        self.name = name.to_string();
        self.description = description.map(str::to_string);
        self
    }

    /// Seed a file on the default branch.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.put_file(path, content);
        self
    }

    /// Make `list_directory` fail for `path` (`""` is the root).
    pub fn with_failing_dir(self, path: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.failing_dirs.insert(path.to_string());
        }
        self
    }

    /// Write a file straight onto the default branch, bumping its revision
    /// and the branch head. Simulates a commit landing from elsewhere.
    pub fn put_file(&self, path: &str, content: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(branch) = state.branches.get_mut(&self.default_branch) {
                branch.files.insert(
                    path.to_string(),
                    StoredFile {
                        content: content.to_string(),
                        sha: new_revision(),
                    },
                );
                branch.head = new_revision();
            }
        }
    }

    /// Copy every readable file of another gateway's default branch.
    pub async fn snapshot_of(source: &dyn RepositoryGateway) -> Self {
        let snapshot = Self::new(source.default_branch());
        let listing = source.list_all_files("").await;
        for path in listing.files {
            if let Ok(file) = source.read_file(&path).await {
                snapshot.put_file(&path, &file.content);
            }
        }
        snapshot
    }

    pub fn file_on_branch(&self, branch: &str, path: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .branches
            .get(branch)
            .and_then(|b| b.files.get(path))
            .map(|f| f.content.clone())
    }

    pub fn branch_names(&self) -> Vec<String> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = state.branches.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pull_requests(&self) -> Vec<RecordedPullRequest> {
        self.state
            .lock()
            .map(|s| s.pull_requests.clone())
            .unwrap_or_default()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state
            .lock()
            .map(|s| s.commits.clone())
            .unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> GatewayResult<T>) -> GatewayResult<T> {
        let mut state = self.state.lock().map_err(|_| GatewayError::Api {
            status: 500,
            message: "in-memory repository state poisoned".to_string(),
        })?;
        f(&mut state)
    }

    fn write(
        &self,
        path: &str,
        message: &str,
        content: &str,
        expected_sha: Option<&str>,
        branch: &str,
    ) -> GatewayResult<()> {
        self.with_state(|state| {
            let target = state
                .branches
                .get_mut(branch)
                .ok_or_else(|| GatewayError::NotFound {
                    path: format!("branch {}", branch),
                })?;

            match (expected_sha, target.files.get(path)) {
                (None, Some(_)) => {
                    return Err(GatewayError::Conflict {
                        path: path.to_string(),
                        message: "file already exists".to_string(),
                    })
                }
                (Some(_), None) => {
                    return Err(GatewayError::NotFound {
                        path: path.to_string(),
                    })
                }
                (Some(expected), Some(current)) if current.sha != expected => {
                    return Err(GatewayError::Conflict {
                        path: path.to_string(),
                        message: format!("{} does not match {}", expected, current.sha),
                    })
                }
                _ => {}
            }

            target.files.insert(
                path.to_string(),
                StoredFile {
                    content: content.to_string(),
                    sha: new_revision(),
                },
            );
            target.head = new_revision();
            state.commits.push(RecordedCommit {
                branch: branch.to_string(),
                path: path.to_string(),
                message: message.to_string(),
            });
            Ok(())
        })
    }
}

#[async_trait]
impl RepositoryGateway for MemoryGateway {
    fn default_branch(&self) -> &str {
        &self.default_branch
    }

    async fn read_file(&self, path: &str) -> GatewayResult<FileContent> {
        let default_branch = self.default_branch.clone();
        self.with_state(|state| {
            state
                .branches
                .get(&default_branch)
                .and_then(|b| b.files.get(path))
                .map(|f| FileContent {
                    path: path.to_string(),
                    content: f.content.clone(),
                    sha: f.sha.clone(),
                })
                .ok_or_else(|| GatewayError::NotFound {
                    path: path.to_string(),
                })
        })
    }

    async fn list_directory(&self, path: &str) -> GatewayResult<Vec<DirEntry>> {
        let default_branch = self.default_branch.clone();
        self.with_state(|state| {
            if state.failing_dirs.contains(path) {
                return Err(GatewayError::Api {
                    status: 403,
                    message: format!("permission denied listing {}", path),
                });
            }

            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{}/", path.trim_end_matches('/'))
            };

            let mut entries = BTreeMap::new();
            if let Some(branch) = state.branches.get(&default_branch) {
                for file_path in branch.files.keys() {
                    let Some(rest) = file_path.strip_prefix(&prefix) else {
                        continue;
                    };
                    match rest.split_once('/') {
                        Some((dir, _)) => {
                            entries.entry(dir.to_string()).or_insert_with(|| DirEntry {
                                path: format!("{}{}", prefix, dir),
                                is_dir: true,
                            });
                        }
                        None => {
                            entries.insert(
                                rest.to_string(),
                                DirEntry {
                                    path: file_path.clone(),
                                    is_dir: false,
                                },
                            );
                        }
                    }
                }
            }

            if entries.is_empty() && !path.is_empty() {
                return Err(GatewayError::NotFound {
                    path: path.to_string(),
                });
            }
            Ok(entries.into_values().collect())
        })
    }

    async fn head_commit(&self, branch: &str) -> GatewayResult<String> {
        self.with_state(|state| {
            state
                .branches
                .get(branch)
                .map(|b| b.head.clone())
                .ok_or_else(|| GatewayError::NotFound {
                    path: format!("branch {}", branch),
                })
        })
    }

    async fn create_branch(&self, name: &str, from_sha: &str) -> GatewayResult<()> {
        self.with_state(|state| {
            if state.branches.contains_key(name) {
                return Err(GatewayError::BranchExists {
                    name: name.to_string(),
                });
            }
            let source = state
                .branches
                .values()
                .find(|b| b.head == from_sha)
                .cloned()
                .ok_or_else(|| GatewayError::Api {
                    status: 422,
                    message: format!("Object does not exist: {}", from_sha),
                })?;
            state.branches.insert(name.to_string(), source);
            Ok(())
        })
    }

    async fn create_file(
        &self,
        path: &str,
        message: &str,
        content: &str,
        branch: &str,
    ) -> GatewayResult<()> {
        self.write(path, message, content, None, branch)
    }

    async fn update_file(
        &self,
        path: &str,
        message: &str,
        content: &str,
        sha: &str,
        branch: &str,
    ) -> GatewayResult<()> {
        self.write(path, message, content, Some(sha), branch)
    }

    async fn open_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> GatewayResult<String> {
        let name = self.name.clone();
        self.with_state(|state| {
            if !state.branches.contains_key(head) {
                return Err(GatewayError::Api {
                    status: 422,
                    message: format!("head branch {} does not exist", head),
                });
            }
            let number = state.pull_requests.len() as u64 + 1;
            let url = format!("https://git.invalid/{}/pull/{}", name, number);
            state.pull_requests.push(RecordedPullRequest {
                number,
                title: title.to_string(),
                body: body.to_string(),
                head: head.to_string(),
                base: base.to_string(),
                url: url.clone(),
            });
            Ok(url)
        })
    }

    async fn repository_info(&self) -> GatewayResult<RepoInfo> {
        Ok(RepoInfo {
            name: self.name.clone(),
            description: self.description.clone(),
        })
    }
}
