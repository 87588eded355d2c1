//! Repository gateway
//!
//! A narrow capability over a hosted source repository. Reads are always made
//! against the default branch fixed at construction time; writes name their
//! target branch explicitly.
//!
//! Recursive listing is best-effort: directories that cannot be listed are
//! skipped and reported in a [`TraversalReport`] instead of aborting the walk.

pub mod memory;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use memory::MemoryGateway;

/// Errors surfaced by a repository gateway.
///
/// Callers only branch on [`GatewayError::is_not_found`]; every other variant
/// is reported to the user with its message intact.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{path} not found")]
    NotFound { path: String },

    #[error("conflict updating {path}: {message}")]
    Conflict { path: String, message: String },

    #[error("branch {name} already exists")]
    BranchExists { name: String },

    #[error("repository API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not decode {path}: {message}")]
    Decode { path: String, message: String },
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Decoded file content plus the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    /// Blob revision; passed back to `update_file` as the concurrency precondition.
    pub sha: String,
}

/// One entry of a single-level directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub name: String,
    pub description: Option<String>,
}

/// A directory the recursive listing could not descend into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDirectory {
    pub path: String,
    pub reason: String,
}

/// Result of a best-effort recursive listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraversalReport {
    /// Readable file paths in depth-first order.
    pub files: Vec<String>,
    pub skipped: Vec<SkippedDirectory>,
}

impl TraversalReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

#[async_trait]
pub trait RepositoryGateway: Send + Sync {
    /// Branch all reads and new branches are relative to.
    fn default_branch(&self) -> &str;

    async fn read_file(&self, path: &str) -> GatewayResult<FileContent>;

    /// List one directory level. `""` is the repository root.
    async fn list_directory(&self, path: &str) -> GatewayResult<Vec<DirEntry>>;

    async fn head_commit(&self, branch: &str) -> GatewayResult<String>;

    async fn create_branch(&self, name: &str, from_sha: &str) -> GatewayResult<()>;

    async fn create_file(
        &self,
        path: &str,
        message: &str,
        content: &str,
        branch: &str,
    ) -> GatewayResult<()>;

    /// Update an existing file. Fails with [`GatewayError::Conflict`] when
    /// `sha` is no longer the file's current revision on `branch`.
    async fn update_file(
        &self,
        path: &str,
        message: &str,
        content: &str,
        sha: &str,
        branch: &str,
    ) -> GatewayResult<()>;

    /// Returns the pull request's web URL.
    async fn open_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> GatewayResult<String>;

    async fn repository_info(&self) -> GatewayResult<RepoInfo>;

    /// Recursively list every readable file below `path`, depth first.
    ///
    /// Directories that fail to list are recorded in the report and logged,
    /// and the walk continues with their siblings.
    async fn list_all_files(&self, path: &str) -> TraversalReport {
        let mut report = TraversalReport::default();

        let root = match self.list_directory(path).await {
            Ok(entries) => entries,
            Err(err) => {
                record_skip(&mut report, path, &err);
                return report;
            }
        };

        let mut stack = vec![root.into_iter()];
        while let Some(level) = stack.last_mut() {
            let Some(entry) = level.next() else {
                stack.pop();
                continue;
            };

            if !entry.is_dir {
                report.files.push(entry.path);
                continue;
            }

            match self.list_directory(&entry.path).await {
                Ok(children) => stack.push(children.into_iter()),
                Err(err) => record_skip(&mut report, &entry.path, &err),
            }
        }

        report
    }

    /// First file (in traversal order) whose content contains `snippet`.
    ///
    /// Reads every file in the worst case; only meant as a fallback locator.
    async fn find_file_containing(&self, snippet: &str) -> Option<String> {
        if snippet.is_empty() {
            return None;
        }

        let listing = self.list_all_files("").await;
        for path in listing.files {
            match self.read_file(&path).await {
                Ok(file) if file.content.contains(snippet) => return Some(path),
                Ok(_) => {}
                Err(err) => debug!(path = %path, error = %err, "skipping unreadable file"),
            }
        }
        None
    }
}

fn record_skip(report: &mut TraversalReport, path: &str, err: &GatewayError) {
    let shown = if path.is_empty() { "/" } else { path };
    warn!(path = %shown, error = %err, "skipping directory during repository walk");
    report.skipped.push(SkippedDirectory {
        path: shown.to_string(),
        reason: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryGateway {
        MemoryGateway::new("main")
            .with_file("README.md", "# demo\n")
            .with_file("src/app/page.tsx", "export default function Page() {}\n")
            .with_file("src/app/layout.tsx", "<html><head></head><body>{children}</body></html>\n")
            .with_file("src/index.html", "<h1>Welcome</h1>\n")
            .with_file("public/logo.svg", "<svg/>\n")
    }

    #[tokio::test]
    async fn test_list_all_files_is_depth_first() {
        let gateway = sample();
        let report = gateway.list_all_files("").await;
        assert_eq!(
            report.files,
            vec![
                "README.md",
                "public/logo.svg",
                "src/app/layout.tsx",
                "src/app/page.tsx",
                "src/index.html",
            ]
        );
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_list_all_files_skips_failing_directories() {
        let gateway = sample().with_failing_dir("src/app");
        let report = gateway.list_all_files("").await;

        assert_eq!(
            report.files,
            vec!["README.md", "public/logo.svg", "src/index.html"]
        );
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, "src/app");
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_list_all_files_reports_unreadable_root() {
        let gateway = sample().with_failing_dir("");
        let report = gateway.list_all_files("").await;
        assert!(report.files.is_empty());
        assert_eq!(report.skipped[0].path, "/");
    }

    #[tokio::test]
    async fn test_list_all_files_from_subdirectory() {
        let gateway = sample();
        let report = gateway.list_all_files("src").await;
        assert_eq!(
            report.files,
            vec!["src/app/layout.tsx", "src/app/page.tsx", "src/index.html"]
        );
    }

    #[tokio::test]
    async fn test_find_file_containing_first_match_in_traversal_order() {
        let gateway = MemoryGateway::new("main")
            .with_file("a/nav.html", "<ul class=\"nav\"></ul>")
            .with_file("b/nav.html", "<ul class=\"nav\"></ul>");

        let found = gateway.find_file_containing("class=\"nav\"").await;
        assert_eq!(found.as_deref(), Some("a/nav.html"));
    }

    #[tokio::test]
    async fn test_find_file_containing_none_when_absent() {
        let gateway = sample();
        assert_eq!(gateway.find_file_containing("<footer>").await, None);
    }

    #[tokio::test]
    async fn test_find_file_containing_ignores_empty_snippet() {
        let gateway = sample();
        assert_eq!(gateway.find_file_containing("").await, None);
    }

    #[test]
    fn test_only_not_found_is_distinguished() {
        let missing = GatewayError::NotFound {
            path: "x".to_string(),
        };
        let api = GatewayError::Api {
            status: 500,
            message: "boom".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(!api.is_not_found());
        assert_eq!(api.to_string(), "repository API error (500): boom");
    }
}
