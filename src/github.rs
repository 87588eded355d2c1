//! GitHub-backed repository gateway
//!
//! Talks to the GitHub REST API directly with a per-project token. Reads go
//! through the contents API against the project's default branch; writes go
//! through git refs, the contents API and pulls.

use crate::config::ProjectConfig;
use crate::gateway::{
    DirEntry, FileContent, GatewayError, GatewayResult, RepoInfo, RepositoryGateway,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Method;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_BASE: &str = "https://api.github.com/";
const API_TIMEOUT_SECS: u64 = 60;
const USER_AGENT: &str = "feature-pilot";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.len() > MAX_ERROR_BODY_LEN {
        let mut end = MAX_ERROR_BODY_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }

    truncated
}

// ============================================================================
// Repository identifiers
// ============================================================================

/// Extract owner and repo from a GitHub remote URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo.git
/// - https://github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        return split_owner_repo(rest.trim_end_matches(".git"));
    }

    let parsed = Url::parse(url).ok()?;
    if parsed.host_str() != Some("github.com") {
        return None;
    }
    split_owner_repo(
        parsed
            .path()
            .trim_start_matches('/')
            .trim_end_matches('/')
            .trim_end_matches(".git"),
    )
}

/// Accepts `owner/repo` as well as any form [`parse_remote_url`] understands.
pub fn parse_repository(repository: &str) -> Option<(String, String)> {
    let repository = repository.trim();
    if repository.contains("github.com") {
        return parse_remote_url(repository);
    }
    if repository.contains(char::is_whitespace) || repository.contains(':') {
        return None;
    }
    split_owner_repo(repository)
}

fn split_owner_repo(path: &str) -> Option<(String, String)> {
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ContentsItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

/// The contents endpoint returns an array for directories and an object for files.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Directory(Vec<ContentsItem>),
    File(ContentsItem),
}

#[derive(Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

#[derive(Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(api_error) => {
            let detail = api_error
                .errors
                .first()
                .and_then(|e| e.message.clone())
                .unwrap_or_default();
            if detail.is_empty() {
                api_error.message
            } else {
                format!("{}: {}", api_error.message, detail)
            }
        }
        Err(_) => sanitize_error_body(body),
    }
}

/// Map a failed response onto the gateway error taxonomy.
///
/// `subject` is the file path or branch name the request was about.
fn map_api_error(status: u16, body: &str, subject: &str) -> GatewayError {
    let message = api_error_message(body);
    let lower = message.to_lowercase();
    match status {
        404 => GatewayError::NotFound {
            path: subject.to_string(),
        },
        409 => GatewayError::Conflict {
            path: subject.to_string(),
            message,
        },
        422 if lower.contains("reference already exists") => GatewayError::BranchExists {
            name: subject.to_string(),
        },
        422 if lower.contains("sha") => GatewayError::Conflict {
            path: subject.to_string(),
            message,
        },
        _ => GatewayError::Api { status, message },
    }
}

fn decode_content(path: &str, item: &ContentsItem) -> GatewayResult<String> {
    let encoded = match (&item.content, item.encoding.as_deref()) {
        (Some(content), Some("base64")) => content,
        (Some(content), None) if content.is_empty() => return Ok(String::new()),
        _ => {
            return Err(GatewayError::Decode {
                path: path.to_string(),
                message: "content not inlined by the contents API (file too large?)".to_string(),
            })
        }
    };

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| GatewayError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })?;
    String::from_utf8(bytes).map_err(|_| GatewayError::Decode {
        path: path.to_string(),
        message: "not valid UTF-8".to_string(),
    })
}

// ============================================================================
// Gateway
// ============================================================================

pub struct GitHubGateway {
    client: reqwest::Client,
    api_base: Url,
    owner: String,
    repo: String,
    token: String,
    default_branch: String,
}

impl GitHubGateway {
    pub fn new(project: &ProjectConfig) -> Result<Self> {
        let (owner, repo) = parse_repository(&project.repository).with_context(|| {
            format!(
                "Project '{}' has an unrecognised repository '{}' (expected owner/repo or a github.com URL)",
                project.name, project.repository
            )
        })?;
        let token = project
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .with_context(|| format!("No GitHub token configured for project '{}'", project.name))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        let api_base = Url::parse(API_BASE).context("Invalid GitHub API base URL")?;

        Ok(Self {
            client,
            api_base,
            owner,
            repo,
            token,
            default_branch: project.default_branch.clone(),
        })
    }

    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// `repos/{owner}/{repo}/<segments...>`, with every `/`-separated part of
    /// each segment percent-encoded on its own.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push("repos")
                .push(&self.owner)
                .push(&self.repo);
            for segment in segments {
                path.extend(segment.split('/').filter(|s| !s.is_empty()));
            }
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        subject: &str,
    ) -> GatewayResult<T> {
        debug!(method = %method, url = %url, "github request");
        let mut request = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            let text = resp.text().await?;
            serde_json::from_str(&text).map_err(|e| GatewayError::Decode {
                path: subject.to_string(),
                message: e.to_string(),
            })
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(map_api_error(status.as_u16(), &body, subject))
        }
    }

    async fn contents(&self, path: &str) -> GatewayResult<ContentsResponse> {
        let mut url = self.endpoint(&["contents", path]);
        url.query_pairs_mut().append_pair("ref", &self.default_branch);
        self.send(Method::GET, url, None, path).await
    }

    async fn put_contents(&self, path: &str, request: PutContentsRequest<'_>) -> GatewayResult<()> {
        let url = self.endpoint(&["contents", path]);
        let body = serde_json::to_value(&request).map_err(|e| GatewayError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let _: IgnoredAny = self.send(Method::PUT, url, Some(body), path).await?;
        Ok(())
    }
}

#[async_trait]
impl RepositoryGateway for GitHubGateway {
    fn default_branch(&self) -> &str {
        &self.default_branch
    }

    async fn read_file(&self, path: &str) -> GatewayResult<FileContent> {
        match self.contents(path).await? {
            ContentsResponse::File(item) if item.kind == "file" => Ok(FileContent {
                path: item.path.clone(),
                content: decode_content(path, &item)?,
                sha: item.sha,
            }),
            _ => Err(GatewayError::Decode {
                path: path.to_string(),
                message: "not a regular file".to_string(),
            }),
        }
    }

    async fn list_directory(&self, path: &str) -> GatewayResult<Vec<DirEntry>> {
        let items = match self.contents(path).await? {
            ContentsResponse::Directory(items) => items,
            ContentsResponse::File(item) => vec![item],
        };
        Ok(items
            .into_iter()
            .map(|item| DirEntry {
                is_dir: item.kind == "dir",
                path: item.path,
            })
            .collect())
    }

    async fn head_commit(&self, branch: &str) -> GatewayResult<String> {
        let url = self.endpoint(&["git", "ref", "heads", branch]);
        let reference: RefResponse = self.send(Method::GET, url, None, branch).await?;
        Ok(reference.object.sha)
    }

    async fn create_branch(&self, name: &str, from_sha: &str) -> GatewayResult<()> {
        let url = self.endpoint(&["git", "refs"]);
        let body = serde_json::to_value(CreateRefRequest {
            reference: format!("refs/heads/{}", name),
            sha: from_sha,
        })
        .map_err(|e| GatewayError::Decode {
            path: name.to_string(),
            message: e.to_string(),
        })?;
        let _: IgnoredAny = self.send(Method::POST, url, Some(body), name).await?;
        Ok(())
    }

    async fn create_file(
        &self,
        path: &str,
        message: &str,
        content: &str,
        branch: &str,
    ) -> GatewayResult<()> {
        self.put_contents(
            path,
            PutContentsRequest {
                message,
                content: STANDARD.encode(content),
                branch,
                sha: None,
            },
        )
        .await
    }

    async fn update_file(
        &self,
        path: &str,
        message: &str,
        content: &str,
        sha: &str,
        branch: &str,
    ) -> GatewayResult<()> {
        self.put_contents(
            path,
            PutContentsRequest {
                message,
                content: STANDARD.encode(content),
                branch,
                sha: Some(sha),
            },
        )
        .await
    }

    async fn open_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> GatewayResult<String> {
        let url = self.endpoint(&["pulls"]);
        let request = serde_json::to_value(CreatePrRequest {
            title,
            body,
            head,
            base,
        })
        .map_err(|e| GatewayError::Decode {
            path: head.to_string(),
            message: e.to_string(),
        })?;
        let pr: CreatePrResponse = self.send(Method::POST, url, Some(request), head).await?;
        Ok(pr.html_url)
    }

    async fn repository_info(&self) -> GatewayResult<RepoInfo> {
        let url = self.endpoint(&[]);
        let repo: RepoResponse = self.send(Method::GET, url, None, &self.repository()).await?;
        Ok(RepoInfo {
            name: repo.name,
            description: repo.description,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
