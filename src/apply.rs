//! Change application
//!
//! Applies the items of a [`ChangeProposal`] one at a time. Each item gets
//! its own branch cut from the default branch head, one commit and one pull
//! request. Items never affect each other: a failure is recorded as that
//! item's outcome and the batch moves on.

use crate::gateway::{GatewayError, RepositoryGateway};
use crate::proposal::{ChangeItem, ChangeProposal, ChangeType};
use crate::util::{fnv1a, truncate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BRANCH_PREFIX: &str = "ai-feedback";
const MAX_BRANCH_ATTEMPTS: usize = 3;
const MAX_TITLE_CHARS: usize = 200;

// ═══════════════════════════════════════════════════════════════════════════
//  CONTENT TRANSFORMATION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("line {line} is out of range (file has {len} lines)")]
    LineOutOfRange { line: i64, len: usize },

    #[error("no line number and no current code to locate the change")]
    MissingAnchor,

    #[error("current code not found in file")]
    AnchorNotFound,
}

/// Compute a file's new content for one edit.
///
/// With a line number the file is split into lines on its own terminator
/// (`\r\n` when the file uses it, `\n` otherwise; a trailing terminator is
/// kept as is): `add` inserts before that line (one past the last
/// line appends), `modify` replaces it and `delete` removes it. Without a line
/// number `add` appends a trailing line, while `modify` and `delete` replace
/// every occurrence of the anchor text.
pub fn compute_new_content(
    content: &str,
    kind: ChangeType,
    line_number: Option<i64>,
    anchor: Option<&str>,
    new_code: &str,
) -> Result<String, EditError> {
    if line_number.is_none() && kind != ChangeType::Add {
        let anchor = anchor.ok_or(EditError::MissingAnchor)?;
        if !content.contains(anchor) {
            return Err(EditError::AnchorNotFound);
        }
        let replacement = if kind == ChangeType::Modify { new_code } else { "" };
        return Ok(content.replace(anchor, replacement));
    }

    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing_newline = content.ends_with(eol);
    let mut lines: Vec<&str> = if content.is_empty() {
        Vec::new()
    } else {
        content
            .strip_suffix(eol)
            .unwrap_or(content)
            .split(eol)
            .collect()
    };

    match (kind, line_number) {
        // Only `add` gets here without a line number.
        (_, None) => lines.push(new_code),
        (ChangeType::Add, Some(line)) => {
            let index = line_index(line, lines.len() + 1, lines.len())?;
            lines.insert(index, new_code);
        }
        (ChangeType::Modify, Some(line)) => {
            let index = line_index(line, lines.len(), lines.len())?;
            lines[index] = new_code;
        }
        (ChangeType::Delete, Some(line)) => {
            let index = line_index(line, lines.len(), lines.len())?;
            lines.remove(index);
        }
    }

    let mut joined = lines.join(eol);
    if trailing_newline && !lines.is_empty() {
        joined.push_str(eol);
    }
    Ok(joined)
}

/// 0-based index for a 1-based `line`, accepted when `1 <= line <= max`.
fn line_index(line: i64, max: usize, len: usize) -> Result<usize, EditError> {
    usize::try_from(line)
        .ok()
        .filter(|l| (1..=max).contains(l))
        .map(|l| l - 1)
        .ok_or(EditError::LineOutOfRange { line, len })
}

/// `ai-feedback-<YYYYmmdd_HHMMSS>-<path hash mod 10000>`, with a random
/// suffix on retries.
pub fn branch_name(path: &str, at: DateTime<Utc>, attempt: usize) -> String {
    let base = format!(
        "{}-{}-{}",
        BRANCH_PREFIX,
        at.format("%Y%m%d_%H%M%S"),
        fnv1a(path.as_bytes()) % 10_000
    );
    if attempt == 0 {
        base
    } else {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", base, &suffix[..8])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  OUTCOMES
// ═══════════════════════════════════════════════════════════════════════════

/// Result of attempting one change item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    PullRequest { file_path: String, url: String },
    Failed { reason: String },
}

impl ApplyOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::PullRequest { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::PullRequest { url, .. } => Some(url),
            Self::Failed { .. } => None,
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PullRequest { url, .. } => write!(f, "✅ PR Created: {}", url),
            Self::Failed { reason } => write!(f, "❌ {}", reason),
        }
    }
}

/// Batch-level view of a list of outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub success: bool,
    pub message: String,
    pub results: Vec<String>,
    pub pull_request_urls: Vec<String>,
    pub errors: Vec<String>,
}

impl ApplySummary {
    /// Succeeds only when at least one pull request was opened and nothing failed.
    pub fn from_outcomes(outcomes: &[ApplyOutcome]) -> Self {
        if outcomes.is_empty() {
            return Self::failure("No proposed changes found", "No changes to apply");
        }

        let results: Vec<String> = outcomes.iter().map(ToString::to_string).collect();
        let pull_request_urls: Vec<String> = outcomes
            .iter()
            .filter_map(|o| o.url().map(str::to_string))
            .collect();
        let errors: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(ToString::to_string)
            .collect();

        let success = !pull_request_urls.is_empty() && errors.is_empty();
        let message = if success {
            format!("Applied {} changes successfully", pull_request_urls.len())
        } else {
            "Some changes failed to apply".to_string()
        };

        Self {
            success,
            message,
            results,
            pull_request_urls,
            errors,
        }
    }

    pub fn failure(message: &str, error: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            results: Vec::new(),
            pull_request_urls: Vec::new(),
            errors: vec![error.to_string()],
        }
    }
}

/// Pick the changes at `indices`, in the order given, dropping out-of-range
/// indices. `None` selects every change.
pub fn select_changes<'a>(changes: &'a [Value], indices: Option<&[usize]>) -> Vec<&'a Value> {
    match indices {
        None => changes.iter().collect(),
        Some(indices) => indices.iter().filter_map(|&i| changes.get(i)).collect(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  APPLIER
// ═══════════════════════════════════════════════════════════════════════════

pub struct ChangeApplier {
    gateway: Arc<dyn RepositoryGateway>,
    clock: fn() -> DateTime<Utc>,
}

impl ChangeApplier {
    pub fn new(gateway: Arc<dyn RepositoryGateway>) -> Self {
        Self {
            gateway,
            clock: Utc::now,
        }
    }

    /// Use a fixed time source for branch names.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply every change of `proposal`, in order.
    pub async fn apply_changes(&self, proposal: &ChangeProposal) -> Vec<ApplyOutcome> {
        let items: Vec<&Value> = proposal.proposed_changes.iter().collect();
        self.apply_items(&proposal.feedback_analysis, &items).await
    }

    /// Apply the given raw change items, one outcome per item, in order.
    pub async fn apply_items(&self, feedback_analysis: &str, items: &[&Value]) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        for (index, raw) in items.iter().enumerate() {
            let outcome = self.apply_one(feedback_analysis, raw).await;
            match &outcome {
                ApplyOutcome::PullRequest { file_path, url } => {
                    info!(index, path = %file_path, url = %url, "change applied")
                }
                ApplyOutcome::Failed { reason } => warn!(index, reason = %reason, "change failed"),
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn apply_one(&self, feedback_analysis: &str, raw: &Value) -> ApplyOutcome {
        let item = match ChangeItem::from_value(raw) {
            Ok(item) => item,
            Err(reason) => return ApplyOutcome::failed(reason),
        };
        let kind = match item.kind() {
            Ok(kind) => kind,
            Err(reason) => return ApplyOutcome::failed(reason),
        };

        let mut file_path = item.file_path.clone();
        if let Some(anchor) = item.anchor() {
            if let Some(found) = self.gateway.find_file_containing(anchor).await {
                if found != file_path {
                    debug!(proposed = %file_path, found = %found, "anchor located in a different file");
                }
                file_path = found;
            }
        }

        let (content, sha) = match self.gateway.read_file(&file_path).await {
            Ok(file) => (file.content, Some(file.sha)),
            Err(e) if e.is_not_found() && kind == ChangeType::Add => (String::new(), None),
            Err(e) if e.is_not_found() => {
                return ApplyOutcome::failed(format!(
                    "File {} not found for {} operation.",
                    file_path, kind
                ))
            }
            Err(e) => return ApplyOutcome::failed(apply_error(&file_path, e)),
        };

        let new_content = match compute_new_content(
            &content,
            kind,
            item.line_number,
            item.anchor(),
            &item.new_code,
        ) {
            Ok(c) => c,
            Err(e) => return ApplyOutcome::failed(apply_error(&file_path, e)),
        };

        match self
            .publish(feedback_analysis, &item, kind, &file_path, &new_content, sha.as_deref())
            .await
        {
            Ok(url) => ApplyOutcome::PullRequest { file_path, url },
            Err(e) => ApplyOutcome::failed(apply_error(&file_path, e)),
        }
    }

    /// Branch, commit and open the pull request for one computed edit.
    async fn publish(
        &self,
        feedback_analysis: &str,
        item: &ChangeItem,
        kind: ChangeType,
        file_path: &str,
        new_content: &str,
        sha: Option<&str>,
    ) -> Result<String, GatewayError> {
        let base = self.gateway.default_branch().to_string();
        let head = self.gateway.head_commit(&base).await?;
        let branch = self.create_branch(file_path, &head).await?;

        let message = format!("AI Feedback Implementation: {}", item.reason);
        match sha {
            Some(sha) => {
                self.gateway
                    .update_file(file_path, &message, new_content, sha, &branch)
                    .await?
            }
            None => {
                self.gateway
                    .create_file(file_path, &message, new_content, &branch)
                    .await?
            }
        }

        let title = truncate(&format!("AI Feedback: {}", item.reason), MAX_TITLE_CHARS);
        let body = pull_request_body(feedback_analysis, item, kind, file_path);
        self.gateway
            .open_pull_request(&title, &body, &branch, &base)
            .await
    }

    async fn create_branch(&self, file_path: &str, from_sha: &str) -> Result<String, GatewayError> {
        let at = (self.clock)();
        let mut attempt = 0;
        loop {
            let name = branch_name(file_path, at, attempt);
            match self.gateway.create_branch(&name, from_sha).await {
                Ok(()) => {
                    debug!(branch = %name, "created branch");
                    return Ok(name);
                }
                Err(GatewayError::BranchExists { .. }) if attempt + 1 < MAX_BRANCH_ATTEMPTS => {
                    debug!(branch = %name, "branch exists, retrying with a fresh name");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn apply_error(file_path: &str, err: impl fmt::Display) -> String {
    format!("Error applying change to {}: {}", file_path, err)
}

fn pull_request_body(
    feedback_analysis: &str,
    item: &ChangeItem,
    kind: ChangeType,
    file_path: &str,
) -> String {
    format!(
        "## AI-Generated Changes\n\n\
         **Feedback Analysis:** {}\n\n\
         **Change Details:**\n\
         - **File:** {}\n\
         - **Type:** {}\n\
         - **Reason:** {}\n\n\
         **Impact:** {}\n\n\
         This change was automatically generated based on user feedback analysis.\n\
         Please review the changes and test thoroughly before merging.",
        if feedback_analysis.is_empty() { "N/A" } else { feedback_analysis },
        file_path,
        kind,
        item.reason,
        item.impact.as_deref().unwrap_or("N/A"),
    )
}
