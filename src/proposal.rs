//! Change proposals
//!
//! The document the analyzer produces and the applier consumes. Change items
//! are kept as raw JSON inside a proposal and decoded one at a time when they
//! are applied, so a single malformed item fails on its own instead of
//! poisoning the whole batch.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Key that marks a document as an analysis failure.
pub const ERROR_KEY: &str = "error";

const REQUIRED_PROPOSAL_FIELDS: &[&str] = &["feedback_analysis", "proposed_changes"];
const REQUIRED_CHANGE_FIELDS: &[&str] = &["file_path", "change_type", "new_code", "reason"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub feedback_analysis: String,
    #[serde(default)]
    pub files_to_examine: Vec<String>,
    pub proposed_changes: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub additional_recommendations: Option<String>,
}

impl ChangeProposal {
    pub fn from_document(doc: &Value) -> Result<Self, ProposalIssue> {
        validate_proposal(doc)?;
        serde_json::from_value(doc.clone()).map_err(|e| ProposalIssue::Malformed(e.to_string()))
    }

    /// The stored form of a freshly analyzed proposal.
    pub fn record_document(&self, analyzed_at: DateTime<Utc>) -> Value {
        let mut doc = json!(self);
        if let Some(map) = doc.as_object_mut() {
            map.insert("ai_generated".to_string(), Value::Bool(true));
            map.insert(
                "analysis_timestamp".to_string(),
                Value::String(analyzed_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        doc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
}

impl ChangeType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
        })
    }
}

/// One localized edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeItem {
    pub file_path: String,
    /// Kept as text; [`ChangeItem::kind`] rejects unknown values per item.
    pub change_type: String,
    /// 1-indexed. `0`, `null` and non-numeric values mean "no line number".
    #[serde(default, deserialize_with = "lenient_line_number")]
    pub line_number: Option<i64>,
    /// Anchor text used to locate the file and, without a line number, the edit.
    #[serde(default, deserialize_with = "lenient_text")]
    pub current_code: Option<String>,
    pub new_code: String,
    pub reason: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub impact: Option<String>,
}

impl ChangeItem {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("Invalid change item: {}", e))
    }

    pub fn kind(&self) -> Result<ChangeType, String> {
        ChangeType::parse(&self.change_type)
            .ok_or_else(|| format!("Unknown change type: {}", self.change_type))
    }

    /// Non-empty anchor text, if any.
    pub fn anchor(&self) -> Option<&str> {
        self.current_code.as_deref().filter(|s| !s.is_empty())
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_line_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let n = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(n.filter(|n| *n != 0))
}

// ═══════════════════════════════════════════════════════════════════════════
//  VALIDATION
// ═══════════════════════════════════════════════════════════════════════════

/// Why a document is not an applicable proposal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalIssue {
    #[error("analysis failed: {0}")]
    ErrorDocument(String),

    #[error("proposal is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("'proposed_changes' must be a list")]
    ChangesNotAList,

    #[error("change {index} is missing required field '{field}'")]
    ChangeMissingField { index: usize, field: &'static str },

    #[error("malformed proposal: {0}")]
    Malformed(String),
}

/// Structural check run before anything is mutated.
///
/// Rejects error documents, requires `feedback_analysis` and
/// `proposed_changes`, and requires `file_path`, `change_type`, `new_code`
/// and `reason` on every change.
pub fn validate_proposal(doc: &Value) -> Result<(), ProposalIssue> {
    let map = doc.as_object().ok_or(ProposalIssue::NotAnObject)?;

    if let Some(err) = map.get(ERROR_KEY) {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(ProposalIssue::ErrorDocument(message));
    }

    for field in REQUIRED_PROPOSAL_FIELDS {
        if !map.contains_key(*field) {
            return Err(ProposalIssue::MissingField(*field));
        }
    }

    let changes = map
        .get("proposed_changes")
        .and_then(Value::as_array)
        .ok_or(ProposalIssue::ChangesNotAList)?;

    for (index, change) in changes.iter().enumerate() {
        for field in REQUIRED_CHANGE_FIELDS {
            if change.get(*field).is_none() {
                return Err(ProposalIssue::ChangeMissingField {
                    index,
                    field: *field,
                });
            }
        }
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
//  ANALYSIS RESULT
// ═══════════════════════════════════════════════════════════════════════════

/// Explicit failure marker produced instead of a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub attempted_cleanup: bool,
    #[serde(default)]
    pub feedback: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl AnalysisError {
    pub fn new(error: impl Into<String>, feedback: &str) -> Self {
        Self {
            error: error.into(),
            raw_response: None,
            attempted_cleanup: false,
            feedback: feedback.to_string(),
        }
    }
}

/// Outcome of analyzing one piece of feedback. Zero proposed changes is still
/// a [`AnalysisResult::Proposal`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisResult {
    Proposal(ChangeProposal),
    Failed(AnalysisError),
}

impl AnalysisResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Proposal(_))
    }

    pub fn proposal(&self) -> Option<&ChangeProposal> {
        match self {
            Self::Proposal(p) => Some(p),
            Self::Failed(_) => None,
        }
    }

    pub fn to_document(&self) -> Value {
        match self {
            Self::Proposal(p) => json!(p),
            Self::Failed(e) => json!(e),
        }
    }
}
