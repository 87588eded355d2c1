//! Feedback service
//!
//! Ties the analyzer and the applier to stored records: feedback comes in,
//! a proposal is analyzed and stored as `pending`, a reviewer confirms it, and
//! applying it opens pull requests and marks it `applied`. Storage is behind
//! [`RecordStore`] and repository access behind [`GatewayFactory`], so the
//! whole flow runs against in-memory fakes in tests.

use crate::analyzer::FeedbackAnalyzer;
use crate::apply::{select_changes, ApplySummary, ChangeApplier};
use crate::config::{Config, ProjectConfig};
use crate::gateway::RepositoryGateway;
use crate::github::GitHubGateway;
use crate::jobs::{Job, JobSender};
use crate::llm::ChatBackend;
use crate::proposal::{validate_proposal, AnalysisError, AnalysisResult, ChangeProposal, ProposalIssue};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
//  RECORDS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub project: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Confirmed,
    Applied,
    Failed,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A stored proposal. `document` is either a proposal record document or,
/// for a failed analysis, the error document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: Uuid,
    pub feedback_id: Uuid,
    pub document: Value,
    pub status: ProposalStatus,
    pub is_confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub pr_url: Option<String>,
}

impl ProposalRecord {
    fn new(feedback_id: Uuid, document: Value, status: ProposalStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            feedback_id,
            document,
            status,
            is_confirmed: false,
            created_at: Utc::now(),
            applied_at: None,
            pr_url: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  STORAGE
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_feedback(&self, feedback: Feedback) -> anyhow::Result<()>;
    async fn feedback(&self, id: Uuid) -> anyhow::Result<Option<Feedback>>;
    async fn insert_proposal(&self, proposal: ProposalRecord) -> anyhow::Result<()>;
    async fn proposal(&self, id: Uuid) -> anyhow::Result<Option<ProposalRecord>>;
    async fn update_proposal(&self, proposal: &ProposalRecord) -> anyhow::Result<()>;
    /// Proposals for one piece of feedback, oldest first.
    async fn proposals_for(&self, feedback_id: Uuid) -> anyhow::Result<Vec<ProposalRecord>>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    feedback: Mutex<HashMap<Uuid, Feedback>>,
    proposals: Mutex<HashMap<Uuid, ProposalRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("record store lock poisoned")
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_feedback(&self, feedback: Feedback) -> anyhow::Result<()> {
        self.feedback
            .lock()
            .map_err(poisoned)?
            .insert(feedback.id, feedback);
        Ok(())
    }

    async fn feedback(&self, id: Uuid) -> anyhow::Result<Option<Feedback>> {
        Ok(self.feedback.lock().map_err(poisoned)?.get(&id).cloned())
    }

    async fn insert_proposal(&self, proposal: ProposalRecord) -> anyhow::Result<()> {
        self.proposals
            .lock()
            .map_err(poisoned)?
            .insert(proposal.id, proposal);
        Ok(())
    }

    async fn proposal(&self, id: Uuid) -> anyhow::Result<Option<ProposalRecord>> {
        Ok(self.proposals.lock().map_err(poisoned)?.get(&id).cloned())
    }

    async fn update_proposal(&self, proposal: &ProposalRecord) -> anyhow::Result<()> {
        let mut proposals = self.proposals.lock().map_err(poisoned)?;
        match proposals.get_mut(&proposal.id) {
            Some(slot) => {
                *slot = proposal.clone();
                Ok(())
            }
            None => anyhow::bail!("proposal {} does not exist", proposal.id),
        }
    }

    async fn proposals_for(&self, feedback_id: Uuid) -> anyhow::Result<Vec<ProposalRecord>> {
        let proposals = self.proposals.lock().map_err(poisoned)?;
        let mut found: Vec<ProposalRecord> = proposals
            .values()
            .filter(|p| p.feedback_id == feedback_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  GATEWAYS
// ═══════════════════════════════════════════════════════════════════════════

/// Builds the repository gateway for a configured project.
pub trait GatewayFactory: Send + Sync {
    fn gateway_for(&self, project: &ProjectConfig) -> anyhow::Result<Arc<dyn RepositoryGateway>>;
}

impl<F> GatewayFactory for F
where
    F: Fn(&ProjectConfig) -> anyhow::Result<Arc<dyn RepositoryGateway>> + Send + Sync,
{
    fn gateway_for(&self, project: &ProjectConfig) -> anyhow::Result<Arc<dyn RepositoryGateway>> {
        self(project)
    }
}

pub struct GitHubGateways;

impl GatewayFactory for GitHubGateways {
    fn gateway_for(&self, project: &ProjectConfig) -> anyhow::Result<Arc<dyn RepositoryGateway>> {
        Ok(Arc::new(GitHubGateway::new(project)?))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  SERVICE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Feedback {0} not found")]
    FeedbackNotFound(Uuid),
    #[error("Proposal {0} not found")]
    ProposalNotFound(Uuid),
    #[error("Proposal is already confirmed.")]
    AlreadyConfirmed,
    #[error("Proposal has already been applied.")]
    AlreadyApplied,
    #[error("AI analysis failed: {}", .0.error)]
    AnalysisFailed(AnalysisError),
    #[error("Proposal cannot be applied: {0}")]
    Invalid(#[from] ProposalIssue),
    #[error("Failed to apply changes: {}", .0.errors.join("; "))]
    ApplyFailed(ApplySummary),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    /// Whether running the same job again could succeed. An apply that
    /// already opened a pull request is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AnalysisFailed(_) | Self::Other(_) => true,
            Self::ApplyFailed(summary) => {
                summary.pull_request_urls.is_empty() && !summary.results.is_empty()
            }
            _ => false,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
}

pub struct FeedbackService {
    store: Arc<dyn RecordStore>,
    projects: Vec<ProjectConfig>,
    gateways: Arc<dyn GatewayFactory>,
    backend: Arc<dyn ChatBackend>,
    max_turns: usize,
    trigger: Option<JobSender>,
}

impl FeedbackService {
    pub fn new(
        config: &Config,
        store: Arc<dyn RecordStore>,
        gateways: Arc<dyn GatewayFactory>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            store,
            projects: config.projects.clone(),
            gateways,
            backend,
            max_turns: config.llm.max_turns,
            trigger: None,
        }
    }

    /// Queue analysis on new feedback and application on confirmation.
    pub fn with_trigger(mut self, trigger: JobSender) -> Self {
        self.trigger = Some(trigger);
        self
    }

    fn project(&self, name: &str) -> anyhow::Result<&ProjectConfig> {
        self.projects
            .iter()
            .find(|p| p.name == name)
            .with_context(|| format!("Unknown project '{}'", name))
    }

    fn gateway(&self, project: &str) -> anyhow::Result<Arc<dyn RepositoryGateway>> {
        self.gateways.gateway_for(self.project(project)?)
    }

    fn enqueue(&self, job: Job) {
        if let Some(trigger) = &self.trigger {
            trigger.send(job);
        }
    }

    async fn load_feedback(&self, id: Uuid) -> ServiceResult<Feedback> {
        self.store
            .feedback(id)
            .await?
            .ok_or(ServiceError::FeedbackNotFound(id))
    }

    async fn load_proposal(&self, id: Uuid) -> ServiceResult<ProposalRecord> {
        self.store
            .proposal(id)
            .await?
            .ok_or(ServiceError::ProposalNotFound(id))
    }

    pub async fn proposal(&self, id: Uuid) -> ServiceResult<ProposalRecord> {
        self.load_proposal(id).await
    }

    pub async fn proposals_for(&self, feedback_id: Uuid) -> ServiceResult<Vec<ProposalRecord>> {
        Ok(self.store.proposals_for(feedback_id).await?)
    }

    pub async fn submit_feedback(&self, project: &str, text: &str) -> ServiceResult<Feedback> {
        self.project(project)?;
        let feedback = Feedback {
            id: Uuid::new_v4(),
            project: project.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_feedback(feedback.clone()).await?;
        info!(feedback = %feedback.id, project, "feedback received");
        self.enqueue(Job::AnalyzeFeedback(feedback.id));
        Ok(feedback)
    }

    /// Analyze stored feedback and store the result as a `pending` proposal.
    ///
    /// A failed analysis is returned as an error and nothing is stored, so the
    /// job layer can retry it.
    pub async fn analyze_feedback(&self, feedback_id: Uuid) -> ServiceResult<ProposalRecord> {
        let feedback = self.load_feedback(feedback_id).await?;
        let gateway = self.gateway(&feedback.project)?;
        let analyzer = FeedbackAnalyzer::new(self.backend.clone(), gateway, self.max_turns);

        match analyzer.analyze(&feedback.text).await {
            AnalysisResult::Proposal(proposal) => {
                let record = ProposalRecord::new(
                    feedback_id,
                    proposal.record_document(Utc::now()),
                    ProposalStatus::Pending,
                );
                self.store.insert_proposal(record.clone()).await?;
                info!(
                    proposal = %record.id,
                    changes = proposal.proposed_changes.len(),
                    "proposal stored"
                );
                Ok(record)
            }
            AnalysisResult::Failed(error) => Err(ServiceError::AnalysisFailed(error)),
        }
    }

    /// Store the final failure of an analysis as a `failed` proposal holding
    /// the error document.
    pub async fn record_failed_analysis(
        &self,
        feedback_id: Uuid,
        cause: &ServiceError,
    ) -> ServiceResult<ProposalRecord> {
        let feedback = self.load_feedback(feedback_id).await?;
        let error = match cause {
            ServiceError::AnalysisFailed(error) => error.clone(),
            other => AnalysisError::new(other.to_string(), &feedback.text),
        };
        let record = ProposalRecord::new(
            feedback_id,
            AnalysisResult::Failed(error).to_document(),
            ProposalStatus::Failed,
        );
        self.store.insert_proposal(record.clone()).await?;
        warn!(feedback = %feedback_id, proposal = %record.id, "analysis recorded as failed");
        Ok(record)
    }

    pub async fn confirm_proposal(&self, id: Uuid) -> ServiceResult<ProposalRecord> {
        let mut record = self.load_proposal(id).await?;
        if record.is_confirmed {
            return Err(ServiceError::AlreadyConfirmed);
        }
        record.is_confirmed = true;
        record.status = ProposalStatus::Confirmed;
        self.store.update_proposal(&record).await?;
        info!(proposal = %id, "proposal confirmed");
        self.enqueue(Job::ApplyProposal(id));
        Ok(record)
    }

    /// Apply a stored proposal, optionally only the changes at `indices`.
    ///
    /// The document is validated before anything is written to the
    /// repository. On success the record becomes `applied`.
    pub async fn apply_proposal(
        &self,
        id: Uuid,
        indices: Option<&[usize]>,
    ) -> ServiceResult<ApplySummary> {
        let mut record = self.load_proposal(id).await?;
        if record.status == ProposalStatus::Applied {
            return Err(ServiceError::AlreadyApplied);
        }

        validate_proposal(&record.document)?;
        let proposal = ChangeProposal::from_document(&record.document)?;
        if proposal.proposed_changes.is_empty() {
            return Ok(ApplySummary::from_outcomes(&[]));
        }

        let selected = select_changes(&proposal.proposed_changes, indices);
        if selected.is_empty() {
            return Ok(ApplySummary::failure(
                "No valid changes found to apply",
                "Invalid change indices",
            ));
        }

        let feedback = self.load_feedback(record.feedback_id).await?;
        let applier = ChangeApplier::new(self.gateway(&feedback.project)?);
        let outcomes = applier
            .apply_items(&proposal.feedback_analysis, &selected)
            .await;
        let summary = ApplySummary::from_outcomes(&outcomes);

        if summary.success {
            let applied_at = Utc::now();
            record.status = ProposalStatus::Applied;
            record.applied_at = Some(applied_at);
            record.pr_url = summary.pull_request_urls.first().cloned();
            if let Some(doc) = record.document.as_object_mut() {
                let applied: Vec<Value> = selected.iter().map(|v| (*v).clone()).collect();
                doc.insert("applied_changes".to_string(), Value::Array(applied));
                doc.insert(
                    "pull_request_urls".to_string(),
                    serde_json::json!(summary.pull_request_urls),
                );
                doc.insert(
                    "applied_at".to_string(),
                    Value::String(applied_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }
            self.store.update_proposal(&record).await?;
            info!(proposal = %id, prs = summary.pull_request_urls.len(), "proposal applied");
        } else {
            warn!(proposal = %id, errors = summary.errors.len(), "proposal not fully applied");
        }

        Ok(summary)
    }

    pub async fn mark_failed(&self, id: Uuid) -> ServiceResult<()> {
        let mut record = self.load_proposal(id).await?;
        record.status = ProposalStatus::Failed;
        self.store.update_proposal(&record).await?;
        warn!(proposal = %id, "proposal marked failed");
        Ok(())
    }

    pub async fn check_connection(&self, project: &str) -> ConnectionReport {
        match self.gateway(project) {
            Ok(gateway) => connection_report(gateway.as_ref()).await,
            Err(e) => ConnectionReport::failed(e),
        }
    }
}

impl ConnectionReport {
    fn failed(e: impl fmt::Display) -> Self {
        Self {
            success: false,
            message: format!("Failed to connect to GitHub: {}", e),
        }
    }
}

/// Check that the repository behind `gateway` is reachable.
pub async fn connection_report(gateway: &dyn RepositoryGateway) -> ConnectionReport {
    match gateway.repository_info().await {
        Ok(info) => ConnectionReport {
            success: true,
            message: format!(
                "Successfully connected to {}: {}",
                info.name,
                info.description.as_deref().unwrap_or("No description")
            ),
        },
        Err(e) => ConnectionReport::failed(e),
    }
}
