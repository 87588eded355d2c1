//! Feedback analysis
//!
//! Turns one piece of free-text feedback into a [`ChangeProposal`] by letting
//! the model explore the repository. Every failure, including backend errors
//! and an exhausted turn budget, comes back as [`AnalysisResult::Failed`]
//! carrying the original feedback.

use crate::gateway::RepositoryGateway;
use crate::llm::prompts::{feedback_analysis_user, FEEDBACK_ANALYSIS_SYSTEM};
use crate::llm::{repair_proposal_json, run_tool_loop, AgenticOutcome, ChatBackend};
use crate::proposal::{AnalysisError, AnalysisResult, ChangeProposal, ERROR_KEY};
use std::sync::Arc;
use tracing::{info, warn};

pub struct FeedbackAnalyzer {
    backend: Arc<dyn ChatBackend>,
    gateway: Arc<dyn RepositoryGateway>,
    max_turns: usize,
}

impl FeedbackAnalyzer {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        gateway: Arc<dyn RepositoryGateway>,
        max_turns: usize,
    ) -> Self {
        Self {
            backend,
            gateway,
            max_turns,
        }
    }

    pub async fn analyze(&self, feedback: &str) -> AnalysisResult {
        let result = match self.run(feedback).await {
            Ok(result) => result,
            Err(e) => AnalysisResult::Failed(AnalysisError::new(
                format!("Error analyzing feedback: {:#}", e),
                feedback,
            )),
        };

        match &result {
            AnalysisResult::Proposal(p) => {
                info!(changes = p.proposed_changes.len(), "analysis produced a proposal")
            }
            AnalysisResult::Failed(e) => warn!(error = %e.error, "analysis failed"),
        }
        result
    }

    async fn run(&self, feedback: &str) -> anyhow::Result<AnalysisResult> {
        let listing = self.gateway.list_all_files("").await;
        info!(
            files = listing.files.len(),
            skipped = listing.skipped.len(),
            "starting feedback analysis"
        );

        let user = feedback_analysis_user(feedback, &listing);
        let outcome = run_tool_loop(
            self.backend.as_ref(),
            self.gateway.as_ref(),
            FEEDBACK_ANALYSIS_SYSTEM,
            &user,
            self.max_turns,
        )
        .await?;

        Ok(match outcome {
            AgenticOutcome::Completed { content, .. } => interpret_response(feedback, &content),
            AgenticOutcome::Incomplete {
                turns,
                last_content,
            } => AnalysisResult::Failed(AnalysisError {
                error: format!(
                    "Analysis incomplete: no final answer after {} model turns",
                    turns
                ),
                raw_response: last_content,
                attempted_cleanup: false,
                feedback: feedback.to_string(),
            }),
        })
    }
}

/// Repair the model's final text and type it as a proposal.
///
/// Only the proposal-level shape is enforced here; per-change requirements
/// are checked by the validator before anything is applied.
pub fn interpret_response(feedback: &str, content: &str) -> AnalysisResult {
    let doc = repair_proposal_json(content);

    if doc.get(ERROR_KEY).is_some() {
        let mut error: AnalysisError = serde_json::from_value(doc.clone())
            .unwrap_or_else(|_| AnalysisError::new(doc[ERROR_KEY].to_string(), feedback));
        error.feedback = feedback.to_string();
        return AnalysisResult::Failed(error);
    }

    match serde_json::from_value::<ChangeProposal>(doc) {
        Ok(proposal) => AnalysisResult::Proposal(proposal),
        Err(e) => AnalysisResult::Failed(AnalysisError {
            error: format!("Invalid proposal: {}", e),
            raw_response: Some(content.to_string()),
            attempted_cleanup: false,
            feedback: feedback.to_string(),
        }),
    }
}
