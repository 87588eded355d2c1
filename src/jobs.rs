//! Background jobs
//!
//! Analysis and application run off the request path on an in-process queue.
//! Each job is spawned on its own task, retried with exponential backoff, and
//! isolated from panics so one bad job cannot take the worker down.

use crate::service::{FeedbackService, ServiceError};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    AnalyzeFeedback(Uuid),
    ApplyProposal(Uuid),
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnalyzeFeedback(id) => write!(f, "analyze feedback {}", id),
            Self::ApplyProposal(id) => write!(f, "apply proposal {}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based): 1s, 2s, 4s with the default.
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { attempts: u32 },
    Failed { attempts: u32, error: String },
    Panicked(String),
}

/// Emitted by the worker after every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: Job,
    pub outcome: JobOutcome,
}

/// Cloneable handle for enqueueing jobs.
#[derive(Clone)]
pub struct JobSender(mpsc::UnboundedSender<Job>);

impl JobSender {
    pub fn send(&self, job: Job) {
        if self.0.send(job).is_err() {
            warn!(%job, "job queue is closed; dropping job");
        }
    }
}

pub struct JobQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl JobQueue {
    pub fn channel() -> (JobSender, JobQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobSender(tx), JobQueue { rx })
    }

    /// Start the worker. A report for each finished job is sent on the
    /// returned receiver. A crashed job leaves its record failed like any
    /// other final failure.
    ///
    /// The worker stops once every [`JobSender`] is gone, including the one
    /// held by a service built with [`FeedbackService::with_trigger`]. Such a
    /// service keeps the queue open for as long as it lives; abort the
    /// returned handle to stop the worker sooner.
    pub fn spawn(
        mut self,
        service: Arc<FeedbackService>,
        policy: RetryPolicy,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<JobReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(job) = self.rx.recv().await {
                let service = service.clone();
                let report_tx = report_tx.clone();
                tokio::spawn(async move {
                    let run = AssertUnwindSafe(run_job(&service, job, &policy)).catch_unwind();
                    let outcome = match run.await {
                        Ok(outcome) => outcome,
                        Err(panic) => {
                            let detail = if let Some(s) = panic.downcast_ref::<&str>() {
                                s.to_string()
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                s.clone()
                            } else {
                                "unknown panic payload".to_string()
                            };
                            error!(%job, panic = %detail, "job crashed");
                            let cause = anyhow::anyhow!("job crashed: {}", detail);
                            record_failure(&service, job, &ServiceError::Other(cause)).await;
                            JobOutcome::Panicked(detail)
                        }
                    };
                    // Nobody listening is fine.
                    let _ = report_tx.send(JobReport { job, outcome });
                });
            }
        });
        (handle, report_rx)
    }
}

/// Run one job to completion, retrying under `policy`. After the final
/// failure the affected record is marked failed.
pub async fn run_job(service: &FeedbackService, job: Job, policy: &RetryPolicy) -> JobOutcome {
    let mut retries = 0;
    loop {
        let err = match attempt(service, job).await {
            Ok(()) => {
                info!(%job, attempts = retries + 1, "job completed");
                return JobOutcome::Completed {
                    attempts: retries + 1,
                };
            }
            Err(err) => err,
        };

        if err.is_retryable() && retries < policy.max_retries {
            let delay = policy.delay(retries);
            let delay_ms = delay.as_millis() as u64;
            warn!(%job, retry = retries + 1, delay_ms, error = %err, "job failed; retrying");
            tokio::time::sleep(delay).await;
            retries += 1;
            continue;
        }

        error!(%job, attempts = retries + 1, error = %err, "job failed");
        record_failure(service, job, &err).await;
        return JobOutcome::Failed {
            attempts: retries + 1,
            error: err.to_string(),
        };
    }
}

async fn attempt(service: &FeedbackService, job: Job) -> Result<(), ServiceError> {
    match job {
        Job::AnalyzeFeedback(id) => service.analyze_feedback(id).await.map(|_| ()),
        Job::ApplyProposal(id) => {
            let summary = service.apply_proposal(id, None).await?;
            if summary.success {
                Ok(())
            } else {
                Err(ServiceError::ApplyFailed(summary))
            }
        }
    }
}

async fn record_failure(service: &FeedbackService, job: Job, err: &ServiceError) {
    let recorded = match (job, err) {
        (_, ServiceError::FeedbackNotFound(_) | ServiceError::ProposalNotFound(_)) => return,
        (_, ServiceError::AlreadyApplied) => return,
        (Job::AnalyzeFeedback(id), _) => service.record_failed_analysis(id, err).await.map(|_| ()),
        (Job::ApplyProposal(id), _) => service.mark_failed(id).await,
    };
    if let Err(e) = recorded {
        error!(%job, error = %e, "could not record job failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProjectConfig};
    use crate::gateway::{MemoryGateway, RepositoryGateway};
    use crate::llm::scripted::ScriptedBackend;
    use crate::service::{GatewayFactory, MemoryStore, ProposalStatus};

    const PROPOSAL: &str = r#"{"feedback_analysis": "Greeting should say Hello",
        "proposed_changes": [
            {"file_path": "index.html", "change_type": "modify", "line_number": 1,
             "new_code": "<h1>Hello</h1>", "reason": "greeting"}]}"#;

    const BROKEN_PROPOSAL: &str = r#"{"feedback_analysis": "Remove stale page",
        "proposed_changes": [
            {"file_path": "gone.html", "change_type": "delete", "line_number": 1,
             "new_code": "", "reason": "cleanup"}]}"#;

    fn config() -> Config {
        let mut config = Config::default();
        config.projects.push(ProjectConfig {
            name: "site".to_string(),
            repository: "acme/site".to_string(),
            token: None,
            default_branch: "main".to_string(),
        });
        config
    }

    fn memory_factory(gateway: Arc<MemoryGateway>) -> Arc<dyn GatewayFactory> {
        Arc::new(
            move |_: &ProjectConfig| -> anyhow::Result<Arc<dyn RepositoryGateway>> {
                Ok(gateway.clone() as Arc<dyn RepositoryGateway>)
            },
        )
    }

    fn service(backend: ScriptedBackend) -> (FeedbackService, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new("main").with_file("index.html", "<h1>Hi</h1>\n"));
        let service = FeedbackService::new(
            &config(),
            Arc::new(MemoryStore::new()),
            memory_factory(gateway.clone()),
            Arc::new(backend),
        );
        (service, gateway)
    }

    #[test]
    fn test_default_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_analysis_retries_until_success() {
        let (service, _) = service(
            ScriptedBackend::new()
                .reply("not json")
                .fail("upstream timeout")
                .reply(PROPOSAL),
        );
        let feedback = service.submit_feedback("site", "Say hello").await.unwrap();

        let outcome = run_job(
            &service,
            Job::AnalyzeFeedback(feedback.id),
            &RetryPolicy::immediate(3),
        )
        .await;
        assert_eq!(outcome, JobOutcome::Completed { attempts: 3 });

        let proposals = service.proposals_for(feedback.id).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn test_analysis_gives_up_and_records_failure() {
        let (service, _) = service(
            ScriptedBackend::new()
                .reply("not json")
                .reply("not json")
                .reply("not json")
                .reply("still not json"),
        );
        let feedback = service.submit_feedback("site", "Say hello").await.unwrap();

        let outcome = run_job(
            &service,
            Job::AnalyzeFeedback(feedback.id),
            &RetryPolicy::immediate(3),
        )
        .await;
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                attempts: 4,
                error: "AI analysis failed: Could not parse JSON response".to_string()
            }
        );

        let proposals = service.proposals_for(feedback.id).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::Failed);
        assert_eq!(
            proposals[0].document["raw_response"],
            serde_json::json!("still not json")
        );
    }

    #[tokio::test]
    async fn test_apply_job_marks_failed_after_retries() {
        let (service, gateway) = service(ScriptedBackend::new().reply(BROKEN_PROPOSAL));
        let feedback = service.submit_feedback("site", "Drop page").await.unwrap();
        let record = service.analyze_feedback(feedback.id).await.unwrap();

        let outcome = run_job(
            &service,
            Job::ApplyProposal(record.id),
            &RetryPolicy::immediate(3),
        )
        .await;
        match outcome {
            JobOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 4);
                assert!(error.contains("File gone.html not found for delete operation."));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(
            service.proposal(record.id).await.unwrap().status,
            ProposalStatus::Failed
        );
        assert!(gateway.pull_requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_record_is_not_retried() {
        let (service, _) = service(ScriptedBackend::new());
        let outcome = run_job(
            &service,
            Job::ApplyProposal(Uuid::new_v4()),
            &RetryPolicy::immediate(3),
        )
        .await;
        assert!(matches!(outcome, JobOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_queue_runs_feedback_through_to_pull_request() {
        let (tx, queue) = JobQueue::channel();
        let (service, gateway) = service(ScriptedBackend::new().reply(PROPOSAL));
        let service = Arc::new(service.with_trigger(tx));
        let (_worker, mut reports) = queue.spawn(service.clone(), RetryPolicy::immediate(3));

        let feedback = service.submit_feedback("site", "Say hello").await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.job, Job::AnalyzeFeedback(feedback.id));
        assert_eq!(report.outcome, JobOutcome::Completed { attempts: 1 });

        let record = service.proposals_for(feedback.id).await.unwrap().remove(0);
        service.confirm_proposal(record.id).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.job, Job::ApplyProposal(record.id));
        assert_eq!(report.outcome, JobOutcome::Completed { attempts: 1 });

        let stored = service.proposal(record.id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Applied);
        assert_eq!(gateway.pull_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_job() {
        let factory: Arc<dyn GatewayFactory> = Arc::new(
            |_: &ProjectConfig| -> anyhow::Result<Arc<dyn RepositoryGateway>> {
                panic!("gateway exploded")
            },
        );
        let (tx, queue) = JobQueue::channel();
        let service = Arc::new(
            FeedbackService::new(
                &config(),
                Arc::new(MemoryStore::new()),
                factory,
                Arc::new(ScriptedBackend::new()),
            )
            .with_trigger(tx.clone()),
        );
        let (_worker, mut reports) = queue.spawn(service.clone(), RetryPolicy::immediate(0));

        let feedback = service.submit_feedback("site", "first").await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Panicked("gateway exploded".to_string()));

        let proposals = service.proposals_for(feedback.id).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::Failed);
        assert_eq!(
            proposals[0].document["error"],
            serde_json::json!("job crashed: gateway exploded")
        );
        assert_eq!(proposals[0].document["feedback"], serde_json::json!("first"));

        let missing = Uuid::new_v4();
        tx.send(Job::ApplyProposal(missing));
        let report = reports.recv().await.unwrap();
        assert_eq!(report.job, Job::ApplyProposal(missing));
        assert!(matches!(report.outcome, JobOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_crashed_apply_marks_proposal_failed() {
        let gateway = Arc::new(MemoryGateway::new("main").with_file("index.html", "<h1>Hi</h1>\n"));
        let armed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let factory: Arc<dyn GatewayFactory> = {
            let gateway = gateway.clone();
            let armed = armed.clone();
            Arc::new(
                move |_: &ProjectConfig| -> anyhow::Result<Arc<dyn RepositoryGateway>> {
                    if armed.load(std::sync::atomic::Ordering::SeqCst) {
                        panic!("gateway exploded");
                    }
                    Ok(gateway.clone() as Arc<dyn RepositoryGateway>)
                },
            )
        };
        let (tx, queue) = JobQueue::channel();
        let service = Arc::new(
            FeedbackService::new(
                &config(),
                Arc::new(MemoryStore::new()),
                factory,
                Arc::new(ScriptedBackend::new().reply(PROPOSAL)),
            )
            .with_trigger(tx),
        );
        let (_worker, mut reports) = queue.spawn(service.clone(), RetryPolicy::immediate(3));

        let feedback = service.submit_feedback("site", "Say hello").await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed { attempts: 1 });
        let record = service.proposals_for(feedback.id).await.unwrap().remove(0);

        armed.store(true, std::sync::atomic::Ordering::SeqCst);
        service.confirm_proposal(record.id).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.job, Job::ApplyProposal(record.id));
        assert_eq!(report.outcome, JobOutcome::Panicked("gateway exploded".to_string()));

        assert_eq!(
            service.proposal(record.id).await.unwrap().status,
            ProposalStatus::Failed
        );
        assert!(gateway.pull_requests().is_empty());
    }

    #[tokio::test]
    async fn test_worker_stops_when_senders_dropped() {
        let (tx, queue) = JobQueue::channel();
        let (service, _) = service(ScriptedBackend::new());
        let (worker, mut reports) = queue.spawn(Arc::new(service), RetryPolicy::immediate(0));

        tx.send(Job::ApplyProposal(Uuid::new_v4()));
        assert!(matches!(
            reports.recv().await.unwrap().outcome,
            JobOutcome::Failed { attempts: 1, .. }
        ));

        drop(tx);
        assert!(worker.await.is_ok());
        assert!(reports.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_triggered_service_keeps_worker_alive_until_aborted() {
        let (tx, queue) = JobQueue::channel();
        let (service, _) = service(ScriptedBackend::new());
        let service = Arc::new(service.with_trigger(tx));
        let (worker, _reports) = queue.spawn(service.clone(), RetryPolicy::immediate(0));

        tokio::task::yield_now().await;
        assert!(!worker.is_finished());

        worker.abort();
        assert!(worker.await.unwrap_err().is_cancelled());
    }
}
