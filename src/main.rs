use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use feature_pilot::analyzer::FeedbackAnalyzer;
use feature_pilot::apply::{select_changes, ApplySummary, ChangeApplier};
use feature_pilot::config::Config;
use feature_pilot::gateway::{MemoryGateway, RepositoryGateway};
use feature_pilot::github::GitHubGateway;
use feature_pilot::jobs::{JobOutcome, JobQueue, RetryPolicy};
use feature_pilot::llm::OpenRouterClient;
use feature_pilot::logging;
use feature_pilot::proposal::{validate_proposal, AnalysisResult, ChangeProposal};
use feature_pilot::service::{
    connection_report, FeedbackService, GitHubGateways, MemoryStore, ProposalStatus,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "feature-pilot",
    about = "Turn user feedback into pull requests against a GitHub repository",
    version
)]
struct Cli {
    /// Config file (defaults to ~/.config/feature-pilot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze feedback and print the proposal document
    Analyze(AnalyzeArgs),
    /// Apply a proposal document, one pull request per change
    Apply(ApplyArgs),
    /// Check a proposal document without touching the repository
    Validate(ValidateArgs),
    /// Check that a project's repository is reachable
    Check(CheckArgs),
    /// Submit feedback through the job queue, optionally confirming the result
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    feedback: String,
    /// Also write the document to this file
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    proposal: PathBuf,
    /// Only apply the changes at these indices, e.g. `--only 0,2`
    #[arg(long, value_delimiter = ',')]
    only: Vec<usize>,
    /// Apply against an in-memory copy of the repository
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    proposal: PathBuf,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long)]
    project: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    feedback: String,
    /// Confirm the proposal and apply it once analysis succeeds
    #[arg(long)]
    confirm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json_logs);

    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Analyze(args) => run_analyze(&config, args).await,
        Commands::Apply(args) => run_apply(&config, args).await,
        Commands::Validate(args) => run_validate(args),
        Commands::Check(args) => run_check(&config, args).await,
        Commands::Run(args) => run_pipeline(config, args).await,
    }
}

async fn run_analyze(config: &Config, args: AnalyzeArgs) -> Result<()> {
    let project = config.project(&args.project)?;
    let gateway = Arc::new(GitHubGateway::new(project)?);
    let backend = Arc::new(OpenRouterClient::new(&config.llm)?);
    let analyzer = FeedbackAnalyzer::new(backend, gateway, config.llm.max_turns);

    let result = analyzer.analyze(&args.feedback).await;
    let rendered = serde_json::to_string_pretty(&result.to_document())?;
    println!("{}", rendered);
    if let Some(out) = &args.out {
        std::fs::write(out, format!("{}\n", rendered))
            .with_context(|| format!("Failed to write {}", out.display()))?;
    }

    match result {
        AnalysisResult::Proposal(_) => Ok(()),
        AnalysisResult::Failed(e) => bail!("AI analysis failed: {}", e.error),
    }
}

fn read_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proposal {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Proposal {} is not valid JSON", path.display()))
}

async fn run_apply(config: &Config, args: ApplyArgs) -> Result<()> {
    let doc = read_document(&args.proposal)?;
    let proposal = ChangeProposal::from_document(&doc).context("Invalid proposal")?;

    let project = config.project(&args.project)?;
    let remote = GitHubGateway::new(project)?;
    let gateway: Arc<dyn RepositoryGateway> = if args.dry_run {
        eprintln!("Dry run: copying {} into memory...", remote.repository());
        Arc::new(MemoryGateway::snapshot_of(&remote).await)
    } else {
        Arc::new(remote)
    };

    let indices = (!args.only.is_empty()).then_some(args.only.as_slice());
    let selected = select_changes(&proposal.proposed_changes, indices);
    let summary = if proposal.proposed_changes.is_empty() {
        ApplySummary::from_outcomes(&[])
    } else if selected.is_empty() {
        ApplySummary::failure("No valid changes found to apply", "Invalid change indices")
    } else {
        let outcomes = ChangeApplier::new(gateway)
            .apply_items(&proposal.feedback_analysis, &selected)
            .await;
        for outcome in &outcomes {
            println!("{}", outcome);
        }
        ApplySummary::from_outcomes(&outcomes)
    };

    println!("{}", summary.message);
    if summary.success {
        Ok(())
    } else {
        bail!("{}", summary.errors.join("\n"))
    }
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let doc = read_document(&args.proposal)?;
    validate_proposal(&doc).context("Invalid proposal")?;
    let changes = doc["proposed_changes"].as_array().map_or(0, Vec::len);
    println!("✅ Proposal is valid ({} changes)", changes);
    Ok(())
}

async fn run_check(config: &Config, args: CheckArgs) -> Result<()> {
    let project = config.project(&args.project)?;
    let report = match GitHubGateway::new(project) {
        Ok(gateway) => connection_report(&gateway).await,
        Err(e) => bail!("Failed to connect to GitHub: {}", e),
    };
    if report.success {
        println!("{}", report.message);
        Ok(())
    } else {
        bail!("{}", report.message)
    }
}

async fn run_pipeline(config: Config, args: RunArgs) -> Result<()> {
    let backend = Arc::new(OpenRouterClient::new(&config.llm)?);
    let (trigger, queue) = JobQueue::channel();
    let service = Arc::new(
        FeedbackService::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(GitHubGateways),
            backend,
        )
        .with_trigger(trigger),
    );
    let (_worker, mut reports) = queue.spawn(service.clone(), RetryPolicy::default());

    let feedback = service.submit_feedback(&args.project, &args.feedback).await?;
    let report = reports.recv().await.context("Job worker stopped")?;
    if let JobOutcome::Panicked(detail) = &report.outcome {
        bail!("Analysis crashed: {}", detail);
    }

    let record = service
        .proposals_for(feedback.id)
        .await?
        .pop()
        .context("Analysis stored no proposal")?;
    println!("{}", serde_json::to_string_pretty(&record.document)?);
    println!("Proposal {} is {}", record.id, record.status);
    if record.status != ProposalStatus::Pending || !args.confirm {
        return Ok(());
    }

    service.confirm_proposal(record.id).await?;
    let report = reports.recv().await.context("Job worker stopped")?;
    let stored = service.proposal(record.id).await?;
    println!("Proposal {} is {}", stored.id, stored.status);
    if let Some(url) = &stored.pr_url {
        println!("Pull request: {}", url);
    }
    match report.outcome {
        JobOutcome::Completed { .. } => Ok(()),
        JobOutcome::Failed { error, .. } => bail!("{}", error),
        JobOutcome::Panicked(detail) => bail!("Apply crashed: {}", detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_parses_index_list() {
        let cli = Cli::try_parse_from([
            "feature-pilot",
            "apply",
            "--project",
            "site",
            "--proposal",
            "p.json",
            "--only",
            "0,2",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Apply(args) => {
                assert_eq!(args.only, vec![0, 2]);
                assert!(args.dry_run);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "feature-pilot",
            "check",
            "--project",
            "site",
            "--json-logs",
            "--config",
            "fp.toml",
        ])
        .unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.config, Some(PathBuf::from("fp.toml")));
    }

    #[test]
    fn test_analyze_requires_feedback() {
        assert!(Cli::try_parse_from(["feature-pilot", "analyze", "--project", "site"]).is_err());
    }
}
