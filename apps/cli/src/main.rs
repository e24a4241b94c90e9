//! Quill CLI - Command-line interface for the Quill orchestration core
//!
//! This CLI provides a `quill` command for driving the agent orchestration
//! and permission-gated execution engine against a scripted demo provider:
//! submit a task, watch approvals and invocations stream by, and inspect the
//! final result and cost summary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quill_orchestrator::config::OrchestratorConfig;
use quill_orchestrator::permission::{ApprovalPolicy, GrantTarget, PermissionGrant, Quotas};
use quill_orchestrator::routing::ProviderProfile;
use quill_orchestrator::task::{ContentType, DocumentScope, Task};
use quill_orchestrator::workflow::{CompositeValidator, MinLengthValidator, PlaceholderValidator};
use quill_orchestrator::{
    ApprovalDecision, EchoProvider, OrchestrationService, PromptWorker, WorkflowEvent,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// Quill CLI - permission-gated agent orchestration for writing tasks
#[derive(Parser, Debug)]
#[command(
    name = "quill",
    author,
    version,
    about = "Quill - permission-gated agent orchestration",
    long_about = "Quill coordinates specialized writing workers behind a capability, quota,\nand approval policy, routing each execution to an upstream provider with failover."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task through the demo deployment
    ///
    /// Builds an in-process service with scripted providers and stock
    /// workers, submits the task, and streams progress until the workflow
    /// reaches a terminal status.
    Run {
        /// External task identifier (idempotency key)
        #[arg(long, default_value = "cli-task")]
        task_id: String,

        /// What to write
        #[arg(long)]
        description: String,

        /// Subject the work is charged to
        #[arg(long, default_value = "demo-user")]
        subject: String,

        /// Optional domain hint (e.g., legal, medical)
        #[arg(long)]
        domain: Option<String>,

        /// Require explicit approval for every invocation (and auto-resolve
        /// it, to demonstrate the full approval round-trip)
        #[arg(long)]
        require_approval: bool,

        /// Optional orchestrator configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the final status report as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate an orchestrator configuration file
    ValidateConfig {
        /// Path to the configuration file
        path: PathBuf,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let level: Level = level.parse().with_context(|| format!("invalid log level '{}'", level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    match args.command {
        Command::Run { task_id, description, subject, domain, require_approval, config, json } => {
            run_task(task_id, description, subject, domain, require_approval, config, json).await
        }
        Command::ValidateConfig { path } => {
            OrchestratorConfig::load(&path)
                .with_context(|| format!("configuration at {} is invalid", path.display()))?;
            println!("configuration ok: {}", path.display());
            Ok(())
        }
    }
}

fn caps(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

/// Builds the demo deployment: three workers, two scripted providers, and a
/// grant for the subject.
async fn demo_service(
    config: OrchestratorConfig,
    subject: &str,
    require_approval: bool,
) -> OrchestrationService {
    let validator = CompositeValidator::new()
        .with(Box::new(MinLengthValidator::new(8)))
        .with(Box::new(PlaceholderValidator));
    let service =
        OrchestrationService::builder(config).with_validator(Arc::new(validator)).build();

    for (id, description, tags) in [
        ("drafter", "Long-form drafting", vec!["article", "technical", "general"]),
        ("summarizer", "Condensing and summaries", vec!["summary", "general"]),
        ("researcher", "Background research", vec!["research", "citations", "general"]),
    ] {
        service
            .registry()
            .register_worker(Arc::new(PromptWorker::new(
                id.to_string(),
                description.to_string(),
                tags.iter().map(|t| t.to_string()).collect(),
            )))
            .await;
    }

    let all_content = vec![
        ContentType::Article,
        ContentType::Summary,
        ContentType::Correspondence,
        ContentType::Technical,
        ContentType::Creative,
        ContentType::Marketing,
    ];
    service.router().register_provider(
        ProviderProfile::new("aurora", all_content.clone(), 3.0, 15.0, 1_800),
        Arc::new(EchoProvider::new("aurora".to_string())),
    );
    service.router().register_provider(
        ProviderProfile::new("meadow", all_content, 0.25, 1.25, 400),
        Arc::new(EchoProvider::new("meadow".to_string())),
    );

    let policy =
        if require_approval { ApprovalPolicy::Always } else { ApprovalPolicy::Never };
    service.permissions().add_grant(PermissionGrant::new(
        subject,
        GrantTarget::WorkerClass("general".to_string()),
        caps(&["article", "summary", "correspondence", "technical", "creative", "marketing"]),
        Quotas::new(50_000, 500_000, 25.0),
        policy,
    ));

    service
}

async fn run_task(
    task_id: String,
    description: String,
    subject: String,
    domain: Option<String>,
    require_approval: bool,
    config_path: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = match config_path {
        Some(path) => OrchestratorConfig::load(&path)
            .with_context(|| format!("failed to load configuration at {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    let service = Arc::new(demo_service(config, &subject, require_approval).await);

    // Stream progress, and auto-resolve approvals so the demo exercises the
    // full approval round-trip without an interactive approver.
    let mut events = service.subscribe();
    let event_service = Arc::clone(&service);
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                WorkflowEvent::TaskClassified { domain, confidence, .. } => {
                    println!("classified: domain={} confidence={:.2}", domain, confidence);
                }
                WorkflowEvent::WorkersSelected { primary, supporting, .. } => {
                    println!("workers: primary={} supporting={:?}", primary, supporting);
                }
                WorkflowEvent::ApprovalRequired { notice, .. } => {
                    println!(
                        "approval required: {} units={} est=${:.4} (auto-approving)",
                        notice.request_id, notice.units, notice.estimated_cost
                    );
                    let _ = event_service.resolve_approval(
                        &notice.request_id,
                        ApprovalDecision::Approve,
                        "cli",
                        Some("approved from cli".to_string()),
                    );
                }
                WorkflowEvent::InvocationStarted { worker_id, provider_id, attempt, .. } => {
                    println!("invocation: worker={} provider={} attempt={}", worker_id, provider_id, attempt);
                }
                WorkflowEvent::AttemptFailed { provider_id, error, .. } => {
                    println!("attempt failed on {}: {}", provider_id, error);
                }
                WorkflowEvent::WorkflowDone { status, .. } => {
                    println!("workflow done: {}", status);
                    break;
                }
                other => debug!(event = ?other, "event"),
            }
        }
    });

    let mut task = Task::new(task_id, description, DocumentScope::new("cli/session"));
    if let Some(domain) = domain {
        task = task.with_domain_hint(domain);
    }

    let workflow_id = match service.submit_task(task, &subject).await {
        Ok(id) => id,
        Err(err) => {
            let code = quill_orchestrator::ResponseCode::from_error(&err);
            bail!("submission rejected ({}): {}", code, err);
        }
    };
    println!("workflow accepted: {}", workflow_id);

    let report = loop {
        let report = service
            .workflow_status(&workflow_id)
            .context("workflow disappeared while polling")?;
        if report.status.is_terminal() {
            break report;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    let _ = printer.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\nstatus: {}", report.status);
        if let Some(failure) = &report.failure {
            println!("failure: {}", failure);
        }
        for (invocation_id, output) in &report.partial_outputs {
            println!("\n--- {} ---\n{}", invocation_id, output);
        }

        let metrics = service.router().cost_metrics();
        println!(
            "\nusage: {} units, ${:.4} across {} provider(s)",
            metrics.total_units(),
            metrics.total_cost(),
            metrics.providers.len()
        );
    }

    if report.status == quill_orchestrator::WorkflowStatus::Failed {
        bail!("workflow failed");
    }
    Ok(())
}
