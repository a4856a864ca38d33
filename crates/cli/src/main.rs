mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use autopilot_core::{RunStatus, WorkflowDefinition};
use clap::{Parser, Subcommand};
use events::{Event, EventBus};
use orchestrator::{
    CommandWorkerPool, EscalationQueue, EventBusNotifier, FileTemplateRenderer, GuidanceDocument,
    GuidanceFirstPolicy, Interpreter, Projection, RunOutcome, StateStore, StateView,
    TracingNotifier, WorkerPool,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vcs::{GitVcs, VersionControl};

use crate::config::{AutopilotConfig, AUTOPILOT_DIR, CONFIG_FILE};

#[derive(Parser)]
#[command(name = "autopilot")]
#[command(about = "Run development workflows autonomously, asking a human only when needed", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project id; defaults to the configured project name.
    #[arg(short, long, global = true)]
    project: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create `.autopilot/` with a default configuration
    Init,
    /// Start a workflow, or continue the project's unfinished run of it
    Run {
        workflow: PathBuf,

        /// Never stop for confirmations
        #[arg(long)]
        unattended: bool,
    },
    /// Answer an escalation and continue its run
    Respond { id: Uuid, response: String },
    /// Continue a run that stopped on an error
    Recover { workflow: PathBuf },
    /// Show the project's run
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List escalations
    Escalations {
        /// Include resolved escalations
        #[arg(long)]
        all: bool,
    },
}

struct Runtime {
    interpreter: Interpreter,
    bus: EventBus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = std::env::current_dir()?;

    if let Commands::Init = cli.command {
        return init_project(&root).await;
    }

    init_tracing();
    let config = AutopilotConfig::load(&root).await?;
    let project = cli
        .project
        .clone()
        .unwrap_or_else(|| config.project.name.clone());

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Run {
            workflow,
            unattended,
        } => run(&root, &config, &project, &workflow, unattended).await,
        Commands::Respond { id, response } => respond(&root, &config, id, &response).await,
        Commands::Recover { workflow } => recover(&root, &config, &project, &workflow).await,
        Commands::Status { json } => status(&root, &config, &project, json).await,
        Commands::Escalations { all } => escalations(&root, &config, &project, all).await,
    }
}

async fn init_project(root: &Path) -> Result<()> {
    let dir = root.join(AUTOPILOT_DIR);
    if dir.join(CONFIG_FILE).exists() {
        println!("Project already initialized at {}", dir.display());
        return Ok(());
    }

    let mut config = AutopilotConfig::default();
    if let Some(name) = root.file_name().and_then(|n| n.to_str()) {
        config.project.name = name.to_string();
    }

    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::create_dir_all(root.join(&config.runtime.templates_dir)).await?;
    tokio::fs::write(
        AutopilotConfig::path(root),
        toml::to_string_pretty(&config)?,
    )
    .await?;

    println!("Initialized autopilot for '{}'", config.project.name);
    println!();
    println!("Next steps:");
    println!("  1. Map worker roles to commands under [workers.commands] in {}/{}", AUTOPILOT_DIR, CONFIG_FILE);
    println!("  2. Optionally write standing answers to {}", config.runtime.guidance.display());
    println!("  3. Run 'autopilot run <workflow.yaml>'");
    Ok(())
}

async fn build_runtime(root: &Path, config: &AutopilotConfig, unattended: bool) -> Result<Runtime> {
    let bus = EventBus::new();

    let vcs: Option<Arc<dyn VersionControl>> = if config.vcs.enabled {
        let git = GitVcs::new(root.to_path_buf(), root.join(&config.vcs.workspaces_dir))
            .with_main_branch(&config.vcs.main_branch);
        if git.is_available().await && git.is_initialized().await.unwrap_or(false) {
            Some(Arc::new(git))
        } else {
            tracing::warn!("Git repository not found; units of work and checkpoints are disabled");
            None
        }
    } else {
        None
    };

    let mut store = StateStore::new(root.join(&config.runtime.state_dir));
    if config.vcs.checkpoint {
        if let Some(vcs) = &vcs {
            store = store.with_checkpoints(vcs.clone());
        }
    }
    let store = Arc::new(store);

    let queue = Arc::new(
        EscalationQueue::new(store.clone())
            .with_notifier(Arc::new(TracingNotifier))
            .with_notifier(Arc::new(EventBusNotifier::new(bus.clone()))),
    );

    let mut pool = CommandWorkerPool::new(root)
        .with_timeout(Duration::from_secs(config.workers.timeout_secs));
    for (role, argv) in &config.workers.commands {
        pool = pool.with_command(role, argv.clone());
    }
    let roles: Vec<&str> = pool.roles().collect();
    if roles.is_empty() {
        tracing::warn!("No worker commands configured; delegate steps will fail");
    } else {
        tracing::debug!(roles = ?roles, "Worker commands configured");
    }
    let workers: Arc<dyn WorkerPool> = Arc::new(pool);

    let mut policy = GuidanceFirstPolicy::new().with_workers(workers.clone());
    if let Some(guidance) = GuidanceDocument::load(&root.join(&config.runtime.guidance)).await? {
        tracing::info!("Loaded {} guidance entries", guidance.entries().len());
        policy = policy.with_guidance(guidance);
    }

    let mut interpreter = Interpreter::new(
        config.interpreter_config(root, unattended),
        store,
        workers,
        Arc::new(policy),
        queue,
    )
    .with_renderer(Arc::new(FileTemplateRenderer::new(
        root.join(&config.runtime.templates_dir),
    )))
    .with_event_bus(bus.clone());
    if let Some(vcs) = vcs {
        interpreter = interpreter.with_vcs(vcs);
    }

    Ok(Runtime { interpreter, bus })
}

/// Print run progress as it happens.
fn follow(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(envelope) = rx.recv().await {
            match envelope.event {
                Event::StepCompleted { step, kind, .. } => println!("  ✓ step {} ({})", step, kind),
                Event::WorkerAttempt {
                    worker,
                    attempt,
                    success: false,
                    ..
                } => println!("  ! {} attempt {} failed", worker, attempt),
                Event::EscalationCreated {
                    escalation_id,
                    question,
                    ..
                } => println!("  ? {} ({})", question, escalation_id),
                _ => {}
            }
        }
    })
}

fn load_workflow(root: &Path, workflow: &Path) -> Result<(String, WorkflowDefinition)> {
    let definition = WorkflowDefinition::from_file(root.join(workflow))?;
    Ok((workflow.display().to_string(), definition))
}

fn report(outcome: RunOutcome) {
    println!();
    match outcome {
        RunOutcome::Completed => println!("Workflow completed."),
        RunOutcome::Suspended { escalation_id } => {
            println!("Waiting on escalation {}.", escalation_id);
            println!("Answer it with 'autopilot respond {} <answer>'.", escalation_id);
        }
        RunOutcome::Paused => println!("Run paused."),
        RunOutcome::Aborted => println!("Run aborted."),
    }
}

async fn run(
    root: &Path,
    config: &AutopilotConfig,
    project: &str,
    workflow: &Path,
    unattended: bool,
) -> Result<()> {
    let (workflow_id, definition) = load_workflow(root, workflow)?;
    let runtime = build_runtime(root, config, unattended).await?;
    let interpreter = &runtime.interpreter;
    let printer = follow(&runtime.bus);

    let state = match interpreter.store().current(project).await? {
        Some(state) if state.status != RunStatus::Completed => {
            if state.workflow != workflow_id {
                bail!(
                    "project '{}' has an unfinished run of '{}'",
                    project,
                    state.workflow
                );
            }
            println!("Continuing {} at step {}", workflow_id, state.current_step);
            state
        }
        _ => {
            println!("Starting {} for '{}'", definition.name, project);
            interpreter.start(project, &workflow_id, &definition).await?
        }
    };

    let outcome = interpreter.run(&definition, state).await;
    printer.abort();
    report(outcome?);
    Ok(())
}

async fn respond(root: &Path, config: &AutopilotConfig, id: Uuid, response: &str) -> Result<()> {
    let runtime = build_runtime(root, config, false).await?;
    let escalation = runtime.interpreter.escalations().get(id).await?;
    let (workflow_id, definition) = load_workflow(root, Path::new(&escalation.workflow))?;
    runtime.interpreter.register(workflow_id, definition).await;

    let printer = follow(&runtime.bus);
    let outcome = runtime.interpreter.respond(id, response).await;
    printer.abort();
    report(outcome?);
    Ok(())
}

async fn recover(root: &Path, config: &AutopilotConfig, project: &str, workflow: &Path) -> Result<()> {
    let (_, definition) = load_workflow(root, workflow)?;
    let runtime = build_runtime(root, config, false).await?;

    let printer = follow(&runtime.bus);
    let outcome = runtime.interpreter.recover(&definition, project).await;
    printer.abort();
    report(outcome?);
    Ok(())
}

async fn status(root: &Path, config: &AutopilotConfig, project: &str, json: bool) -> Result<()> {
    let store = StateStore::new(root.join(&config.runtime.state_dir));

    if json {
        match store.query(project, Projection::Summary).await? {
            Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
            None => println!("null"),
        }
        return Ok(());
    }

    let Some(StateView::Summary(summary)) = store.query(project, Projection::Summary).await? else {
        println!("No runs yet for '{}'.", project);
        return Ok(());
    };

    println!();
    println!("Project:  {}", summary.project_id);
    println!("Workflow: {} ({})", summary.workflow_name, summary.workflow);
    println!("Phase:    {}", summary.phase.as_str());
    println!("Status:   {}", summary.status.as_str());
    println!("Step:     {}/{}", summary.current_step, summary.total_steps);
    if let Some(id) = summary.pending_escalation {
        println!("Waiting:  escalation {}", id);
    }

    if let Some(StateView::RecentActivity { activity }) =
        store.query(project, Projection::RecentActivity(5)).await?
    {
        if !activity.is_empty() {
            println!();
            println!("Recent activity:");
            for a in activity {
                let mark = if a.error.is_some() { "✗" } else { "✓" };
                println!("  {} step {} {} #{}: {}", mark, a.step_index, a.worker, a.attempt, a.action);
            }
        }
    }
    println!();
    println!("Details: {}", store.status_path(project).display());
    Ok(())
}

async fn escalations(root: &Path, config: &AutopilotConfig, project: &str, all: bool) -> Result<()> {
    let store = Arc::new(StateStore::new(root.join(&config.runtime.state_dir)));
    let queue = EscalationQueue::new(store);
    let list = if all {
        queue.list(project).await?
    } else {
        queue.pending(project).await?
    };

    if list.is_empty() {
        println!("No escalations.");
        return Ok(());
    }

    for escalation in list {
        println!();
        println!(
            "{} [{} / {} / {}] step {}",
            escalation.id,
            escalation.kind.as_str(),
            escalation.priority.as_str(),
            escalation.status.as_str(),
            escalation.step_index
        );
        println!("  {}", escalation.question);
        if !escalation.options.is_empty() {
            println!("  options: {}", escalation.options.join(", "));
        }
        if !escalation.reasoning.is_empty() {
            println!(
                "  autopilot: {} (confidence {:.2})",
                escalation.reasoning, escalation.confidence
            );
        }
        if let Some(response) = &escalation.response {
            println!("  answered: {}", response);
        }
    }
    println!();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autopilot=info,orchestrator=info,vcs=info".into()),
        )
        .init();
}
