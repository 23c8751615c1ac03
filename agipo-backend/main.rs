use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agipo::config::Config;
use agipo::sandbox::{SandboxProfile, SandboxProvider, SandboxRuntime, SandboxSpec};
use agipo::workflows::Workflow;
use agipo::workflows::canvas::Canvas;
use agipo::workflows::events::RunEvent;
use agipo::workflows::file_repository::FileWorkflowRepository;
use agipo::workflows::mapping::validate_mappings;
use agipo::workflows::orchestrator::{InstallOutcome, Orchestrator, RunSummary};
use agipo::workflows::repository::{StoredWorkflow, WorkflowRepository};
use agipo::workflows::script;

#[derive(Parser)]
#[command(name = "agipo", about = "Workflow graph runner")]
enum Cli {
    /// Save the two-node starter workflow
    Init {
        #[arg(long, default_value = "default")]
        id: String,
        #[arg(long, default_value = "Untitled workflow")]
        name: String,
        /// Overwrite an existing workflow with the same id
        #[arg(long)]
        force: bool,
    },
    /// List stored workflows
    List,
    /// Print the planned chains and the command each one runs
    Chains {
        #[command(flatten)]
        source: WorkflowSource,
    },
    /// Run a workflow, streaming its output
    Run {
        #[command(flatten)]
        source: WorkflowSource,
        /// Install a package into the scratch directory first (repeatable)
        #[arg(long = "install", value_name = "PACKAGE")]
        packages: Vec<String>,
        /// Print run events as JSON lines on stderr
        #[arg(long)]
        events: bool,
    },
}

#[derive(clap::Args)]
struct WorkflowSource {
    /// Stored workflow id
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    id: Option<String>,
    /// Read the workflow from a JSON file instead of the store
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agipo=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Init { id, name, force } => init(&config, id, name, force).await,
        Cli::List => list(&config).await,
        Cli::Chains { source } => chains(&config, &source).await,
        Cli::Run {
            source,
            packages,
            events,
        } => run(&config, &source, &packages, events).await,
    }
}

async fn open_repository(config: &Config) -> Result<FileWorkflowRepository> {
    let repo = FileWorkflowRepository::new(&config.data_dir);
    repo.load_all()
        .await
        .with_context(|| format!("failed to load workflows from {}", config.data_dir.display()))?;
    Ok(repo)
}

async fn load_workflow(config: &Config, source: &WorkflowSource) -> Result<Workflow> {
    if let Some(path) = &source.file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if let Ok(stored) = serde_json::from_str::<StoredWorkflow>(&content) {
            return Ok(stored.workflow());
        }
        return serde_json::from_str::<Workflow>(&content)
            .with_context(|| format!("{} is not a workflow document", path.display()));
    }

    let id = source
        .id
        .as_deref()
        .context("a workflow id or --file is required")?;
    let repo = open_repository(config).await?;
    repo.get(id)
        .await
        .map(|stored| stored.workflow())
        .with_context(|| format!("workflow not found: {id}"))
}

async fn init(config: &Config, id: String, name: String, force: bool) -> Result<()> {
    let repo = open_repository(config).await?;
    if !force && repo.get(&id).await.is_some() {
        bail!("workflow {id} already exists (use --force to overwrite)");
    }
    let saved = repo
        .save(StoredWorkflow::new(id, name, Workflow::default_template()))
        .await
        .context("failed to save workflow")?;
    println!(
        "Created workflow {} at {}",
        saved.id,
        config.data_dir.join("workflows").join(format!("{}.json", saved.id)).display()
    );
    Ok(())
}

async fn list(config: &Config) -> Result<()> {
    let repo = open_repository(config).await?;
    let workflows = repo.list().await;
    if workflows.is_empty() {
        println!("No workflows. Create one with `agipo init`.");
        return Ok(());
    }
    for wf in workflows {
        let modified = wf
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{}\t{}\t{} nodes, {} edges\t{modified}",
            wf.id,
            wf.name,
            wf.nodes.len(),
            wf.edges.len()
        );
    }
    Ok(())
}

async fn chains(config: &Config, source: &WorkflowSource) -> Result<()> {
    let workflow = load_workflow(config, source).await?;
    let canvas = Canvas::new(workflow);
    let opts = config.orchestrator_config().script;

    for issue in validate_mappings(&canvas.snapshot()) {
        println!("warning: {issue}");
    }

    let planned = canvas.chains()?;
    if planned.is_empty() {
        println!("No chains: the workflow has no source nodes.");
    }
    for (i, chain) in planned.iter().enumerate() {
        println!("Chain {}: {chain}", i + 1);
        println!("  {}", script::build_full_command(chain, &opts));
    }
    Ok(())
}

fn sandbox_spec(config: &Config) -> SandboxSpec {
    let mut spec = SandboxSpec::new("cli");
    if config.interpreter.split_whitespace().next() == Some("node") {
        spec.profile = SandboxProfile::NodeScripts;
    }
    spec.labels.insert("environment".into(), config.environment.clone());
    spec
}

async fn run(
    config: &Config,
    source: &WorkflowSource,
    packages: &[String],
    events: bool,
) -> Result<()> {
    let workflow = load_workflow(config, source).await?;

    let provider: Arc<dyn SandboxProvider> = Arc::from(
        agipo::sandbox::build_provider(config.host_config()).context("failed to set up sandbox")?,
    );
    let runtime = Arc::new(SandboxRuntime::new(provider, sandbox_spec(config)));
    let mut orchestrator = Orchestrator::new(Arc::clone(&runtime), config.orchestrator_config());
    let mut event_printer = None;
    if events {
        let (events_tx, events_rx) = broadcast::channel::<RunEvent>(256);
        orchestrator = orchestrator.with_events(events_tx);
        event_printer = Some(tokio::spawn(print_events(events_rx)));
    }

    let mut canvas = Canvas::new(workflow).with_output_tap(|chunk| {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    });
    tokio::spawn(log_node_status(canvas.subscribe()));

    let mut result: Result<Option<RunSummary>> = Ok(None);
    for package in packages {
        match canvas.install(&orchestrator, package).await {
            Ok(InstallOutcome::Failed { message }) => {
                result = Err(anyhow::anyhow!("failed to install {package}: {message}"));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
    }
    if result.is_ok() {
        result = canvas.run(&orchestrator).await.map(Some).map_err(Into::into);
    }

    drop(orchestrator);
    if let Some(printer) = event_printer {
        let _ = printer.await;
    }
    if let Err(e) = runtime.teardown().await {
        tracing::warn!(error = %e, "failed to tear down sandbox");
    }

    if let Some(summary) = result? {
        if !summary.succeeded() {
            bail!(
                "{} of {} chain(s) failed",
                summary.failed_count(),
                summary.chains.len()
            );
        }
    }
    Ok(())
}

async fn log_node_status(mut updates: watch::Receiver<Arc<Workflow>>) {
    while updates.changed().await.is_ok() {
        let running: Vec<String> = updates
            .borrow_and_update()
            .nodes
            .iter()
            .filter(|n| n.is_running)
            .map(|n| n.id.clone())
            .collect();
        if !running.is_empty() {
            tracing::debug!(nodes = ?running, "nodes running");
        }
    }
}

async fn print_events(mut events_rx: broadcast::Receiver<RunEvent>) {
    loop {
        match events_rx.recv().await {
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
