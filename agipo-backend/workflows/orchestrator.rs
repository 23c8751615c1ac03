use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

use crate::sandbox::{ExecEvent, ExecRequest, ExecStream, SandboxError, SandboxRuntime};
use crate::workflows::Workflow;
use crate::workflows::events::{RunEvent, RunEventType};
use crate::workflows::graph::{self, Chain, GraphError};
use crate::workflows::script::{self, ScriptOptions};

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Receives everything a run produces, in order.
///
/// Every chain gets exactly one `on_chain_start` and one
/// `on_chain_complete`, and chains never overlap.
pub trait RunListener: Send {
    fn on_output(&mut self, chunk: &str);

    fn on_chain_start(&mut self, _chain: &Chain) {}

    fn on_chain_complete(&mut self, _chain: &Chain, _outcome: &ChainOutcome) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    TimedOut {
        after: Duration,
    },
}

impl ChainOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChainOutcome::Succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct ChainReport {
    pub node_ids: Vec<String>,
    pub outcome: ChainOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub chains: Vec<ChainReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.chains.iter().all(|c| c.outcome.is_success())
    }

    pub fn failed_count(&self) -> usize {
        self.chains.iter().filter(|c| !c.outcome.is_success()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Blank package name; nothing was spawned.
    Skipped,
    Installed,
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub script: ScriptOptions,
    /// Shell that reads the generated command from stdin (`-s`).
    pub shell: String,
    /// Package manager invocation; the quoted package name is appended.
    pub install_command: String,
    /// Kill a chain or install that runs longer than this.
    pub exec_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            script: ScriptOptions::default(),
            shell: "sh".into(),
            install_command: "npm install".into(),
            exec_timeout: None,
        }
    }
}

/// Sequences chain execution and dependency installs against the shared
/// sandbox runtime. Holds no node state; callers observe progress through
/// [`RunListener`] and, optionally, broadcast [`RunEvent`]s.
pub struct Orchestrator {
    runtime: Arc<SandboxRuntime>,
    config: OrchestratorConfig,
    events_tx: Option<broadcast::Sender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<SandboxRuntime>, config: OrchestratorConfig) -> Self {
        Self {
            runtime,
            config,
            events_tx: None,
        }
    }

    pub fn with_events(mut self, events_tx: broadcast::Sender<RunEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    pub fn runtime(&self) -> &Arc<SandboxRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn emit(
        &self,
        run_id: &str,
        chain: Option<&Chain>,
        event_type: RunEventType,
        message: impl Into<String>,
    ) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(RunEvent {
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                chain: chain.map(|c| c.node_ids().into_iter().map(String::from).collect()),
                event_type,
                message: message.into(),
            });
        }
    }

    /// Install one package into the scratch directory.
    ///
    /// Never fails: problems end up as a failure line in the output.
    pub async fn install_dependency(
        &self,
        package: &str,
        listener: &mut dyn RunListener,
    ) -> InstallOutcome {
        let package = package.trim();
        if package.is_empty() {
            tracing::debug!("empty package name, skipping install");
            return InstallOutcome::Skipped;
        }

        let run_id = Uuid::new_v4().to_string();
        let mut sink = OutputSink::new(listener);
        sink.line(&format!("Installing {package}..."));
        self.emit(&run_id, None, RunEventType::InstallStarted, package);
        tracing::info!(package, "installing dependency");

        let command = format!(
            "{} && {} {}",
            script::workdir_prelude(&self.config.script),
            self.config.install_command,
            script::shell_quote(package)
        );

        let failure = match self.stream_command(&run_id, None, &command, &mut sink).await {
            Ok(0) => None,
            Ok(code) => Some(format!("exited with code {code}")),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                sink.line(&format!("✓ Installed {package}"));
                self.emit(&run_id, None, RunEventType::InstallCompleted, package);
                tracing::info!(package, "✓ dependency installed");
                InstallOutcome::Installed
            }
            Some(message) => {
                sink.line(&format!("✗ Failed to install {package}: {message}"));
                self.emit(&run_id, None, RunEventType::InstallFailed, &message);
                tracing::warn!(package, error = %message, "✗ dependency install failed");
                InstallOutcome::Failed { message }
            }
        }
    }

    /// Plan the workflow and run every chain, one at a time, in source order.
    ///
    /// Only a malformed graph is an error; it is reported before anything is
    /// spawned. A failing chain is recorded and the run moves on.
    pub async fn run_workflow(
        &self,
        workflow: &Workflow,
        listener: &mut dyn RunListener,
    ) -> Result<RunSummary, GraphError> {
        let chains = graph::plan(workflow)?;

        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("workflow_run", run = %&run_id[..8]);
        self.emit(
            &run_id,
            None,
            RunEventType::RunStarted,
            format!("{} chain(s)", chains.len()),
        );
        tracing::info!(parent: &span, nodes = workflow.nodes.len(), chains = chains.len(), "▶ Started");

        let start = Instant::now();
        let mut reports = Vec::with_capacity(chains.len());
        for chain in chains.iter().filter(|c| !c.is_empty()) {
            let report = self
                .run_chain(&run_id, chain, listener)
                .instrument(span.clone())
                .await;
            reports.push(report);
        }

        let summary = RunSummary {
            run_id: run_id.clone(),
            chains: reports,
        };
        let elapsed = start.elapsed().as_secs_f64();
        self.emit(
            &run_id,
            None,
            RunEventType::RunCompleted,
            format!(
                "{} chain(s), {} failed, {elapsed:.1}s",
                summary.chains.len(),
                summary.failed_count()
            ),
        );
        if summary.succeeded() {
            tracing::info!(parent: &span, elapsed = format_args!("{elapsed:.1}s"), "✓ Completed");
        } else {
            tracing::warn!(
                parent: &span,
                failed = summary.failed_count(),
                elapsed = format_args!("{elapsed:.1}s"),
                "✗ Completed with failures"
            );
        }

        Ok(summary)
    }

    async fn run_chain(
        &self,
        run_id: &str,
        chain: &Chain,
        listener: &mut dyn RunListener,
    ) -> ChainReport {
        listener.on_chain_start(chain);
        self.emit(run_id, Some(chain), RunEventType::ChainStarted, chain.to_string());
        tracing::info!(chain = %chain, "chain started");

        let start = Instant::now();
        let mut sink = OutputSink::new(listener);
        let command = script::build_full_command(chain, &self.config.script);
        tracing::debug!(command = %command, "spawning chain");

        let outcome = match self.stream_command(run_id, Some(chain), &command, &mut sink).await {
            Ok(0) => ChainOutcome::Succeeded,
            Ok(code) => ChainOutcome::Failed {
                exit_code: Some(code),
                message: format!("exited with code {code}"),
            },
            Err(SandboxError::Timeout(after)) => ChainOutcome::TimedOut { after },
            Err(e) => ChainOutcome::Failed {
                exit_code: None,
                message: e.to_string(),
            },
        };

        match &outcome {
            ChainOutcome::Succeeded => {
                sink.line(&format!("✓ Chain {chain} finished"));
                self.emit(run_id, Some(chain), RunEventType::ChainCompleted, "finished");
                tracing::info!(chain = %chain, "✓ chain finished");
            }
            ChainOutcome::Failed { message, .. } => {
                sink.line(&format!("✗ Chain {chain} failed: {message}"));
                self.emit(run_id, Some(chain), RunEventType::ChainFailed, message);
                tracing::error!(chain = %chain, error = %message, "✗ chain failed");
            }
            ChainOutcome::TimedOut { after } => {
                let message = format!("timed out after {after:?}");
                sink.line(&format!("✗ Chain {chain} {message}"));
                self.emit(run_id, Some(chain), RunEventType::ChainFailed, &message);
                tracing::error!(chain = %chain, "✗ chain {message}");
            }
        }

        let listener = sink.into_inner();
        listener.on_chain_complete(chain, &outcome);

        ChainReport {
            node_ids: chain.node_ids().into_iter().map(String::from).collect(),
            outcome,
            elapsed: start.elapsed(),
        }
    }

    /// Feed `command` to `<shell> -s` and forward its output until exit.
    ///
    /// The command travels on stdin because a chain carries every node's
    /// source and may exceed the kernel's per-argument limit.
    async fn stream_command(
        &self,
        run_id: &str,
        chain: Option<&Chain>,
        command: &str,
        sink: &mut OutputSink<'_>,
    ) -> Result<i32, SandboxError> {
        let req = ExecRequest::new(&self.config.shell, &["-s".to_string()])
            .with_stdin(stdin_script(command));
        let mut stream = self.runtime.spawn(req).await?;

        let Some(limit) = self.config.exec_timeout else {
            return self.drain(run_id, chain, stream.as_mut(), sink).await;
        };

        let result = tokio::time::timeout(limit, self.drain(run_id, chain, stream.as_mut(), sink)).await;
        match result {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(limit = ?limit, "process exceeded timeout, killing");
                let _ = stream.kill().await;
                // Let the kill land before the caller reuses or tears down the workspace.
                let reaped = tokio::time::timeout(KILL_GRACE, async {
                    while let Ok(Some(event)) = stream.next_event().await {
                        if matches!(event, ExecEvent::Exit { .. }) {
                            break;
                        }
                    }
                })
                .await;
                if reaped.is_err() {
                    tracing::warn!(grace = ?KILL_GRACE, "killed process did not exit in time");
                }
                Err(SandboxError::Timeout(limit))
            }
        }
    }

    async fn drain(
        &self,
        run_id: &str,
        chain: Option<&Chain>,
        stream: &mut (dyn ExecStream + Send + Unpin),
        sink: &mut OutputSink<'_>,
    ) -> Result<i32, SandboxError> {
        let mut stdout = Utf8Chunks::default();
        let mut stderr = Utf8Chunks::default();

        while let Some(event) = stream.next_event().await? {
            let text = match event {
                ExecEvent::Stdout(bytes) => stdout.push(&bytes),
                ExecEvent::Stderr(bytes) => stderr.push(&bytes),
                ExecEvent::Exit { code } => {
                    for rest in [stdout.finish(), stderr.finish()] {
                        self.forward(run_id, chain, rest, sink);
                    }
                    return Ok(code);
                }
            };
            self.forward(run_id, chain, text, sink);
        }

        Err(SandboxError::Exec(
            "process output ended without an exit status".into(),
        ))
    }

    fn forward(&self, run_id: &str, chain: Option<&Chain>, text: String, sink: &mut OutputSink<'_>) {
        if text.is_empty() {
            return;
        }
        sink.write(&text);
        self.emit(run_id, chain, RunEventType::Output, text);
    }
}

/// Wrap `command` in a brace group reading from `/dev/null`. The shell
/// parses the whole group before running it, so no node can consume the
/// rest of the script as its own stdin.
fn stdin_script(command: &str) -> String {
    format!("{{ {command}\n}} < /dev/null\n")
}

/// Listener wrapper that knows whether the output is at a line start, so
/// status lines never glue onto unterminated process output.
struct OutputSink<'a> {
    listener: &'a mut dyn RunListener,
    at_line_start: bool,
}

impl<'a> OutputSink<'a> {
    fn new(listener: &'a mut dyn RunListener) -> Self {
        Self {
            listener,
            at_line_start: true,
        }
    }

    fn write(&mut self, text: &str) {
        self.listener.on_output(text);
        self.at_line_start = text.ends_with('\n');
    }

    fn line(&mut self, text: &str) {
        if !self.at_line_start {
            self.write("\n");
        }
        self.write(&format!("{text}\n"));
    }

    fn into_inner(self) -> &'a mut dyn RunListener {
        self.listener
    }
}

/// Decodes a byte stream into text without splitting multi-byte characters
/// across chunk boundaries.
#[derive(Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
