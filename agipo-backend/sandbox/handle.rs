use std::path::Path;

use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// Handle to a booted sandbox. Everything the runtime needs to run chains.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Host directory backing the sandbox workspace.
    fn root(&self) -> &Path;

    // ── Exec ────────────────────────────────────────────────────

    /// Spawn a process and stream its output.
    async fn exec_stream(
        &self,
        req: ExecRequest,
    ) -> Result<Box<dyn ExecStream + Send + Unpin>, SandboxError>;

    // ── Lifecycle ───────────────────────────────────────────────

    async fn destroy(&self) -> Result<(), SandboxError>;
}

/// Stream of events from a running process.
///
/// `next_event` yields stdout/stderr chunks in arrival order, then exactly
/// one `ExecEvent::Exit`, then `None`.
#[async_trait]
pub trait ExecStream: Send {
    async fn next_event(&mut self) -> Result<Option<ExecEvent>, SandboxError>;

    /// Terminate the process and everything it started. The stream still
    /// ends with `Exit`.
    async fn kill(&mut self) -> Result<(), SandboxError>;
}
