//! In-memory provider for runtime and orchestrator tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::{ExecStream, SandboxHandle};
use super::provider::SandboxProvider;
use super::types::*;

type Responder = dyn Fn(&ExecRequest) -> Result<Vec<ExecEvent>, SandboxError> + Send + Sync;

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<ExecRequest>>,
    destroyed: Mutex<Vec<String>>,
}

pub struct FakeProvider {
    provisions: AtomicUsize,
    boot_failures_left: AtomicUsize,
    delay: Option<Duration>,
    responder: Arc<Responder>,
    shared: Arc<Shared>,
}

impl FakeProvider {
    /// Every command prints nothing and exits 0.
    pub fn new() -> Self {
        Self {
            provisions: AtomicUsize::new(0),
            boot_failures_left: AtomicUsize::new(0),
            delay: None,
            responder: Arc::new(|_| Ok(vec![ExecEvent::Exit { code: 0 }])),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_boots(self, count: usize) -> Self {
        self.boot_failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<Vec<ExecEvent>, SandboxError> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.requests().into_iter().map(|req| req.command).collect()
    }

    /// Stdin of every request, decoded; empty when none was given.
    pub fn scripts(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|req| String::from_utf8_lossy(&req.stdin.unwrap_or_default()).into_owned())
            .collect()
    }

    fn requests(&self) -> Vec<ExecRequest> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.shared.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            name: "fake",
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let seq = self.provisions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .boot_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SandboxError::Provision("scripted boot failure".into()));
        }
        Ok(Box::new(FakeHandle {
            id: format!("fake-{}-{seq}", spec.workspace_id),
            root: PathBuf::from("/fake"),
            responder: Arc::clone(&self.responder),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeHandle {
    id: String,
    root: PathBuf,
    responder: Arc<Responder>,
    shared: Arc<Shared>,
}

#[async_trait]
impl SandboxHandle for FakeHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn exec_stream(
        &self,
        req: ExecRequest,
    ) -> Result<Box<dyn ExecStream + Send + Unpin>, SandboxError> {
        self.shared.requests.lock().unwrap().push(req.clone());
        let events = (self.responder)(&req)?;
        Ok(Box::new(FakeStream {
            events: events.into(),
        }))
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        self.shared.destroyed.lock().unwrap().push(self.id.clone());
        Ok(())
    }
}

struct FakeStream {
    events: VecDeque<ExecEvent>,
}

#[async_trait]
impl ExecStream for FakeStream {
    async fn next_event(&mut self) -> Result<Option<ExecEvent>, SandboxError> {
        Ok(self.events.pop_front())
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.events.clear();
        self.events.push_back(ExecEvent::Exit { code: -1 });
        Ok(())
    }
}
