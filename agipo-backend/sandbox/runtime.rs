use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

use super::error::SandboxError;
use super::handle::{ExecStream, SandboxHandle};
use super::provider::SandboxProvider;
use super::types::{ExecRequest, SandboxSpec};

type BootResult = Result<Arc<dyn SandboxHandle>, Arc<SandboxError>>;
type BootFuture = Shared<BoxFuture<'static, BootResult>>;

/// Observable lifecycle of a [`SandboxRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Booting,
    Ready,
    TornDown,
}

enum Slot {
    Uninitialized,
    Booting { generation: u64, boot: BootFuture },
    Ready {
        generation: u64,
        handle: Arc<dyn SandboxHandle>,
    },
    TornDown,
}

/// The single sandbox instance of a session.
///
/// Boots lazily on first use. Every caller that arrives while a boot is in
/// flight awaits the same shared boot future, so at most one provision runs
/// at a time. Processes may be spawned concurrently against a ready
/// instance. Finishing or killing outstanding processes before
/// [`teardown`](Self::teardown) is the caller's job.
pub struct SandboxRuntime {
    provider: Arc<dyn SandboxProvider>,
    spec: SandboxSpec,
    slot: Mutex<Slot>,
    boots: AtomicU64,
}

impl SandboxRuntime {
    pub fn new(provider: Arc<dyn SandboxProvider>, spec: SandboxSpec) -> Self {
        Self {
            provider,
            spec,
            slot: Mutex::new(Slot::Uninitialized),
            boots: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> RuntimeState {
        match &*self.slot.lock().await {
            Slot::Uninitialized => RuntimeState::Uninitialized,
            Slot::Booting { .. } => RuntimeState::Booting,
            Slot::Ready { .. } => RuntimeState::Ready,
            Slot::TornDown => RuntimeState::TornDown,
        }
    }

    /// Number of boots started over the runtime's lifetime.
    pub fn boot_count(&self) -> u64 {
        self.boots.load(Ordering::SeqCst)
    }

    /// Return the ready instance, booting it first if needed.
    pub async fn ensure_instance(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let (generation, boot) = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                Slot::Ready { handle, .. } => return Ok(Arc::clone(handle)),
                Slot::Booting { generation, boot } => (*generation, boot.clone()),
                Slot::Uninitialized | Slot::TornDown => {
                    let generation = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
                    let boot = self.start_boot(generation);
                    *slot = Slot::Booting {
                        generation,
                        boot: boot.clone(),
                    };
                    (generation, boot)
                }
            }
        };

        let result = boot.await;

        let mut slot = self.slot.lock().await;
        let still_current =
            matches!(&*slot, Slot::Booting { generation: g, .. } if *g == generation);
        let already_ready =
            matches!(&*slot, Slot::Ready { generation: g, .. } if *g == generation);

        match result {
            Ok(handle) if still_current => {
                tracing::info!(
                    sandbox_id = %handle.id(),
                    root = %handle.root().display(),
                    generation,
                    "sandbox runtime ready"
                );
                *slot = Slot::Ready {
                    generation,
                    handle: Arc::clone(&handle),
                };
                Ok(handle)
            }
            // Another waiter on the same boot already promoted it.
            Ok(handle) if already_ready => Ok(handle),
            Ok(_) => Err(SandboxError::Boot("runtime was torn down during boot".into())),
            Err(e) => {
                if still_current {
                    tracing::error!(generation, error = %e, "sandbox boot failed");
                    *slot = Slot::Uninitialized;
                }
                Err(SandboxError::Boot(e.to_string()))
            }
        }
    }

    fn start_boot(&self, generation: u64) -> BootFuture {
        let provider = Arc::clone(&self.provider);
        let spec = self.spec.clone();
        async move {
            tracing::info!(
                generation,
                provider = provider.info().name,
                workspace = %spec.workspace_id,
                "booting sandbox runtime"
            );
            provider
                .provision(spec)
                .await
                .map(|handle| -> Arc<dyn SandboxHandle> { Arc::from(handle) })
                .map_err(Arc::new)
        }
        .boxed()
        .shared()
    }

    /// Spawn `req` inside the instance, booting it if needed.
    pub async fn spawn(
        &self,
        req: ExecRequest,
    ) -> Result<Box<dyn ExecStream + Send + Unpin>, SandboxError> {
        let handle = self.ensure_instance().await?;
        handle.exec_stream(req).await
    }

    /// Release the instance. A later `ensure_instance` boots from scratch.
    /// No-op when nothing was ever booted.
    pub async fn teardown(&self) -> Result<(), SandboxError> {
        let previous = {
            let mut slot = self.slot.lock().await;
            if matches!(&*slot, Slot::Uninitialized | Slot::TornDown) {
                return Ok(());
            }
            std::mem::replace(&mut *slot, Slot::TornDown)
        };

        let handle = match previous {
            Slot::Ready { handle, .. } => handle,
            Slot::Booting { boot, .. } => match boot.await {
                Ok(handle) => handle,
                Err(_) => return Ok(()),
            },
            Slot::Uninitialized | Slot::TornDown => return Ok(()),
        };

        tracing::info!(sandbox_id = %handle.id(), "tearing down sandbox runtime");
        handle.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::FakeProvider;
    use std::time::Duration;

    fn runtime(provider: &Arc<FakeProvider>) -> SandboxRuntime {
        SandboxRuntime::new(provider.clone(), SandboxSpec::new("session"))
    }

    #[tokio::test]
    async fn starts_uninitialized() {
        let provider = Arc::new(FakeProvider::new());
        let rt = runtime(&provider);
        assert_eq!(rt.state().await, RuntimeState::Uninitialized);
        assert_eq!(rt.boot_count(), 0);
        assert_eq!(provider.provisions(), 0);
    }

    #[tokio::test]
    async fn concurrent_ensure_boots_once() {
        let provider = Arc::new(FakeProvider::new().with_delay(Duration::from_millis(50)));
        let rt = Arc::new(runtime(&provider));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let rt = Arc::clone(&rt);
            tasks.push(tokio::spawn(async move { rt.ensure_instance().await }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id().to_string());
        }

        assert_eq!(provider.provisions(), 1);
        assert_eq!(rt.boot_count(), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(rt.state().await, RuntimeState::Ready);
    }

    #[tokio::test]
    async fn repeated_ensure_after_ready_reuses_instance() {
        let provider = Arc::new(FakeProvider::new());
        let rt = runtime(&provider);

        let a = rt.ensure_instance().await.unwrap();
        let b = rt.ensure_instance().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.provisions(), 1);
    }

    #[tokio::test]
    async fn teardown_then_ensure_reboots() {
        let provider = Arc::new(FakeProvider::new());
        let rt = runtime(&provider);

        let first = rt.ensure_instance().await.unwrap();
        rt.teardown().await.unwrap();
        assert_eq!(rt.state().await, RuntimeState::TornDown);
        assert_eq!(provider.destroyed(), vec![first.id().to_string()]);

        let second = rt.ensure_instance().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(provider.provisions(), 2);
        assert_eq!(rt.boot_count(), 2);
    }

    #[tokio::test]
    async fn teardown_without_boot_is_noop() {
        let provider = Arc::new(FakeProvider::new());
        let rt = runtime(&provider);

        rt.teardown().await.unwrap();
        rt.teardown().await.unwrap();
        assert_eq!(rt.state().await, RuntimeState::Uninitialized);
        assert!(provider.destroyed().is_empty());
    }

    #[tokio::test]
    async fn failed_boot_resets_and_retries() {
        let provider = Arc::new(FakeProvider::new().failing_boots(1));
        let rt = runtime(&provider);

        let err = rt.ensure_instance().await.err().expect("first boot should fail");
        assert!(matches!(err, SandboxError::Boot(_)));
        assert_eq!(rt.state().await, RuntimeState::Uninitialized);

        rt.ensure_instance().await.unwrap();
        assert_eq!(provider.provisions(), 2);
        assert_eq!(rt.state().await, RuntimeState::Ready);
    }

    #[tokio::test]
    async fn spawn_boots_lazily() {
        let provider = Arc::new(FakeProvider::new());
        let rt = runtime(&provider);

        let req = ExecRequest::new("sh", &["-s".into()]).with_stdin("true\n");
        let mut stream = rt.spawn(req).await.unwrap();
        while let Ok(Some(_)) = stream.next_event().await {}

        assert_eq!(provider.provisions(), 1);
        assert_eq!(
            provider.commands(),
            vec![vec!["sh".to_string(), "-s".to_string()]]
        );
        assert_eq!(provider.scripts(), vec!["true\n".to_string()]);
    }

    #[tokio::test]
    async fn waiter_never_gets_a_handle_from_a_superseded_boot() {
        let provider = Arc::new(FakeProvider::new().with_delay(Duration::from_millis(100)));
        let rt = Arc::new(runtime(&provider));
        let later: Arc<dyn SandboxHandle> =
            Arc::from(provider.provision(SandboxSpec::new("later")).await.unwrap());

        let waiter = tokio::spawn({
            let rt = Arc::clone(&rt);
            async move { rt.ensure_instance().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rt.state().await, RuntimeState::Booting);

        // Generation 1 is torn down and generation 2 is installed while the
        // waiter is still parked on generation 1's boot.
        *rt.slot.lock().await = Slot::Ready {
            generation: 2,
            handle: Arc::clone(&later),
        };

        let err = waiter.await.unwrap().err().expect("stale boot must not be handed out");
        assert!(matches!(err, SandboxError::Boot(_)));

        let current = rt.ensure_instance().await.unwrap();
        assert!(Arc::ptr_eq(&current, &later));
    }

    #[tokio::test]
    async fn teardown_during_boot_fails_waiters_and_destroys_instance() {
        let provider = Arc::new(FakeProvider::new().with_delay(Duration::from_millis(80)));
        let rt = Arc::new(runtime(&provider));

        let waiter = tokio::spawn({
            let rt = Arc::clone(&rt);
            async move { rt.ensure_instance().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        rt.teardown().await.unwrap();
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(rt.state().await, RuntimeState::TornDown);
        assert_eq!(provider.destroyed().len(), 1);
    }
}
