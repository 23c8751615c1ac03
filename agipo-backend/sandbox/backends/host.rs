use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{ExecStream, SandboxHandle};
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;

/// Best-effort local sandbox.
///
/// Each provision gets its own workspace directory under `config.root_dir`.
/// Processes run as the current user with a filtered env.
/// NOT a security boundary; for trusted workflow code only.
pub struct HostProvider {
    config: HostConfig,
    counter: AtomicU64,
}

impl HostProvider {
    pub fn new(config: HostConfig) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&config.root_dir).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create sandboxes root {}: {e}",
                config.root_dir.display()
            ))
        })?;
        Ok(Self {
            config,
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl SandboxProvider for HostProvider {
    fn info(&self) -> SandboxProviderInfo {
        SandboxProviderInfo {
            name: "local-host",
        }
    }

    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        validate_profile(&spec.profile);

        if let Some(delay) = self.config.boot_delay {
            tokio::time::sleep(delay).await;
        }

        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let sandbox_id = format!("host-{}-{seq}", spec.workspace_id);
        // One directory per boot so a teardown never races a fresh instance.
        let workspace_dir = self.config.root_dir.join(&sandbox_id);

        tracing::info!(
            sandbox_id = %sandbox_id,
            workspace_dir = %workspace_dir.display(),
            labels = ?spec.labels,
            "provisioning local-host sandbox"
        );

        let jail = FsJail::create(workspace_dir)?;
        let supervisor = ProcessSupervisor::new(
            self.config.inherit_env_allowlist.clone(),
            self.config.max_output_bytes,
        );

        Ok(Box::new(HostHandle {
            id: sandbox_id,
            jail: Arc::new(jail),
            supervisor: Arc::new(supervisor),
            env: spec.env,
        }))
    }
}

struct HostHandle {
    id: String,
    jail: Arc<FsJail>,
    supervisor: Arc<ProcessSupervisor>,
    /// Per-sandbox env vars (from SandboxSpec.env).
    env: std::collections::BTreeMap<String, String>,
}

#[async_trait]
impl SandboxHandle for HostHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &Path {
        self.jail.root()
    }

    async fn exec_stream(
        &self,
        mut req: ExecRequest,
    ) -> Result<Box<dyn ExecStream + Send + Unpin>, SandboxError> {
        tracing::debug!(sandbox_id = %self.id, command = ?req.command, "exec in local-host sandbox");
        for (k, v) in &self.env {
            req.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let stream = self.supervisor.exec_stream(&req, self.jail.root()).await?;
        Ok(Box::new(stream))
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        tracing::info!(sandbox_id = %self.id, "destroying local-host sandbox");
        self.jail.destroy()
    }
}

/// Best-effort profile validation: log warnings if expected tools are missing.
fn validate_profile(profile: &SandboxProfile) {
    for bin in profile.required_binaries() {
        if which(bin).is_none() {
            tracing::warn!(
                binary = bin,
                "sandbox profile requires '{bin}' but it was not found on PATH"
            );
        }
    }
}

fn which(bin: &str) -> Option<std::path::PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full = dir.join(bin);
            if full.is_file() { Some(full) } else { None }
        })
    })
}
