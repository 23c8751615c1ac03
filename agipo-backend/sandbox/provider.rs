use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::{SandboxProviderInfo, SandboxSpec};

/// Factory for sandboxes.
///
/// The runtime holds one provider and calls `provision()` once per boot.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Metadata about this provider.
    fn info(&self) -> SandboxProviderInfo;

    /// Create a new sandbox from the given spec.
    async fn provision(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError>;
}
