pub mod backends;
pub mod error;
pub mod handle;
pub mod local_host;
pub mod provider;
pub mod runtime;
pub mod types;

#[cfg(test)]
pub mod fake;

pub use error::SandboxError;
pub use handle::{ExecStream, SandboxHandle};
pub use provider::SandboxProvider;
pub use runtime::{RuntimeState, SandboxRuntime};
pub use types::*;

use backends::host::HostProvider;

/// Build the sandbox provider for the local host.
pub fn build_provider(config: HostConfig) -> Result<Box<dyn SandboxProvider>, SandboxError> {
    tracing::info!(
        root_dir = %config.root_dir.display(),
        "initializing local-host sandbox provider"
    );
    Ok(Box::new(HostProvider::new(config)?))
}
