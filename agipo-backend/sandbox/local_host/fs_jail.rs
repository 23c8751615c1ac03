use std::path::{Path, PathBuf};

use crate::sandbox::error::SandboxError;

/// Workspace directory for the local-host backend.
///
/// This is NOT a chroot; processes spawned in the workspace can still reach
/// the host.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a new jail rooted at `root`. Creates the directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create workspace dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove the entire workspace directory.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
