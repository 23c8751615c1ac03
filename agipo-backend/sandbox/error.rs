use std::io;

/// Errors from sandbox operations.
///
/// Backends map their internal failures into these variants. `Boot` is
/// what every waiter on a shared boot receives when that boot fails.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("provision failed: {0}")]
    Provision(String),

    #[error("boot failed: {0}")]
    Boot(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
