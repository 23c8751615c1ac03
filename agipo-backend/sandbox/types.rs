use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// ── Provider info ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxProviderInfo {
    pub name: &'static str,
}

// ── Sandbox spec (input to provision) ───────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub workspace_id: String,
    pub profile: SandboxProfile,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            profile: SandboxProfile::Base,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxProfile {
    Base,
    /// Node scripts plus a package manager for dependency installs.
    NodeScripts,
}

impl SandboxProfile {
    /// Binaries the profile expects on PATH. Missing ones are only warned about.
    pub fn required_binaries(&self) -> &'static [&'static str] {
        match self {
            SandboxProfile::Base => &["sh"],
            SandboxProfile::NodeScripts => &["sh", "node", "npm"],
        }
    }
}

// ── Exec model ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Bytes written to the process's stdin, which is then closed.
    /// `None` gives the process a null stdin.
    pub stdin: Option<Vec<u8>>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(program.into());
        command.extend(args.iter().cloned());
        Self {
            command,
            env: BTreeMap::new(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit { code: i32 },
}

// ── Backend config ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub root_dir: PathBuf,
    pub inherit_env_allowlist: Vec<String>,
    pub max_output_bytes: usize,
    /// Delay injected before a provision completes. Used to widen boot races in tests.
    pub boot_delay: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(""), // must be set by caller
            inherit_env_allowlist: vec!["PATH".into(), "HOME".into(), "LANG".into(), "TERM".into()],
            max_output_bytes: 10 * 1024 * 1024, // 10 MB
            boot_delay: None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
