use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::HostConfig;
use crate::workflows::orchestrator::OrchestratorConfig;
use crate::workflows::script::ScriptOptions;

/// Runner configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub sandbox_root: PathBuf,
    pub interpreter: String,
    pub script_extension: String,
    pub install_command: String,
    pub exec_timeout: Option<Duration>,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(|key| std::env::var(key).ok(), dirs::home_dir().as_deref())
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(get: impl Fn(&str) -> Option<String>, home_dir: Option<&Path>) -> Self {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("AGIPO_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            home_dir
                .unwrap_or_else(|| Path::new("."))
                .join(".agipo")
        });

        let sandbox_root = get("AGIPO_SANDBOX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sandboxes"));

        let interpreter = get("AGIPO_INTERPRETER").unwrap_or_else(|| "node".to_string());

        let script_extension = get("AGIPO_SCRIPT_EXTENSION")
            .map(|ext| ext.trim_start_matches('.').to_string())
            .unwrap_or_else(|| default_extension(&interpreter).to_string());

        let install_command =
            get("AGIPO_INSTALL_COMMAND").unwrap_or_else(|| "npm install".to_string());

        let exec_timeout = get("AGIPO_EXEC_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let sentry_dsn = get("SENTRY_DSN");

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        Config {
            data_dir,
            sandbox_root,
            interpreter,
            script_extension,
            install_command,
            exec_timeout,
            sentry_dsn,
            environment,
        }
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            root_dir: self.sandbox_root.clone(),
            ..HostConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            script: ScriptOptions {
                interpreter: self.interpreter.clone(),
                extension: self.script_extension.clone(),
                ..ScriptOptions::default()
            },
            install_command: self.install_command.clone(),
            exec_timeout: self.exec_timeout,
            ..OrchestratorConfig::default()
        }
    }
}

fn default_extension(interpreter: &str) -> &'static str {
    let program = interpreter.split_whitespace().next().unwrap_or_default();
    let program = program.rsplit('/').next().unwrap_or(program);
    match program {
        "node" | "bun" => "js",
        "deno" | "ts-node" | "tsx" => "ts",
        "python" | "python3" => "py",
        "sh" | "bash" | "zsh" | "dash" => "sh",
        "ruby" => "rb",
        _ => "txt",
    }
}
