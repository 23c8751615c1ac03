use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::ExecStream;
use crate::sandbox::types::{ExecEvent, ExecRequest};

const READ_CHUNK: usize = 8 * 1024;
const TRUNCATED_NOTICE: &[u8] = b"\n[output truncated]\n";

/// Wraps `tokio::process::Command` with env filtering, an output cap and
/// kill. Used by `HostProvider`.
///
/// Every process leads its own process group, so a kill also reaches the
/// interpreters a shell pipeline started.
pub struct ProcessSupervisor {
    /// Environment variables to inherit from host (allowlist).
    pub env_allowlist: Vec<String>,
    /// Maximum stdout+stderr bytes forwarded per process.
    pub max_output_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
        }
    }

    /// Build a filtered env map: only allowlisted host vars + request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    /// Start a process and stream its stdout/stderr as chunks.
    ///
    /// `req.stdin` is written and then closed; without it stdin is null.
    /// Dropping the returned stream kills the process.
    pub async fn exec_stream(
        &self,
        req: &ExecRequest,
        working_dir: &Path,
    ) -> Result<ProcessExecStream, SandboxError> {
        let (program, args) = req
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Exec("empty command".into()))?;

        let env = self.build_env(&req.env);

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(working_dir);
        cmd.env_clear();
        for (k, v) in &env {
            cmd.env(k, v);
        }
        cmd.stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Exec("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Exec("stderr was not captured".into()))?;

        tracing::debug!(program = %program, pid = ?child.id(), "process spawned");

        if let (Some(bytes), Some(mut stdin)) = (req.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // The process may exit without reading everything.
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::debug!(error = %e, "stdin closed early");
                }
            });
        }

        // Multiplex stdout and stderr into a single event channel
        let (tx, rx) = mpsc::unbounded_channel();
        let budget = Arc::new(AtomicUsize::new(self.max_output_bytes));

        let stdout_handle = tokio::spawn(pump(stdout, tx.clone(), budget.clone(), ExecEvent::Stdout));
        let stderr_handle = tokio::spawn(pump(stderr, tx.clone(), budget, ExecEvent::Stderr));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // Wait for exit in background, drain stdout/stderr before sending Exit
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Some(pid) = child.id() {
                        kill_process_group(pid).await;
                    }
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = stdout_handle.await;
            let _ = stderr_handle.await;
            let code = match status {
                Ok(s) => s.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(error = %e, "waiting on child failed");
                    -1
                }
            };
            let _ = tx.send(ExecEvent::Exit { code });
        });

        Ok(ProcessExecStream {
            rx,
            kill_tx: Some(kill_tx),
        })
    }
}

/// SIGKILL the whole group led by `pid`.
async fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("kill -KILL -{pid}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            tracing::warn!(pid, error = %e, "failed to kill process group");
        }
    }
    #[cfg(not(unix))]
    {
        tracing::warn!(pid, "process group kill not implemented on this platform");
    }
}

/// Forward reads from one pipe until EOF, charging every byte to the
/// shared budget. Past the budget the pipe is still drained so the child
/// never blocks on a full pipe.
async fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ExecEvent>,
    budget: Arc<AtomicUsize>,
    wrap: fn(Vec<u8>) -> ExecEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut truncated = false;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if truncated {
            continue;
        }
        let left = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                Some(left.saturating_sub(n))
            })
            .unwrap_or_else(|prev| prev);
        let take = left.min(n);
        if take > 0 {
            let _ = tx.send(wrap(buf[..take].to_vec()));
        }
        if take < n {
            truncated = true;
            let _ = tx.send(ExecEvent::Stderr(TRUNCATED_NOTICE.to_vec()));
        }
    }
}

/// ExecStream implementation backed by a child process.
pub struct ProcessExecStream {
    rx: mpsc::UnboundedReceiver<ExecEvent>,
    kill_tx: Option<oneshot::Sender<()>>,
}

#[async_trait::async_trait]
impl ExecStream for ProcessExecStream {
    async fn next_event(&mut self) -> Result<Option<ExecEvent>, SandboxError> {
        Ok(self.rx.recv().await)
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(vec!["PATH".into()], 1024 * 1024)
    }

    fn sh(script: &str) -> ExecRequest {
        ExecRequest::new("sh", &["-c".to_string(), script.to_string()])
    }

    /// Drain a stream into (stdout, stderr, exit code).
    async fn collect(stream: &mut ProcessExecStream) -> (String, String, Option<i32>) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        while let Ok(Some(event)) = stream.next_event().await {
            match event {
                ExecEvent::Stdout(d) => out.extend(d),
                ExecEvent::Stderr(d) => err.extend(d),
                ExecEvent::Exit { code: c } => code = Some(c),
            }
        }
        (
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
            code,
        )
    }

    #[tokio::test]
    async fn exec_stream_echo() {
        let sup = supervisor();
        let mut stream = sup
            .exec_stream(&ExecRequest::new("echo", &["streaming".to_string()]), &PathBuf::from("."))
            .await
            .unwrap();

        let (out, _, code) = collect(&mut stream).await;
        assert_eq!(out.trim(), "streaming");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn exec_stream_nonzero_exit_and_stderr() {
        let sup = supervisor();
        let mut stream = sup
            .exec_stream(&sh("echo oops >&2; exit 42"), &PathBuf::from("."))
            .await
            .unwrap();

        let (_, err, code) = collect(&mut stream).await;
        assert_eq!(err.trim(), "oops");
        assert_eq!(code, Some(42));
    }

    #[tokio::test]
    async fn exec_stream_pipeline() {
        let sup = supervisor();
        let mut stream = sup
            .exec_stream(&sh("printf 'hello' | tr a-z A-Z"), &PathBuf::from("."))
            .await
            .unwrap();

        let (out, _, code) = collect(&mut stream).await;
        assert_eq!(out, "HELLO");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn exec_stream_runs_in_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let mut stream = sup
            .exec_stream(&sh("printf x > marker.txt"), tmp.path())
            .await
            .unwrap();

        let (_, _, code) = collect(&mut stream).await;
        assert_eq!(code, Some(0));
        assert!(tmp.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn exec_env_filtering() {
        // Only PATH is in allowlist; request vars are passed through
        let sup = ProcessSupervisor::new(vec!["PATH".into()], 1024 * 1024);
        let mut req = sh("echo \"$MY_VAR\"");
        req.env.insert("MY_VAR".into(), "my_value".into());

        let mut stream = sup.exec_stream(&req, &PathBuf::from(".")).await.unwrap();
        let (out, _, _) = collect(&mut stream).await;
        assert_eq!(out.trim(), "my_value");
    }

    #[tokio::test]
    async fn exec_empty_command_errors() {
        let sup = supervisor();
        let req = ExecRequest {
            command: vec![],
            env: BTreeMap::new(),
            stdin: None,
        };
        assert!(sup.exec_stream(&req, &PathBuf::from(".")).await.is_err());
    }

    #[tokio::test]
    async fn kill_terminates_process() {
        let sup = supervisor();
        let mut stream = sup
            .exec_stream(&ExecRequest::new("sleep", &["60".to_string()]), &PathBuf::from("."))
            .await
            .unwrap();

        stream.kill().await.unwrap();
        let (_, _, code) = tokio::time::timeout(Duration::from_secs(5), collect(&mut stream))
            .await
            .expect("killed process should exit promptly");
        assert_eq!(code, Some(-1));
    }

    #[tokio::test]
    async fn kill_reaches_background_children() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor();
        // The background sleep inherits stdout, so the stream only ends
        // once it is gone too.
        let mut stream = sup
            .exec_stream(&sh("sleep 60 & echo $! > bg.pid; wait"), tmp.path())
            .await
            .unwrap();

        let pid_file = tmp.path().join("bg.pid");
        for _ in 0..100 {
            if std::fs::read_to_string(&pid_file).is_ok_and(|s| s.ends_with('\n')) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(pid_file.exists());

        stream.kill().await.unwrap();
        let (_, _, code) = tokio::time::timeout(Duration::from_secs(5), collect(&mut stream))
            .await
            .expect("background child should die with its group");
        assert_eq!(code, Some(-1));
    }

    #[tokio::test]
    async fn stdin_bytes_reach_the_process() {
        let sup = supervisor();
        let req = ExecRequest::new("tr", &["a-z".to_string(), "A-Z".to_string()])
            .with_stdin("piped in\n");
        let mut stream = sup.exec_stream(&req, &PathBuf::from(".")).await.unwrap();

        let (out, _, code) = collect(&mut stream).await;
        assert_eq!(out, "PIPED IN\n");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn script_larger_than_an_argument_runs_from_stdin() {
        let sup = supervisor();
        let script = format!("# {}\necho done\n", "x".repeat(256 * 1024));
        let req = ExecRequest::new("sh", &["-s".to_string()]).with_stdin(script);
        let mut stream = sup.exec_stream(&req, &PathBuf::from(".")).await.unwrap();

        let (out, err, code) = collect(&mut stream).await;
        assert_eq!(out, "done\n", "{err}");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn output_cap_truncates() {
        let sup = ProcessSupervisor::new(vec!["PATH".into()], 10);
        let mut stream = sup
            .exec_stream(&sh("printf '0123456789ABCDEF'"), &PathBuf::from("."))
            .await
            .unwrap();

        let (out, err, code) = collect(&mut stream).await;
        assert_eq!(out, "0123456789");
        assert!(err.contains("[output truncated]"));
        assert_eq!(code, Some(0));
    }
}
