//! Shell sandbox interface: out-of-process command execution behind a trait.
//!
//! The production sandbox is supplied by the embedding application;
//! [`LocalToolAdapter`] is a non-sandboxed reference implementation for
//! tests and the demo binary.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default cap on combined stdout+stderr before truncation.
pub const DEFAULT_MAX_SHELL_RESPONSE_CHARS: usize = 25_000;

/// Default execution timeout.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Result of one shell invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Out-of-process shell execution, cancellable via `cancel` and bounded by
/// an adapter-configured timeout.
#[async_trait::async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn execute(&self, cmd: &str, cancel: CancellationToken) -> ShellResult;
}

/// Middle-omission truncation, preserving both ends of the output.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let chars: Vec<char> = output.chars().collect();
    let total = chars.len();
    let half = max_chars / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[total - half..].iter().collect();
    let omitted = total - max_chars;
    format!("{head}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{tail}")
}

/// Non-sandboxed reference `ToolAdapter`: spawns `sh -c <cmd>` directly on
/// this host. Not a production sandbox — for tests and the demo binary only.
pub struct LocalToolAdapter {
    timeout: Duration,
    max_response_chars: usize,
}

impl LocalToolAdapter {
    pub fn new(timeout: Duration, max_response_chars: usize) -> Self {
        Self {
            timeout,
            max_response_chars,
        }
    }
}

impl Default for LocalToolAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL_TIMEOUT, DEFAULT_MAX_SHELL_RESPONSE_CHARS)
    }
}

#[async_trait::async_trait]
impl ToolAdapter for LocalToolAdapter {
    async fn execute(&self, cmd: &str, cancel: CancellationToken) -> ShellResult {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return ShellResult {
                    ok: false,
                    stdout: String::new(),
                    stderr: format!("failed to spawn: {e}"),
                    exit_code: -1,
                }
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let read_fut = async {
            let stdout_read = async {
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut stdout_buf).await;
                }
            };
            let stderr_read = async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut stderr_buf).await;
                }
            };
            tokio::join!(stdout_read, stderr_read);
            child.wait().await
        };
        tokio::pin!(read_fut);

        tokio::select! {
            status = &mut read_fut => {
                match status {
                    Ok(status) => ShellResult {
                        ok: status.success(),
                        stdout: truncate_output(&String::from_utf8_lossy(&stdout_buf), self.max_response_chars),
                        stderr: truncate_output(&String::from_utf8_lossy(&stderr_buf), self.max_response_chars),
                        exit_code: status.code().unwrap_or(-1),
                    },
                    Err(e) => ShellResult {
                        ok: false,
                        stdout: String::new(),
                        stderr: e.to_string(),
                        exit_code: -1,
                    },
                }
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(cmd = %cmd, "local tool adapter: command timed out");
                ShellResult {
                    ok: false,
                    stdout: String::new(),
                    stderr: "tool execution timed out".to_string(),
                    exit_code: -1,
                }
            }
            _ = cancel.cancelled() => {
                warn!(cmd = %cmd, "local tool adapter: command cancelled");
                ShellResult {
                    ok: false,
                    stdout: String::new(),
                    stderr: "tool execution cancelled".to_string(),
                    exit_code: -1,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_simple_command() {
        let adapter = LocalToolAdapter::default();
        let result = adapter.execute("echo hello", CancellationToken::new()).await;
        assert!(result.ok);
        assert!(result.stdout.contains("hello"));
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn captures_nonzero_exit_code() {
        let adapter = LocalToolAdapter::default();
        let result = adapter.execute("exit 3", CancellationToken::new()).await;
        assert!(!result.ok);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let adapter = LocalToolAdapter::new(Duration::from_secs(5), DEFAULT_MAX_SHELL_RESPONSE_CHARS);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = adapter.execute("sleep 5", cancel).await;
        assert!(!result.ok);
        assert!(result.stderr.contains("cancelled"));
    }

    #[test]
    fn truncate_preserves_both_ends() {
        let input = format!("{}{}", "A".repeat(20), "B".repeat(20));
        let out = truncate_output(&input, 10);
        assert!(out.starts_with('A'));
        assert!(out.ends_with('B'));
        assert!(out.contains("TRUNCATED"));
    }
}
