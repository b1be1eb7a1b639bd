//! Builder for executing external tool commands with timeout support.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tq_core::Error;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// The child process is killed when the returned future is dropped, so
/// aborting the task that awaits it never leaves an orphaned encoder behind.
///
/// # Example
///
/// ```no_run
/// use tq_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> tq_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .arg("-v").arg("quiet")
///     .arg("-print_format").arg("json")
///     .arg("-show_format")
///     .arg("/path/to/video.mkv")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    fn spawn(&self) -> tq_core::Result<tokio::process::Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| Error::tool(self.program_name(), format!("failed to spawn: {e}")))
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the process outlives the timeout (it is killed).
    /// - [`Error::Tool`] if the process exits with a non-zero status (message
    ///   includes stderr) or cannot be spawned.
    pub async fn execute(&self) -> tq_core::Result<ToolOutput> {
        let program_name = self.program_name();
        let child = self.spawn()?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };

                if !output.status.success() {
                    return Err(Error::tool(
                        program_name,
                        format!(
                            "exited with status {}: {}",
                            output.status,
                            tool_output.stderr.trim()
                        ),
                    ));
                }

                Ok(tool_output)
            }
            Ok(Err(e)) => Err(Error::tool(
                program_name,
                format!("I/O error waiting for process: {e}"),
            )),
            // The child future was dropped, which kills the process.
            Err(_elapsed) => Err(Error::Timeout(format!(
                "{program_name} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Execute the command, handing each stderr line to `on_line` as it
    /// arrives.
    ///
    /// Used for ffmpeg's `-progress pipe:2` stream. Only the last few stderr
    /// lines are retained and reported if the process fails.
    pub async fn execute_with_stderr_lines<F>(&self, mut on_line: F) -> tq_core::Result<ToolOutput>
    where
        F: FnMut(&str),
    {
        let program_name = self.program_name();
        let mut child = self.spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::tool(&program_name, "stderr not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(&program_name, "stdout not captured"))?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut stdout_buf = String::new();

        let run = async {
            let mut lines = BufReader::new(stderr).lines();
            let drain_stdout = async {
                let _ = stdout.read_to_string(&mut stdout_buf).await;
            };
            let read_stderr = async {
                while let Ok(Some(line)) = lines.next_line().await {
                    on_line(&line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            };
            tokio::join!(drain_stdout, read_stderr);
            child.wait().await
        };

        let outcome = tokio::time::timeout(self.timeout, run).await;
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(Error::tool(
                    program_name,
                    format!("I/O error waiting for process: {e}"),
                ))
            }
            Err(_elapsed) => {
                let _ = child.start_kill();
                return Err(Error::Timeout(format!(
                    "{program_name} timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let stderr_tail = tail.into_iter().collect::<Vec<_>>().join("\n");
        if !status.success() {
            return Err(Error::tool(
                program_name,
                format!("exited with status {status}: {}", stderr_tail.trim()),
            ));
        }

        Ok(ToolOutput {
            status,
            stdout: stdout_buf,
            stderr: stderr_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_echo() {
        // `echo` should be universally available.
        let output = ToolCommand::new(PathBuf::from("echo"))
            .arg("hello")
            .execute()
            .await;

        match output {
            Ok(out) => {
                assert!(out.status.success());
                assert!(out.stdout.trim().contains("hello"));
            }
            Err(_) => {
                // On some minimal environments echo may not exist; skip.
            }
        }
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        assert!(matches!(result, Err(Error::Tool { .. })));
    }

    #[tokio::test]
    async fn timeout_fires() {
        // `sleep 10` should be killed well before 10 seconds.
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "unexpected error: {err}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn stderr_lines_are_streamed() {
        let mut seen = Vec::new();
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo one >&2; echo two >&2; echo out"])
            .execute_with_stderr_lines(|line| seen.push(line.to_string()))
            .await;

        if let Ok(out) = result {
            assert_eq!(seen, vec!["one", "two"]);
            assert_eq!(out.stdout.trim(), "out");
        }
    }

    #[tokio::test]
    async fn failing_process_reports_stderr_tail() {
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo broken input >&2; exit 3"])
            .execute_with_stderr_lines(|_| {})
            .await;

        if let Err(Error::Tool { message, .. }) = result {
            assert!(message.contains("broken input"), "message: {message}");
        }
    }
}
