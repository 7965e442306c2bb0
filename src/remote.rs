//! Remote execution on provisioned hosts.
//!
//! A [`RemoteChannel`] is an open line to one host: run shell commands with a
//! mandatory timeout, copy files in and out, and run commands inside a named
//! container on that host. Channels are opened by a [`Connector`], which
//! absorbs instance-boot variance by retrying the connection.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Connector                             │
//! │  connect(HostTarget) ──────────► RemoteChannel              │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RemoteChannel                           │
//! │  run(Command) ───────────► ExecResult                       │
//! │  exec_stream(Command) ───► OutputStream                     │
//! │  put / get                                                  │
//! │  container_run / container_put                              │
//! │  close()                                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Implementation | Module | Transport |
//! |----------------|--------|-----------|
//! | SSH | [`ssh`] | system `ssh` / `scp` |
//! | Local | [`local`] | child processes on this machine |
//!
//! A non-zero exit code is a normal [`ExecResult`], not an error. Callers
//! that want failure semantics opt in with [`ExecResult::check`].

pub mod local;
pub mod ssh;

#[cfg(test)]
pub mod fake;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};

/// Commands without an explicit timeout are bounded by this.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur while talking to a host.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Could not open a channel after all connection attempts.
    #[error("Failed to connect to {host} after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        host: String,
        attempts: u32,
        reason: String,
    },

    /// A command exited non-zero and the caller asked for failure semantics.
    #[error("Command '{command}' exited with code {exit_code}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The command could not be started or its output could not be read.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The command ran longer than its timeout and was killed.
    #[error("Command '{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// A file copy failed.
    #[error("File transfer failed: {0}")]
    Transfer(String),

    /// The run was cancelled before the command started.
    #[error("Cancelled before running '{0}'")]
    Cancelled(String),

    /// I/O error during local file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to execute on a host.
///
/// Commands are either a program with arguments, escaped for the shell, or a
/// verbatim shell snippet built with [`Command::script`].
///
/// # Example
///
/// ```
/// use dlc_orchestrator::remote::Command;
///
/// let cmd = Command::new("docker")
///     .arg("pull")
///     .arg("repo:2.6.0-gpu-py312-ubuntu22.04")
///     .env("AWS_REGION", "us-west-2")
///     .timeout(600);
///
/// assert_eq!(cmd.to_shell_string(), "docker pull 'repo:2.6.0-gpu-py312-ubuntu22.04'");
/// assert_eq!(cmd.timeout_secs, Some(600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program, or the whole snippet for scripts.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<String>,

    /// Environment variables exported before the command runs.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds; [`DEFAULT_COMMAND_TIMEOUT`] when unset.
    pub timeout_secs: Option<u64>,

    script: bool,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
            script: false,
        }
    }

    /// A shell snippet passed to the remote shell unchanged.
    ///
    /// ```
    /// use dlc_orchestrator::remote::Command;
    /// let cmd = Command::script("nvidia-smi && echo ok");
    /// assert_eq!(cmd.to_shell_string(), "nvidia-smi && echo ok");
    /// ```
    pub fn script(text: impl Into<String>) -> Self {
        Self {
            script: true,
            ..Self::new(text)
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The effective timeout.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }

    /// Converts the command to a shell-executable string.
    ///
    /// ```
    /// use dlc_orchestrator::remote::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        if self.script {
            return self.program.clone();
        }
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }

    /// The full line sent to a remote shell: exports, `cd`, then the command.
    pub fn to_remote_line(&self) -> String {
        let mut line = String::new();
        for (key, value) in &self.env {
            line.push_str(&format!("export {}={}; ", key, quote(value)));
        }
        if let Some(dir) = &self.working_dir {
            line.push_str(&format!("cd {}; ", quote(dir)));
        }
        line.push_str(&self.to_shell_string());
        line
    }
}

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command; -1 when it was killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit into [`RemoteError::CommandFailed`].
    pub fn check(self, command: &Command) -> RemoteResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::CommandFailed {
                command: command.to_shell_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }

    /// Stdout followed by stderr, as written to the entry log.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// A single line of output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

/// A stream of output lines from a command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Drains `stream` into an [`ExecResult`], logging each line under `host`.
pub async fn collect_output(host: &str, mut stream: OutputStream, start: Instant) -> ExecResult {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit_code = -1;

    while let Some(line) = stream.next().await {
        match line {
            OutputLine::Stdout(s) => {
                tracing::debug!(host = %host, "{}", s);
                stdout.push_str(&s);
                stdout.push('\n');
            }
            OutputLine::Stderr(s) => {
                tracing::debug!(host = %host, stream = "stderr", "{}", s);
                stderr.push_str(&s);
                stderr.push('\n');
            }
            OutputLine::ExitCode(code) => exit_code = code,
        }
    }

    ExecResult {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
    }
}

/// Runs `cmd` on `channel` bounded by the command's timeout.
///
/// The process behind the stream is killed when the timeout drops it.
pub async fn run_with_timeout<C>(channel: &C, cmd: &Command) -> RemoteResult<ExecResult>
where
    C: RemoteChannel + ?Sized,
{
    let start = Instant::now();
    let timeout = cmd.effective_timeout();
    let stream = channel.exec_stream(cmd).await?;

    tokio::time::timeout(timeout, collect_output(channel.host(), stream, start))
        .await
        .map_err(|_| RemoteError::Timeout {
            command: cmd.to_shell_string(),
            secs: timeout.as_secs(),
        })
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub user: String,
    pub key_file: Option<PathBuf>,
}

/// An open line to one host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Host name or address this channel talks to.
    fn host(&self) -> &str;

    /// Starts a command and streams its output, ending with the exit code.
    async fn exec_stream(&self, cmd: &Command) -> RemoteResult<OutputStream>;

    /// Runs a command to completion.
    async fn run(&self, cmd: &Command) -> RemoteResult<ExecResult>;

    /// Copies a local file or directory to the host.
    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<()>;

    /// Copies a file or directory from the host.
    async fn get(&self, remote: &str, local: &Path) -> RemoteResult<()>;

    /// Runs a command inside a running container on the host.
    async fn container_run(&self, container: &str, cmd: &Command) -> RemoteResult<ExecResult> {
        self.run(&docker_exec(container, cmd)).await
    }

    /// Copies a local file into a running container on the host.
    ///
    /// The file is staged under `/tmp` on the host and moved in with
    /// `docker cp`.
    async fn container_put(&self, container: &str, local: &Path, remote: &str) -> RemoteResult<()> {
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let staged = format!("/tmp/{}-{}", uuid::Uuid::new_v4(), file_name);

        self.put(local, &staged).await?;
        let copy = Command::new("docker")
            .arg("cp")
            .arg(&staged)
            .arg(format!("{}:{}", container, remote));
        let result = self.run(&copy).await?;
        let _ = self.run(&Command::new("rm").arg("-rf").arg(&staged)).await;

        if result.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer(format!(
                "docker cp into {} failed: {}",
                container,
                result.stderr.trim()
            )))
        }
    }

    /// Closes the channel. Idempotent.
    async fn close(&self) -> RemoteResult<()>;
}

/// Opens channels to hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &HostTarget) -> RemoteResult<Arc<dyn RemoteChannel>>;
}

/// Wraps `cmd` in `docker exec` against `container`.
pub fn docker_exec(container: &str, cmd: &Command) -> Command {
    let mut exec = Command::new("docker").arg("exec");
    for (key, value) in &cmd.env {
        exec = exec.arg("-e").arg(format!("{}={}", key, value));
    }
    if let Some(dir) = &cmd.working_dir {
        exec = exec.arg("-w").arg(dir.clone());
    }
    exec = exec
        .arg(container)
        .arg("bash")
        .arg("-c")
        .arg(cmd.to_shell_string());
    match cmd.timeout_secs {
        Some(secs) => exec.timeout(secs),
        None => exec,
    }
}

/// Escape a string for use in a shell command.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        quote(s)
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
