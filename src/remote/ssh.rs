//! SSH channels via the system `ssh` and `scp` commands.
//!
//! Every command spawns a fresh `ssh` process:
//!
//! ```sh
//! ssh [options] user@host "export KEY='value'; cd '/path'; command"
//! ```
//!
//! Freshly launched instances accept connections some time after EC2
//! reports them healthy, so [`SshConnector::connect`] probes the host with
//! `true` until it answers (16 attempts, 60 s apart by default).

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::{
    Command, Connector, ExecResult, HostTarget, OutputLine, OutputStream, RemoteChannel,
    RemoteError, RemoteResult, run_with_timeout,
};
use crate::config::RemoteConfig;
use crate::waiter::{WaitError, Waiter};

/// Opens [`SshChannel`]s, retrying until the host accepts connections.
pub struct SshConnector {
    config: RemoteConfig,
    cancel: CancellationToken,
}

impl SshConnector {
    pub fn new(config: RemoteConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    fn ssh_opts(&self, target: &HostTarget) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
        ];

        if self.config.disable_host_key_check {
            opts.push("-o".to_string());
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("-o".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &target.key_file {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            opts.push("-i".to_string());
            opts.push(key);
        }

        opts
    }

    /// Connection attempts are counted, not timed: an unreachable host
    /// spends `ConnectTimeout` inside every attempt.
    fn connect_waiter(&self) -> Waiter {
        Waiter::attempts(
            Duration::from_secs(self.config.connect_interval_secs),
            self.config.connect_attempts,
        )
        .with_cancel(self.cancel.clone())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &HostTarget) -> RemoteResult<Arc<dyn RemoteChannel>> {
        let channel = SshChannel {
            host: target.host.clone(),
            user: target.user.clone(),
            port: self.config.port,
            opts: self.ssh_opts(target),
            default_timeout: self.config.command_timeout_secs,
            cancel: self.cancel.clone(),
            closed: AtomicBool::new(false),
        };

        let waiter = self.connect_waiter();
        let attempts = waiter.max_attempts().unwrap_or(1);
        let probe = Command::new("true").timeout(60);
        let last_error = Mutex::new(String::new());

        let what = format!("SSH on {}", target.host);
        let result = waiter
            .until(&what, || {
                let attempt = channel.run(&probe);
                let last_error = &last_error;
                async move {
                    let reason = match attempt.await {
                        Ok(r) if r.success() => return Ok::<_, RemoteError>(Some(())),
                        Ok(r) => r.stderr.trim().to_string(),
                        Err(RemoteError::Cancelled(c)) => return Err(RemoteError::Cancelled(c)),
                        Err(e) => e.to_string(),
                    };
                    tracing::debug!(host = %channel.host, "SSH not ready: {}", reason);
                    *last_error.lock().unwrap_or_else(PoisonError::into_inner) = reason;
                    Ok(None)
                }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(host = %target.host, "SSH channel open");
                Ok(Arc::new(channel))
            }
            Err(WaitError::Cancelled { .. }) => Err(RemoteError::Cancelled(what)),
            Err(WaitError::Failed(e)) => Err(e),
            Err(WaitError::Timeout { .. }) => Err(RemoteError::ConnectFailed {
                host: target.host.clone(),
                attempts,
                reason: last_error.into_inner().unwrap_or_else(PoisonError::into_inner),
            }),
        }
    }
}

/// A channel to one host over SSH.
pub struct SshChannel {
    host: String,
    user: String,
    port: u16,
    opts: Vec<String>,
    default_timeout: u64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SshChannel {
    /// Build the SSH destination string.
    fn ssh_dest(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Build a full SSH command.
    fn ssh_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(&self.opts);
        cmd.arg("-p").arg(self.port.to_string());
        cmd.arg(self.ssh_dest());
        cmd
    }

    fn scp_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("scp");
        cmd.arg("-r");
        cmd.args(&self.opts);
        cmd.arg("-P").arg(self.port.to_string());
        cmd
    }

    fn ensure_open(&self) -> RemoteResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::ExecFailed(format!(
                "channel to {} is closed",
                self.host
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec_stream(&self, cmd: &Command) -> RemoteResult<OutputStream> {
        self.ensure_open()?;

        let mut ssh_cmd = self.ssh_command();
        ssh_cmd.arg(cmd.to_remote_line());
        ssh_cmd.stdout(Stdio::piped());
        ssh_cmd.stderr(Stdio::piped());
        ssh_cmd.kill_on_drop(true);

        let mut child = ssh_cmd
            .spawn()
            .map_err(|e| RemoteError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::ExecFailed("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RemoteError::ExecFailed("Failed to capture stderr".to_string()))?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| OutputLine::Stderr(line.unwrap_or_default()));

        let exit = stream::once(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            OutputLine::ExitCode(code)
        });

        Ok(Box::pin(stream::select(stdout_stream, stderr_stream).chain(exit)))
    }

    async fn run(&self, cmd: &Command) -> RemoteResult<ExecResult> {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Cancelled(cmd.to_shell_string()));
        }
        let cmd = match cmd.timeout_secs {
            Some(_) => cmd.clone(),
            None => cmd.clone().timeout(self.default_timeout),
        };
        tracing::debug!(host = %self.host, "$ {}", cmd.to_shell_string());
        run_with_timeout(self, &cmd).await
    }

    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<()> {
        self.ensure_open()?;
        let output = self
            .scp_command()
            .arg(local)
            .arg(format!("{}:{}", self.ssh_dest(), remote))
            .output()
            .await
            .map_err(|e| RemoteError::Transfer(e.to_string()))?;

        if !output.status.success() {
            return Err(RemoteError::Transfer(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> RemoteResult<()> {
        self.ensure_open()?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = self
            .scp_command()
            .arg(format!("{}:{}", self.ssh_dest(), remote))
            .arg(local)
            .output()
            .await
            .map_err(|e| RemoteError::Transfer(e.to_string()))?;

        if !output.status.success() {
            return Err(RemoteError::Transfer(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> RemoteResult<()> {
        // Connections are per command; closing only refuses further use.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target() -> HostTarget {
        HostTarget {
            host: "10.0.0.1".into(),
            user: "ec2-user".into(),
            key_file: Some(PathBuf::from("/tmp/key.pem")),
        }
    }

    #[test]
    fn test_ssh_options() {
        let connector = SshConnector::new(RemoteConfig::default(), CancellationToken::new());
        let opts = connector.ssh_opts(&target());
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(opts[opts.len() - 2..], ["-i".to_string(), "/tmp/key.pem".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_makes_every_attempt_against_unreachable_host() {
        use std::sync::atomic::AtomicU32;

        let connector = SshConnector::new(RemoteConfig::default(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), WaitError<RemoteError>> = connector
            .connect_waiter()
            .until("SSH on 10.0.0.1", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    // ConnectTimeout=30 against an unreachable host
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(None)
                }
            })
            .await;

        assert!(matches!(result, Err(WaitError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_cancelled_channel_refuses_commands() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let channel = SshChannel {
            host: "10.0.0.1".into(),
            user: "ec2-user".into(),
            port: 22,
            opts: vec![],
            default_timeout: 1800,
            cancel,
            closed: AtomicBool::new(false),
        };
        assert!(matches!(
            channel.run(&Command::new("true")).await,
            Err(RemoteError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_transfers() {
        let channel = SshChannel {
            host: "10.0.0.1".into(),
            user: "ec2-user".into(),
            port: 22,
            opts: vec![],
            default_timeout: 1800,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        channel.close().await.unwrap();
        assert!(channel.put(Path::new("/etc/hosts"), "/tmp/hosts").await.is_err());
    }
}
