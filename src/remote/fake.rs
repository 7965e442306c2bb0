//! Scripted in-memory connector for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    Command, Connector, ExecResult, HostTarget, OutputLine, OutputStream, RemoteChannel,
    RemoteError, RemoteResult,
};

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
    delay: Duration,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    files: HashMap<String, String>,
    refused: HashSet<String>,
    commands: Vec<(String, String)>,
    puts: Vec<(String, PathBuf, String)>,
    connects: Vec<String>,
    closed: Vec<String>,
}

/// Connector whose channels answer from a script and record every command.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands containing `needle` exit with `exit_code` and print `stdout`.
    /// Later rules win over earlier ones.
    pub fn on(&self, needle: &str, exit_code: i32, stdout: &str) -> &Self {
        self.on_with(needle, exit_code, stdout, "", Duration::ZERO)
    }

    pub fn on_with(
        &self,
        needle: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        delay: Duration,
    ) -> &Self {
        self.state().rules.push(Rule {
            needle: needle.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            delay,
        });
        self
    }

    /// Content returned by `get` for `remote`.
    pub fn file(&self, remote: &str, content: &str) -> &Self {
        self.state()
            .files
            .insert(remote.to_string(), content.to_string());
        self
    }

    /// Connections to `host` fail.
    pub fn refuse(&self, host: &str) -> &Self {
        self.state().refused.insert(host.to_string());
        self
    }

    /// `(host, line)` for every command run so far.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state().commands.clone()
    }

    /// Lines run on `host`.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn puts(&self) -> Vec<(String, PathBuf, String)> {
        self.state().puts.clone()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.state().closed.clone()
    }
}

#[async_trait]
impl Connector for FakeRemote {
    async fn connect(&self, target: &HostTarget) -> RemoteResult<Arc<dyn RemoteChannel>> {
        let mut state = self.state();
        state.connects.push(target.host.clone());
        if state.refused.contains(&target.host) {
            return Err(RemoteError::ConnectFailed {
                host: target.host.clone(),
                attempts: 16,
                reason: "Connection refused".to_string(),
            });
        }
        Ok(Arc::new(FakeChannel {
            host: target.host.clone(),
            remote: self.clone(),
        }))
    }
}

/// Channel handed out by [`FakeRemote`].
pub struct FakeChannel {
    host: String,
    remote: FakeRemote,
}

impl FakeChannel {
    pub fn new(host: &str, remote: FakeRemote) -> Self {
        Self {
            host: host.to_string(),
            remote,
        }
    }

    fn answer(&self, cmd: &Command) -> Rule {
        let line = cmd.to_remote_line();
        let mut state = self.remote.state();
        state.commands.push((self.host.clone(), line.clone()));
        state
            .rules
            .iter()
            .rev()
            .find(|r| line.contains(&r.needle))
            .cloned()
            .unwrap_or(Rule {
                needle: String::new(),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                delay: Duration::ZERO,
            })
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec_stream(&self, cmd: &Command) -> RemoteResult<OutputStream> {
        let rule = self.answer(cmd);
        let mut lines: Vec<OutputLine> = rule
            .stdout
            .lines()
            .map(|l| OutputLine::Stdout(l.to_string()))
            .collect();
        lines.extend(rule.stderr.lines().map(|l| OutputLine::Stderr(l.to_string())));
        lines.push(OutputLine::ExitCode(rule.exit_code));
        Ok(Box::pin(futures::stream::iter(lines)))
    }

    async fn run(&self, cmd: &Command) -> RemoteResult<ExecResult> {
        let rule = self.answer(cmd);
        let timeout = cmd.effective_timeout();
        if rule.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RemoteError::Timeout {
                command: cmd.to_shell_string(),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(rule.delay).await;
        let with_newline = |s: &str| {
            if s.is_empty() || s.ends_with('\n') {
                s.to_string()
            } else {
                format!("{}\n", s)
            }
        };
        Ok(ExecResult {
            exit_code: rule.exit_code,
            stdout: with_newline(&rule.stdout),
            stderr: with_newline(&rule.stderr),
            duration: rule.delay,
        })
    }

    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<()> {
        self.remote
            .state()
            .puts
            .push((self.host.clone(), local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> RemoteResult<()> {
        let content = self.remote.state().files.get(remote).cloned();
        match content {
            Some(content) => {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(local, content).await?;
                Ok(())
            }
            None => Err(RemoteError::Transfer(format!("{}: No such file", remote))),
        }
    }

    async fn close(&self) -> RemoteResult<()> {
        self.remote.state().closed.push(self.host.clone());
        Ok(())
    }
}
