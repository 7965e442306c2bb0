//! Channel that runs commands as child processes on this machine.
//!
//! The orchestrator host talks to Kubernetes through `kubectl` and to
//! nothing else locally, so this channel is small: a shell, a working
//! directory and a base environment. File transfer is a local copy.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{
    Command, ExecResult, OutputLine, OutputStream, RemoteChannel, RemoteError, RemoteResult,
    run_with_timeout,
};

/// Runs commands with `shell -c` in a fixed working directory.
pub struct LocalChannel {
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
}

impl LocalChannel {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            env: Vec::new(),
            shell: "/bin/sh".to_string(),
        }
    }

    /// Adds a variable set for every command on this channel.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.working_dir.join(path)
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn exec_stream(&self, cmd: &Command) -> RemoteResult<OutputStream> {
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(cmd.to_shell_string());
        process.current_dir(&self.working_dir);

        for (key, value) in self.env.iter().chain(cmd.env.iter()) {
            process.env(key, value);
        }
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }

        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| RemoteError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::ExecFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RemoteError::ExecFailed("stderr not captured".to_string()))?;

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
        run_with_timeout(self, cmd).await
    }

    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<()> {
        let dest = self.resolve(remote);
        copy_any(local, &dest)
            .await
            .map_err(|e| RemoteError::Transfer(e.to_string()))
    }

    async fn get(&self, remote: &str, local: &Path) -> RemoteResult<()> {
        let src = self.resolve(remote);
        copy_any(&src, local)
            .await
            .map_err(|e| RemoteError::Transfer(e.to_string()))
    }

    async fn close(&self) -> RemoteResult<()> {
        Ok(())
    }
}

async fn copy_any(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if src.is_dir() {
        copy_dir_all(src, dst).await
    } else {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }
}

/// Recursively copy a directory.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_with_env_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new(dir.path()).with_env("BASE", "one");

        let result = channel
            .run(&Command::script("echo $BASE $EXTRA; exit 3").env("EXTRA", "two"))
            .await
            .unwrap();

        assert_eq!(result.stdout.trim(), "one two");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let channel = LocalChannel::default();
        let result = channel.run(&Command::new("sleep").arg("5").timeout(1)).await;
        assert!(matches!(result, Err(RemoteError::Timeout { secs: 1, .. })));
    }

    #[tokio::test]
    async fn test_put_and_get_copy_directories() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested/a.txt"), "a").unwrap();

        let work = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new(work.path());
        channel.put(src.path(), "staged").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(work.path().join("staged/nested/a.txt")).unwrap(),
            "a"
        );

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("copy.txt");
        channel.get("staged/nested/a.txt", &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "a");
    }
}
