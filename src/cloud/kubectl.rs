//! [`KubeApi`] over the `aws` and `kubectl` command line tools.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::*;
use crate::remote::local::LocalChannel;
use crate::remote::{Command, ExecResult, RemoteChannel, RemoteError};

const KUBECTL_TIMEOUT_SECS: u64 = 15 * 60;

/// Runs `kubectl` through a channel, locally by default.
pub struct KubectlCli {
    channel: Arc<dyn RemoteChannel>,
    timeout_secs: u64,
}

impl KubectlCli {
    pub fn new() -> Self {
        Self::with_channel(Arc::new(LocalChannel::default()))
    }

    pub fn with_channel(channel: Arc<dyn RemoteChannel>) -> Self {
        Self {
            channel,
            timeout_secs: KUBECTL_TIMEOUT_SECS,
        }
    }

    fn kubectl(&self, target: &KubeTarget) -> Command {
        Command::new("kubectl")
            .env("KUBECONFIG", target.kubeconfig.to_string_lossy())
            .timeout(self.timeout_secs)
    }

    async fn run(&self, cmd: Command) -> CloudResult<ExecResult> {
        debug!(command = %cmd.to_shell_string(), "kubectl");
        let result = self.channel.run(&cmd).await.map_err(remote_error)?;
        if result.success() {
            Ok(result)
        } else {
            Err(cli_error(&result))
        }
    }
}

impl Default for KubectlCli {
    fn default() -> Self {
        Self::new()
    }
}

fn remote_error(err: RemoteError) -> CloudError {
    CloudError::Unavailable(err.to_string())
}

/// Classifies a failed CLI call by its stderr.
fn cli_error(result: &ExecResult) -> CloudError {
    let stderr = result.stderr.trim();
    if stderr.contains("NotFound") || stderr.contains("not found") {
        CloudError::NotFound(stderr.to_string())
    } else if stderr.contains("Throttling")
        || stderr.contains("connection refused")
        || stderr.contains("i/o timeout")
        || stderr.contains("TLS handshake timeout")
    {
        CloudError::Unavailable(stderr.to_string())
    } else {
        CloudError::Api {
            code: format!("ExitCode{}", result.exit_code),
            message: stderr.to_string(),
        }
    }
}

/// Parses `kubectl apply -o name` output (`deployment.apps/vllm`).
fn parse_objects(stdout: &str) -> Vec<KubeObject> {
    stdout
        .lines()
        .filter_map(|line| {
            let (kind, name) = line.trim().split_once('/')?;
            Some(KubeObject {
                kind: kind.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodState,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PodState {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    container_statuses: Vec<ContainerState>,
}

#[derive(Deserialize)]
struct ContainerState {
    #[serde(default)]
    ready: bool,
}

fn parse_pods(json: &str) -> CloudResult<Vec<PodStatus>> {
    let list: PodList = serde_json::from_str(json).map_err(|e| CloudError::Api {
        code: "InvalidPodList".to_string(),
        message: e.to_string(),
    })?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| PodStatus {
            name: pod.metadata.name,
            phase: pod.status.phase,
            containers_ready: pod
                .status
                .container_statuses
                .iter()
                .map(|c| c.ready)
                .collect(),
        })
        .collect())
}

#[async_trait]
impl KubeApi for KubectlCli {
    async fn write_kubeconfig(&self, cluster: &str, region: &str, path: &Path) -> CloudResult<()> {
        let cmd = Command::new("aws")
            .args(["eks", "update-kubeconfig", "--name", cluster, "--region", region])
            .arg("--kubeconfig")
            .arg(path.to_string_lossy())
            .timeout(self.timeout_secs);
        self.run(cmd).await.map(|_| ())
    }

    async fn namespace_exists(&self, target: &KubeTarget, namespace: &str) -> CloudResult<bool> {
        let cmd = self
            .kubectl(target)
            .args(["get", "namespace", namespace, "-o", "name"]);
        match self.run(cmd).await {
            Ok(_) => Ok(true),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_namespace(
        &self,
        target: &KubeTarget,
        namespace: &str,
        labels: &Tags,
    ) -> CloudResult<()> {
        self.run(self.kubectl(target).args(["create", "namespace", namespace]))
            .await?;
        if !labels.is_empty() {
            let cmd = self
                .kubectl(target)
                .args(["label", "namespace", namespace, "--overwrite"])
                .args(labels.iter().map(|(k, v)| format!("{}={}", k, v)));
            self.run(cmd).await?;
        }
        Ok(())
    }

    async fn delete_namespace(&self, target: &KubeTarget, namespace: &str) -> CloudResult<()> {
        let cmd = self
            .kubectl(target)
            .args(["delete", "namespace", namespace, "--wait=true", "--timeout=10m"]);
        self.run(cmd).await.map(|_| ())
    }

    async fn apply(
        &self,
        target: &KubeTarget,
        namespace: &str,
        manifest: &str,
    ) -> CloudResult<Vec<KubeObject>> {
        let file = tempfile::Builder::new()
            .prefix("manifest-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| CloudError::Unavailable(e.to_string()))?;
        tokio::fs::write(file.path(), manifest)
            .await
            .map_err(|e| CloudError::Unavailable(e.to_string()))?;

        let cmd = self
            .kubectl(target)
            .args(["apply", "-n", namespace, "-o", "name", "-f"])
            .arg(file.path().to_string_lossy());
        let result = self.run(cmd).await?;
        Ok(parse_objects(&result.stdout))
    }

    async fn delete_object(
        &self,
        target: &KubeTarget,
        namespace: &str,
        object: &KubeObject,
    ) -> CloudResult<()> {
        let cmd = self
            .kubectl(target)
            .args(["delete", "-n", namespace, "--wait=true"])
            .arg(object.to_string());
        self.run(cmd).await.map(|_| ())
    }

    async fn pods(&self, target: &KubeTarget, namespace: &str) -> CloudResult<Vec<PodStatus>> {
        let cmd = self
            .kubectl(target)
            .args(["get", "pods", "-n", namespace, "-o", "json"]);
        let result = self.run(cmd).await?;
        parse_pods(&result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::remote::fake::{FakeChannel, FakeRemote};

    fn target() -> KubeTarget {
        KubeTarget {
            cluster: "dlc-pr".into(),
            kubeconfig: PathBuf::from("/tmp/kubeconfig-dlc-pr"),
        }
    }

    fn cli(remote: &FakeRemote) -> KubectlCli {
        KubectlCli::with_channel(Arc::new(FakeChannel::new("localhost", remote.clone())))
    }

    #[test]
    fn test_parse_applied_objects() {
        let objects = parse_objects("deployment.apps/vllm\nservice/vllm-svc\n\n");
        assert_eq!(
            objects,
            vec![
                KubeObject {
                    kind: "deployment.apps".into(),
                    name: "vllm".into()
                },
                KubeObject {
                    kind: "service".into(),
                    name: "vllm-svc".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_pods() {
        let json = r#"{"items":[
            {"metadata":{"name":"a"},"status":{"phase":"Running","containerStatuses":[{"ready":true}]}},
            {"metadata":{"name":"b"},"status":{"phase":"Pending"}}
        ]}"#;
        let pods = parse_pods(json).unwrap();
        assert!(pods[0].is_ready());
        assert!(!pods[1].is_ready());
        assert_eq!(pods[1].name, "b");
    }

    #[tokio::test]
    async fn test_missing_namespace_is_not_an_error() {
        let remote = FakeRemote::new();
        remote.on_with(
            "get namespace vllm",
            1,
            "",
            "Error from server (NotFound): namespaces \"vllm\" not found",
            Duration::ZERO,
        );

        assert!(!cli(&remote).namespace_exists(&target(), "vllm").await.unwrap());
    }

    #[tokio::test]
    async fn test_commands_carry_kubeconfig() {
        let remote = FakeRemote::new();
        let mut labels = Tags::new();
        labels.insert("dlc-ci/run-id".into(), "r1".into());

        cli(&remote)
            .create_namespace(&target(), "vllm", &labels)
            .await
            .unwrap();

        let commands = remote.commands_on("localhost");
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("export KUBECONFIG='/tmp/kubeconfig-dlc-pr';"));
        assert!(commands[0].contains("kubectl create namespace vllm"));
        assert!(commands[1].contains("dlc-ci/run-id=r1"));
    }

    #[tokio::test]
    async fn test_failed_apply_is_classified() {
        let remote = FakeRemote::new();
        remote.on_with("apply", 1, "", "error: unable to recognize", Duration::ZERO);

        let err = cli(&remote)
            .apply(&target(), "vllm", "kind: Pod\nmetadata:\n  name: p\n")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Api { .. }));
    }
}
