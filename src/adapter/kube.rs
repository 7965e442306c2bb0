//! Managed-Kubernetes (EKS) adapter.
//!
//! Entries run against an existing cluster (or one created for them with
//! `create_cluster: true`). Setup writes a kubeconfig private to the entry,
//! creates the entry's namespace, optionally provisions a Lustre volume
//! for the pods, applies the entry's manifests and waits for every pod in
//! the namespace to be ready. Commands run on the orchestrator host with
//! the kubeconfig exported.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    AdapterContext, AdapterError, AdapterResult, AdapterState, Lifecycle, PlatformAdapter,
    ResourceSet, health_wait, recoverable,
};
use crate::buildspec::template::Template;
use crate::buildspec::validate::manifest_paths;
use crate::cloud::{Cluster, ClusterRequest, KubeTarget, ResourceStatus, Tags};
use crate::image::ImageDescriptor;
use crate::plan::{Params, PlatformFamily, TestEntry};
use crate::provider::{FilesystemSpec, ProvisionError};
use crate::remote::{Command, ExecResult};
use crate::waiter::Waiter;

/// Static Lustre volume plus a claim the entry's pods can mount.
const FSX_VOLUME: &str = r#"apiVersion: v1
kind: PersistentVolume
metadata:
  name: {{ volume_name }}
spec:
  capacity:
    storage: {{ capacity }}Gi
  volumeMode: Filesystem
  accessModes:
    - ReadWriteMany
  mountOptions:
    - flock
  persistentVolumeReclaimPolicy: Retain
  csi:
    driver: fsx.csi.aws.com
    volumeHandle: {{ filesystem_id }}
    volumeAttributes:
      dnsname: {{ dns_name }}
      mountname: {{ mount_name }}
---
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: fsx-claim
spec:
  accessModes:
    - ReadWriteMany
  storageClassName: ""
  resources:
    requests:
      storage: {{ capacity }}Gi
  volumeName: {{ volume_name }}
"#;

pub struct KubeAdapter {
    ctx: AdapterContext,
    entry: TestEntry,
    life: Lifecycle,
    params: Params,
    target: Option<KubeTarget>,
    namespace: String,
}

impl KubeAdapter {
    pub fn new(ctx: AdapterContext, entry: TestEntry, _image: ImageDescriptor) -> Self {
        Self {
            ctx,
            entry,
            life: Lifecycle::new(),
            params: Params::new(),
            target: None,
            namespace: String::new(),
        }
    }

    fn owner(&self) -> &str {
        &self.entry.id
    }

    fn required<'a>(params: &'a Params, name: &str) -> AdapterResult<&'a str> {
        params
            .str(name)
            .ok_or_else(|| AdapterError::invalid_param(name, "required"))
    }

    /// The entry's cluster, ACTIVE.
    async fn cluster(&self, params: &Params) -> AdapterResult<Cluster> {
        let provider = &self.ctx.provider;
        let name = Self::required(params, "cluster")?;

        match provider.describe_cluster(name).await? {
            Some(cluster) if cluster.status == ResourceStatus::Active => Ok(cluster),
            Some(cluster) if cluster.status == ResourceStatus::Creating => {
                info!(cluster = %name, "Waiting for cluster to become ACTIVE");
                Ok(provider.wait_cluster_active(name).await?)
            }
            Some(cluster) => Err(ProvisionError::Failed {
                what: format!("use cluster {}", name),
                reason: format!("cluster is {:?}", cluster.status),
            }
            .into()),
            None if params.flag("create_cluster") => {
                let vpc = provider.default_vpc().await?;
                let subnets = provider.subnets(&vpc).await?;
                let request = ClusterRequest {
                    name: name.to_string(),
                    version: params.str("kubernetes_version").map(str::to_string),
                    role_arn: Self::required(params, "cluster_role_arn")?.to_string(),
                    subnet_ids: subnets.into_iter().map(|s| s.id).collect(),
                    security_group_ids: Vec::new(),
                    tags: Tags::new(),
                };
                Ok(provider.acquire_cluster(self.owner(), &request).await?)
            }
            None => Err(AdapterError::invalid_param(
                "cluster",
                format!("cluster '{}' does not exist", name),
            )),
        }
    }

    async fn subnets_of(&self, cluster: &Cluster) -> AdapterResult<Vec<String>> {
        if !cluster.subnet_ids.is_empty() {
            return Ok(cluster.subnet_ids.clone());
        }
        let provider = &self.ctx.provider;
        let vpc = match &cluster.vpc_id {
            Some(vpc) => vpc.clone(),
            None => provider.default_vpc().await?,
        };
        Ok(provider
            .subnets(&vpc)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    /// Creates a Lustre filesystem reachable from the cluster's nodes and
    /// binds it into the namespace as `fsx-claim`.
    async fn shared_volume(&self, cluster: &Cluster, target: &KubeTarget) -> AdapterResult<()> {
        let provider = &self.ctx.provider;
        let owner = self.owner();
        let subnet = self
            .subnets_of(cluster)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::invalid_param("shared_fs", "cluster has no subnets"))?;
        let groups = cluster.security_group_id.iter().cloned().collect();
        let spec = FilesystemSpec::scratch(subnet, groups);
        let filesystem = provider.acquire_filesystem(owner, &spec).await?;

        let mut values = Params::new();
        values.insert("volume_name", provider.resource_name(owner, "pv"));
        values.insert("capacity", spec.capacity_gb);
        values.insert("filesystem_id", filesystem.id.clone());
        values.insert("dns_name", filesystem.dns_name.clone().unwrap_or_default());
        values.insert("mount_name", filesystem.mount_name.clone().unwrap_or_default());
        let manifest = Template::parse(FSX_VOLUME)
            .and_then(|t| t.render(&values))
            .map_err(|e| AdapterError::Manifest {
                path: "fsx-volume".to_string(),
                reason: e.to_string(),
            })?;
        provider
            .apply_manifest(owner, target, &self.namespace, &manifest)
            .await?;
        Ok(())
    }

    /// Reads and renders one manifest relative to the repo root.
    async fn render_manifest(&self, path: &str, values: &Params) -> AdapterResult<String> {
        let full = self.ctx.repo_root.join(path);
        let source = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| AdapterError::Manifest {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Template::parse(&source)
            .and_then(|t| t.render(values))
            .map_err(|e| AdapterError::Manifest {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn wait_pods_ready(&self, target: &KubeTarget) -> AdapterResult<()> {
        let kubernetes = &self.ctx.config.kubernetes;
        let provider = &self.ctx.provider;
        let what = format!("pods in {}/{} to be ready", target.cluster, self.namespace);

        Waiter::new(
            Duration::from_secs(kubernetes.ready_poll_interval_secs),
            Duration::from_secs(kubernetes.ready_timeout_secs),
        )
        .with_cancel(provider.cancel_token().clone())
        .until(&what, || async {
            let pods = provider.pods(target, &self.namespace).await?;
            let pending: Vec<&str> = pods
                .iter()
                .filter(|p| !p.is_ready())
                .map(|p| p.name.as_str())
                .collect();
            if !pods.is_empty() && pending.is_empty() {
                return Ok(Some(()));
            }
            debug!(namespace = %self.namespace, pending = ?pending, "Pods not ready");
            Ok::<_, AdapterError>(None)
        })
        .await
        .map_err(health_wait)
    }

    fn kubeconfig_path(&self) -> PathBuf {
        let name = self.ctx.provider.resource_name(self.owner(), "kubeconfig");
        self.ctx.work_dir.join(name)
    }

    async fn provision(&mut self, params: &Params) -> AdapterResult<ResourceSet> {
        let provider = self.ctx.provider.clone();
        let owner = self.owner().to_string();
        self.params = params.clone();
        self.namespace = Self::required(params, "namespace")?.to_string();

        let cluster = self.cluster(params).await?;
        info!(entry = %owner, cluster = %cluster.name, namespace = %self.namespace, "Setting up Kubernetes entry");

        if let (Some(instance_type), Some(role)) =
            (params.str("node_instance_type"), params.str("node_role_arn"))
        {
            let count = params.u64("node_count").unwrap_or(1).max(1);
            let subnets = self.subnets_of(&cluster).await?;
            provider
                .acquire_nodegroup(
                    &owner,
                    &cluster.name,
                    instance_type,
                    i32::try_from(count).unwrap_or(i32::MAX),
                    role,
                    subnets,
                )
                .await?;
        }

        let target = provider
            .write_kubeconfig(&cluster.name, &self.kubeconfig_path())
            .await?;
        self.target = Some(target.clone());
        provider
            .acquire_namespace(&owner, &target, &self.namespace)
            .await?;

        if params.flag("shared_fs") {
            self.shared_volume(&cluster, &target).await?;
        }

        let manifests = manifest_paths(&self.entry);
        if !manifests.is_empty() {
            let mut values = params.clone();
            values.insert("run_id", provider.ledger().run_id());
            values.insert("entry_id", owner.clone());
            values.insert("namespace", self.namespace.clone());
            for path in &manifests {
                let manifest = self.render_manifest(path, &values).await?;
                let objects = provider
                    .apply_manifest(&owner, &target, &self.namespace, &manifest)
                    .await?;
                info!(manifest = %path, objects = objects.len(), "Applied manifest");
            }
            self.wait_pods_ready(&target).await?;
        }

        Ok(ResourceSet {
            resources: provider.ledger().owned_by(&owner),
            hosts: Vec::new(),
            endpoint: cluster.endpoint,
        })
    }

    fn kubectl_command(&self, command: &str) -> AdapterResult<Command> {
        let target = self.target.as_ref().ok_or(AdapterError::InvalidParam {
            name: "cluster".to_string(),
            reason: "setup did not complete".to_string(),
        })?;
        Ok(Command::script(command)
            .envs(self.ctx.command_env(&self.params))
            .env("CLUSTER_NAME", target.cluster.clone())
            .env("NAMESPACE", self.namespace.clone())
            .env("KUBECONFIG", target.kubeconfig.to_string_lossy())
            .working_dir(self.ctx.repo_root.to_string_lossy())
            .timeout(self.ctx.command_timeout(&self.params)))
    }
}

#[async_trait]
impl PlatformAdapter for KubeAdapter {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Kubernetes
    }

    fn state(&self) -> AdapterState {
        self.life.state()
    }

    async fn setup(&mut self, params: &Params) -> AdapterResult<ResourceSet> {
        self.life.begin_setup()?;
        let result = self.provision(params).await;
        self.life.finish_setup(result.is_ok());
        result
    }

    async fn execute_command(&mut self, command: &str) -> AdapterResult<ExecResult> {
        self.life.begin_execute()?;
        info!(entry = %self.entry.id, command = %command, "Running");
        let result = match self.kubectl_command(command) {
            Ok(cmd) => self.ctx.local.run(&cmd).await.map_err(AdapterError::from),
            Err(e) => Err(e),
        };
        self.life.finish_execute(recoverable(&result));
        result
    }

    async fn teardown(&mut self) -> AdapterResult<()> {
        if !self.life.tear_down() {
            return Ok(());
        }
        if let Some(target) = self.target.take() {
            if let Err(e) = tokio::fs::remove_file(&target.kubeconfig).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %target.kubeconfig.display(), error = %e, "Failed to remove kubeconfig");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FailureKind;
    use crate::adapter::testing::Harness;
    use crate::ledger::ResourceKind;
    use crate::plan::Platform;

    const URI: &str = "vllm:0.9.1-gpu-py312-cu128-ubuntu22.04-ec2";

    fn entry(params: serde_json::Value) -> (TestEntry, ImageDescriptor, Params) {
        let image = ImageDescriptor::parse(URI).unwrap();
        let entry = TestEntry {
            id: "vllm/0-kube-gpu".into(),
            image_name: "vllm".into(),
            index: 0,
            platform: Platform::parse("kube-gpu").unwrap(),
            params: serde_json::from_value(params).unwrap(),
            run: vec!["scripts/wait_ready.sh".into()],
            data_source: None,
            selectors: Default::default(),
            parallel_group: None,
        };
        let mut setup = entry.params.clone();
        setup.insert("image_uri", URI);
        setup.insert("region", "us-west-2");
        setup.insert("framework", "vllm");
        (entry, image, setup)
    }

    fn write_manifest(harness: &Harness) {
        let dir = harness.dir.path().join("manifests");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("vllm.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: vllm\n  namespace: {{ namespace }}\nspec:\n  template:\n    spec:\n      containers:\n        - name: vllm\n          image: {{ image_uri }}\n",
        )
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_applies_manifests_and_waits_for_pods() {
        let harness = Harness::new();
        harness.cloud.add_cluster("dlc-pr", ResourceStatus::Active);
        harness.kube.pods_ready_after(3);
        write_manifest(&harness);
        let (entry, image, params) = entry(serde_json::json!({
            "cluster": "dlc-pr",
            "namespace": "vllm",
            "manifest": "manifests/vllm.yaml",
        }));
        let mut adapter = KubeAdapter::new(harness.context(), entry, image);

        let start = tokio::time::Instant::now();
        let set = adapter.setup(&params).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3 * 300));

        let applied = harness.kube.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].1, "vllm");
        assert!(applied[0].2.contains(&format!("image: {}", URI)));
        assert!(applied[0].2.contains("namespace: vllm"));

        let kinds: Vec<ResourceKind> = set.resources.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::Namespace, ResourceKind::KubeObject]);

        adapter.execute_command("scripts/wait_ready.sh").await.unwrap();
        let command = harness.remote.commands_on("localhost").pop().unwrap();
        assert!(command.contains("CLUSTER_NAME="));
        assert!(command.contains("NAMESPACE="));
        assert!(command.contains("KUBECONFIG="));
        assert!(command.contains("DLC_IMAGE="));
        assert!(command.ends_with("scripts/wait_ready.sh"));

        let kubeconfig = adapter.target.as_ref().unwrap().kubeconfig.clone();
        assert!(kubeconfig.exists());
        adapter.teardown().await.unwrap();
        assert!(!kubeconfig.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_setup_records_nothing_new() {
        let harness = Harness::new();
        harness.cloud.add_cluster("dlc-pr", ResourceStatus::Active);
        write_manifest(&harness);
        let (entry, image, params) = entry(serde_json::json!({
            "cluster": "dlc-pr",
            "namespace": "vllm",
            "manifest": "manifests/vllm.yaml",
        }));

        let mut first = KubeAdapter::new(harness.context(), entry.clone(), image.clone());
        let first_set = first.setup(&params).await.unwrap();
        let recorded = harness.ledger.len();

        let mut second = KubeAdapter::new(harness.context(), entry, image);
        let second_set = second.setup(&params).await.unwrap();

        assert_eq!(harness.kube.applied().len(), 2);
        assert_eq!(harness.ledger.len(), recorded);
        assert_eq!(second_set.resources, first_set.resources);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pods_never_ready() {
        let harness = Harness::new();
        harness.cloud.add_cluster("dlc-pr", ResourceStatus::Active);
        harness.kube.pods_ready_after(usize::MAX);
        write_manifest(&harness);
        let (entry, image, params) = entry(serde_json::json!({
            "cluster": "dlc-pr",
            "namespace": "vllm",
            "manifest": "manifests/vllm.yaml",
        }));
        let mut adapter = KubeAdapter::new(harness.context(), entry, image);

        let err = adapter.setup(&params).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::HealthCheckTimeout);
        assert_eq!(adapter.state(), AdapterState::Faulted);
        adapter.teardown().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::TornDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cluster() {
        let harness = Harness::new();
        let (entry, image, params) = entry(serde_json::json!({
            "cluster": "nope",
            "namespace": "vllm",
        }));
        let mut adapter = KubeAdapter::new(harness.context(), entry, image);

        let err = adapter.setup(&params).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Config);
        assert!(harness.kube.namespaces().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_volume_is_bound() {
        let harness = Harness::new();
        harness.cloud.add_cluster("dlc-pr", ResourceStatus::Active);
        let (entry, image, params) = entry(serde_json::json!({
            "cluster": "dlc-pr",
            "namespace": "train",
            "shared_fs": true,
        }));
        let mut adapter = KubeAdapter::new(harness.context(), entry, image);

        let set = adapter.setup(&params).await.unwrap();
        assert!(set.resources.iter().any(|r| r.kind == ResourceKind::Filesystem));
        let applied = harness.kube.applied();
        assert_eq!(applied.len(), 1);
        assert!(applied[0].2.contains("driver: fsx.csi.aws.com"));
        assert!(applied[0].2.contains("storage: 1200Gi"));
    }
}
