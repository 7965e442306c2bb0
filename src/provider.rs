//! Resource provider: acquire and release cloud primitives.
//!
//! Every `acquire_*` operation follows the same shape:
//!
//! 1. Refuse to start once the run is cancelled.
//! 2. Look for an equivalent resource created earlier by the same run and
//!    entry (deterministic name or tag set) and reuse it if found.
//! 3. Otherwise create it through [`CloudApi`], retrying transient errors.
//! 4. Append a [`Resource`] to the [`ResourceLedger`] as soon as the create
//!    call returns, before any waiting, so a later timeout still leaves the
//!    resource on record for cleanup.
//! 5. Wait for the resource to become usable.
//!
//! Reused resources are not appended again: the ledger only records
//! creations, and the creation that matters was recorded the first time.
//!
//! [`ResourceProvider::release`] is the inverse of every kind the ledger can
//! hold. Releases tolerate resources that are already gone.

pub mod retry;
pub mod zones;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cloud::{
    Address, BlockDevice, CloudApi, CloudError, CloudResult, Cluster, ClusterRequest, Filesystem,
    FilesystemRequest, Instance, InstanceRequest, InstanceState, IngressRule, KubeApi,
    KubeObject, KubeTarget, Nodegroup, NodegroupRequest, PodStatus, ResourceStatus,
    SecurityGroup, Service, ServiceRequest, Subnet, Tags, TaggedResource, Task,
    TaskDefinitionRequest, TaskRequest,
};
use crate::config::ProviderConfig;
use crate::ledger::{Resource, ResourceKind, ResourceLedger};
use crate::waiter::{WaitError, Waiter};
use retry::RetryPolicy;
use zones::ZoneSelector;

/// Longest name accepted by every resource kind we create.
const MAX_NAME_LEN: usize = 63;

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Why an acquisition or release failed.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Every candidate zone reported insufficient capacity.
    #[error("No capacity for {instance_type} in any of [{}]", zones.join(", "))]
    CapacityUnavailable {
        instance_type: String,
        zones: Vec<String>,
    },

    /// The resource was created but never became usable.
    #[error("Timed out after {}s waiting for {what}", waited.as_secs())]
    ProvisionTimeout { what: String, waited: Duration },

    /// A resource with the expected identity exists but is not equivalent.
    #[error("Existing {kind} '{id}' cannot be reused: {reason}")]
    ReuseConflict {
        kind: ResourceKind,
        id: String,
        reason: String,
    },

    /// The run was cancelled before the operation started.
    #[error("Cancelled before {0}")]
    Cancelled(String),

    /// The cloud reported the resource as failed.
    #[error("Failed to {what}: {reason}")]
    Failed { what: String, reason: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// Writing a local artifact (private key, kubeconfig) failed.
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<WaitError<CloudError>> for ProvisionError {
    fn from(e: WaitError<CloudError>) -> Self {
        match e {
            WaitError::Timeout { what, waited } => ProvisionError::ProvisionTimeout { what, waited },
            WaitError::Cancelled { what } => ProvisionError::Cancelled(what),
            WaitError::Failed(e) => ProvisionError::Cloud(e),
        }
    }
}

/// Tag key `<prefix>:<name>`.
pub fn tag_key(prefix: &str, name: &str) -> String {
    format!("{}:{}", prefix, name)
}

/// Lowercase alphanumerics separated by single dashes.
fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn tolerate_gone(result: CloudResult<()>) -> CloudResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// What to launch in [`ResourceProvider::acquire_instances`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub ami_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub count: u32,
    /// Suffix of the `Name` tag, e.g. `master` or `worker`.
    pub role: String,
    /// Zones to try first; empty means allowlist, then discovery.
    pub zones: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub block_device: Option<BlockDevice>,
    pub user_data: Option<String>,
    /// Overrides the configured instance profile.
    pub iam_profile: Option<String>,
}

/// Lustre filesystem parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FilesystemSpec {
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub capacity_gb: i32,
    pub deployment_type: String,
}

impl FilesystemSpec {
    /// `SCRATCH_2` with 1.2 TB, the smallest Lustre size.
    pub fn scratch(subnet_id: impl Into<String>, security_group_ids: Vec<String>) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            security_group_ids,
            capacity_gb: 1200,
            deployment_type: "SCRATCH_2".to_string(),
        }
    }
}

/// A key pair whose private half is on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairInfo {
    pub name: String,
    pub key_file: PathBuf,
}

/// Creates and destroys cloud resources on behalf of one run.
pub struct ResourceProvider {
    cloud: Arc<dyn CloudApi>,
    kube: Arc<dyn KubeApi>,
    ledger: Arc<ResourceLedger>,
    config: ProviderConfig,
    retry: RetryPolicy,
    zones: ZoneSelector,
    cancel: CancellationToken,
}

impl ResourceProvider {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        kube: Arc<dyn KubeApi>,
        ledger: Arc<ResourceLedger>,
        config: ProviderConfig,
        cancel: CancellationToken,
    ) -> Self {
        let retry = RetryPolicy::new(
            config.retry_attempts,
            Duration::from_secs(config.retry_max_delay_secs),
        );
        let zones = ZoneSelector::new(config.zone_overrides.clone());
        Self {
            cloud,
            kube,
            ledger,
            config,
            retry,
            zones,
            cancel,
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn region(&self) -> &str {
        self.cloud.region()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn check_cancelled(&self, what: &str) -> ProvisionResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(what.to_string()));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    fn resource_waiter(&self) -> Waiter {
        Waiter::new(
            self.poll_interval(),
            Duration::from_secs(self.config.resource_ready_timeout_secs),
        )
        .with_cancel(self.cancel.clone())
    }

    /// Waiters used while releasing ignore cancellation: cleanup must finish.
    fn release_waiter(&self) -> Waiter {
        Waiter::new(
            self.poll_interval(),
            Duration::from_secs(self.config.instance_ready_timeout_secs),
        )
    }

    fn key(&self, name: &str) -> String {
        tag_key(self.ledger.tag_prefix(), name)
    }

    /// `<prefix>-<run8>-<owner slug>-<suffix>`, at most 63 characters.
    pub fn resource_name(&self, owner: &str, suffix: &str) -> String {
        let prefix = self.ledger.tag_prefix();
        let run: String = self.ledger.run_id().chars().take(8).collect();
        let fixed = prefix.len() + run.len() + suffix.len() + 3;
        let budget = MAX_NAME_LEN.saturating_sub(fixed);
        let mut owner = slug(owner);
        owner.truncate(budget);
        let owner = owner.trim_end_matches('-');
        format!("{}-{}-{}-{}", prefix, run, owner, suffix)
    }

    /// Tags identifying a resource of this run, without the timestamp.
    fn identity_tags(&self, owner: &str, name: &str) -> Tags {
        let mut tags = Tags::new();
        tags.insert(self.key("run-id"), self.ledger.run_id().to_string());
        tags.insert(self.key("entry"), owner.to_string());
        tags.insert("Name".to_string(), name.to_string());
        tags
    }

    /// The full tag set attached at creation.
    pub fn creation_tags(&self, owner: &str, component: &str, name: &str) -> Tags {
        let mut tags = self.identity_tags(owner, name);
        tags.insert(self.key("component"), component.to_string());
        tags.insert(self.key("created-at"), Utc::now().to_rfc3339());
        tags
    }

    /// gp3 root volume with the configured size, IOPS and throughput.
    pub fn block_device(&self, ubuntu: bool) -> BlockDevice {
        BlockDevice {
            device_name: if ubuntu { "/dev/sda1" } else { "/dev/xvda" }.to_string(),
            size_gb: self.config.volume_size_gb,
            iops: self.config.volume_iops,
            throughput: self.config.volume_throughput,
        }
    }

    fn key_dir(&self) -> PathBuf {
        self.config
            .key_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("dlc-orchestrator-keys"))
    }

    // Key pairs

    /// A key pair for the entry, with its private key written to disk.
    pub async fn acquire_keypair(&self, owner: &str) -> ProvisionResult<KeyPairInfo> {
        self.check_cancelled("creating a key pair")?;
        let name = self.resource_name(owner, "key");
        let key_file = self.key_dir().join(format!("{}.pem", name));

        let existing = self
            .retry
            .run("describe_key_pairs", || self.cloud.find_key_pair(&name))
            .await?;
        if existing.is_some() {
            if key_file.exists() {
                tracing::debug!(key = %name, "Reusing key pair");
                return Ok(KeyPairInfo { name, key_file });
            }
            return Err(ProvisionError::ReuseConflict {
                kind: ResourceKind::KeyPair,
                id: name,
                reason: "private key is not available locally".to_string(),
            });
        }

        let tags = self.creation_tags(owner, "key-pair", &name);
        let created = self
            .retry
            .run("create_key_pair", || self.cloud.create_key_pair(&name, &tags))
            .await?;
        self.ledger.append(
            owner,
            Resource::KeyPair {
                name: name.clone(),
                key_file: Some(key_file.clone()),
            },
        );

        let material = created.private_key.ok_or_else(|| ProvisionError::Failed {
            what: format!("create key pair {}", name),
            reason: "no private key material returned".to_string(),
        })?;
        write_private_key(&key_file, &material).await?;
        tracing::info!(key = %name, path = %key_file.display(), "Created key pair");

        Ok(KeyPairInfo { name, key_file })
    }

    // Security groups and ingress

    pub async fn acquire_security_group(
        &self,
        owner: &str,
        vpc_id: &str,
        description: &str,
    ) -> ProvisionResult<SecurityGroup> {
        self.check_cancelled("creating a security group")?;
        let name = self.resource_name(owner, "sg");

        let existing = self
            .retry
            .run("describe_security_groups", || {
                self.cloud.find_security_group(vpc_id, &name)
            })
            .await?;
        if let Some(group) = existing {
            let ours = group.tags.get(&self.key("run-id")).map(String::as_str)
                == Some(self.ledger.run_id());
            if !ours {
                return Err(ProvisionError::ReuseConflict {
                    kind: ResourceKind::SecurityGroup,
                    id: group.id,
                    reason: "owned by another run".to_string(),
                });
            }
            tracing::debug!(group = %group.id, "Reusing security group");
            return Ok(group);
        }

        let tags = self.creation_tags(owner, "security-group", &name);
        let group = self
            .retry
            .run("create_security_group", || {
                self.cloud
                    .create_security_group(vpc_id, &name, description, &tags)
            })
            .await?;
        self.ledger.append(
            owner,
            Resource::SecurityGroup {
                group_id: group.id.clone(),
            },
        );
        tracing::info!(group = %group.id, name = %name, "Created security group");
        Ok(group)
    }

    /// Adds `rule` unless an identical rule is already present.
    ///
    /// Returns whether a rule was added.
    pub async fn authorize_ingress(
        &self,
        owner: &str,
        group_id: &str,
        rule: &IngressRule,
    ) -> ProvisionResult<bool> {
        self.check_cancelled("authorizing ingress")?;
        let existing = self
            .retry
            .run("describe_security_group_rules", || {
                self.cloud.ingress_rules(group_id)
            })
            .await?;
        if existing.contains(rule) {
            tracing::debug!(group = %group_id, rule = %rule, "Ingress rule already present");
            return Ok(false);
        }

        self.retry
            .run("authorize_security_group_ingress", || {
                self.cloud.authorize_ingress(group_id, rule)
            })
            .await?;
        self.ledger.append(
            owner,
            Resource::IngressRule {
                group_id: group_id.to_string(),
                rule: rule.clone(),
            },
        );
        Ok(true)
    }

    // Elastic addresses

    /// The `index`-th elastic address of the entry.
    pub async fn acquire_elastic_ip(&self, owner: &str, index: usize) -> ProvisionResult<Address> {
        self.check_cancelled("allocating an elastic IP")?;
        let name = self.resource_name(owner, &format!("eip{}", index));
        let identity = self.identity_tags(owner, &name);

        let existing = self
            .retry
            .run("describe_addresses", || self.cloud.find_addresses(&identity))
            .await?;
        if let Some(address) = existing.into_iter().next() {
            tracing::debug!(allocation = %address.allocation_id, "Reusing elastic IP");
            return Ok(address);
        }

        let tags = self.creation_tags(owner, "elastic-ip", &name);
        let address = self
            .retry
            .run("allocate_address", || self.cloud.allocate_address(&tags))
            .await?;
        self.ledger.append(
            owner,
            Resource::ElasticIp {
                allocation_id: address.allocation_id.clone(),
            },
        );
        Ok(address)
    }

    /// Associates `address` with a network interface; returns the
    /// association id. An address that is already associated is left alone.
    pub async fn attach_elastic_ip(
        &self,
        owner: &str,
        address: &Address,
        network_interface_id: &str,
    ) -> ProvisionResult<String> {
        self.check_cancelled("associating an elastic IP")?;
        if let Some(association) = &address.association_id {
            return Ok(association.clone());
        }
        let association = self
            .retry
            .run("associate_address", || {
                self.cloud
                    .associate_address(&address.allocation_id, network_interface_id)
            })
            .await?;
        self.ledger.append(
            owner,
            Resource::AddressAssociation {
                association_id: association.clone(),
            },
        );
        Ok(association)
    }

    // Instances

    /// Launches `spec.count` instances in the first zone with capacity and
    /// waits until they are running and pass both status checks.
    pub async fn acquire_instances(
        &self,
        owner: &str,
        spec: &InstanceSpec,
    ) -> ProvisionResult<Vec<Instance>> {
        self.check_cancelled("launching instances")?;
        let name = self.resource_name(owner, &spec.role);
        let identity = self.identity_tags(owner, &name);

        let existing = self
            .retry
            .run("describe_instances", || self.cloud.find_instances(&identity))
            .await?;
        if !existing.is_empty() {
            if existing.len() as u32 != spec.count {
                return Err(ProvisionError::ReuseConflict {
                    kind: ResourceKind::Instance,
                    id: name,
                    reason: format!(
                        "found {} live instance(s), expected {}",
                        existing.len(),
                        spec.count
                    ),
                });
            }
            tracing::debug!(name = %name, "Reusing instances");
            let ids: Vec<String> = existing.into_iter().map(|i| i.id).collect();
            return self.wait_instances_ready(&ids).await;
        }

        let region = self.cloud.region().to_string();
        let discovered = if spec.zones.is_empty()
            && self.zones.allowlist(&spec.instance_type, &region).is_none()
        {
            self.retry
                .run("describe_availability_zones", || {
                    self.cloud.availability_zones()
                })
                .await?
        } else {
            Vec::new()
        };
        let candidates =
            self.zones
                .candidates(&spec.instance_type, &region, &spec.zones, &discovered);

        let tags = self.creation_tags(owner, "instance", &name);
        for zone in &candidates {
            self.check_cancelled("launching instances")?;
            let request = InstanceRequest {
                ami_id: spec.ami_id.clone(),
                instance_type: spec.instance_type.clone(),
                key_name: spec.key_name.clone(),
                iam_profile: spec
                    .iam_profile
                    .clone()
                    .or_else(|| Some(self.config.iam_instance_profile.clone())),
                count: spec.count,
                availability_zone: zone.clone(),
                security_group_ids: spec.security_group_ids.clone(),
                block_device: spec.block_device.clone(),
                user_data: spec.user_data.clone(),
                tags: tags.clone(),
            };

            match self
                .retry
                .run("run_instances", || self.cloud.run_instances(&request))
                .await
            {
                Ok(instances) => {
                    for instance in &instances {
                        self.ledger.append(
                            owner,
                            Resource::Instance {
                                instance_id: instance.id.clone(),
                            },
                        );
                    }
                    tracing::info!(
                        instance_type = %spec.instance_type,
                        zone = %zone,
                        count = instances.len(),
                        "Launched instances"
                    );
                    let ids: Vec<String> = instances.into_iter().map(|i| i.id).collect();
                    return self.wait_instances_ready(&ids).await;
                }
                Err(e) if e.is_capacity() => {
                    tracing::warn!(
                        instance_type = %spec.instance_type,
                        zone = %zone,
                        "No capacity, trying next zone: {}",
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProvisionError::CapacityUnavailable {
            instance_type: spec.instance_type.clone(),
            zones: candidates,
        })
    }

    async fn wait_instances_ready(&self, ids: &[String]) -> ProvisionResult<Vec<Instance>> {
        let waiter = Waiter::new(
            self.poll_interval(),
            Duration::from_secs(self.config.instance_ready_timeout_secs),
        )
        .with_cancel(self.cancel.clone());

        let what = format!("instances {} to pass status checks", ids.join(", "));
        let instances = waiter
            .until(&what, || async {
                let mut ready = Vec::with_capacity(ids.len());
                for id in ids {
                    let instance = self
                        .retry
                        .run("describe_instances", || self.cloud.describe_instance(id))
                        .await?;
                    match instance.state {
                        InstanceState::Running => {}
                        InstanceState::Pending => return Ok(None),
                        other => {
                            return Err(CloudError::Api {
                                code: "UnexpectedState".to_string(),
                                message: format!("instance {} is {:?}", id, other),
                            });
                        }
                    }
                    let health = self
                        .retry
                        .run("describe_instance_status", || {
                            self.cloud.instance_health(id)
                        })
                        .await?;
                    if !health.is_ok() {
                        return Ok(None);
                    }
                    ready.push(instance);
                }
                Ok(Some(ready))
            })
            .await?;
        Ok(instances)
    }

    // Shared filesystems

    /// A Lustre filesystem, returned once it is `AVAILABLE`.
    pub async fn acquire_filesystem(
        &self,
        owner: &str,
        spec: &FilesystemSpec,
    ) -> ProvisionResult<Filesystem> {
        self.check_cancelled("creating a filesystem")?;
        let name = self.resource_name(owner, "fsx");
        let identity = self.identity_tags(owner, &name);

        let existing = self
            .retry
            .run("describe_file_systems", || {
                self.cloud.find_filesystems(&identity)
            })
            .await?;
        let filesystem = match existing.into_iter().next() {
            Some(fs) => {
                tracing::debug!(filesystem = %fs.id, "Reusing filesystem");
                fs
            }
            None => {
                let request = FilesystemRequest {
                    subnet_id: spec.subnet_id.clone(),
                    security_group_ids: spec.security_group_ids.clone(),
                    capacity_gb: spec.capacity_gb,
                    deployment_type: spec.deployment_type.clone(),
                    tags: self.creation_tags(owner, "filesystem", &name),
                };
                let fs = self
                    .retry
                    .run("create_file_system", || {
                        self.cloud.create_filesystem(&request)
                    })
                    .await?;
                self.ledger.append(
                    owner,
                    Resource::Filesystem {
                        filesystem_id: fs.id.clone(),
                    },
                );
                tracing::info!(filesystem = %fs.id, "Created filesystem");
                fs
            }
        };

        let id = filesystem.id.clone();
        let what = format!("filesystem {} to become AVAILABLE", id);
        let filesystem = self
            .resource_waiter()
            .until(&what, || async {
                let fs = self
                    .retry
                    .run("describe_file_systems", || {
                        self.cloud.describe_filesystem(&id)
                    })
                    .await?;
                match fs.status {
                    ResourceStatus::Active => Ok(Some(fs)),
                    ResourceStatus::Failed => Err(CloudError::Api {
                        code: "FAILED".to_string(),
                        message: format!("filesystem {} failed", id),
                    }),
                    _ => Ok(None),
                }
            })
            .await?;
        Ok(filesystem)
    }

    // Managed Kubernetes

    /// A control plane named exactly `request.name`, returned once ACTIVE.
    ///
    /// An existing ACTIVE cluster with that name is reused as is.
    pub async fn acquire_cluster(
        &self,
        owner: &str,
        request: &ClusterRequest,
    ) -> ProvisionResult<Cluster> {
        self.check_cancelled("creating a cluster")?;
        let existing = self
            .retry
            .run("describe_cluster", || {
                self.cloud.describe_cluster(&request.name)
            })
            .await?;

        match existing {
            Some(cluster) if cluster.status == ResourceStatus::Active => {
                tracing::info!(cluster = %cluster.name, "Reusing active cluster");
                return Ok(cluster);
            }
            Some(cluster) if cluster.status == ResourceStatus::Creating => {}
            Some(cluster) => {
                return Err(ProvisionError::ReuseConflict {
                    kind: ResourceKind::Cluster,
                    id: cluster.name,
                    reason: format!("cluster is {:?}", cluster.status),
                });
            }
            None => {
                let mut request = request.clone();
                request
                    .tags
                    .extend(self.creation_tags(owner, "cluster", &request.name));
                self.retry
                    .run("create_cluster", || self.cloud.create_cluster(&request))
                    .await?;
                self.ledger.append(
                    owner,
                    Resource::Cluster {
                        name: request.name.clone(),
                    },
                );
                tracing::info!(cluster = %request.name, "Created cluster");
            }
        }

        self.wait_cluster_active(&request.name).await
    }

    /// Waits for an existing cluster to be ACTIVE.
    pub async fn wait_cluster_active(&self, name: &str) -> ProvisionResult<Cluster> {
        let what = format!("cluster {} to become ACTIVE", name);
        let cluster = self
            .resource_waiter()
            .until(&what, || async {
                let cluster = self
                    .retry
                    .run("describe_cluster", || self.cloud.describe_cluster(name))
                    .await?;
                match cluster {
                    Some(c) if c.status == ResourceStatus::Active => Ok(Some(c)),
                    Some(c) if c.status == ResourceStatus::Failed => Err(CloudError::Api {
                        code: "FAILED".to_string(),
                        message: format!("cluster {} failed", c.name),
                    }),
                    Some(_) => Ok(None),
                    None => Err(CloudError::NotFound(format!("cluster {}", name))),
                }
            })
            .await?;
        Ok(cluster)
    }

    /// A managed nodegroup, returned once ACTIVE.
    pub async fn acquire_nodegroup(
        &self,
        owner: &str,
        cluster: &str,
        instance_type: &str,
        count: i32,
        node_role_arn: &str,
        subnet_ids: Vec<String>,
    ) -> ProvisionResult<Nodegroup> {
        self.check_cancelled("creating a nodegroup")?;
        let name = self.resource_name(owner, "ng");

        let existing = self
            .retry
            .run("describe_nodegroup", || {
                self.cloud.describe_nodegroup(cluster, &name)
            })
            .await?;
        match existing {
            Some(group) => {
                if group
                    .instance_type
                    .as_deref()
                    .is_some_and(|t| t != instance_type)
                {
                    return Err(ProvisionError::ReuseConflict {
                        kind: ResourceKind::Nodegroup,
                        id: format!("{}/{}", cluster, name),
                        reason: format!(
                            "instance type {:?} differs from {}",
                            group.instance_type, instance_type
                        ),
                    });
                }
                tracing::debug!(nodegroup = %name, "Reusing nodegroup");
            }
            None => {
                let request = NodegroupRequest {
                    cluster: cluster.to_string(),
                    name: name.clone(),
                    node_role_arn: node_role_arn.to_string(),
                    subnet_ids,
                    instance_type: instance_type.to_string(),
                    count,
                    tags: self.creation_tags(owner, "nodegroup", &name),
                };
                self.retry
                    .run("create_nodegroup", || self.cloud.create_nodegroup(&request))
                    .await?;
                self.ledger.append(
                    owner,
                    Resource::Nodegroup {
                        cluster: cluster.to_string(),
                        name: name.clone(),
                    },
                );
                tracing::info!(cluster = %cluster, nodegroup = %name, "Created nodegroup");
            }
        }

        let what = format!("nodegroup {}/{} to become ACTIVE", cluster, name);
        let group = self
            .resource_waiter()
            .until(&what, || async {
                let group = self
                    .retry
                    .run("describe_nodegroup", || {
                        self.cloud.describe_nodegroup(cluster, &name)
                    })
                    .await?;
                match group {
                    Some(g) if g.status == ResourceStatus::Active => Ok(Some(g)),
                    Some(g) if g.status == ResourceStatus::Failed => Err(CloudError::Api {
                        code: "CREATE_FAILED".to_string(),
                        message: format!("nodegroup {} failed", g.name),
                    }),
                    _ => Ok(None),
                }
            })
            .await?;
        Ok(group)
    }

    /// Writes a kubeconfig for `cluster` to `path`.
    pub async fn write_kubeconfig(&self, cluster: &str, path: &Path) -> ProvisionResult<KubeTarget> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ProvisionError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let region = self.cloud.region().to_string();
        self.retry
            .run("update_kubeconfig", || {
                self.kube.write_kubeconfig(cluster, &region, path)
            })
            .await?;
        Ok(KubeTarget {
            cluster: cluster.to_string(),
            kubeconfig: path.to_path_buf(),
        })
    }

    /// Creates `namespace` unless it exists. Returns whether it was created.
    pub async fn acquire_namespace(
        &self,
        owner: &str,
        target: &KubeTarget,
        namespace: &str,
    ) -> ProvisionResult<bool> {
        self.check_cancelled("creating a namespace")?;
        let exists = self
            .retry
            .run("get_namespace", || self.kube.namespace_exists(target, namespace))
            .await?;
        if exists {
            tracing::debug!(cluster = %target.cluster, namespace = %namespace, "Namespace exists");
            return Ok(false);
        }

        let mut labels = Tags::new();
        labels.insert(
            format!("{}/run-id", self.ledger.tag_prefix()),
            self.ledger.run_id().to_string(),
        );
        self.retry
            .run("create_namespace", || {
                self.kube.create_namespace(target, namespace, &labels)
            })
            .await?;
        self.ledger.append(
            owner,
            Resource::Namespace {
                target: target.clone(),
                name: namespace.to_string(),
            },
        );
        tracing::info!(cluster = %target.cluster, namespace = %namespace, "Created namespace");
        Ok(true)
    }

    /// Applies a rendered manifest and records every object it created.
    ///
    /// Re-applying is harmless; objects already in the ledger are not
    /// recorded twice.
    pub async fn apply_manifest(
        &self,
        owner: &str,
        target: &KubeTarget,
        namespace: &str,
        manifest: &str,
    ) -> ProvisionResult<Vec<KubeObject>> {
        self.check_cancelled("applying a manifest")?;
        let objects = self
            .retry
            .run("apply", || self.kube.apply(target, namespace, manifest))
            .await?;
        for object in &objects {
            let recorded = self.ledger.find(|r| {
                matches!(r, Resource::KubeObject { target: t, namespace: ns, object: o }
                    if t.cluster == target.cluster && ns == namespace && o == object)
            });
            if recorded.is_some() {
                tracing::debug!(object = %object, namespace = %namespace, "Object already recorded");
                continue;
            }
            self.ledger.append(
                owner,
                Resource::KubeObject {
                    target: target.clone(),
                    namespace: namespace.to_string(),
                    object: object.clone(),
                },
            );
        }
        Ok(objects)
    }

    pub async fn pods(&self, target: &KubeTarget, namespace: &str) -> ProvisionResult<Vec<PodStatus>> {
        Ok(self
            .retry
            .run("get_pods", || self.kube.pods(target, namespace))
            .await?)
    }

    // Container clusters

    /// Creates the ECS cluster unless an ACTIVE one has that name.
    pub async fn acquire_ecs_cluster(&self, owner: &str, name: &str) -> ProvisionResult<bool> {
        self.check_cancelled("creating an ECS cluster")?;
        let status = self
            .retry
            .run("describe_clusters", || self.cloud.describe_ecs_cluster(name))
            .await?;
        if status == Some(ResourceStatus::Active) {
            tracing::debug!(cluster = %name, "Reusing ECS cluster");
            return Ok(false);
        }

        let tags = self.creation_tags(owner, "ecs-cluster", name);
        self.retry
            .run("create_cluster", || self.cloud.create_ecs_cluster(name, &tags))
            .await?;
        self.ledger.append(
            owner,
            Resource::EcsCluster {
                name: name.to_string(),
            },
        );
        tracing::info!(cluster = %name, "Created ECS cluster");
        Ok(true)
    }

    /// Waits until at least `count` container instances joined `cluster`.
    pub async fn wait_container_instances(&self, cluster: &str, count: usize) -> ProvisionResult<()> {
        let what = format!("{} container instance(s) in {}", count, cluster);
        Waiter::new(
            self.poll_interval(),
            Duration::from_secs(self.config.instance_ready_timeout_secs),
        )
        .with_cancel(self.cancel.clone())
        .until(&what, || async {
            let registered = self
                .retry
                .run("list_container_instances", || {
                    self.cloud.container_instance_count(cluster)
                })
                .await?;
            Ok::<_, CloudError>((registered >= count).then_some(()))
        })
        .await?;
        Ok(())
    }

    /// Registers a task definition revision; returns its ARN.
    ///
    /// A family this run already registered keeps its recorded revision.
    pub async fn register_task_definition(
        &self,
        owner: &str,
        request: &TaskDefinitionRequest,
    ) -> ProvisionResult<String> {
        self.check_cancelled("registering a task definition")?;
        let revision_of = format!("task-definition/{}:", request.family);
        if let Some(handle) = self.ledger.find(|r| {
            matches!(r, Resource::TaskDefinition { arn } if arn.contains(&revision_of))
        }) {
            let arn = handle.resource.id();
            tracing::debug!(task_definition = %arn, "Reusing task definition");
            return Ok(arn);
        }

        let mut request = request.clone();
        request
            .tags
            .extend(self.creation_tags(owner, "task-definition", &request.family));
        let arn = self
            .retry
            .run("register_task_definition", || {
                self.cloud.register_task_definition(&request)
            })
            .await?;
        self.ledger
            .append(owner, Resource::TaskDefinition { arn: arn.clone() });
        Ok(arn)
    }

    /// A service with all desired tasks running.
    pub async fn acquire_service(
        &self,
        owner: &str,
        request: &ServiceRequest,
    ) -> ProvisionResult<Service> {
        self.check_cancelled("creating a service")?;
        let existing = self
            .retry
            .run("describe_services", || {
                self.cloud.describe_service(&request.cluster, &request.name)
            })
            .await?;

        match existing {
            Some(service) if service.status == ResourceStatus::Active => {
                tracing::debug!(service = %service.name, "Reusing service");
            }
            _ => {
                let mut request = request.clone();
                request
                    .tags
                    .extend(self.creation_tags(owner, "service", &request.name));
                self.retry
                    .run("create_service", || self.cloud.create_service(&request))
                    .await?;
                self.ledger.append(
                    owner,
                    Resource::Service {
                        cluster: request.cluster.clone(),
                        name: request.name.clone(),
                    },
                );
                tracing::info!(cluster = %request.cluster, service = %request.name, "Created service");
            }
        }

        let what = format!("service {} to reach RUNNING", request.name);
        let service = self
            .resource_waiter()
            .until(&what, || async {
                let service = self
                    .retry
                    .run("describe_services", || {
                        self.cloud.describe_service(&request.cluster, &request.name)
                    })
                    .await?;
                Ok::<_, CloudError>(service.filter(|s| {
                    s.status == ResourceStatus::Active
                        && s.desired_count > 0
                        && s.running_count >= s.desired_count
                }))
            })
            .await?;
        Ok(service)
    }

    pub async fn service_tasks(&self, cluster: &str, service: &str) -> ProvisionResult<Vec<String>> {
        Ok(self
            .retry
            .run("list_tasks", || self.cloud.service_tasks(cluster, service))
            .await?)
    }

    /// Starts a standalone task; returns its ARN.
    pub async fn run_task(&self, owner: &str, request: &TaskRequest) -> ProvisionResult<String> {
        self.check_cancelled("running a task")?;
        let mut request = request.clone();
        request.tags.extend(self.creation_tags(
            owner,
            "task",
            &request.container_name,
        ));
        let arn = self
            .retry
            .run("run_task", || self.cloud.run_task(&request))
            .await?;
        self.ledger.append(
            owner,
            Resource::Task {
                cluster: request.cluster.clone(),
                arn: arn.clone(),
            },
        );
        Ok(arn)
    }

    pub async fn describe_task(&self, cluster: &str, arn: &str) -> ProvisionResult<Task> {
        Ok(self
            .retry
            .run("describe_tasks", || self.cloud.describe_task(cluster, arn))
            .await?)
    }

    pub async fn task_logs(&self, group: &str, stream: &str) -> ProvisionResult<Vec<String>> {
        Ok(self
            .retry
            .run("get_log_events", || self.cloud.task_logs(group, stream))
            .await?)
    }

    // Discovery

    pub async fn default_vpc(&self) -> ProvisionResult<String> {
        Ok(self
            .retry
            .run("describe_vpcs", || self.cloud.default_vpc())
            .await?)
    }

    pub async fn subnets(&self, vpc_id: &str) -> ProvisionResult<Vec<Subnet>> {
        Ok(self
            .retry
            .run("describe_subnets", || self.cloud.subnets(vpc_id))
            .await?)
    }

    pub async fn describe_instance(&self, instance_id: &str) -> ProvisionResult<Instance> {
        Ok(self
            .retry
            .run("describe_instances", || {
                self.cloud.describe_instance(instance_id)
            })
            .await?)
    }

    pub async fn describe_cluster(&self, name: &str) -> ProvisionResult<Option<Cluster>> {
        Ok(self
            .retry
            .run("describe_cluster", || self.cloud.describe_cluster(name))
            .await?)
    }

    /// Resources carrying the run-id tag key, for the janitor.
    pub async fn list_tagged(&self) -> ProvisionResult<Vec<TaggedResource>> {
        let key = self.key("run-id");
        Ok(self
            .retry
            .run("get_resources", || self.cloud.list_tagged(&key))
            .await?)
    }

    // Release

    /// Destroys one resource. A resource that is already gone counts as
    /// released.
    pub async fn release(&self, resource: &Resource) -> ProvisionResult<()> {
        match resource {
            Resource::Instance { instance_id } => {
                tolerate_gone(
                    self.retry
                        .run("terminate_instances", || {
                            self.cloud.terminate_instance(instance_id)
                        })
                        .await,
                )?;
                self.wait_terminated(instance_id).await
            }
            Resource::KeyPair { name, key_file } => {
                tolerate_gone(
                    self.retry
                        .run("delete_key_pair", || self.cloud.delete_key_pair(name))
                        .await,
                )?;
                if let Some(path) = key_file {
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(source) => {
                            return Err(ProvisionError::Io {
                                path: path.clone(),
                                source,
                            });
                        }
                    }
                }
                Ok(())
            }
            Resource::SecurityGroup { group_id } => self.delete_security_group(group_id).await,
            Resource::IngressRule { group_id, rule } => Ok(tolerate_gone(
                self.retry
                    .run("revoke_security_group_ingress", || {
                        self.cloud.revoke_ingress(group_id, rule)
                    })
                    .await,
            )?),
            Resource::ElasticIp { allocation_id } => Ok(tolerate_gone(
                self.retry
                    .run("release_address", || {
                        self.cloud.release_address(allocation_id)
                    })
                    .await,
            )?),
            Resource::AddressAssociation { association_id } => Ok(tolerate_gone(
                self.retry
                    .run("disassociate_address", || {
                        self.cloud.disassociate_address(association_id)
                    })
                    .await,
            )?),
            Resource::Filesystem { filesystem_id } => {
                tolerate_gone(
                    self.retry
                        .run("delete_file_system", || {
                            self.cloud.delete_filesystem(filesystem_id)
                        })
                        .await,
                )?;
                self.wait_filesystem_gone(filesystem_id).await
            }
            Resource::Cluster { name } => Ok(tolerate_gone(
                self.retry
                    .run("delete_cluster", || self.cloud.delete_cluster(name))
                    .await,
            )?),
            Resource::Nodegroup { cluster, name } => {
                tolerate_gone(
                    self.retry
                        .run("delete_nodegroup", || {
                            self.cloud.delete_nodegroup(cluster, name)
                        })
                        .await,
                )?;
                let what = format!("nodegroup {}/{} to be deleted", cluster, name);
                self.release_waiter()
                    .until(&what, || async {
                        let group = tolerate_missing(
                            self.cloud.describe_nodegroup(cluster, name).await,
                        )?;
                        Ok::<_, CloudError>(group.is_none().then_some(()))
                    })
                    .await?;
                Ok(())
            }
            Resource::EcsCluster { name } => Ok(tolerate_gone(
                self.retry
                    .run("delete_cluster", || self.cloud.delete_ecs_cluster(name))
                    .await,
            )?),
            Resource::TaskDefinition { arn } => Ok(tolerate_gone(
                self.retry
                    .run("deregister_task_definition", || {
                        self.cloud.deregister_task_definition(arn)
                    })
                    .await,
            )?),
            Resource::Service { cluster, name } => Ok(tolerate_gone(
                self.retry
                    .run("delete_service", || self.cloud.delete_service(cluster, name))
                    .await,
            )?),
            Resource::Task { cluster, arn } => Ok(tolerate_gone(
                self.retry
                    .run("stop_task", || self.cloud.stop_task(cluster, arn))
                    .await,
            )?),
            Resource::Namespace { target, name } => Ok(tolerate_gone(
                self.retry
                    .run("delete_namespace", || self.kube.delete_namespace(target, name))
                    .await,
            )?),
            Resource::KubeObject {
                target,
                namespace,
                object,
            } => Ok(tolerate_gone(
                self.retry
                    .run("delete", || {
                        self.kube.delete_object(target, namespace, object)
                    })
                    .await,
            )?),
        }
    }

    async fn wait_terminated(&self, instance_id: &str) -> ProvisionResult<()> {
        let what = format!("instance {} to terminate", instance_id);
        self.release_waiter()
            .until(&what, || async {
                match self.cloud.describe_instance(instance_id).await {
                    Ok(i) => Ok((i.state == InstanceState::Terminated).then_some(())),
                    Err(e) if e.is_not_found() => Ok(Some(())),
                    Err(e) if e.is_transient() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(())
    }

    async fn wait_filesystem_gone(&self, filesystem_id: &str) -> ProvisionResult<()> {
        let what = format!("filesystem {} to be deleted", filesystem_id);
        self.release_waiter()
            .until(&what, || async {
                match self.cloud.describe_filesystem(filesystem_id).await {
                    Ok(_) => Ok(None),
                    Err(e) if e.is_not_found() => Ok(Some(())),
                    Err(e) if e.is_transient() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(())
    }

    /// Security groups stay referenced by terminating network interfaces for
    /// a while; `DependencyViolation` is retried until the waiter expires.
    async fn delete_security_group(&self, group_id: &str) -> ProvisionResult<()> {
        let what = format!("security group {} to be deleted", group_id);
        self.release_waiter()
            .until(&what, || async {
                match self.cloud.delete_security_group(group_id).await {
                    Ok(()) => Ok(Some(())),
                    Err(e) if e.is_not_found() => Ok(Some(())),
                    Err(CloudError::Api { code, .. }) if code == "DependencyViolation" => {
                        tracing::debug!(group = %group_id, "Security group still in use");
                        Ok(None)
                    }
                    Err(e) if e.is_transient() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(())
    }
}

fn tolerate_missing<T>(result: CloudResult<Option<T>>) -> CloudResult<Option<T>> {
    match result {
        Err(e) if e.is_not_found() => Ok(None),
        other => other,
    }
}

async fn write_private_key(path: &Path, material: &str) -> ProvisionResult<()> {
    let io_err = |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, material).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
            .await
            .map_err(io_err)?;
    }
    Ok(())
}
