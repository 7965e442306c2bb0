//! Cloud API seam.
//!
//! The orchestrator talks to four external systems, each behind a trait so
//! that the provider, adapters and sink can be exercised without an account:
//!
//! | Trait | Production implementation | Purpose |
//! |-------|---------------------------|---------|
//! | [`CloudApi`] | [`aws::AwsCloud`] | EC2, FSx, EKS, ECS and CloudWatch Logs primitives |
//! | [`KubeApi`] | [`kubectl::KubectlCli`] | namespaces, manifests and pods inside a cluster |
//! | [`ObjectStore`] | [`aws::S3Store`] | raw log uploads |
//! | [`MetricsBackend`] | [`aws::CloudWatchMetrics`] | metric emission |
//!
//! Every method is a single remote call (or a short fixed sequence of calls
//! that together answer one question). Retrying, waiting and ledger
//! registration live one layer up in [`crate::provider`].
//!
//! Errors are classified at this boundary into [`CloudError`] so that the
//! callers can tell transient failures (throttling, 5xx) from capacity
//! shortages and from resources that are already gone.

pub mod aws;
pub mod kubectl;

#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::ledger::Resource;
use crate::telemetry::Metric;

/// Resource tags, sorted by key.
pub type Tags = BTreeMap<String, String>;

/// Result type for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Classified cloud API failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    /// The API rejected the call because of request rate.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// The service failed or could not be reached (5xx, timeouts).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The zone has no capacity for the requested instance type.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// The resource does not exist (or no longer exists).
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other API error, with the service's error code.
    #[error("{code}: {message}")]
    Api { code: String, message: String },
}

const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "TooManyRequestsException",
    "SlowDown",
    "PriorRequestNotComplete",
];

const UNAVAILABLE_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "ServerException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "Unavailable",
];

const CAPACITY_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientCapacity",
    "InsufficientHostCapacity",
    "InsufficientCapacityException",
];

impl CloudError {
    /// Classifies an API error code.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if THROTTLE_CODES.contains(&code) {
            CloudError::Throttled(message)
        } else if UNAVAILABLE_CODES.contains(&code) {
            CloudError::Unavailable(message)
        } else if CAPACITY_CODES.contains(&code) {
            CloudError::InsufficientCapacity(message)
        } else if code.contains("NotFound") || code == "NoSuchEntity" {
            CloudError::NotFound(message)
        } else {
            CloudError::Api {
                code: code.to_string(),
                message,
            }
        }
    }

    /// Throttling and service failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Throttled(_) | CloudError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, CloudError::InsufficientCapacity(_))
    }
}

/// Lifecycle status shared by clusters, nodegroups and services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResourceStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
    Other(String),
}

impl ResourceStatus {
    /// Maps the status strings used by EKS, ECS and FSx.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "CREATING" | "PROVISIONING" | "PENDING" => ResourceStatus::Creating,
            "ACTIVE" | "AVAILABLE" | "RUNNING" => ResourceStatus::Active,
            "UPDATING" => ResourceStatus::Updating,
            "DELETING" | "DEPROVISIONING" | "DRAINING" | "INACTIVE" => ResourceStatus::Deleting,
            "FAILED" | "CREATE_FAILED" | "DELETE_FAILED" | "MISCONFIGURED" => ResourceStatus::Failed,
            _ => ResourceStatus::Other(raw.to_string()),
        }
    }
}

/// EC2 instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl InstanceState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }

    /// Pending or running.
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Running)
    }
}

/// Root volume settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub device_name: String,
    pub size_gb: i32,
    pub iops: i32,
    pub throughput: i32,
}

/// Parameters of one `run_instances` call in one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRequest {
    pub ami_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub iam_profile: Option<String>,
    pub count: u32,
    pub availability_zone: String,
    pub security_group_ids: Vec<String>,
    pub block_device: Option<BlockDevice>,
    /// Raw user-data script; encoded by the implementation.
    pub user_data: Option<String>,
    pub tags: Tags,
}

/// Instance description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
    pub subnet_id: Option<String>,
    pub vpc_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub network_interface_id: Option<String>,
    pub tags: Tags,
}

/// Result of the two EC2 status checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceHealth {
    pub system_ok: bool,
    pub instance_ok: bool,
}

impl InstanceHealth {
    pub fn is_ok(&self) -> bool {
        self.system_ok && self.instance_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyPair {
    pub name: String,
    pub key_pair_id: Option<String>,
    /// Only returned by creation.
    #[serde(skip)]
    pub private_key: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub vpc_id: Option<String>,
    pub tags: Tags,
}

/// Where ingress traffic may come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum IngressSource {
    Cidr(String),
    Group(String),
}

/// One ingress permission: protocol, port range and source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub source: IngressSource,
}

impl IngressRule {
    /// A single TCP port opened to one CIDR block.
    pub fn tcp_cidr(port: i32, cidr: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            source: IngressSource::Cidr(cidr.into()),
        }
    }

    /// All traffic from members of `group_id`.
    pub fn all_from_group(group_id: impl Into<String>) -> Self {
        Self {
            protocol: "-1".to_string(),
            from_port: -1,
            to_port: -1,
            source: IngressSource::Group(group_id.into()),
        }
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            IngressSource::Cidr(cidr) => cidr.as_str(),
            IngressSource::Group(group) => group.as_str(),
        };
        write!(
            f,
            "{} {}-{} from {}",
            self.protocol, self.from_port, self.to_port, source
        )
    }
}

/// An elastic address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub allocation_id: String,
    pub public_ip: Option<String>,
    pub association_id: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subnet {
    pub id: String,
    pub availability_zone: String,
}

/// Parameters for a Lustre filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemRequest {
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub capacity_gb: i32,
    /// Lustre deployment type, e.g. `SCRATCH_2`.
    pub deployment_type: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filesystem {
    pub id: String,
    pub dns_name: Option<String>,
    /// Lustre mount name, the token after `@tcp:/`.
    pub mount_name: Option<String>,
    pub status: ResourceStatus,
    pub tags: Tags,
}

/// Parameters for a managed Kubernetes control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRequest {
    pub name: String,
    pub version: Option<String>,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub status: ResourceStatus,
    pub version: Option<String>,
    pub endpoint: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_ids: Vec<String>,
    pub security_group_id: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodegroupRequest {
    pub cluster: String,
    pub name: String,
    pub node_role_arn: String,
    pub subnet_ids: Vec<String>,
    pub instance_type: String,
    pub count: i32,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Nodegroup {
    pub cluster: String,
    pub name: String,
    pub status: ResourceStatus,
    pub instance_type: Option<String>,
    pub desired_size: Option<i32>,
}

/// ECS launch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaunchType {
    Ec2,
    Fargate,
}

/// `awsvpc` networking for tasks and services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskNetwork {
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub assign_public_ip: bool,
}

/// A single-container task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDefinitionRequest {
    pub family: String,
    pub container_name: String,
    pub image: String,
    /// Empty keeps the image's default command.
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub port_mappings: Vec<u16>,
    pub gpu_count: u32,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub launch_type: LaunchType,
    pub execution_role_arn: Option<String>,
    /// CloudWatch log group for the container's output.
    pub log_group: Option<String>,
    pub log_stream_prefix: String,
    pub region: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRequest {
    pub cluster: String,
    pub name: String,
    pub task_definition: String,
    pub desired_count: i32,
    pub launch_type: LaunchType,
    pub network: Option<TaskNetwork>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: String,
    pub status: ResourceStatus,
    pub running_count: i32,
    pub desired_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub launch_type: LaunchType,
    pub container_name: String,
    /// Replaces the container command when non-empty.
    pub command: Vec<String>,
    pub network: Option<TaskNetwork>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub arn: String,
    /// `PROVISIONING`, `PENDING`, `RUNNING`, `STOPPED`, ...
    pub last_status: String,
    pub exit_code: Option<i32>,
    pub stopped_reason: Option<String>,
    /// Public address the task can be reached on, when it has one.
    pub endpoint: Option<String>,
}

impl Task {
    pub fn is_running(&self) -> bool {
        self.last_status.eq_ignore_ascii_case("RUNNING")
    }

    pub fn is_stopped(&self) -> bool {
        self.last_status.eq_ignore_ascii_case("STOPPED")
    }

    /// The CloudWatch log stream of the task's container.
    pub fn log_stream(&self, prefix: &str, container: &str) -> Option<String> {
        let task_id = self.arn.rsplit('/').next()?;
        Some(format!("{}/{}/{}", prefix, container, task_id))
    }
}

/// A resource found by tag, for the stale-resource janitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedResource {
    pub resource: Resource,
    pub tags: Tags,
}

/// EC2, FSx, EKS, ECS and CloudWatch Logs primitives.
///
/// Implementations must classify errors with [`CloudError::from_code`]
/// and must not retry internally.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Region the client is bound to.
    fn region(&self) -> &str;

    // Discovery

    async fn availability_zones(&self) -> CloudResult<Vec<String>>;
    async fn default_vpc(&self) -> CloudResult<String>;
    async fn subnets(&self, vpc_id: &str) -> CloudResult<Vec<Subnet>>;

    // Instances

    /// Launches `request.count` instances in one zone.
    async fn run_instances(&self, request: &InstanceRequest) -> CloudResult<Vec<Instance>>;
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<Instance>;
    async fn instance_health(&self, instance_id: &str) -> CloudResult<InstanceHealth>;
    /// Live instances carrying every tag in `tags`.
    async fn find_instances(&self, tags: &Tags) -> CloudResult<Vec<Instance>>;
    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()>;

    // Key pairs

    async fn find_key_pair(&self, name: &str) -> CloudResult<Option<KeyPair>>;
    async fn create_key_pair(&self, name: &str, tags: &Tags) -> CloudResult<KeyPair>;
    async fn delete_key_pair(&self, name: &str) -> CloudResult<()>;

    // Security groups

    async fn find_security_group(&self, vpc_id: &str, name: &str)
    -> CloudResult<Option<SecurityGroup>>;
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> CloudResult<SecurityGroup>;
    async fn ingress_rules(&self, group_id: &str) -> CloudResult<Vec<IngressRule>>;
    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> CloudResult<()>;
    async fn revoke_ingress(&self, group_id: &str, rule: &IngressRule) -> CloudResult<()>;
    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()>;

    // Elastic addresses

    async fn find_addresses(&self, tags: &Tags) -> CloudResult<Vec<Address>>;
    async fn allocate_address(&self, tags: &Tags) -> CloudResult<Address>;
    /// Returns the association id.
    async fn associate_address(
        &self,
        allocation_id: &str,
        network_interface_id: &str,
    ) -> CloudResult<String>;
    async fn disassociate_address(&self, association_id: &str) -> CloudResult<()>;
    async fn release_address(&self, allocation_id: &str) -> CloudResult<()>;

    // Shared filesystems

    async fn find_filesystems(&self, tags: &Tags) -> CloudResult<Vec<Filesystem>>;
    async fn create_filesystem(&self, request: &FilesystemRequest) -> CloudResult<Filesystem>;
    async fn describe_filesystem(&self, filesystem_id: &str) -> CloudResult<Filesystem>;
    async fn delete_filesystem(&self, filesystem_id: &str) -> CloudResult<()>;

    // Managed Kubernetes

    async fn describe_cluster(&self, name: &str) -> CloudResult<Option<Cluster>>;
    async fn create_cluster(&self, request: &ClusterRequest) -> CloudResult<Cluster>;
    async fn delete_cluster(&self, name: &str) -> CloudResult<()>;
    async fn describe_nodegroup(&self, cluster: &str, name: &str)
    -> CloudResult<Option<Nodegroup>>;
    async fn create_nodegroup(&self, request: &NodegroupRequest) -> CloudResult<Nodegroup>;
    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()>;

    // Container clusters

    async fn describe_ecs_cluster(&self, name: &str) -> CloudResult<Option<ResourceStatus>>;
    async fn create_ecs_cluster(&self, name: &str, tags: &Tags) -> CloudResult<()>;
    async fn delete_ecs_cluster(&self, name: &str) -> CloudResult<()>;
    async fn container_instance_count(&self, cluster: &str) -> CloudResult<usize>;
    /// Returns the task definition ARN.
    async fn register_task_definition(&self, request: &TaskDefinitionRequest)
    -> CloudResult<String>;
    async fn deregister_task_definition(&self, arn: &str) -> CloudResult<()>;
    async fn create_service(&self, request: &ServiceRequest) -> CloudResult<Service>;
    async fn describe_service(&self, cluster: &str, name: &str) -> CloudResult<Option<Service>>;
    async fn delete_service(&self, cluster: &str, name: &str) -> CloudResult<()>;
    async fn service_tasks(&self, cluster: &str, service: &str) -> CloudResult<Vec<String>>;
    /// Returns the task ARN.
    async fn run_task(&self, request: &TaskRequest) -> CloudResult<String>;
    async fn describe_task(&self, cluster: &str, task_arn: &str) -> CloudResult<Task>;
    async fn stop_task(&self, cluster: &str, task_arn: &str) -> CloudResult<()>;
    async fn task_logs(&self, log_group: &str, log_stream: &str) -> CloudResult<Vec<String>>;

    // Janitor

    /// Every resource carrying the tag key `tag_key`.
    async fn list_tagged(&self, tag_key: &str) -> CloudResult<Vec<TaggedResource>>;
}

/// A cluster reachable through a kubeconfig file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KubeTarget {
    pub cluster: String,
    pub kubeconfig: PathBuf,
}

/// A namespaced object created by `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KubeObject {
    pub kind: String,
    pub name: String,
}

impl fmt::Display for KubeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.to_ascii_lowercase(), self.name)
    }
}

/// Pod phase and per-container readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub name: String,
    pub phase: String,
    pub containers_ready: Vec<bool>,
}

impl PodStatus {
    /// Running with every container reporting ready.
    pub fn is_ready(&self) -> bool {
        self.phase == "Running"
            && !self.containers_ready.is_empty()
            && self.containers_ready.iter().all(|ready| *ready)
    }
}

/// Operations inside a Kubernetes cluster.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Writes a kubeconfig for `cluster` to `path`.
    async fn write_kubeconfig(&self, cluster: &str, region: &str, path: &Path) -> CloudResult<()>;
    async fn namespace_exists(&self, target: &KubeTarget, namespace: &str) -> CloudResult<bool>;
    async fn create_namespace(
        &self,
        target: &KubeTarget,
        namespace: &str,
        labels: &Tags,
    ) -> CloudResult<()>;
    async fn delete_namespace(&self, target: &KubeTarget, namespace: &str) -> CloudResult<()>;
    /// Applies a rendered manifest and returns the objects it created.
    async fn apply(
        &self,
        target: &KubeTarget,
        namespace: &str,
        manifest: &str,
    ) -> CloudResult<Vec<KubeObject>>;
    async fn delete_object(
        &self,
        target: &KubeTarget,
        namespace: &str,
        object: &KubeObject,
    ) -> CloudResult<()>;
    async fn pods(&self, target: &KubeTarget, namespace: &str) -> CloudResult<Vec<PodStatus>>;
}

/// Blob storage for raw logs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` and returns a printable reference (`s3://bucket/key`).
    async fn put(&self, key: &str, body: Vec<u8>) -> CloudResult<String>;
}

/// Time-series sink for metrics.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn put_metrics(&self, namespace: &str, metrics: &[Metric]) -> CloudResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CloudError::from_code("RequestLimitExceeded", "slow down").is_transient());
        assert!(CloudError::from_code("InternalError", "oops").is_transient());
        assert!(CloudError::from_code("InsufficientInstanceCapacity", "none").is_capacity());
        assert!(CloudError::from_code("InvalidInstanceID.NotFound", "gone").is_not_found());
        assert!(CloudError::from_code("ResourceNotFoundException", "gone").is_not_found());

        let other = CloudError::from_code("UnauthorizedOperation", "denied");
        assert!(!other.is_transient());
        assert_eq!(other.to_string(), "UnauthorizedOperation: denied");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(ResourceStatus::parse("ACTIVE"), ResourceStatus::Active);
        assert_eq!(ResourceStatus::parse("AVAILABLE"), ResourceStatus::Active);
        assert_eq!(ResourceStatus::parse("CREATE_FAILED"), ResourceStatus::Failed);
        assert_eq!(InstanceState::parse("shutting-down"), InstanceState::ShuttingDown);
        assert!(InstanceState::parse("pending").is_live());
    }

    #[test]
    fn test_pod_readiness() {
        let pod = |phase: &str, ready: Vec<bool>| PodStatus {
            name: "p".into(),
            phase: phase.into(),
            containers_ready: ready,
        };
        assert!(pod("Running", vec![true, true]).is_ready());
        assert!(!pod("Running", vec![true, false]).is_ready());
        assert!(!pod("Pending", vec![true]).is_ready());
        assert!(!pod("Running", vec![]).is_ready());
    }

    #[test]
    fn test_task_log_stream() {
        let task = Task {
            arn: "arn:aws:ecs:us-west-2:1:task/cluster/abc123".into(),
            last_status: "STOPPED".into(),
            exit_code: Some(0),
            stopped_reason: None,
            endpoint: None,
        };
        assert_eq!(
            task.log_stream("dlc", "main").as_deref(),
            Some("dlc/main/abc123")
        );
    }
}
