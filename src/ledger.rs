//! Resource ledger.
//!
//! The ledger is the append-only record of every cloud resource a run
//! created. It is the single owner of [`ResourceHandle`]s: the provider
//! appends one handle after each successful create call, adapters and
//! execution contexts keep [`ResourceRef`]s (sequence number, identifier and
//! region only), and the cleanup coordinator reads a snapshot once the
//! dispatcher has finished and releases everything in reverse order.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cloud::{IngressRule, KubeObject, KubeTarget};

/// The cloud primitive a handle stands for, with what is needed to
/// release it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Instance {
        instance_id: String,
    },
    KeyPair {
        name: String,
        /// Local private key file written at creation.
        key_file: Option<PathBuf>,
    },
    SecurityGroup {
        group_id: String,
    },
    IngressRule {
        group_id: String,
        rule: IngressRule,
    },
    ElasticIp {
        allocation_id: String,
    },
    AddressAssociation {
        association_id: String,
    },
    Filesystem {
        filesystem_id: String,
    },
    Cluster {
        name: String,
    },
    Nodegroup {
        cluster: String,
        name: String,
    },
    EcsCluster {
        name: String,
    },
    TaskDefinition {
        arn: String,
    },
    Service {
        cluster: String,
        name: String,
    },
    Task {
        cluster: String,
        arn: String,
    },
    Namespace {
        target: KubeTarget,
        name: String,
    },
    KubeObject {
        target: KubeTarget,
        namespace: String,
        object: KubeObject,
    },
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Instance { .. } => ResourceKind::Instance,
            Resource::KeyPair { .. } => ResourceKind::KeyPair,
            Resource::SecurityGroup { .. } => ResourceKind::SecurityGroup,
            Resource::IngressRule { .. } => ResourceKind::IngressRule,
            Resource::ElasticIp { .. } => ResourceKind::ElasticIp,
            Resource::AddressAssociation { .. } => ResourceKind::AddressAssociation,
            Resource::Filesystem { .. } => ResourceKind::Filesystem,
            Resource::Cluster { .. } => ResourceKind::Cluster,
            Resource::Nodegroup { .. } => ResourceKind::Nodegroup,
            Resource::EcsCluster { .. } => ResourceKind::EcsCluster,
            Resource::TaskDefinition { .. } => ResourceKind::TaskDefinition,
            Resource::Service { .. } => ResourceKind::Service,
            Resource::Task { .. } => ResourceKind::Task,
            Resource::Namespace { .. } => ResourceKind::Namespace,
            Resource::KubeObject { .. } => ResourceKind::KubeObject,
        }
    }

    /// The cloud identifier, as printed in logs and cleanup summaries.
    pub fn id(&self) -> String {
        match self {
            Resource::Instance { instance_id } => instance_id.clone(),
            Resource::KeyPair { name, .. } => name.clone(),
            Resource::SecurityGroup { group_id } => group_id.clone(),
            Resource::IngressRule { group_id, rule } => format!("{} {}", group_id, rule),
            Resource::ElasticIp { allocation_id } => allocation_id.clone(),
            Resource::AddressAssociation { association_id } => association_id.clone(),
            Resource::Filesystem { filesystem_id } => filesystem_id.clone(),
            Resource::Cluster { name } | Resource::EcsCluster { name } => name.clone(),
            Resource::Nodegroup { cluster, name } | Resource::Service { cluster, name } => {
                format!("{}/{}", cluster, name)
            }
            Resource::TaskDefinition { arn } => arn.clone(),
            Resource::Task { arn, .. } => arn.clone(),
            Resource::Namespace { target, name } => format!("{}/{}", target.cluster, name),
            Resource::KubeObject {
                target,
                namespace,
                object,
            } => format!("{}/{}/{}", target.cluster, namespace, object),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    KeyPair,
    SecurityGroup,
    IngressRule,
    ElasticIp,
    AddressAssociation,
    Filesystem,
    Cluster,
    Nodegroup,
    EcsCluster,
    TaskDefinition,
    Service,
    Task,
    Namespace,
    KubeObject,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::KeyPair => "key-pair",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::IngressRule => "ingress-rule",
            ResourceKind::ElasticIp => "elastic-ip",
            ResourceKind::AddressAssociation => "address-association",
            ResourceKind::Filesystem => "filesystem",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Nodegroup => "nodegroup",
            ResourceKind::EcsCluster => "ecs-cluster",
            ResourceKind::TaskDefinition => "task-definition",
            ResourceKind::Service => "service",
            ResourceKind::Task => "task",
            ResourceKind::Namespace => "namespace",
            ResourceKind::KubeObject => "kube-object",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHandle {
    /// Creation order within the run, starting at 1.
    pub seq: u64,
    pub run_id: String,
    pub region: String,
    pub tag_prefix: String,
    /// Entry id that acquired the resource.
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub resource: Resource,
}

impl ResourceHandle {
    pub fn to_ref(&self) -> ResourceRef {
        ResourceRef {
            seq: self.seq,
            kind: self.resource.kind(),
            id: self.resource.id(),
            region: self.region.clone(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} ({})",
            self.seq,
            self.resource.kind(),
            self.resource.id(),
            self.region
        )
    }
}

/// Weak reference to a ledger entry: identifies, never owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceRef {
    pub seq: u64,
    pub kind: ResourceKind,
    pub id: String,
    pub region: String,
}

/// Append-only, ordered log of the resources created by one run.
#[derive(Debug)]
pub struct ResourceLedger {
    run_id: String,
    region: String,
    tag_prefix: String,
    entries: Mutex<Vec<ResourceHandle>>,
}

impl ResourceLedger {
    pub fn new(
        run_id: impl Into<String>,
        region: impl Into<String>,
        tag_prefix: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            region: region.into(),
            tag_prefix: tag_prefix.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn tag_prefix(&self) -> &str {
        &self.tag_prefix
    }

    /// Records a resource the cloud just confirmed as created.
    ///
    /// Only the resource provider calls this, and only after the create call
    /// returned, so append order is creation order.
    pub(crate) fn append(&self, owner: &str, resource: Resource) -> ResourceRef {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = ResourceHandle {
            seq: entries.len() as u64 + 1,
            run_id: self.run_id.clone(),
            region: self.region.clone(),
            tag_prefix: self.tag_prefix.clone(),
            owner: owner.to_string(),
            created_at: Utc::now(),
            resource,
        };
        tracing::debug!(run = %self.run_id, resource = %handle, "Registered resource");
        let reference = handle.to_ref();
        entries.push(handle);
        reference
    }

    /// Copy of every handle in creation order.
    pub fn snapshot(&self) -> Vec<ResourceHandle> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// References to the handles acquired by `owner`.
    pub fn owned_by(&self, owner: &str) -> Vec<ResourceRef> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.owner == owner)
            .map(ResourceHandle::to_ref)
            .collect()
    }

    /// The first handle whose resource satisfies `pred`.
    pub fn find<P>(&self, pred: P) -> Option<ResourceHandle>
    where
        P: Fn(&Resource) -> bool,
    {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|h| pred(&h.resource))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
