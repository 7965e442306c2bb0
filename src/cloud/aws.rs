//! AWS SDK implementations of the cloud traits.
//!
//! SDK retries are disabled: [`crate::provider::retry::RetryPolicy`] owns
//! backoff so that every retry is visible in the run's retry statistics.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types as ec2;
use aws_sdk_ecs::types as ecs;
use aws_sdk_eks::types as eks;
use aws_sdk_fsx::types as fsx;
use base64::Engine;
use tracing::debug;

use super::*;
use crate::ledger::Resource;
use crate::telemetry::Metric;

/// Loads shared SDK configuration for `region` with SDK retries off.
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .retry_config(RetryConfig::disabled())
        .load()
        .await
}

/// Classifies an SDK failure.
fn classify<E, R>(err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + Debug,
    R: Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let inner = ctx.err();
            CloudError::from_code(
                inner.code().unwrap_or("Unknown"),
                inner.message().unwrap_or_default().to_string(),
            )
        }
        _ => CloudError::Unavailable(format!("{:?}", err)),
    }
}

fn build_error(err: impl std::fmt::Display) -> CloudError {
    CloudError::Api {
        code: "InvalidRequest".to_string(),
        message: err.to_string(),
    }
}

fn ec2_tags(tags: &Tags) -> Vec<ec2::Tag> {
    tags.iter()
        .map(|(k, v)| ec2::Tag::builder().key(k).value(v).build())
        .collect()
}

fn tag_spec(kind: ec2::ResourceType, tags: &Tags) -> ec2::TagSpecification {
    ec2::TagSpecification::builder()
        .resource_type(kind)
        .set_tags(Some(ec2_tags(tags)))
        .build()
}

fn tag_filters(tags: &Tags) -> Vec<ec2::Filter> {
    tags.iter()
        .map(|(k, v)| {
            ec2::Filter::builder()
                .name(format!("tag:{}", k))
                .values(v)
                .build()
        })
        .collect()
}

fn filter(name: &str, value: &str) -> ec2::Filter {
    ec2::Filter::builder().name(name).values(value).build()
}

fn from_ec2_tags(tags: &[ec2::Tag]) -> Tags {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

fn to_instance(raw: &ec2::Instance) -> Instance {
    Instance {
        id: raw.instance_id().unwrap_or_default().to_string(),
        state: raw
            .state()
            .and_then(|s| s.name())
            .map(|n| InstanceState::parse(n.as_str()))
            .unwrap_or(InstanceState::Unknown),
        instance_type: raw.instance_type().map(|t| t.as_str().to_string()),
        availability_zone: raw
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string),
        subnet_id: raw.subnet_id().map(str::to_string),
        vpc_id: raw.vpc_id().map(str::to_string),
        public_ip: raw.public_ip_address().map(str::to_string),
        private_ip: raw.private_ip_address().map(str::to_string),
        network_interface_id: raw
            .network_interfaces()
            .first()
            .and_then(|n| n.network_interface_id())
            .map(str::to_string),
        tags: from_ec2_tags(raw.tags()),
    }
}

fn to_permission(rule: &IngressRule) -> ec2::IpPermission {
    let builder = ec2::IpPermission::builder()
        .ip_protocol(&rule.protocol)
        .from_port(rule.from_port)
        .to_port(rule.to_port);
    match &rule.source {
        IngressSource::Cidr(cidr) => builder
            .ip_ranges(ec2::IpRange::builder().cidr_ip(cidr).build())
            .build(),
        IngressSource::Group(group) => builder
            .user_id_group_pairs(ec2::UserIdGroupPair::builder().group_id(group).build())
            .build(),
    }
}

fn from_permissions(perms: &[ec2::IpPermission]) -> Vec<IngressRule> {
    let mut rules = Vec::new();
    for perm in perms {
        let protocol = perm.ip_protocol().unwrap_or("-1").to_string();
        let from_port = perm.from_port().unwrap_or(-1);
        let to_port = perm.to_port().unwrap_or(-1);
        let cidrs = perm
            .ip_ranges()
            .iter()
            .filter_map(|r| r.cidr_ip())
            .map(|c| IngressSource::Cidr(c.to_string()));
        let groups = perm
            .user_id_group_pairs()
            .iter()
            .filter_map(|p| p.group_id())
            .map(|g| IngressSource::Group(g.to_string()));
        for source in cidrs.chain(groups) {
            rules.push(IngressRule {
                protocol: protocol.clone(),
                from_port,
                to_port,
                source,
            });
        }
    }
    rules
}

fn to_filesystem(raw: &fsx::FileSystem) -> Filesystem {
    Filesystem {
        id: raw.file_system_id().unwrap_or_default().to_string(),
        dns_name: raw.dns_name().map(str::to_string),
        mount_name: raw
            .lustre_configuration()
            .and_then(|l| l.mount_name())
            .map(str::to_string),
        status: raw
            .lifecycle()
            .map(|l| ResourceStatus::parse(l.as_str()))
            .unwrap_or(ResourceStatus::Other("unknown".to_string())),
        tags: raw
            .tags()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect(),
    }
}

fn to_cluster(raw: &eks::Cluster) -> Cluster {
    let vpc = raw.resources_vpc_config();
    Cluster {
        name: raw.name().unwrap_or_default().to_string(),
        status: raw
            .status()
            .map(|s| ResourceStatus::parse(s.as_str()))
            .unwrap_or(ResourceStatus::Other("unknown".to_string())),
        version: raw.version().map(str::to_string),
        endpoint: raw.endpoint().map(str::to_string),
        vpc_id: vpc.and_then(|v| v.vpc_id()).map(str::to_string),
        subnet_ids: vpc.map(|v| v.subnet_ids().to_vec()).unwrap_or_default(),
        security_group_id: vpc
            .and_then(|v| v.cluster_security_group_id())
            .map(str::to_string),
        tags: raw
            .tags()
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
    }
}

fn to_nodegroup(cluster: &str, raw: &eks::Nodegroup) -> Nodegroup {
    Nodegroup {
        cluster: cluster.to_string(),
        name: raw.nodegroup_name().unwrap_or_default().to_string(),
        status: raw
            .status()
            .map(|s| ResourceStatus::parse(s.as_str()))
            .unwrap_or(ResourceStatus::Other("unknown".to_string())),
        instance_type: raw.instance_types().first().cloned(),
        desired_size: raw.scaling_config().and_then(|s| s.desired_size()),
    }
}

fn hash_tags(tags: &Tags) -> HashMap<String, String> {
    tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn ecs_tags(tags: &Tags) -> Vec<ecs::Tag> {
    tags.iter()
        .map(|(k, v)| ecs::Tag::builder().key(k).value(v).build())
        .collect()
}

fn ecs_launch_type(launch: LaunchType) -> ecs::LaunchType {
    match launch {
        LaunchType::Ec2 => ecs::LaunchType::Ec2,
        LaunchType::Fargate => ecs::LaunchType::Fargate,
    }
}

fn ecs_network(network: &TaskNetwork) -> CloudResult<ecs::NetworkConfiguration> {
    let vpc = ecs::AwsVpcConfiguration::builder()
        .set_subnets(Some(network.subnet_ids.clone()))
        .set_security_groups(Some(network.security_group_ids.clone()))
        .assign_public_ip(if network.assign_public_ip {
            ecs::AssignPublicIp::Enabled
        } else {
            ecs::AssignPublicIp::Disabled
        })
        .build()
        .map_err(build_error)?;
    Ok(ecs::NetworkConfiguration::builder()
        .awsvpc_configuration(vpc)
        .build())
}

fn to_service(raw: &ecs::Service) -> Service {
    Service {
        name: raw.service_name().unwrap_or_default().to_string(),
        status: raw
            .status()
            .map(ResourceStatus::parse)
            .unwrap_or(ResourceStatus::Other("unknown".to_string())),
        running_count: raw.running_count(),
        desired_count: raw.desired_count(),
    }
}

/// EC2, FSx, EKS, ECS and CloudWatch Logs through the AWS SDK.
pub struct AwsCloud {
    region: String,
    ec2: aws_sdk_ec2::Client,
    ecs: aws_sdk_ecs::Client,
    eks: aws_sdk_eks::Client,
    fsx: aws_sdk_fsx::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
}

impl AwsCloud {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            region: config
                .region()
                .map(|r| r.to_string())
                .unwrap_or_default(),
            ec2: aws_sdk_ec2::Client::new(config),
            ecs: aws_sdk_ecs::Client::new(config),
            eks: aws_sdk_eks::Client::new(config),
            fsx: aws_sdk_fsx::Client::new(config),
            logs: aws_sdk_cloudwatchlogs::Client::new(config),
        }
    }

    async fn describe_instances(&self, filters: Vec<ec2::Filter>) -> CloudResult<Vec<Instance>> {
        let mut found = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .ec2
                .describe_instances()
                .set_filters(Some(filters.clone()))
                .set_next_token(token)
                .send()
                .await
                .map_err(classify)?;
            for reservation in out.reservations() {
                found.extend(reservation.instances().iter().map(to_instance));
            }
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(found);
            }
        }
    }
}

#[async_trait]
impl CloudApi for AwsCloud {
    fn region(&self) -> &str {
        &self.region
    }

    async fn availability_zones(&self) -> CloudResult<Vec<String>> {
        let out = self
            .ec2
            .describe_availability_zones()
            .filters(filter("state", "available"))
            .send()
            .await
            .map_err(classify)?;
        Ok(out
            .availability_zones()
            .iter()
            .filter_map(|z| z.zone_name())
            .map(str::to_string)
            .collect())
    }

    async fn default_vpc(&self) -> CloudResult<String> {
        let out = self
            .ec2
            .describe_vpcs()
            .filters(filter("isDefault", "true"))
            .send()
            .await
            .map_err(classify)?;
        out.vpcs()
            .first()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| CloudError::NotFound(format!("default VPC in {}", self.region)))
    }

    async fn subnets(&self, vpc_id: &str) -> CloudResult<Vec<Subnet>> {
        let out = self
            .ec2
            .describe_subnets()
            .filters(filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(classify)?;
        Ok(out
            .subnets()
            .iter()
            .filter_map(|s| {
                Some(Subnet {
                    id: s.subnet_id()?.to_string(),
                    availability_zone: s.availability_zone()?.to_string(),
                })
            })
            .collect())
    }

    async fn run_instances(&self, request: &InstanceRequest) -> CloudResult<Vec<Instance>> {
        let mut call = self
            .ec2
            .run_instances()
            .image_id(&request.ami_id)
            .instance_type(ec2::InstanceType::from(request.instance_type.as_str()))
            .key_name(&request.key_name)
            .min_count(request.count as i32)
            .max_count(request.count as i32)
            .placement(
                ec2::Placement::builder()
                    .availability_zone(&request.availability_zone)
                    .build(),
            )
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .tag_specifications(tag_spec(ec2::ResourceType::Instance, &request.tags));

        if let Some(profile) = &request.iam_profile {
            call = call.iam_instance_profile(
                ec2::IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }
        if let Some(device) = &request.block_device {
            call = call.block_device_mappings(
                ec2::BlockDeviceMapping::builder()
                    .device_name(&device.device_name)
                    .ebs(
                        ec2::EbsBlockDevice::builder()
                            .volume_size(device.size_gb)
                            .volume_type(ec2::VolumeType::Gp3)
                            .iops(device.iops)
                            .throughput(device.throughput)
                            .delete_on_termination(true)
                            .build(),
                    )
                    .build(),
            );
        }
        if let Some(data) = &request.user_data {
            call = call.user_data(base64::engine::general_purpose::STANDARD.encode(data));
        }

        let out = call.send().await.map_err(classify)?;
        debug!(
            zone = %request.availability_zone,
            count = out.instances().len(),
            "run_instances returned"
        );
        Ok(out.instances().iter().map(to_instance).collect())
    }

    async fn describe_instance(&self, instance_id: &str) -> CloudResult<Instance> {
        let out = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(classify)?;
        out.reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .map(to_instance)
            .ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
    }

    async fn instance_health(&self, instance_id: &str) -> CloudResult<InstanceHealth> {
        let out = self
            .ec2
            .describe_instance_status()
            .instance_ids(instance_id)
            .include_all_instances(true)
            .send()
            .await
            .map_err(classify)?;
        let Some(status) = out.instance_statuses().first() else {
            return Ok(InstanceHealth::default());
        };
        let ok = |summary: Option<&ec2::InstanceStatusSummary>| {
            summary.and_then(|s| s.status()) == Some(&ec2::SummaryStatus::Ok)
        };
        Ok(InstanceHealth {
            system_ok: ok(status.system_status()),
            instance_ok: ok(status.instance_status()),
        })
    }

    async fn find_instances(&self, tags: &Tags) -> CloudResult<Vec<Instance>> {
        let mut filters = tag_filters(tags);
        filters.push(
            ec2::Filter::builder()
                .name("instance-state-name")
                .values("pending")
                .values("running")
                .build(),
        );
        self.describe_instances(filters).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn find_key_pair(&self, name: &str) -> CloudResult<Option<KeyPair>> {
        let out = match self.ec2.describe_key_pairs().key_names(name).send().await {
            Ok(out) => out,
            Err(e) => {
                let err = classify(e);
                return if err.is_not_found() { Ok(None) } else { Err(err) };
            }
        };
        Ok(out.key_pairs().first().map(|k| KeyPair {
            name: k.key_name().unwrap_or(name).to_string(),
            key_pair_id: k.key_pair_id().map(str::to_string),
            private_key: None,
            tags: from_ec2_tags(k.tags()),
        }))
    }

    async fn create_key_pair(&self, name: &str, tags: &Tags) -> CloudResult<KeyPair> {
        let out = self
            .ec2
            .create_key_pair()
            .key_name(name)
            .tag_specifications(tag_spec(ec2::ResourceType::KeyPair, tags))
            .send()
            .await
            .map_err(classify)?;
        Ok(KeyPair {
            name: name.to_string(),
            key_pair_id: out.key_pair_id().map(str::to_string),
            private_key: out.key_material().map(str::to_string),
            tags: tags.clone(),
        })
    }

    async fn delete_key_pair(&self, name: &str) -> CloudResult<()> {
        self.ec2
            .delete_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn find_security_group(
        &self,
        vpc_id: &str,
        name: &str,
    ) -> CloudResult<Option<SecurityGroup>> {
        let out = self
            .ec2
            .describe_security_groups()
            .filters(filter("vpc-id", vpc_id))
            .filters(filter("group-name", name))
            .send()
            .await
            .map_err(classify)?;
        Ok(out.security_groups().first().map(|g| SecurityGroup {
            id: g.group_id().unwrap_or_default().to_string(),
            name: g.group_name().unwrap_or(name).to_string(),
            vpc_id: g.vpc_id().map(str::to_string),
            tags: from_ec2_tags(g.tags()),
        }))
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> CloudResult<SecurityGroup> {
        let out = self
            .ec2
            .create_security_group()
            .group_name(name)
            .description(description)
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ec2::ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(classify)?;
        Ok(SecurityGroup {
            id: out.group_id().unwrap_or_default().to_string(),
            name: name.to_string(),
            vpc_id: Some(vpc_id.to_string()),
            tags: tags.clone(),
        })
    }

    async fn ingress_rules(&self, group_id: &str) -> CloudResult<Vec<IngressRule>> {
        let out = self
            .ec2
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(out
            .security_groups()
            .first()
            .map(|g| from_permissions(g.ip_permissions()))
            .unwrap_or_default())
    }

    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> CloudResult<()> {
        self.ec2
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(to_permission(rule))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn revoke_ingress(&self, group_id: &str, rule: &IngressRule) -> CloudResult<()> {
        self.ec2
            .revoke_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(to_permission(rule))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()> {
        self.ec2
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn find_addresses(&self, tags: &Tags) -> CloudResult<Vec<Address>> {
        let out = self
            .ec2
            .describe_addresses()
            .set_filters(Some(tag_filters(tags)))
            .send()
            .await
            .map_err(classify)?;
        Ok(out
            .addresses()
            .iter()
            .map(|a| Address {
                allocation_id: a.allocation_id().unwrap_or_default().to_string(),
                public_ip: a.public_ip().map(str::to_string),
                association_id: a.association_id().map(str::to_string),
                tags: from_ec2_tags(a.tags()),
            })
            .collect())
    }

    async fn allocate_address(&self, tags: &Tags) -> CloudResult<Address> {
        let out = self
            .ec2
            .allocate_address()
            .domain(ec2::DomainType::Vpc)
            .tag_specifications(tag_spec(ec2::ResourceType::ElasticIp, tags))
            .send()
            .await
            .map_err(classify)?;
        Ok(Address {
            allocation_id: out.allocation_id().unwrap_or_default().to_string(),
            public_ip: out.public_ip().map(str::to_string),
            association_id: None,
            tags: tags.clone(),
        })
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        network_interface_id: &str,
    ) -> CloudResult<String> {
        let out = self
            .ec2
            .associate_address()
            .allocation_id(allocation_id)
            .network_interface_id(network_interface_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.association_id().unwrap_or_default().to_string())
    }

    async fn disassociate_address(&self, association_id: &str) -> CloudResult<()> {
        self.ec2
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()> {
        self.ec2
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn find_filesystems(&self, tags: &Tags) -> CloudResult<Vec<Filesystem>> {
        let mut found = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .fsx
                .describe_file_systems()
                .set_next_token(token)
                .send()
                .await
                .map_err(classify)?;
            found.extend(
                out.file_systems()
                    .iter()
                    .map(to_filesystem)
                    .filter(|f| tags.iter().all(|(k, v)| f.tags.get(k) == Some(v))),
            );
            token = out.next_token().map(str::to_string);
            if token.is_none() {
                return Ok(found);
            }
        }
    }

    async fn create_filesystem(&self, request: &FilesystemRequest) -> CloudResult<Filesystem> {
        let tags = request
            .tags
            .iter()
            .map(|(k, v)| fsx::Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(build_error)?;
        let out = self
            .fsx
            .create_file_system()
            .file_system_type(fsx::FileSystemType::Lustre)
            .storage_capacity(request.capacity_gb)
            .subnet_ids(&request.subnet_id)
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .lustre_configuration(
                fsx::CreateFileSystemLustreConfiguration::builder()
                    .deployment_type(fsx::LustreDeploymentType::from(
                        request.deployment_type.as_str(),
                    ))
                    .build(),
            )
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(classify)?;
        out.file_system()
            .map(to_filesystem)
            .ok_or_else(|| CloudError::Unavailable("create_file_system returned nothing".into()))
    }

    async fn describe_filesystem(&self, filesystem_id: &str) -> CloudResult<Filesystem> {
        let out = self
            .fsx
            .describe_file_systems()
            .file_system_ids(filesystem_id)
            .send()
            .await
            .map_err(classify)?;
        out.file_systems()
            .first()
            .map(to_filesystem)
            .ok_or_else(|| CloudError::NotFound(filesystem_id.to_string()))
    }

    async fn delete_filesystem(&self, filesystem_id: &str) -> CloudResult<()> {
        self.fsx
            .delete_file_system()
            .file_system_id(filesystem_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn describe_cluster(&self, name: &str) -> CloudResult<Option<Cluster>> {
        match self.eks.describe_cluster().name(name).send().await {
            Ok(out) => Ok(out.cluster().map(to_cluster)),
            Err(e) => match classify(e) {
                err if err.is_not_found() => Ok(None),
                err => Err(err),
            },
        }
    }

    async fn create_cluster(&self, request: &ClusterRequest) -> CloudResult<Cluster> {
        let out = self
            .eks
            .create_cluster()
            .name(&request.name)
            .set_version(request.version.clone())
            .role_arn(&request.role_arn)
            .resources_vpc_config(
                eks::VpcConfigRequest::builder()
                    .set_subnet_ids(Some(request.subnet_ids.clone()))
                    .set_security_group_ids(Some(request.security_group_ids.clone()))
                    .build(),
            )
            .set_tags(Some(hash_tags(&request.tags)))
            .send()
            .await
            .map_err(classify)?;
        out.cluster()
            .map(to_cluster)
            .ok_or_else(|| CloudError::Unavailable("create_cluster returned nothing".into()))
    }

    async fn delete_cluster(&self, name: &str) -> CloudResult<()> {
        self.eks
            .delete_cluster()
            .name(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<Option<Nodegroup>> {
        match self
            .eks
            .describe_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .send()
            .await
        {
            Ok(out) => Ok(out.nodegroup().map(|n| to_nodegroup(cluster, n))),
            Err(e) => match classify(e) {
                err if err.is_not_found() => Ok(None),
                err => Err(err),
            },
        }
    }

    async fn create_nodegroup(&self, request: &NodegroupRequest) -> CloudResult<Nodegroup> {
        let out = self
            .eks
            .create_nodegroup()
            .cluster_name(&request.cluster)
            .nodegroup_name(&request.name)
            .node_role(&request.node_role_arn)
            .set_subnets(Some(request.subnet_ids.clone()))
            .instance_types(&request.instance_type)
            .scaling_config(
                eks::NodegroupScalingConfig::builder()
                    .min_size(request.count)
                    .max_size(request.count)
                    .desired_size(request.count)
                    .build(),
            )
            .set_tags(Some(hash_tags(&request.tags)))
            .send()
            .await
            .map_err(classify)?;
        out.nodegroup()
            .map(|n| to_nodegroup(&request.cluster, n))
            .ok_or_else(|| CloudError::Unavailable("create_nodegroup returned nothing".into()))
    }

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()> {
        self.eks
            .delete_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn describe_ecs_cluster(&self, name: &str) -> CloudResult<Option<ResourceStatus>> {
        let out = self
            .ecs
            .describe_clusters()
            .clusters(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(out
            .clusters()
            .first()
            .and_then(|c| c.status())
            .map(ResourceStatus::parse)
            .filter(|s| *s != ResourceStatus::Deleting))
    }

    async fn create_ecs_cluster(&self, name: &str, tags: &Tags) -> CloudResult<()> {
        self.ecs
            .create_cluster()
            .cluster_name(name)
            .set_tags(Some(ecs_tags(tags)))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_ecs_cluster(&self, name: &str) -> CloudResult<()> {
        self.ecs
            .delete_cluster()
            .cluster(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn container_instance_count(&self, cluster: &str) -> CloudResult<usize> {
        let out = self
            .ecs
            .list_container_instances()
            .cluster(cluster)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.container_instance_arns().len())
    }

    async fn register_task_definition(
        &self,
        request: &TaskDefinitionRequest,
    ) -> CloudResult<String> {
        let mut container = ecs::ContainerDefinition::builder()
            .name(&request.container_name)
            .image(&request.image)
            .essential(true)
            .set_environment(Some(
                request
                    .environment
                    .iter()
                    .map(|(k, v)| ecs::KeyValuePair::builder().name(k).value(v).build())
                    .collect(),
            ))
            .set_port_mappings(Some(
                request
                    .port_mappings
                    .iter()
                    .map(|p| {
                        ecs::PortMapping::builder()
                            .container_port(i32::from(*p))
                            .protocol(ecs::TransportProtocol::Tcp)
                            .build()
                    })
                    .collect(),
            ));
        if !request.command.is_empty() {
            container = container.set_command(Some(request.command.clone()));
        }
        if request.gpu_count > 0 {
            container = container.resource_requirements(
                ecs::ResourceRequirement::builder()
                    .r#type(ecs::ResourceType::Gpu)
                    .value(request.gpu_count.to_string())
                    .build()
                    .map_err(build_error)?,
            );
        }
        if let Some(group) = &request.log_group {
            container = container.log_configuration(
                ecs::LogConfiguration::builder()
                    .log_driver(ecs::LogDriver::Awslogs)
                    .options("awslogs-group", group)
                    .options("awslogs-region", &request.region)
                    .options("awslogs-stream-prefix", &request.log_stream_prefix)
                    .options("awslogs-create-group", "true")
                    .build()
                    .map_err(build_error)?,
            );
        }

        let (compatibility, network_mode) = match request.launch_type {
            LaunchType::Ec2 => (ecs::Compatibility::Ec2, ecs::NetworkMode::Bridge),
            LaunchType::Fargate => (ecs::Compatibility::Fargate, ecs::NetworkMode::Awsvpc),
        };
        let out = self
            .ecs
            .register_task_definition()
            .family(&request.family)
            .requires_compatibilities(compatibility)
            .network_mode(network_mode)
            .set_cpu(request.cpu.clone())
            .set_memory(request.memory.clone())
            .set_execution_role_arn(request.execution_role_arn.clone())
            .container_definitions(container.build())
            .set_tags(Some(ecs_tags(&request.tags)))
            .send()
            .await
            .map_err(classify)?;
        out.task_definition()
            .and_then(|t| t.task_definition_arn())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Unavailable("register_task_definition returned no ARN".into()))
    }

    async fn deregister_task_definition(&self, arn: &str) -> CloudResult<()> {
        self.ecs
            .deregister_task_definition()
            .task_definition(arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_service(&self, request: &ServiceRequest) -> CloudResult<Service> {
        let network = request.network.as_ref().map(ecs_network).transpose()?;
        let out = self
            .ecs
            .create_service()
            .cluster(&request.cluster)
            .service_name(&request.name)
            .task_definition(&request.task_definition)
            .desired_count(request.desired_count)
            .launch_type(ecs_launch_type(request.launch_type))
            .set_network_configuration(network)
            .set_tags(Some(ecs_tags(&request.tags)))
            .send()
            .await
            .map_err(classify)?;
        out.service()
            .map(to_service)
            .ok_or_else(|| CloudError::Unavailable("create_service returned nothing".into()))
    }

    async fn describe_service(&self, cluster: &str, name: &str) -> CloudResult<Option<Service>> {
        let out = self
            .ecs
            .describe_services()
            .cluster(cluster)
            .services(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(out
            .services()
            .first()
            .map(to_service)
            .filter(|s| s.status != ResourceStatus::Deleting))
    }

    async fn delete_service(&self, cluster: &str, name: &str) -> CloudResult<()> {
        self.ecs
            .delete_service()
            .cluster(cluster)
            .service(name)
            .force(true)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn service_tasks(&self, cluster: &str, service: &str) -> CloudResult<Vec<String>> {
        let out = self
            .ecs
            .list_tasks()
            .cluster(cluster)
            .service_name(service)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.task_arns().to_vec())
    }

    async fn run_task(&self, request: &TaskRequest) -> CloudResult<String> {
        let network = request.network.as_ref().map(ecs_network).transpose()?;
        let mut overrides = ecs::ContainerOverride::builder().name(&request.container_name);
        if !request.command.is_empty() {
            overrides = overrides.set_command(Some(request.command.clone()));
        }
        let out = self
            .ecs
            .run_task()
            .cluster(&request.cluster)
            .task_definition(&request.task_definition)
            .launch_type(ecs_launch_type(request.launch_type))
            .set_network_configuration(network)
            .overrides(
                ecs::TaskOverride::builder()
                    .container_overrides(overrides.build())
                    .build(),
            )
            .set_tags(Some(ecs_tags(&request.tags)))
            .send()
            .await
            .map_err(classify)?;

        if let Some(task) = out.tasks().first().and_then(|t| t.task_arn()) {
            return Ok(task.to_string());
        }
        let reason = out
            .failures()
            .first()
            .and_then(|f| f.reason())
            .unwrap_or("no task started")
            .to_string();
        // Placement failures name the exhausted resource, e.g. "RESOURCE:GPU".
        if reason.starts_with("RESOURCE:") {
            Err(CloudError::InsufficientCapacity(reason))
        } else {
            Err(CloudError::Api {
                code: "RunTaskFailure".to_string(),
                message: reason,
            })
        }
    }

    async fn describe_task(&self, cluster: &str, task_arn: &str) -> CloudResult<Task> {
        let out = self
            .ecs
            .describe_tasks()
            .cluster(cluster)
            .tasks(task_arn)
            .send()
            .await
            .map_err(classify)?;
        let raw = out
            .tasks()
            .first()
            .ok_or_else(|| CloudError::NotFound(task_arn.to_string()))?;
        let container = raw.containers().first();
        Ok(Task {
            arn: raw.task_arn().unwrap_or(task_arn).to_string(),
            last_status: raw.last_status().unwrap_or_default().to_string(),
            exit_code: container.and_then(|c| c.exit_code()),
            stopped_reason: raw.stopped_reason().map(str::to_string),
            endpoint: container
                .and_then(|c| c.network_interfaces().first())
                .and_then(|n| n.private_ipv4_address())
                .map(str::to_string),
        })
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> CloudResult<()> {
        self.ecs
            .stop_task()
            .cluster(cluster)
            .task(task_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn task_logs(&self, log_group: &str, log_stream: &str) -> CloudResult<Vec<String>> {
        let mut lines = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .logs
                .get_log_events()
                .log_group_name(log_group)
                .log_stream_name(log_stream)
                .start_from_head(true)
                .set_next_token(token.clone())
                .send()
                .await
                .map_err(classify)?;
            lines.extend(
                out.events()
                    .iter()
                    .filter_map(|e| e.message())
                    .map(str::to_string),
            );
            let next = out.next_forward_token().map(str::to_string);
            // The forward token repeats once the end of the stream is reached.
            if next.is_none() || next == token {
                return Ok(lines);
            }
            token = next;
        }
    }

    async fn list_tagged(&self, tag_key: &str) -> CloudResult<Vec<TaggedResource>> {
        let mut found = Vec::new();

        let instances = self
            .describe_instances(vec![
                filter("tag-key", tag_key),
                ec2::Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .values("stopped")
                    .build(),
            ])
            .await?;
        for instance in instances {
            found.push(TaggedResource {
                resource: Resource::Instance {
                    instance_id: instance.id,
                },
                tags: instance.tags,
            });
        }

        let pairs = self
            .ec2
            .describe_key_pairs()
            .filters(filter("tag-key", tag_key))
            .send()
            .await
            .map_err(classify)?;
        for pair in pairs.key_pairs() {
            if let Some(name) = pair.key_name() {
                found.push(TaggedResource {
                    resource: Resource::KeyPair {
                        name: name.to_string(),
                        key_file: None,
                    },
                    tags: from_ec2_tags(pair.tags()),
                });
            }
        }

        let groups = self
            .ec2
            .describe_security_groups()
            .filters(filter("tag-key", tag_key))
            .send()
            .await
            .map_err(classify)?;
        for group in groups.security_groups() {
            if let Some(id) = group.group_id() {
                found.push(TaggedResource {
                    resource: Resource::SecurityGroup {
                        group_id: id.to_string(),
                    },
                    tags: from_ec2_tags(group.tags()),
                });
            }
        }

        let addresses = self
            .ec2
            .describe_addresses()
            .filters(filter("tag-key", tag_key))
            .send()
            .await
            .map_err(classify)?;
        for address in addresses.addresses() {
            if let Some(id) = address.allocation_id() {
                found.push(TaggedResource {
                    resource: Resource::ElasticIp {
                        allocation_id: id.to_string(),
                    },
                    tags: from_ec2_tags(address.tags()),
                });
            }
        }

        Ok(found)
    }
}

/// Raw log uploads to one S3 bucket.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(config: &SdkConfig, bucket: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>) -> CloudResult<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("text/plain")
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}

/// CloudWatch `PutMetricData`, 20 datums per call.
pub struct CloudWatchMetrics {
    client: aws_sdk_cloudwatch::Client,
}

const METRICS_PER_CALL: usize = 20;

impl CloudWatchMetrics {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_cloudwatch::Client::new(config),
        }
    }
}

/// Maps the sink's unit strings onto CloudWatch units.
fn standard_unit(unit: &str) -> aws_sdk_cloudwatch::types::StandardUnit {
    use aws_sdk_cloudwatch::types::StandardUnit;
    match unit.to_ascii_lowercase().as_str() {
        "seconds" | "s" | "s/epoch" => StandardUnit::Seconds,
        "ms" | "milliseconds" => StandardUnit::Milliseconds,
        "count" => StandardUnit::Count,
        u if u.ends_with("/sec") || u.ends_with("/s") => StandardUnit::CountSecond,
        _ => StandardUnit::None,
    }
}

#[async_trait]
impl MetricsBackend for CloudWatchMetrics {
    async fn put_metrics(&self, namespace: &str, metrics: &[Metric]) -> CloudResult<()> {
        use aws_sdk_cloudwatch::primitives::DateTime;
        use aws_sdk_cloudwatch::types::{Dimension, MetricDatum};

        for chunk in metrics.chunks(METRICS_PER_CALL) {
            let data = chunk
                .iter()
                .map(|m| {
                    MetricDatum::builder()
                        .metric_name(&m.name)
                        .value(m.value)
                        .unit(standard_unit(&m.unit))
                        .timestamp(DateTime::from_secs(m.timestamp.timestamp()))
                        .set_dimensions(Some(
                            m.dimensions
                                .iter()
                                .map(|(k, v)| Dimension::builder().name(k).value(v).build())
                                .collect(),
                        ))
                        .build()
                })
                .collect();
            self.client
                .put_metric_data()
                .namespace(namespace)
                .set_metric_data(Some(data))
                .send()
                .await
                .map_err(classify)?;
        }
        Ok(())
    }
}
