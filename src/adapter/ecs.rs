//! Container-cluster (ECS) adapter.
//!
//! Inference entries run as a service: setup waits for it to reach RUNNING
//! and for its health path to answer, and each command is an HTTP probe
//! `METHOD PATH [BODY]` against the service endpoint. Training entries
//! run one task per command; the command's output is the task's log
//! stream and its exit code is the container's.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    AdapterContext, AdapterError, AdapterResult, AdapterState, Lifecycle, PlatformAdapter,
    ResourceSet, health_wait, parse_probe, recoverable,
};
use crate::cloud::{
    IngressRule, LaunchType, ServiceRequest, Tags, TaskDefinitionRequest, TaskNetwork,
    TaskRequest,
};
use crate::image::{ImageDescriptor, Processor};
use crate::plan::{Params, PlatformFamily, TestEntry, Workload};
use crate::provider::InstanceSpec;
use crate::remote::{Command, ExecResult};
use crate::waiter::{WaitError, Waiter};

const CONTAINER_NAME: &str = "main";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEALTH_PATH: &str = "/ping";

/// What a setup left running.
enum Mode {
    Service { endpoint: String },
    Tasks,
}

pub struct EcsAdapter {
    ctx: AdapterContext,
    entry: TestEntry,
    image: ImageDescriptor,
    life: Lifecycle,
    params: Params,
    cluster: String,
    launch_type: LaunchType,
    task_definition: Option<String>,
    network: Option<TaskNetwork>,
    mode: Option<Mode>,
}

fn launch_type(params: &Params) -> AdapterResult<LaunchType> {
    match params.str("launch_type") {
        None => Ok(LaunchType::Ec2),
        Some(raw) if raw.eq_ignore_ascii_case("EC2") => Ok(LaunchType::Ec2),
        Some(raw) if raw.eq_ignore_ascii_case("FARGATE") => Ok(LaunchType::Fargate),
        Some(other) => Err(AdapterError::invalid_param(
            "launch_type",
            format!("'{}' is neither EC2 nor FARGATE", other),
        )),
    }
}

/// A served model is healthy when it answers 2xx with JSON (or nothing),
/// containing `expect` when given.
fn healthy(status_ok: bool, body: &str, expect: Option<&str>) -> bool {
    let body = body.trim();
    let shaped = body.is_empty() || serde_json::from_str::<serde_json::Value>(body).is_ok();
    status_ok && shaped && expect.is_none_or(|needle| body.contains(needle))
}

impl EcsAdapter {
    pub fn new(ctx: AdapterContext, entry: TestEntry, image: ImageDescriptor) -> Self {
        Self {
            ctx,
            entry,
            image,
            life: Lifecycle::new(),
            params: Params::new(),
            cluster: String::new(),
            launch_type: LaunchType::Ec2,
            task_definition: None,
            network: None,
            mode: None,
        }
    }

    fn owner(&self) -> &str {
        &self.entry.id
    }

    fn port(&self) -> AdapterResult<u16> {
        match self.params.u64("port") {
            None => Ok(DEFAULT_PORT),
            Some(port) => u16::try_from(port)
                .map_err(|_| AdapterError::invalid_param("port", format!("{} is out of range", port))),
        }
    }

    fn log_group(&self) -> String {
        self.params
            .str("log_group")
            .map(str::to_string)
            .unwrap_or_else(|| format!("/ecs/{}", self.ctx.provider.ledger().tag_prefix()))
    }

    fn serves(&self) -> bool {
        self.entry.workload(&self.image) == Workload::Inference
    }

    /// Launches ECS-optimised instances that join the cluster.
    async fn launch_container_instances(&self, group_id: &str) -> AdapterResult<Vec<String>> {
        let provider = &self.ctx.provider;
        let owner = self.owner();
        let count = self.params.u64("node_count").unwrap_or(1).max(1);
        let ami = self
            .params
            .str("ami_id")
            .map(str::to_string)
            .or_else(|| provider.config().amis.ecs.clone())
            .ok_or_else(|| {
                AdapterError::invalid_param("ami_id", "not set and no ECS AMI configured")
            })?;
        let instance_type = self
            .params
            .str("instance_type")
            .ok_or_else(|| AdapterError::invalid_param("instance_type", "required for EC2"))?;
        let key = provider.acquire_keypair(owner).await?;

        let spec = InstanceSpec {
            ami_id: ami,
            instance_type: instance_type.to_string(),
            key_name: key.name,
            count: count as u32,
            role: "ecs".to_string(),
            zones: self.params.string_list("zones"),
            security_group_ids: vec![group_id.to_string()],
            block_device: Some(provider.block_device(false)),
            user_data: Some(format!(
                "#!/bin/bash\necho ECS_CLUSTER={} >> /etc/ecs/ecs.config\n",
                self.cluster
            )),
            iam_profile: Some(provider.config().ecs_instance_profile.clone()),
        };
        let instances = provider.acquire_instances(owner, &spec).await?;
        provider
            .wait_container_instances(&self.cluster, instances.len())
            .await?;
        Ok(instances
            .into_iter()
            .filter_map(|i| i.public_ip.or(i.private_ip))
            .collect())
    }

    fn task_definition_request(&self) -> AdapterResult<TaskDefinitionRequest> {
        let gpu_count = self.params.u64("gpu_count").map(|n| n as u32).unwrap_or(
            if self.image.processor() == Processor::Gpu {
                1
            } else {
                0
            },
        );
        let fargate_default = |value: &str| {
            (self.launch_type == LaunchType::Fargate).then(|| value.to_string())
        };
        Ok(TaskDefinitionRequest {
            family: self.ctx.provider.resource_name(self.owner(), "task"),
            container_name: CONTAINER_NAME.to_string(),
            image: self.image.uri.clone(),
            command: self.params.string_list("command"),
            environment: self.ctx.command_env(&self.params).into_iter().collect(),
            port_mappings: if self.serves() { vec![self.port()?] } else { Vec::new() },
            gpu_count,
            cpu: self
                .params
                .render("cpu")
                .or_else(|| fargate_default("2048")),
            memory: self
                .params
                .render("memory")
                .or_else(|| fargate_default("8192")),
            launch_type: self.launch_type,
            execution_role_arn: self.params.str("execution_role_arn").map(str::to_string),
            log_group: Some(self.log_group()),
            log_stream_prefix: self.ctx.provider.ledger().tag_prefix().to_string(),
            region: self.ctx.provider.region().to_string(),
            tags: Tags::new(),
        })
    }

    async fn wait_healthy(&self, endpoint: &str) -> AdapterResult<()> {
        let serving = &self.ctx.config.serving;
        let path = self.params.str("health_path").unwrap_or(DEFAULT_HEALTH_PATH);
        let expect = self.params.str("health_expect");
        let url = format!("{}{}", endpoint, path);
        let timeout = Duration::from_secs(serving.request_timeout_secs);

        Waiter::new(
            Duration::from_secs(serving.poll_interval_secs),
            Duration::from_secs(serving.ready_timeout_secs),
        )
        .with_cancel(self.ctx.provider.cancel_token().clone())
        .until(&format!("{} to become healthy", url), || async {
            match self.ctx.http.request("GET", &url, None, timeout).await {
                Ok(reply) if healthy(reply.is_success(), &reply.body, expect) => Ok(Some(())),
                Ok(reply) => {
                    debug!(url = %url, status = reply.status, "Service not healthy yet");
                    Ok(None)
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Service not reachable yet");
                    Ok(None)
                }
            }
        })
        .await
        .map_err(health_wait::<AdapterError>)
    }

    async fn start_service(&self, task_definition: &str, hosts: &[String]) -> AdapterResult<String> {
        let provider = &self.ctx.provider;
        let owner = self.owner();
        let request = ServiceRequest {
            cluster: self.cluster.clone(),
            name: provider.resource_name(owner, "svc"),
            task_definition: task_definition.to_string(),
            desired_count: 1,
            launch_type: self.launch_type,
            network: self.network.clone(),
            tags: Tags::new(),
        };
        provider.acquire_service(owner, &request).await?;

        let tasks = provider.service_tasks(&self.cluster, &request.name).await?;
        let mut address = None;
        for arn in &tasks {
            let task = provider.describe_task(&self.cluster, arn).await?;
            if task.is_running() {
                address = task.endpoint;
                if address.is_some() {
                    break;
                }
            }
        }
        let address = address
            .or_else(|| hosts.first().cloned())
            .ok_or_else(|| {
                AdapterError::invalid_param(
                    "launch_type",
                    format!("service {} has no reachable task", request.name),
                )
            })?;
        let endpoint = format!("http://{}:{}", address, self.port()?);
        self.wait_healthy(&endpoint).await?;
        info!(entry = %owner, endpoint = %endpoint, "Service healthy");
        Ok(endpoint)
    }

    async fn provision(&mut self, params: &Params) -> AdapterResult<ResourceSet> {
        let provider = self.ctx.provider.clone();
        let owner = self.owner().to_string();
        self.params = params.clone();
        self.launch_type = launch_type(params)?;
        self.cluster = params
            .str("cluster")
            .map(str::to_string)
            .unwrap_or_else(|| provider.resource_name(&owner, "ecs"));
        info!(entry = %owner, cluster = %self.cluster, launch_type = ?self.launch_type, "Setting up ECS entry");

        provider.acquire_ecs_cluster(&owner, &self.cluster).await?;

        let vpc = provider.default_vpc().await?;
        let group = provider
            .acquire_security_group(&owner, &vpc, &format!("DLC ECS test {}", owner))
            .await?;
        if self.serves() {
            provider
                .authorize_ingress(
                    &owner,
                    &group.id,
                    &IngressRule::tcp_cidr(i32::from(self.port()?), "0.0.0.0/0"),
                )
                .await?;
        }

        let hosts = match self.launch_type {
            LaunchType::Ec2 => self.launch_container_instances(&group.id).await?,
            LaunchType::Fargate => {
                let subnets = provider.subnets(&vpc).await?;
                self.network = Some(TaskNetwork {
                    subnet_ids: subnets.into_iter().map(|s| s.id).collect(),
                    security_group_ids: vec![group.id.clone()],
                    assign_public_ip: true,
                });
                Vec::new()
            }
        };

        let request = self.task_definition_request()?;
        let task_definition = provider.register_task_definition(&owner, &request).await?;
        self.task_definition = Some(task_definition.clone());

        let endpoint = if self.serves() {
            let endpoint = self.start_service(&task_definition, &hosts).await?;
            self.mode = Some(Mode::Service {
                endpoint: endpoint.clone(),
            });
            Some(endpoint)
        } else {
            self.mode = Some(Mode::Tasks);
            None
        };

        Ok(ResourceSet {
            resources: provider.ledger().owned_by(&owner),
            hosts,
            endpoint,
        })
    }

    async fn probe(&self, endpoint: &str, command: &str) -> AdapterResult<ExecResult> {
        let start = Instant::now();
        let Some((method, path, body)) = parse_probe(command) else {
            // Anything else runs on the orchestrator host against the endpoint.
            let cmd = Command::script(command)
                .envs(self.ctx.command_env(&self.params))
                .env("SERVICE_ENDPOINT", endpoint)
                .working_dir(self.ctx.repo_root.to_string_lossy())
                .timeout(self.ctx.command_timeout(&self.params));
            return Ok(self.ctx.local.run(&cmd).await?);
        };

        let url = format!("{}{}", endpoint, path);
        let timeout = Duration::from_secs(self.ctx.config.serving.request_timeout_secs);
        let (exit_code, stdout, stderr) = match self
            .ctx
            .http
            .request(&method, &url, body.as_deref(), timeout)
            .await
        {
            Ok(reply) if reply.is_success() => (0, reply.body, String::new()),
            Ok(reply) => (1, reply.body, format!("HTTP {} from {} {}", reply.status, method, url)),
            Err(e) => (1, String::new(), format!("{} {} failed: {}", method, url, e)),
        };
        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn run_task(&self, command: &str) -> AdapterResult<ExecResult> {
        let provider = &self.ctx.provider;
        let start = Instant::now();
        let task_definition = self.task_definition.clone().ok_or(AdapterError::InvalidParam {
            name: "launch_type".to_string(),
            reason: "no task definition registered".to_string(),
        })?;
        let request = TaskRequest {
            cluster: self.cluster.clone(),
            task_definition,
            launch_type: self.launch_type,
            container_name: CONTAINER_NAME.to_string(),
            command: vec!["bash".to_string(), "-c".to_string(), command.to_string()],
            network: self.network.clone(),
            tags: Tags::new(),
        };
        let arn = provider.run_task(self.owner(), &request).await?;
        debug!(entry = %self.entry.id, task = %arn, "Started task");

        let cluster = self.cluster.clone();
        let secs = self.ctx.command_timeout(&self.params);
        let task = Waiter::new(
            Duration::from_secs(provider.config().poll_interval_secs),
            Duration::from_secs(secs),
        )
        .until(&format!("task {} to stop", arn), || async {
            let task = provider.describe_task(&cluster, &arn).await?;
            Ok::<_, AdapterError>(task.is_stopped().then_some(task))
        })
        .await
        .map_err(|e| match e {
            WaitError::Timeout { .. } => AdapterError::Remote(crate::remote::RemoteError::Timeout {
                command: command.to_string(),
                secs,
            }),
            WaitError::Cancelled { what } => AdapterError::Cancelled(what),
            WaitError::Failed(e) => e,
        })?;

        let logs = match task.log_stream(provider.ledger().tag_prefix(), CONTAINER_NAME) {
            Some(stream) => provider.task_logs(&self.log_group(), &stream).await?,
            None => Vec::new(),
        };
        let mut stdout = logs.join("\n");
        if !stdout.is_empty() {
            stdout.push('\n');
        }
        Ok(ExecResult {
            exit_code: task.exit_code.unwrap_or(-1),
            stdout,
            stderr: task.stopped_reason.unwrap_or_default(),
            duration: start.elapsed(),
        })
    }
}

#[async_trait]
impl PlatformAdapter for EcsAdapter {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::ContainerCluster
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
        let result = match &self.mode {
            Some(Mode::Service { endpoint }) => self.probe(endpoint, command).await,
            Some(Mode::Tasks) => self.run_task(command).await,
            None => Err(AdapterError::InvalidParam {
                name: "launch_type".to_string(),
                reason: "setup did not complete".to_string(),
            }),
        };
        self.life.finish_execute(recoverable(&result));
        result
    }

    async fn teardown(&mut self) -> AdapterResult<()> {
        // Services, tasks and instances belong to the ledger.
        self.life.tear_down();
        self.mode = None;
        Ok(())
    }
}
