//! VM adapter: bare instances reached over SSH, tests run in docker.
//!
//! Setup acquires, in dependency order, a key pair, a security group and
//! its ingress rules, the master instance, any worker instances (in the
//! master's zone), one elastic IP per host when `efa` is set, and a Lustre
//! filesystem when `shared_fs` is set. It then opens one channel per host,
//! wires passwordless SSH from the master to the workers, mounts the
//! filesystem, logs in to the registry and pulls the image.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    AdapterContext, AdapterError, AdapterResult, AdapterState, Lifecycle, PlatformAdapter,
    ResourceSet, recoverable,
};
use crate::cloud::{Filesystem, Instance, IngressRule};
use crate::image::{Arch, ImageDescriptor, Processor};
use crate::plan::{Params, PlatformFamily, TestEntry};
use crate::provider::{FilesystemSpec, InstanceSpec, KeyPairInfo};
use crate::remote::{Command, ExecResult, HostTarget, RemoteChannel, RemoteError};

const FSX_MOUNT_POINT: &str = "/fsx";
const PULL_TIMEOUT_SECS: u64 = 60 * 60;
const PREPARE_TIMEOUT_SECS: u64 = 10 * 60;

/// One prepared host.
struct VmHost {
    instance_id: String,
    address: String,
    private_ip: Option<String>,
    channel: Arc<dyn RemoteChannel>,
}

pub struct VmAdapter {
    ctx: AdapterContext,
    entry: TestEntry,
    image: ImageDescriptor,
    life: Lifecycle,
    params: Params,
    hosts: Vec<VmHost>,
    filesystem: Option<Filesystem>,
    /// Name of the long-running container, with `container: persistent`.
    container: Option<String>,
}

impl VmAdapter {
    pub fn new(ctx: AdapterContext, entry: TestEntry, image: ImageDescriptor) -> Self {
        Self {
            ctx,
            entry,
            image,
            life: Lifecycle::new(),
            params: Params::new(),
            hosts: Vec::new(),
            filesystem: None,
            container: None,
        }
    }

    fn owner(&self) -> &str {
        &self.entry.id
    }

    fn ami(&self, params: &Params) -> AdapterResult<String> {
        if let Some(ami) = params.str("ami_id") {
            return Ok(ami.to_string());
        }
        let amis = &self.ctx.provider.config().amis;
        let configured = match self.image.arch {
            Arch::X86 => amis.x86.clone(),
            Arch::Arm64 => amis.arm64.clone(),
            Arch::Graviton => amis.graviton.clone().or_else(|| amis.arm64.clone()),
        };
        configured.ok_or_else(|| {
            AdapterError::invalid_param(
                "ami_id",
                format!("not set and no {} AMI configured", self.image.arch),
            )
        })
    }

    fn node_count(params: &Params) -> u32 {
        params
            .u64("node_count")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1)
            .max(1)
    }

    /// Device passthrough inferred from the image's processor.
    fn device_flags(&self) -> Vec<String> {
        match self.image.processor() {
            Processor::Gpu => vec!["--gpus".to_string(), "all".to_string()],
            Processor::Neuron => {
                let devices = self.params.u64("neuron_devices").unwrap_or(1);
                (0..devices)
                    .map(|i| format!("--device=/dev/neuron{}", i))
                    .collect()
            }
            Processor::Cpu | Processor::Eia => Vec::new(),
        }
    }

    fn docker_flags(&self) -> Vec<String> {
        let mut flags = vec!["--network".to_string(), "host".to_string()];
        flags.extend(self.device_flags());
        if self.filesystem.is_some() {
            flags.push("-v".to_string());
            flags.push(format!("{0}:{0}", FSX_MOUNT_POINT));
        }
        if let Some(shm) = self.params.str("shm_size") {
            flags.push(format!("--shm-size={}", shm));
        }
        flags
    }

    fn master(&self) -> AdapterResult<&VmHost> {
        self.hosts.first().ok_or(AdapterError::InvalidParam {
            name: "node_count".to_string(),
            reason: "no hosts were prepared".to_string(),
        })
    }

    async fn launch(
        &self,
        params: &Params,
        key: &KeyPairInfo,
        group_id: &str,
    ) -> AdapterResult<Vec<Instance>> {
        let provider = &self.ctx.provider;
        let nodes = Self::node_count(params);
        let ubuntu = params.str("ami_os").is_none_or(|os| os == "ubuntu");
        let mut spec = InstanceSpec {
            ami_id: self.ami(params)?,
            instance_type: params
                .str("instance_type")
                .ok_or_else(|| AdapterError::invalid_param("instance_type", "required"))?
                .to_string(),
            key_name: key.name.clone(),
            count: 1,
            role: "master".to_string(),
            zones: params.string_list("zones"),
            security_group_ids: vec![group_id.to_string()],
            block_device: Some(provider.block_device(ubuntu)),
            user_data: None,
            iam_profile: params.str("iam_profile").map(str::to_string),
        };

        let mut instances = provider.acquire_instances(self.owner(), &spec).await?;
        if nodes > 1 {
            spec.count = nodes - 1;
            spec.role = "worker".to_string();
            spec.zones = instances
                .iter()
                .filter_map(|i| i.availability_zone.clone())
                .collect();
            instances.extend(provider.acquire_instances(self.owner(), &spec).await?);
        }
        Ok(instances)
    }

    async fn connect(&self, instance: &Instance, address: String, key: &KeyPairInfo) -> AdapterResult<VmHost> {
        let target = HostTarget {
            host: address.clone(),
            user: self.ctx.provider.config().ssh_user.clone(),
            key_file: key.key_file.clone(),
        };
        let channel = self.ctx.connector.connect(&target).await?;
        Ok(VmHost {
            instance_id: instance.id.clone(),
            address,
            private_ip: instance.private_ip.clone(),
            channel,
        })
    }

    /// Runs a preparation step and fails setup on a non-zero exit.
    async fn prepare(host: &VmHost, cmd: Command) -> AdapterResult<ExecResult> {
        let cmd = if cmd.timeout_secs.is_some() {
            cmd
        } else {
            cmd.timeout(PREPARE_TIMEOUT_SECS)
        };
        debug!(host = %host.address, command = %cmd.to_shell_string(), "Preparing host");
        Ok(host.channel.run(&cmd).await?.check(&cmd)?)
    }

    /// Master generates a key; every worker trusts it. The master also gets
    /// a hostfile listing every node's private address.
    async fn link_nodes(&self) -> AdapterResult<()> {
        let master = self.master()?;
        let keygen = Command::script(
            "test -f ~/.ssh/id_rsa || ssh-keygen -t rsa -N '' -q -f ~/.ssh/id_rsa; cat ~/.ssh/id_rsa.pub",
        );
        let public_key = Self::prepare(master, keygen).await?.stdout.trim().to_string();

        for worker in &self.hosts[1..] {
            let trust = Command::script(format!(
                "mkdir -p ~/.ssh && echo {} >> ~/.ssh/authorized_keys",
                crate::remote::shell_escape(&public_key)
            ));
            Self::prepare(worker, trust).await?;
        }

        let addresses: Vec<&str> = self
            .hosts
            .iter()
            .map(|h| h.private_ip.as_deref().unwrap_or(&h.address))
            .collect();
        let hostfile = Command::script(format!(
            "printf '%s\\n' {} > ~/hosts && echo 'StrictHostKeyChecking no' >> ~/.ssh/config",
            addresses.join(" ")
        ));
        Self::prepare(master, hostfile).await?;
        Ok(())
    }

    async fn mount(&self, filesystem: &Filesystem) -> AdapterResult<()> {
        let (Some(dns), Some(mount_name)) = (&filesystem.dns_name, &filesystem.mount_name) else {
            return Err(AdapterError::invalid_param(
                "shared_fs",
                format!("filesystem {} has no mount target", filesystem.id),
            ));
        };
        let mount = format!(
            "sudo mkdir -p {0} && sudo mount -t lustre -o relatime,flock {1}@tcp:/{2} {0}",
            FSX_MOUNT_POINT, dns, mount_name
        );
        for host in &self.hosts {
            Self::prepare(host, Command::script(mount.clone())).await?;
        }
        Ok(())
    }

    async fn pull(&self, host: &VmHost) -> AdapterResult<()> {
        if let Some(registry) = &self.image.registry {
            if self.image.registry_account().is_some() {
                let login = Command::script(format!(
                    "aws ecr get-login-password --region {} | docker login --username AWS --password-stdin {}",
                    self.ctx.provider.region(),
                    registry
                ));
                Self::prepare(host, login).await?;
            }
        }
        let pull = Command::new("docker")
            .args(["pull", &self.image.uri])
            .timeout(PULL_TIMEOUT_SECS);
        Self::prepare(host, pull).await?;
        Ok(())
    }

    /// Starts the long-running container used with `container: persistent`.
    async fn start_container(&self, host: &VmHost, name: &str) -> AdapterResult<()> {
        let mut run = Command::new("docker")
            .args(["run", "-d", "--name", name])
            .args(self.docker_flags());
        for (key, value) in self.ctx.command_env(&self.params) {
            run = run.arg("-e").arg(format!("{}={}", key, value));
        }
        let run = run.arg(&self.image.uri).args(["tail", "-f", "/dev/null"]);
        Self::prepare(host, run).await?;
        Ok(())
    }

    async fn provision(&mut self, params: &Params) -> AdapterResult<ResourceSet> {
        let provider = self.ctx.provider.clone();
        let owner = self.owner().to_string();
        let nodes = Self::node_count(params);
        let shared_fs = params.flag("shared_fs");
        info!(entry = %owner, nodes, shared_fs, "Setting up VM entry");

        let key = provider.acquire_keypair(&owner).await?;
        let vpc = provider.default_vpc().await?;
        let group = provider
            .acquire_security_group(&owner, &vpc, &format!("DLC test {}", owner))
            .await?;
        provider
            .authorize_ingress(&owner, &group.id, &IngressRule::tcp_cidr(22, "0.0.0.0/0"))
            .await?;
        if nodes > 1 || shared_fs {
            provider
                .authorize_ingress(&owner, &group.id, &IngressRule::all_from_group(&group.id))
                .await?;
        }

        let instances = self.launch(params, &key, &group.id).await?;

        let mut addresses = Vec::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            let address = if params.flag("efa") {
                let eni = instance.network_interface_id.as_deref().ok_or_else(|| {
                    AdapterError::invalid_param(
                        "efa",
                        format!("instance {} has no network interface", instance.id),
                    )
                })?;
                let eip = provider.acquire_elastic_ip(&owner, index).await?;
                provider.attach_elastic_ip(&owner, &eip, eni).await?;
                eip.public_ip.clone()
            } else {
                None
            };
            let address = address
                .or_else(|| instance.public_ip.clone())
                .or_else(|| instance.private_ip.clone())
                .ok_or_else(|| {
                    AdapterError::invalid_param(
                        "instance_type",
                        format!("instance {} has no reachable address", instance.id),
                    )
                })?;
            addresses.push(address);
        }

        if shared_fs {
            let subnet = instances
                .first()
                .and_then(|i| i.subnet_id.clone())
                .ok_or_else(|| AdapterError::invalid_param("shared_fs", "master has no subnet"))?;
            let filesystem = provider
                .acquire_filesystem(&owner, &FilesystemSpec::scratch(subnet, vec![group.id.clone()]))
                .await?;
            self.filesystem = Some(filesystem);
        }

        for (instance, address) in instances.iter().zip(addresses) {
            let host = self.connect(instance, address, &key).await?;
            self.hosts.push(host);
        }

        if self.hosts.len() > 1 {
            self.link_nodes().await?;
        }
        if let Some(filesystem) = &self.filesystem {
            self.mount(filesystem).await?;
        }
        for host in &self.hosts {
            self.pull(host).await?;
        }

        if params.str("container") == Some("persistent") {
            let name = provider.resource_name(&owner, "ctr");
            for host in &self.hosts {
                self.start_container(host, &name).await?;
            }
            self.container = Some(name);
        }

        Ok(ResourceSet {
            resources: provider.ledger().owned_by(&owner),
            hosts: self.hosts.iter().map(|h| h.address.clone()).collect(),
            endpoint: None,
        })
    }

    fn entry_command(&self, command: &str) -> AdapterResult<Command> {
        let env = self.ctx.command_env(&self.params);
        let timeout = self.ctx.command_timeout(&self.params);

        let cmd = match (&self.container, self.params.str("exec")) {
            (_, Some("host")) => Command::script(command).envs(env),
            (Some(container), _) => {
                crate::remote::docker_exec(container, &Command::script(command).envs(env))
            }
            (None, _) => {
                let mut run = Command::new("docker")
                    .args(["run", "--rm"])
                    .args(self.docker_flags());
                for (key, value) in env {
                    run = run.arg("-e").arg(format!("{}={}", key, value));
                }
                run.arg(&self.image.uri).args(["bash", "-c", command])
            }
        };
        Ok(cmd.timeout(timeout))
    }
}

#[async_trait]
impl PlatformAdapter for VmAdapter {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Vm
    }

    fn state(&self) -> AdapterState {
        self.life.state()
    }

    async fn setup(&mut self, params: &Params) -> AdapterResult<ResourceSet> {
        self.life.begin_setup()?;
        self.params = params.clone();
        let result = self.provision(params).await;
        self.life.finish_setup(result.is_ok());
        result
    }

    async fn execute_command(&mut self, command: &str) -> AdapterResult<ExecResult> {
        self.life.begin_execute()?;
        let result = match self.entry_command(command) {
            Ok(cmd) => match self.master() {
                Ok(master) => {
                    info!(entry = %self.entry.id, host = %master.address, command = %command, "Running");
                    master.channel.run(&cmd).await.map_err(AdapterError::from)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.life.finish_execute(recoverable(&result));
        result
    }

    async fn teardown(&mut self) -> AdapterResult<()> {
        if !self.life.tear_down() {
            return Ok(());
        }
        if let Some(container) = self.container.take() {
            // Channels refuse commands once the run is cancelled.
            if self.ctx.provider.cancel_token().is_cancelled() {
                warn!(
                    container = %container,
                    hosts = self.hosts.len(),
                    "Run cancelled, skipping container removal; instance termination removes it"
                );
            } else {
                for host in &self.hosts {
                    let rm = Command::new("docker").args(["rm", "-f", &container]).timeout(120);
                    match host.channel.run(&rm).await {
                        Ok(_) => {}
                        Err(RemoteError::Cancelled(_)) => {
                            warn!(host = %host.address, container = %container, "Run cancelled, container removal skipped");
                        }
                        Err(e) => {
                            warn!(host = %host.address, error = %e, "Failed to remove container");
                        }
                    }
                }
            }
        }
        for host in self.hosts.drain(..) {
            if let Err(e) = host.channel.close().await {
                warn!(host = %host.address, instance = %host.instance_id, error = %e, "Failed to close channel");
            }
        }
        Ok(())
    }
}
