//! Turning a matched (offer, request) pair into a launched task.

use fleet_id::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::driver::ClusterDriver;
use crate::error::SchedulerError;
use crate::matcher::{find_role_for_ports, required_memory, Allocation};
use crate::offer::{names, Range, Resource, ResourceOffer, ResourceValue, DEFAULT_ROLE};
use crate::request::{Notification, NotificationKind, WorkerInfo, WorkerRequest};
use crate::spec::{CommandStyle, ContainerSpec, FetchUri, NetworkMode, VolumeMount, WorkerSpec};
use crate::tracker::{LaunchedTask, StatusTracker};

/// Path of the agent jar below the controller URL.
pub const AGENT_JAR_PATH: &str = "jnlpJars/agent.jar";

/// The command a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    /// When false, `value` is executed directly with `arguments`.
    pub shell: bool,
    pub arguments: Vec<String>,
    pub uris: Vec<FetchUri>,
}

/// A container port bound to a concrete host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPortMapping {
    pub container_port: u32,
    pub host_port: u64,
    pub protocol: String,
}

/// Docker container settings of a launched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image: String,
    pub network: NetworkMode,
    pub privileged: bool,
    pub force_pull_image: bool,
    pub parameters: Vec<(String, String)>,
    pub port_mappings: Vec<HostPortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub networks: Vec<String>,
    pub hostname: Option<String>,
}

/// The launch directive submitted to the cluster for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
    pub command: CommandInfo,
    pub container: Option<ContainerInfo>,
}

impl TaskSpec {
    /// Sum of the scalar resource `name`.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| match r.value {
                ResourceValue::Scalar(v) => Some(v),
                _ => None,
            })
            .sum()
    }
}

/// Joins two URL segments with exactly one `/` between them.
pub fn join_paths(prefix: &str, suffix: &str) -> String {
    format!(
        "{}/{}",
        prefix.strip_suffix('/').unwrap_or(prefix),
        suffix.strip_prefix('/').unwrap_or(suffix)
    )
}

/// Builds launch directives and submits them.
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    controller_url: String,
    role: String,
}

impl TaskLauncher {
    pub fn new(controller_url: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            controller_url: controller_url.into(),
            role: role.into(),
        }
    }

    /// `{controller}/computer/{name}/slave-agent.jnlp`
    pub fn jnlp_url(&self, name: &TaskId) -> String {
        join_paths(
            &join_paths(&join_paths(&self.controller_url, "computer"), name.as_str()),
            "slave-agent.jnlp",
        )
    }

    pub fn agent_jar_uri(&self) -> String {
        join_paths(&self.controller_url, AGENT_JAR_PATH)
    }

    /// The agent command line for `spec`.
    pub fn agent_command(&self, spec: &WorkerSpec) -> String {
        let secret = spec
            .secret
            .as_deref()
            .map(|s| format!("-secret {s}"))
            .unwrap_or_default();
        let url = self.jnlp_url(&spec.name);

        match spec.command_style {
            CommandStyle::Linux => format!(
                "java -DHUDSON_HOME=jenkins -server -Xmx{}m {} -jar ${{MESOS_SANDBOX-.}}/agent.jar {} {} -jnlpUrl {}",
                spec.memory_mb, spec.jvm_args, spec.jnlp_args, secret, url
            ),
            CommandStyle::Windows => format!(
                "java -DHUDSON_HOME=jenkins -server -Xmx{}m {} -jar %MESOS_SANDBOX%/agent.jar {} {} -jnlpUrl {}",
                spec.memory_mb, spec.jvm_args, spec.jnlp_args, secret, url
            ),
        }
    }

    /// The command info for `spec`: the agent command plus fetched URIs.
    ///
    /// Fails if the container asks for a blank custom shell.
    pub fn command_info(&self, spec: &WorkerSpec) -> Result<CommandInfo, SchedulerError> {
        let command = self.agent_command(spec);
        let custom_shell = spec.container.as_ref().and_then(|c| c.custom_shell.as_deref());

        let mut info = match custom_shell {
            Some(shell) if shell.trim().is_empty() => {
                return Err(SchedulerError::InvalidLaunchSpec {
                    task_id: spec.name.clone(),
                    reason: "custom shell is blank".to_string(),
                });
            }
            Some(shell) => {
                debug!(task_id = %spec.name, shell, "Using custom shell");
                CommandInfo {
                    value: shell.to_string(),
                    shell: false,
                    arguments: vec![command],
                    uris: Vec::new(),
                }
            }
            None => CommandInfo {
                value: command,
                shell: true,
                arguments: Vec::new(),
                uris: Vec::new(),
            },
        };

        info.uris.push(FetchUri::new(self.agent_jar_uri()));
        info.uris.extend(spec.additional_uris.iter().cloned());
        Ok(info)
    }

    /// Scalar resources claimed from the offer, each capped by what the
    /// offer has and tagged with the role it came from.
    fn scalar_resources(&self, offer: &ResourceOffer, spec: &WorkerSpec) -> Vec<Resource> {
        let mut cpus_needed = spec.cpus;
        let mut mem_needed = required_memory(spec.memory_mb);
        let mut disk_needed = spec.disk_mb;
        let mut claimed = Vec::new();

        for resource in &offer.resources {
            if resource.role != self.role && resource.role != DEFAULT_ROLE {
                continue;
            }
            let ResourceValue::Scalar(available) = resource.value else {
                continue;
            };
            let needed = match resource.name.as_str() {
                names::CPUS => &mut cpus_needed,
                names::MEM => &mut mem_needed,
                names::DISK => &mut disk_needed,
                _ => continue,
            };
            if *needed <= 0.0 {
                continue;
            }
            let take = available.min(*needed);
            *needed -= take;
            claimed.push(Resource::scalar(resource.name.clone(), take).with_role(resource.role.clone()));
        }
        claimed
    }

    fn container_info(
        offer: &ResourceOffer,
        spec: &WorkerSpec,
        container: &ContainerSpec,
        allocation: &Allocation,
        resources: &mut Vec<Resource>,
    ) -> ContainerInfo {
        let mut allocated = allocation.ports.iter().copied();
        let mut port_mappings = Vec::with_capacity(container.port_mappings.len());
        let mut ranges = Vec::new();

        for mapping in &container.port_mappings {
            let host_port = match mapping.host_port {
                Some(port) => Some(u64::from(port)),
                None => allocated.next(),
            };
            let Some(host_port) = host_port else {
                continue;
            };
            ranges.push(Range::single(host_port));
            port_mappings.push(HostPortMapping {
                container_port: mapping.container_port,
                host_port,
                protocol: mapping.protocol.clone(),
            });
        }

        if !ranges.is_empty() {
            resources.push(
                Resource::ranges(names::PORTS, ranges).with_role(find_role_for_ports(offer)),
            );
        }

        ContainerInfo {
            image: container.image.clone(),
            network: container.network,
            privileged: container.privileged,
            force_pull_image: container.force_pull_image,
            parameters: container.parameters.clone(),
            port_mappings,
            volumes: container.volumes.clone(),
            networks: container
                .networks
                .iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
            hostname: (container.network != NetworkMode::Host).then(|| spec.name.to_string()),
        }
    }

    /// Build the launch directive for `spec` on `offer`.
    pub fn build(
        &self,
        offer: &ResourceOffer,
        spec: &WorkerSpec,
        allocation: &Allocation,
    ) -> Result<TaskSpec, SchedulerError> {
        let command = self.command_info(spec)?;
        let mut resources = self.scalar_resources(offer, spec);
        let container = spec
            .container
            .as_ref()
            .map(|c| Self::container_info(offer, spec, c, allocation, &mut resources));

        Ok(TaskSpec {
            task_id: spec.name.clone(),
            name: format!("task {}", spec.name),
            agent_id: offer.agent_id.clone(),
            resources,
            command,
            container,
        })
    }

    /// Submit exactly one task for `request` on `offer` and start tracking it.
    ///
    /// The request must already be out of the request queue. On failure the
    /// request's `failed` callback is queued and nothing is tracked; the
    /// caller decides whether the offer is declined.
    pub fn launch(
        &self,
        driver: &dyn ClusterDriver,
        offer: &ResourceOffer,
        request: WorkerRequest,
        allocation: &Allocation,
        tracker: &mut StatusTracker,
        notifications: &mut Vec<Notification>,
    ) -> Result<TaskId, SchedulerError> {
        let failed = |request: &WorkerRequest| {
            Notification::new(
                NotificationKind::Failed,
                WorkerInfo {
                    name: request.name().clone(),
                    agent_id: None,
                },
                request.callback.clone(),
            )
        };

        let task = match self.build(offer, &request.spec, allocation) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %request.name(), error = %e, "Failed to build launch directive");
                notifications.push(failed(&request));
                return Err(e);
            }
        };

        info!(
            task_id = %task.task_id,
            offer_id = %offer.id,
            agent_id = %offer.agent_id,
            cpus = task.scalar(names::CPUS),
            mem = task.scalar(names::MEM),
            "Launching task"
        );

        if let Err(e) = driver.launch_task(&offer.id, &task) {
            error!(task_id = %task.task_id, error = %e, "Failed to submit task");
            notifications.push(failed(&request));
            return Err(e.into());
        }

        tracker.insert(LaunchedTask::new(
            offer.id.clone(),
            offer.agent_id.clone(),
            request,
        ));
        Ok(task.task_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use fleet_id::OfferId;

    use super::*;
    use crate::driver::{DriverCall, MockDriver};
    use crate::request::WorkerCallback;
    use crate::spec::PortMapping;

    #[derive(Default)]
    struct Failures(AtomicUsize);

    impl WorkerCallback for Failures {
        fn running(&self, _: &WorkerInfo) {}
        fn finished(&self, _: &WorkerInfo) {}
        fn failed(&self, _: &WorkerInfo) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn launcher() -> TaskLauncher {
        TaskLauncher::new("http://controller:8080/", "*")
    }

    fn spec() -> WorkerSpec {
        WorkerSpec::new(TaskId::parse("agent1").unwrap(), 1.0, 1000)
    }

    fn offer() -> ResourceOffer {
        ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-S1").unwrap(),
        )
        .with_scalar(names::CPUS, 4.0)
        .with_scalar(names::MEM, 8192.0)
        .with_scalar(names::DISK, 1000.0)
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("http://a/", "/b"), "http://a/b");
        assert_eq!(join_paths("http://a", "b"), "http://a/b");
    }

    #[test]
    fn test_jnlp_url() {
        assert_eq!(
            launcher().jnlp_url(&TaskId::parse("agent1").unwrap()),
            "http://controller:8080/computer/agent1/slave-agent.jnlp"
        );
    }

    #[test]
    fn test_linux_command() {
        let spec = spec().with_secret("s3cr3t");
        let command = launcher().agent_command(&spec);
        assert_eq!(
            command,
            "java -DHUDSON_HOME=jenkins -server -Xmx1000m  -jar ${MESOS_SANDBOX-.}/agent.jar  -secret s3cr3t -jnlpUrl http://controller:8080/computer/agent1/slave-agent.jnlp"
        );
    }

    #[test]
    fn test_windows_command() {
        let mut spec = spec();
        spec.command_style = CommandStyle::Windows;
        assert!(launcher()
            .agent_command(&spec)
            .contains("-jar %MESOS_SANDBOX%/agent.jar"));
    }

    #[test]
    fn test_command_fetches_agent_jar_and_extra_uris() {
        let mut spec = spec();
        spec.additional_uris.push(FetchUri::new("http://files/tools.tgz"));
        let info = launcher().command_info(&spec).unwrap();

        assert!(info.shell);
        let uris: Vec<_> = info.uris.iter().map(|u| u.value.as_str()).collect();
        assert_eq!(
            uris,
            vec!["http://controller:8080/jnlpJars/agent.jar", "http://files/tools.tgz"]
        );
    }

    #[test]
    fn test_custom_shell() {
        let mut container = ContainerSpec::docker("agent:latest");
        container.custom_shell = Some("/bin/bash".to_string());
        let info = launcher()
            .command_info(&spec().with_container(container))
            .unwrap();

        assert!(!info.shell);
        assert_eq!(info.value, "/bin/bash");
        assert_eq!(info.arguments.len(), 1);
        assert!(info.arguments[0].starts_with("java "));
    }

    #[test]
    fn test_blank_custom_shell_is_invalid() {
        let mut container = ContainerSpec::docker("agent:latest");
        container.custom_shell = Some("   ".to_string());
        let err = launcher()
            .command_info(&spec().with_container(container))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidLaunchSpec { .. }));
    }

    #[test]
    fn test_resources_capped_and_padded() {
        let mut spec = spec();
        spec.disk_mb = 5000.0;
        let task = launcher().build(&offer(), &spec, &Allocation::default()).unwrap();

        assert_eq!(task.name, "task agent1");
        assert_eq!(task.scalar(names::CPUS), 1.0);
        assert!((task.scalar(names::MEM) - 1100.0).abs() < 1e-9);
        assert_eq!(task.scalar(names::DISK), 1000.0);
        assert!(task.container.is_none());
    }

    #[test]
    fn test_resources_keep_offer_role() {
        let offer = ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-S1").unwrap(),
        )
        .with_resource(Resource::scalar(names::CPUS, 4.0).with_role("ci"))
        .with_scalar(names::MEM, 4096.0);

        let task = TaskLauncher::new("http://c/", "ci")
            .build(&offer, &spec(), &Allocation::default())
            .unwrap();
        assert_eq!(task.resources[0].role, "ci");
        assert_eq!(task.resources[1].role, DEFAULT_ROLE);
    }

    #[test]
    fn test_container_ports_and_hostname() {
        let mut container = ContainerSpec::docker("agent:latest");
        container.network = NetworkMode::Bridge;
        container.networks = vec!["  overlay ".to_string()];
        container.port_mappings = vec![
            PortMapping {
                container_port: 8080,
                host_port: None,
                protocol: "tcp".to_string(),
            },
            PortMapping {
                container_port: 9090,
                host_port: Some(31900),
                protocol: "udp".to_string(),
            },
        ];
        let offer = offer().with_resource(
            Resource::ranges(names::PORTS, vec![Range::new(31000, 31010)]).with_role("ci"),
        );
        let allocation = Allocation {
            ports: vec![31000],
        };

        let task = launcher()
            .build(&offer, &spec().with_container(container), &allocation)
            .unwrap();
        let container = task.container.as_ref().unwrap();

        assert_eq!(container.hostname.as_deref(), Some("agent1"));
        assert_eq!(container.networks, vec!["overlay"]);
        assert_eq!(container.port_mappings[0].host_port, 31000);
        assert_eq!(container.port_mappings[1].host_port, 31900);

        let ports = task.resources.iter().find(|r| r.name == names::PORTS).unwrap();
        assert_eq!(ports.role, "ci");
        assert_eq!(
            ports.value,
            ResourceValue::Ranges(vec![Range::single(31000), Range::single(31900)])
        );
    }

    #[test]
    fn test_host_network_has_no_hostname() {
        let container = ContainerSpec::docker("agent:latest");
        let task = launcher()
            .build(&offer(), &spec().with_container(container), &Allocation::default())
            .unwrap();
        assert!(task.container.unwrap().hostname.is_none());
    }

    #[test]
    fn test_launch_tracks_task() {
        let driver = MockDriver::new();
        let mut tracker = StatusTracker::new();
        let mut notifications = Vec::new();
        let request = WorkerRequest::new(spec(), Arc::new(Failures::default()));

        let task_id = launcher()
            .launch(
                &driver,
                &offer(),
                request,
                &Allocation::default(),
                &mut tracker,
                &mut notifications,
            )
            .unwrap();

        assert_eq!(task_id.as_str(), "agent1");
        assert!(tracker.contains(&task_id));
        assert!(notifications.is_empty());
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Launch { .. })), 1);
    }

    #[test]
    fn test_launch_failure_notifies_failed() {
        let driver = MockDriver::failing();
        let mut tracker = StatusTracker::new();
        let mut notifications = Vec::new();
        let callback = Arc::new(Failures::default());
        let request = WorkerRequest::new(spec(), callback.clone());

        let result = launcher().launch(
            &driver,
            &offer(),
            request,
            &Allocation::default(),
            &mut tracker,
            &mut notifications,
        );

        assert!(matches!(result, Err(SchedulerError::Driver(_))));
        assert!(tracker.is_empty());
        notifications.into_iter().for_each(Notification::fire);
        assert_eq!(callback.0.load(Ordering::SeqCst), 1);
        assert_eq!(driver.launched().len(), 1);
    }
}
