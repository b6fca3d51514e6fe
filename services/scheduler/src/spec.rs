//! Worker specifications submitted by the host.

use fleet_id::TaskId;
use serde::{Deserialize, Serialize};

use crate::constraints::AttributeSelector;

/// Shell dialect of the agent launch command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStyle {
    #[default]
    Linux,
    Windows,
}

/// An extra artifact fetched into the task sandbox before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchUri {
    pub value: String,
    pub executable: bool,
    pub extract: bool,
}

impl FetchUri {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            executable: false,
            extract: false,
        }
    }
}

/// Container network mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Host,
    Bridge,
    User,
}

/// A container port exposed on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u32,
    /// Fixed host port; `None` allocates one from the offer.
    pub host_port: Option<u32>,
    pub protocol: String,
}

/// A volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub container_path: String,
    pub host_path: Option<String>,
    pub read_only: bool,
}

/// Docker container settings for a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub network: NetworkMode,
    pub privileged: bool,
    pub force_pull_image: bool,
    pub parameters: Vec<(String, String)>,
    pub port_mappings: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    /// Named virtual networks to attach.
    pub networks: Vec<String>,
    /// Run the agent command through this shell instead of `/bin/sh -c`.
    pub custom_shell: Option<String>,
}

impl ContainerSpec {
    pub fn docker(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Number of host ports that must be allocated from the offer.
    pub fn dynamic_port_count(&self) -> usize {
        self.port_mappings
            .iter()
            .filter(|m| m.host_port.is_none())
            .count()
    }
}

/// Everything needed to provision one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Unique worker name; becomes the task ID.
    pub name: TaskId,
    pub label: String,
    pub cpus: f64,
    pub memory_mb: u32,
    pub disk_mb: f64,
    /// Placement constraints. When empty, the label's configured
    /// constraints apply.
    pub attributes: AttributeSelector,
    pub jvm_args: String,
    pub jnlp_args: String,
    /// Agent secret passed on the command line, if the host uses one.
    pub secret: Option<String>,
    pub command_style: CommandStyle,
    pub additional_uris: Vec<FetchUri>,
    pub container: Option<ContainerSpec>,
}

impl WorkerSpec {
    /// A plain worker with the given resources and no container.
    pub fn new(name: TaskId, cpus: f64, memory_mb: u32) -> Self {
        Self {
            name,
            label: String::new(),
            cpus,
            memory_mb,
            disk_mb: 0.0,
            attributes: AttributeSelector::default(),
            jvm_args: String::new(),
            jnlp_args: String::new(),
            secret: None,
            command_style: CommandStyle::default(),
            additional_uris: Vec::new(),
            container: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_attributes(mut self, attributes: AttributeSelector) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Host ports the worker needs allocated from an offer.
    pub fn dynamic_port_count(&self) -> usize {
        self.container
            .as_ref()
            .map_or(0, ContainerSpec::dynamic_port_count)
    }

    /// True if the worker exposes any container ports.
    pub fn has_port_mappings(&self) -> bool {
        self.container
            .as_ref()
            .is_some_and(|c| !c.port_mappings.is_empty())
    }
}
