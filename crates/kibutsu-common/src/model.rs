use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{validate_name, validate_project_name, ComposeError, Result};

/// A named group of services to bring up together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub name: String,
    pub services: Vec<ServiceSpec>,
}

impl ProjectDescriptor {
    /// Rejects bad names and duplicate services before anything touches the engine.
    pub fn validate(&self) -> Result<()> {
        validate_project_name(&self.name)?;
        let mut seen = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !seen.insert(service.name.as_str()) {
                return Err(ComposeError::InvalidDescriptor(format!(
                    "service {} is declared more than once",
                    service.name
                )));
            }
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Extra project networks to attach besides the project default network.
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub restart: RestartPolicy,
}

fn default_replicas() -> u32 {
    1
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            environment: BTreeMap::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            replicas: 1,
            restart: RestartPolicy::default(),
        }
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.image.trim().is_empty() {
            return Err(ComposeError::InvalidDescriptor(format!(
                "service {} has no image",
                self.name
            )));
        }
        for network in &self.networks {
            validate_name(network)?;
        }
        for mount in &self.volumes {
            if mount.target.is_empty() {
                return Err(ComposeError::InvalidDescriptor(format!(
                    "service {} mounts {} without a target",
                    self.name, mount.source
                )));
            }
            if mount.is_named_volume() {
                validate_name(&mount.source)?;
            }
        }
        Ok(())
    }

    /// Environment in the `KEY=value` form the engine expects.
    pub fn env_list(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Sources that are not paths name a project-scoped volume.
    pub fn is_named_volume(&self) -> bool {
        !(self.source.starts_with('/') || self.source.starts_with('.') || self.source.starts_with('~'))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Created,
    Running,
    Stopped,
    Removing,
}

impl InstanceStatus {
    /// Maps an engine container state string.
    pub fn from_engine_state(state: &str) -> Self {
        match state {
            "created" => InstanceStatus::Created,
            "running" | "restarting" | "paused" => InstanceStatus::Running,
            "removing" => InstanceStatus::Removing,
            _ => InstanceStatus::Stopped,
        }
    }
}

/// One container fulfilling a service, as discovered from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: String,
    pub index: u32,
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub status: InstanceStatus,
    pub fingerprint: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A container carrying the project label without a usable service/index pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanResource {
    pub container_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
}

/// Live snapshot of a project, rebuilt from engine queries on every read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectView {
    pub name: String,
    pub services: BTreeMap<String, Vec<ServiceInstance>>,
    pub orphans: Vec<OrphanResource>,
    pub networks: Vec<NetworkInfo>,
    pub volumes: Vec<VolumeInfo>,
    pub warnings: Vec<String>,
}

impl ProjectView {
    /// Instances of `service`, ordered by index.
    pub fn instances(&self, service: &str) -> &[ServiceInstance] {
        self.services.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.values().all(Vec::is_empty)
            && self.orphans.is_empty()
            && self.networks.is_empty()
            && self.volumes.is_empty()
    }

    pub fn summary(&self) -> ProjectSummary {
        let running = self
            .services
            .values()
            .flatten()
            .filter(|i| i.status == InstanceStatus::Running)
            .count();
        ProjectSummary {
            name: self.name.clone(),
            services: self.services.keys().cloned().collect(),
            instances: self.instance_count(),
            running,
            orphans: self.orphans.len(),
        }
    }

    pub fn service_summaries(&self) -> Vec<ServiceSummary> {
        self.services
            .iter()
            .map(|(name, instances)| ServiceSummary {
                name: name.clone(),
                image: instances.first().map(|i| i.image.clone()).unwrap_or_default(),
                total: instances.len(),
                running: instances
                    .iter()
                    .filter(|i| i.status == InstanceStatus::Running)
                    .count(),
                indices: instances.iter().map(|i| i.index).collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub name: String,
    pub services: Vec<String>,
    pub instances: usize,
    pub running: usize,
    pub orphans: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub image: String,
    pub total: usize,
    pub running: usize,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Terminal marker: the instance's stream closed.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub service: String,
    pub instance_index: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: LogSource,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Container,
    Network,
    Volume,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Container => f.write_str("container"),
            ResourceKind::Network => f.write_str("network"),
            ResourceKind::Volume => f.write_str("volume"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Started,
    Stopped,
    Removed,
}

/// Pushed to subscribers after a mutating operation touched a resource category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub project: String,
    pub action: ChangeAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_mapping() {
        assert_eq!(InstanceStatus::from_engine_state("running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from_engine_state("paused"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from_engine_state("created"), InstanceStatus::Created);
        assert_eq!(InstanceStatus::from_engine_state("exited"), InstanceStatus::Stopped);
        assert_eq!(InstanceStatus::from_engine_state("removing"), InstanceStatus::Removing);
    }

    #[test]
    fn test_duplicate_services_rejected() {
        let descriptor = ProjectDescriptor {
            name: "demo".into(),
            services: vec![ServiceSpec::new("web", "nginx"), ServiceSpec::new("web", "httpd")],
        };
        assert!(matches!(
            descriptor.validate(),
            Err(ComposeError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_named_volume_detection() {
        let named = VolumeMount { source: "data".into(), target: "/data".into(), read_only: false };
        let bind = VolumeMount { source: "/srv/data".into(), target: "/data".into(), read_only: true };
        assert!(named.is_named_volume());
        assert!(!bind.is_named_volume());
    }

    #[test]
    fn test_change_event_wire_format() {
        let event = ChangeEvent {
            kind: ResourceKind::Container,
            project: "demo".into(),
            action: ChangeAction::Started,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "container");
        assert_eq!(json["action"], "started");
    }
}
