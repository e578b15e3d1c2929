//! Resource naming and labeling.
//!
//! Every resource the orchestrator creates carries the project label; containers also carry
//! service and index labels. Those labels are the only record of what a project contains, so
//! the functions here are used both to create resources and to rediscover them.

use std::collections::HashMap;

use kibutsu_common::{ComposeError, Result, ServiceSpec};
use kibutsu_engine::{ContainerSpec, LabelFilter, MountKind, MountSpec};
use sha2::{Digest, Sha256};

pub const PROJECT_LABEL: &str = "io.kibutsu.project";
pub const SERVICE_LABEL: &str = "io.kibutsu.service";
pub const INDEX_LABEL: &str = "io.kibutsu.index";
pub const FINGERPRINT_LABEL: &str = "io.kibutsu.fingerprint";
/// JSON of the `ServiceSpec` the instance was created from.
pub const SPEC_LABEL: &str = "io.kibutsu.spec";

/// Project names never contain `_`, so every derived name splits back into exactly one
/// (project, rest) pair.
pub fn container_name(project: &str, service: &str, index: u32) -> String {
    format!("{project}_{service}_{index}")
}

pub fn default_network(project: &str) -> String {
    format!("{project}_default")
}

pub fn network_name(project: &str, network: &str) -> String {
    format!("{project}_{network}")
}

pub fn volume_name(project: &str, source: &str) -> String {
    format!("{project}_{source}")
}

/// Labels for project-level resources (networks, volumes).
pub fn project_labels(project: &str) -> HashMap<String, String> {
    HashMap::from([(PROJECT_LABEL.to_string(), project.to_string())])
}

pub fn instance_labels(
    project: &str,
    spec: &ServiceSpec,
    index: u32,
) -> Result<HashMap<String, String>> {
    let recorded = serde_json::to_string(spec).map_err(|e| {
        ComposeError::InvalidDescriptor(format!("service {} cannot be recorded: {e}", spec.name))
    })?;
    let mut labels = project_labels(project);
    labels.insert(SERVICE_LABEL.to_string(), spec.name.clone());
    labels.insert(INDEX_LABEL.to_string(), index.to_string());
    labels.insert(FINGERPRINT_LABEL.to_string(), fingerprint(spec));
    labels.insert(SPEC_LABEL.to_string(), recorded);
    Ok(labels)
}

pub fn project_filter(project: &str) -> LabelFilter {
    LabelFilter::new().with(PROJECT_LABEL, project)
}

/// Matches resources of any project.
pub fn managed_filter() -> LabelFilter {
    LabelFilter::new().with_key(PROJECT_LABEL)
}

/// Hash of the creation parameters that force a recreate when they change.
pub fn fingerprint(spec: &ServiceSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.image.as_bytes());
    hasher.update([0]);
    for (key, value) in &spec.environment {
        hasher.update(format!("{key}={value}").as_bytes());
        hasher.update([0]);
    }
    hasher.update([1]);
    for mount in &spec.volumes {
        let mode = if mount.read_only { "ro" } else { "rw" };
        hasher.update(format!("{}:{}:{mode}", mount.source, mount.target).as_bytes());
        hasher.update([0]);
    }
    hasher.update([1]);
    for port in &spec.ports {
        let host_ip = port.host_ip.as_deref().unwrap_or("");
        let host_port = port.host_port.map(|p| p.to_string()).unwrap_or_default();
        hasher.update(
            format!("{host_ip}:{host_port}:{}/{}", port.container_port, port.protocol).as_bytes(),
        );
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

/// Recovers the spec an instance was created from.
pub fn recorded_spec(labels: &HashMap<String, String>) -> Option<ServiceSpec> {
    labels
        .get(SPEC_LABEL)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

/// Everything needed to create instance `index` of `spec`.
pub fn container_spec(project: &str, spec: &ServiceSpec, index: u32) -> Result<ContainerSpec> {
    let name = container_name(project, &spec.name, index);
    let mounts = spec
        .volumes
        .iter()
        .map(|mount| {
            if mount.is_named_volume() {
                MountSpec {
                    kind: MountKind::Volume,
                    source: volume_name(project, &mount.source),
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                }
            } else {
                MountSpec {
                    kind: MountKind::Bind,
                    source: mount.source.clone(),
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                }
            }
        })
        .collect();

    Ok(ContainerSpec {
        labels: instance_labels(project, spec, index)?,
        name: name.clone(),
        image: spec.image.clone(),
        env: spec.env_list(),
        ports: spec.ports.clone(),
        mounts,
        network: Some(default_network(project)),
        aliases: vec![spec.name.clone(), name],
        restart: spec.restart,
    })
}

/// Typed identity recovered from a resource's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceIdentity {
    /// Project-level resource: network or volume.
    Project { project: String },
    Service {
        project: String,
        service: String,
        index: u32,
    },
    /// Carries the project label but no usable service/index pair.
    Orphan { project: String, reason: String },
}

impl ResourceIdentity {
    /// `None` when the resource is not managed by any project.
    pub fn parse(labels: &HashMap<String, String>) -> Option<Self> {
        let project = labels.get(PROJECT_LABEL)?.clone();
        let service = labels.get(SERVICE_LABEL);
        let index = labels.get(INDEX_LABEL);

        let identity = match (service, index) {
            (None, None) => ResourceIdentity::Project { project },
            (Some(service), Some(raw)) => match raw.parse::<u32>() {
                Ok(index) if !service.is_empty() => ResourceIdentity::Service {
                    project,
                    service: service.clone(),
                    index,
                },
                Ok(_) => ResourceIdentity::Orphan {
                    project,
                    reason: "empty service label".to_string(),
                },
                Err(_) => ResourceIdentity::Orphan {
                    project,
                    reason: format!("malformed index label {raw:?}"),
                },
            },
            (Some(_), None) => ResourceIdentity::Orphan {
                project,
                reason: "missing index label".to_string(),
            },
            (None, Some(_)) => ResourceIdentity::Orphan {
                project,
                reason: "missing service label".to_string(),
            },
        };
        Some(identity)
    }

    pub fn project(&self) -> &str {
        match self {
            ResourceIdentity::Project { project }
            | ResourceIdentity::Service { project, .. }
            | ResourceIdentity::Orphan { project, .. } => project,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibutsu_common::{PortBinding, Protocol, VolumeMount};

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_names() {
        assert_eq!(container_name("demo", "web", 0), "demo_web_0");
        assert_eq!(default_network("demo"), "demo_default");
        assert_eq!(network_name("demo", "backend"), "demo_backend");
        assert_eq!(volume_name("demo", "data"), "demo_data");
    }

    #[test]
    fn test_names_do_not_collide_across_projects() {
        assert_ne!(container_name("a", "b-c", 0), container_name("a-b", "c", 0));
        assert_ne!(container_name("a", "b_c", 0), container_name("a-b", "c", 0));
        // `a_b` is not a valid project, so `a`'s network is the only owner of this name
        assert_eq!(network_name("a", "b_default"), "a_b_default");
        assert!(kibutsu_common::validate_project_name("a_b").is_err());
    }

    #[test]
    fn test_instance_labels_round_trip_identity() {
        let spec = ServiceSpec::new("web", "nginx:latest");
        let labels = instance_labels("demo", &spec, 3).unwrap();
        assert_eq!(
            ResourceIdentity::parse(&labels),
            Some(ResourceIdentity::Service {
                project: "demo".into(),
                service: "web".into(),
                index: 3
            })
        );
        assert_eq!(recorded_spec(&labels), Some(spec));
    }

    #[test]
    fn test_identity_parsing() {
        assert_eq!(ResourceIdentity::parse(&labels(&[("other", "x")])), None);
        assert_eq!(
            ResourceIdentity::parse(&labels(&[(PROJECT_LABEL, "demo")])),
            Some(ResourceIdentity::Project {
                project: "demo".into()
            })
        );

        let malformed = ResourceIdentity::parse(&labels(&[
            (PROJECT_LABEL, "demo"),
            (SERVICE_LABEL, "web"),
            (INDEX_LABEL, "-1"),
        ]))
        .unwrap();
        assert!(matches!(malformed, ResourceIdentity::Orphan { ref reason, .. } if reason.contains("malformed")));

        let missing = ResourceIdentity::parse(&labels(&[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "web")]))
            .unwrap();
        assert!(matches!(missing, ResourceIdentity::Orphan { .. }));
        assert_eq!(missing.project(), "demo");
    }

    #[test]
    fn test_fingerprint_tracks_creation_parameters() {
        let base = ServiceSpec::new("web", "nginx:1.25").with_env("MODE", "prod");
        let same = base.clone().with_replicas(5);
        assert_eq!(fingerprint(&base), fingerprint(&same));

        let image = ServiceSpec { image: "nginx:1.26".into(), ..base.clone() };
        assert_ne!(fingerprint(&base), fingerprint(&image));

        let env = base.clone().with_env("MODE", "dev");
        assert_ne!(fingerprint(&base), fingerprint(&env));

        let mut ports = base.clone();
        ports.ports.push(PortBinding {
            container_port: 80,
            host_port: Some(8080),
            host_ip: None,
            protocol: Protocol::Tcp,
        });
        assert_ne!(fingerprint(&base), fingerprint(&ports));

        let mut mounts = base.clone();
        mounts.volumes.push(VolumeMount {
            source: "data".into(),
            target: "/data".into(),
            read_only: false,
        });
        assert_ne!(fingerprint(&base), fingerprint(&mounts));
    }

    #[test]
    fn test_container_spec_scopes_named_volumes() {
        let mut spec = ServiceSpec::new("db", "postgres:16");
        spec.volumes.push(VolumeMount {
            source: "data".into(),
            target: "/var/lib/postgresql/data".into(),
            read_only: false,
        });
        spec.volumes.push(VolumeMount {
            source: "./init".into(),
            target: "/docker-entrypoint-initdb.d".into(),
            read_only: true,
        });

        let container = container_spec("demo", &spec, 1).unwrap();
        assert_eq!(container.name, "demo_db_1");
        assert_eq!(container.network.as_deref(), Some("demo_default"));
        assert_eq!(container.mounts[0].kind, MountKind::Volume);
        assert_eq!(container.mounts[0].source, "demo_data");
        assert_eq!(container.mounts[1].kind, MountKind::Bind);
        assert_eq!(container.mounts[1].source, "./init");
        assert_eq!(container.labels[INDEX_LABEL], "1");
    }
}
