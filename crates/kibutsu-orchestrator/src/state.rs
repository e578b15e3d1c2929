//! Project state reader.
//!
//! Rebuilds a `ProjectView` from live engine queries on every call; nothing is cached.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::DateTime;
use kibutsu_common::{
    ComposeError, InstanceStatus, NetworkInfo, OrphanResource, ProjectSummary, ProjectView,
    Result, ServiceInstance, ServiceSpec, VolumeInfo,
};
use kibutsu_engine::{ContainerSummary, EngineGateway, LabelFilter, NetworkSummary, VolumeSummary};
use tracing::{debug, instrument, warn};

use crate::labels::{self, ResourceIdentity, FINGERPRINT_LABEL, PROJECT_LABEL};

/// A view plus the raw container records it was built from.
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    pub view: ProjectView,
    pub containers: Vec<ContainerSummary>,
}

impl ProjectSnapshot {
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Spec recorded on the lowest-indexed instance of `service` that carries one.
    pub fn recorded_spec(&self, service: &str) -> Option<ServiceSpec> {
        self.view.instances(service).iter().find_map(|instance| {
            self.containers
                .iter()
                .find(|c| c.id == instance.container_id)
                .and_then(|c| labels::recorded_spec(&c.labels))
        })
    }
}

#[derive(Clone)]
pub struct ProjectReader {
    engine: Arc<dyn EngineGateway>,
}

impl ProjectReader {
    pub fn new(engine: Arc<dyn EngineGateway>) -> Self {
        Self { engine }
    }

    /// `NotFound` when nothing carries the project label.
    pub async fn read(&self, project: &str) -> Result<ProjectView> {
        let snapshot = self.snapshot(project).await?;
        if snapshot.is_empty() {
            return Err(ComposeError::NotFound(format!("project {project}")));
        }
        Ok(snapshot.view)
    }

    /// Like `read`, but an absent project yields an empty snapshot.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, project: &str) -> Result<ProjectSnapshot> {
        let filter = labels::project_filter(project);
        let (containers, networks, volumes) = self.query(&filter).await?;
        let view = build_view(project, &containers, &networks, &volumes);
        debug!(
            instances = view.instance_count(),
            orphans = view.orphans.len(),
            "Project snapshot taken"
        );
        Ok(ProjectSnapshot { view, containers })
    }

    /// Summaries of every project with at least one labeled resource, ordered by name.
    pub async fn list(&self) -> Result<Vec<ProjectSummary>> {
        let (containers, networks, volumes) = self.query(&labels::managed_filter()).await?;

        let mut projects: BTreeMap<String, (Vec<ContainerSummary>, Vec<NetworkSummary>, Vec<VolumeSummary>)> =
            BTreeMap::new();
        for container in containers {
            if let Some(project) = container.labels.get(PROJECT_LABEL).cloned() {
                projects.entry(project).or_default().0.push(container);
            }
        }
        for network in networks {
            if let Some(project) = network.labels.get(PROJECT_LABEL).cloned() {
                projects.entry(project).or_default().1.push(network);
            }
        }
        for volume in volumes {
            if let Some(project) = volume.labels.get(PROJECT_LABEL).cloned() {
                projects.entry(project).or_default().2.push(volume);
            }
        }

        Ok(projects
            .iter()
            .map(|(name, (containers, networks, volumes))| {
                build_view(name, containers, networks, volumes).summary()
            })
            .collect())
    }

    async fn query(
        &self,
        filter: &LabelFilter,
    ) -> Result<(Vec<ContainerSummary>, Vec<NetworkSummary>, Vec<VolumeSummary>)> {
        let (containers, networks, volumes) = tokio::try_join!(
            self.engine.list_containers(filter),
            self.engine.list_networks(filter),
            self.engine.list_volumes(filter),
        )?;
        Ok((containers, networks, volumes))
    }
}

/// Groups labeled resources into a view. Containers without a usable identity, or
/// duplicating an index already taken, are reported as orphans.
pub fn build_view(
    project: &str,
    containers: &[ContainerSummary],
    networks: &[NetworkSummary],
    volumes: &[VolumeSummary],
) -> ProjectView {
    let mut view = ProjectView {
        name: project.to_string(),
        ..ProjectView::default()
    };

    // Oldest container keeps a contested index
    let mut ordered: Vec<&ContainerSummary> = containers.iter().collect();
    ordered.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));

    let mut taken: HashSet<(String, u32)> = HashSet::new();
    for container in ordered {
        let identity = match ResourceIdentity::parse(&container.labels) {
            Some(identity) if identity.project() == project => identity,
            _ => continue,
        };
        match identity {
            ResourceIdentity::Service { service, index, .. } => {
                if !taken.insert((service.clone(), index)) {
                    view.orphans.push(orphan(
                        container,
                        format!("duplicate index {index} for service {service}"),
                    ));
                    continue;
                }
                view.services.entry(service.clone()).or_default().push(ServiceInstance {
                    service,
                    index,
                    container_id: container.id.clone(),
                    name: container.name.clone(),
                    image: container.image.clone(),
                    status: InstanceStatus::from_engine_state(&container.state),
                    fingerprint: container.labels.get(FINGERPRINT_LABEL).cloned(),
                    created_at: container.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                });
            }
            ResourceIdentity::Orphan { reason, .. } => view.orphans.push(orphan(container, reason)),
            ResourceIdentity::Project { .. } => {
                view.orphans.push(orphan(container, "missing service and index labels".to_string()))
            }
        }
    }

    for instances in view.services.values_mut() {
        instances.sort_by_key(|i| i.index);
    }
    for orphan in &view.orphans {
        warn!(%project, container = %orphan.name, reason = %orphan.reason, "Orphan container");
        view.warnings
            .push(format!("orphan container {}: {}", orphan.name, orphan.reason));
    }

    view.networks = networks
        .iter()
        .map(|n| NetworkInfo {
            id: n.id.clone(),
            name: n.name.clone(),
        })
        .collect();
    view.networks.sort_by(|a, b| a.name.cmp(&b.name));
    view.volumes = volumes
        .iter()
        .map(|v| VolumeInfo { name: v.name.clone() })
        .collect();
    view.volumes.sort_by(|a, b| a.name.cmp(&b.name));
    view
}

fn orphan(container: &ContainerSummary, reason: String) -> OrphanResource {
    OrphanResource {
        container_id: container.id.clone(),
        name: container.name.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{INDEX_LABEL, SERVICE_LABEL};
    use std::collections::HashMap;

    fn container(id: &str, name: &str, labels: &[(&str, &str)], created: i64) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            state: "running".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            created: Some(created),
        }
    }

    #[test]
    fn test_groups_by_service_and_sorts_by_index() {
        let containers = vec![
            container("b", "demo_web_1", &[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "web"), (INDEX_LABEL, "1")], 2),
            container("a", "demo_web_0", &[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "web"), (INDEX_LABEL, "0")], 1),
            container("c", "demo_db_0", &[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "db"), (INDEX_LABEL, "0")], 3),
        ];
        let view = build_view("demo", &containers, &[], &[]);
        assert_eq!(view.instance_count(), 3);
        let indices: Vec<u32> = view.instances("web").iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(view.instances("web")[0].status, InstanceStatus::Running);
        assert!(view.orphans.is_empty());
    }

    #[test]
    fn test_malformed_and_duplicate_instances_become_orphans() {
        let containers = vec![
            container("a", "demo_web_0", &[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "web"), (INDEX_LABEL, "0")], 1),
            container("b", "copy-of-web", &[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "web"), (INDEX_LABEL, "0")], 5),
            container("c", "stray", &[(PROJECT_LABEL, "demo"), (SERVICE_LABEL, "web"), (INDEX_LABEL, "x")], 2),
            container("d", "bare", &[(PROJECT_LABEL, "demo")], 3),
        ];
        let view = build_view("demo", &containers, &[], &[]);
        assert_eq!(view.instances("web").len(), 1);
        assert_eq!(view.instances("web")[0].container_id, "a");
        assert_eq!(view.orphans.len(), 3);
        assert_eq!(view.warnings.len(), 3);
        assert!(!view.is_empty());
    }

    #[test]
    fn test_project_with_only_networks_is_not_empty() {
        let networks = vec![NetworkSummary {
            id: "n1".into(),
            name: "demo_default".into(),
            labels: HashMap::from([(PROJECT_LABEL.to_string(), "demo".to_string())]),
        }];
        let view = build_view("demo", &[], &networks, &[]);
        assert!(!view.is_empty());
        assert_eq!(view.networks[0].name, "demo_default");
    }
}
