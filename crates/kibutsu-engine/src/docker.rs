//! `EngineGateway` over the Docker remote API.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, EventMessage, EventMessageTypeEnum, HostConfig, Mount, MountTypeEnum,
    PortBinding as EnginePortBinding, RestartPolicy as EngineRestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kibutsu_common::{LogSource, ResourceKind, RestartPolicy};
use tracing::{debug, info, instrument};

use crate::gateway::{
    ContainerSpec, ContainerSummary, EngineEvent, EngineGateway, EngineStream, LabelFilter,
    LogChunk, LogOptions, MountKind, NetworkSummary, VolumeSummary,
};
use crate::{EngineError, Result};

/// Default per-call deadline for engine requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period handed to the engine before it kills a stopping container.
pub const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Clone)] // Clone is cheap: the client is shared
pub struct DockerGateway {
    docker: Arc<Docker>,
    call_timeout: Duration,
    stop_timeout_secs: i64,
}

impl DockerGateway {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self {
            docker,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }

    /// Connects through `DOCKER_HOST` or the platform's local socket.
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(EngineError::from)?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, secs: i64) -> Self {
        self.stop_timeout_secs = secs;
        self
    }

    pub fn client(&self) -> Arc<Docker> {
        self.docker.clone()
    }

    /// Bounds one engine request by the configured deadline.
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BollardError>> + Send,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::Timeout {
                operation,
                after: self.call_timeout,
            }),
        }
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<EnginePortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            if port.host_port.is_some() || port.host_ip.is_some() {
                port_bindings.entry(key).or_default().get_or_insert_with(Vec::new).push(
                    EnginePortBinding {
                        host_ip: port.host_ip.clone(),
                        host_port: port.host_port.map(|p| p.to_string()),
                    },
                );
            }
        }

        let mounts = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(match m.kind {
                    MountKind::Volume => MountTypeEnum::VOLUME,
                    MountKind::Bind => MountTypeEnum::BIND,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let restart_name = match spec.restart {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        };

        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(
                network.clone(),
                EndpointSettings {
                    aliases: Some(spec.aliases.clone()),
                    ..Default::default()
                },
            )]),
        });

        Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                mounts: Some(mounts),
                network_mode: spec.network.clone(),
                restart_policy: Some(EngineRestartPolicy {
                    name: Some(restart_name),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        }
    }
}

/// Splits the RFC 3339 prefix the engine adds when timestamps are requested.
pub fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    if let Some((head, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(head) {
            return (Some(ts.with_timezone(&Utc)), rest);
        }
    }
    (None, line)
}

fn log_chunk(output: LogOutput) -> LogChunk {
    let (source, bytes) = match output {
        LogOutput::StdErr { message } => (LogSource::Stderr, message),
        LogOutput::StdOut { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => (LogSource::Stdout, message),
    };
    let text = String::from_utf8_lossy(&bytes);
    let (timestamp, message) = split_timestamp(text.trim_end_matches(['\r', '\n']));
    LogChunk {
        source,
        timestamp,
        message: message.to_string(),
    }
}

fn engine_event(message: EventMessage) -> Option<EngineEvent> {
    let kind = match message.typ? {
        EventMessageTypeEnum::CONTAINER => ResourceKind::Container,
        EventMessageTypeEnum::NETWORK => ResourceKind::Network,
        EventMessageTypeEnum::VOLUME => ResourceKind::Volume,
        _ => return None,
    };
    let actor = message.actor.unwrap_or_default();
    Some(EngineEvent {
        kind,
        action: message.action.unwrap_or_default(),
        id: actor.id.unwrap_or_default(),
        labels: actor.attributes.unwrap_or_default(),
    })
}

/// 304 means the container was already in the requested state.
fn ignore_not_modified(result: Result<()>) -> Result<()> {
    match result {
        Err(EngineError::Api { status: 304, .. }) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl EngineGateway for DockerGateway {
    async fn ping(&self) -> Result<()> {
        self.call("ping", self.docker.ping()).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.call("inspect_image", self.docker.inspect_image(image)).await {
            Ok(_) => return Ok(()),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(%image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let pull = async {
            let mut progress = self.docker.create_image(Some(options), None, None);
            while let Some(item) = progress.next().await {
                let info = item?;
                if let Some(status) = info.status {
                    debug!(%image, %status, "pull progress");
                }
            }
            Ok::<(), BollardError>(())
        };
        // Pulls may legitimately outlast a single-call deadline.
        match tokio::time::timeout(self.call_timeout * 5, pull).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::Timeout {
                operation: "pull_image",
                after: self.call_timeout * 5,
            }),
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });
        let response = self
            .call(
                "create_container",
                self.docker.create_container(options, Self::container_config(spec)),
            )
            .await?;
        debug!(container_id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        ignore_not_modified(
            self.call(
                "start_container",
                self.docker
                    .start_container(id, None::<StartContainerOptions<String>>),
            )
            .await,
        )
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: self.stop_timeout_secs,
        });
        ignore_not_modified(
            self.call("stop_container", self.docker.stop_container(id, options))
                .await,
        )
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        self.call("remove_container", self.docker.remove_container(id, options))
            .await
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        let options = Some(ListContainersOptions::<String> {
            all: true,
            filters: filter.to_engine_filters(),
            ..Default::default()
        });
        let containers = self
            .call("list_containers", self.docker.list_containers(options))
            .await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                created: c.created,
            })
            .collect())
    }

    async fn create_network(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            labels: labels.clone(),
            ..Default::default()
        };
        self.call("create_network", self.docker.create_network(options))
            .await
            .map(|_| ())
    }

    async fn connect_network(&self, network: &str, container_id: &str, aliases: &[String]) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings {
                aliases: Some(aliases.to_vec()),
                ..Default::default()
            },
        };
        self.call("connect_network", self.docker.connect_network(network, options))
            .await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.call("remove_network", self.docker.remove_network(name))
            .await
    }

    async fn list_networks(&self, filter: &LabelFilter) -> Result<Vec<NetworkSummary>> {
        let options = Some(ListNetworksOptions::<String> {
            filters: filter.to_engine_filters(),
        });
        let networks = self
            .call("list_networks", self.docker.list_networks(options))
            .await?;
        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                labels: n.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            labels: labels.clone(),
            ..Default::default()
        };
        self.call("create_volume", self.docker.create_volume(options))
            .await
            .map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.call(
            "remove_volume",
            self.docker
                .remove_volume(name, None::<RemoveVolumeOptions>),
        )
        .await
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<VolumeSummary>> {
        let options = Some(ListVolumesOptions::<String> {
            filters: filter.to_engine_filters(),
        });
        let response = self
            .call("list_volumes", self.docker.list_volumes(options))
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeSummary {
                name: v.name,
                labels: v.labels,
            })
            .collect())
    }

    fn container_logs(&self, id: &str, options: LogOptions) -> EngineStream<LogChunk> {
        let docker = self.docker.clone();
        let id = id.to_string();
        let logs_options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            timestamps: options.timestamps,
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        Box::pin(async_stream::stream! {
            let mut output = docker.logs(&id, Some(logs_options));
            while let Some(item) = output.next().await {
                let chunk: Result<LogChunk> = item.map(log_chunk).map_err(EngineError::from);
                let failed = chunk.is_err();
                yield chunk;
                if failed {
                    break;
                }
            }
        })
    }

    fn events(&self, filter: &LabelFilter) -> EngineStream<EngineEvent> {
        let docker = self.docker.clone();
        let mut filters = filter.to_engine_filters();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        Box::pin(async_stream::stream! {
            let mut events = docker.events(Some(options));
            while let Some(item) = events.next().await {
                match item {
                    Ok(message) => {
                        if let Some(event) = engine_event(message) {
                            yield Ok::<_, EngineError>(event);
                        }
                    }
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        break;
                    }
                }
            }
        })
    }
}
