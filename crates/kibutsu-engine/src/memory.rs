//! In-process engine honouring the `EngineGateway` contract.
//!
//! Backs the orchestrator and server test suites: it keeps containers, networks and
//! volumes in memory, enforces the same conflicts the real engine raises (name clashes,
//! networks with attached containers, volumes in use), and lets a test inject faults,
//! latency and log output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use kibutsu_common::{LogSource, ResourceKind};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::gateway::{
    ContainerSpec, ContainerSummary, EngineEvent, EngineGateway, EngineStream, LabelFilter,
    LogChunk, LogOptions, MountKind, NetworkSummary, VolumeSummary,
};
use crate::{EngineError, Result};

const LOG_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Ping,
    EnsureImage,
    CreateContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    ListContainers,
    CreateNetwork,
    ConnectNetwork,
    RemoveNetwork,
    ListNetworks,
    CreateVolume,
    RemoveVolume,
    ListVolumes,
    Logs,
}

#[derive(Debug)]
struct Fault {
    op: EngineOp,
    target: String,
    remaining: usize,
}

struct MemContainer {
    summary: ContainerSummary,
    networks: HashSet<String>,
    volumes: Vec<String>,
    history: Vec<LogChunk>,
    logs: broadcast::Sender<LogChunk>,
}

#[derive(Default)]
struct MemState {
    containers: BTreeMap<String, MemContainer>,
    networks: BTreeMap<String, (NetworkSummary, HashSet<String>)>,
    volumes: BTreeMap<String, VolumeSummary>,
    images: HashSet<String>,
    missing_images: HashSet<String>,
    faults: Vec<Fault>,
    calls: HashMap<EngineOp, usize>,
    unavailable: bool,
    next_id: u64,
}

impl MemState {
    fn record(&mut self, op: EngineOp, target: &str) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.unavailable {
            return Err(EngineError::Unavailable("connection refused".to_string()));
        }
        if let Some(fault) = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0 && target.contains(&f.target))
        {
            fault.remaining -= 1;
            return Err(EngineError::Api {
                status: 500,
                message: format!("injected fault on {op:?} {target}"),
            });
        }
        Ok(())
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:064x}", self.next_id)
    }

    /// Resolves an id, id prefix or name the way the engine does.
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.summary.name == id_or_name || c.summary.id.starts_with(id_or_name))
            .map(|c| c.summary.id.clone())
    }

    fn container_name(&self, id_or_name: &str) -> String {
        self.resolve(id_or_name)
            .and_then(|id| self.containers.get(&id))
            .map(|c| c.summary.name.clone())
            .unwrap_or_else(|| id_or_name.to_string())
    }
}

/// Decrements the open-stream counter when a log stream is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryEngine {
    state: Mutex<MemState>,
    latency_ms: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
    open_streams: Arc<AtomicUsize>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(MemState::default()),
            latency_ms: AtomicU64::new(0),
            events,
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn emit(&self, summary: &ContainerSummary, action: &str) {
        // No subscribers is fine
        let _ = self.events.send(EngineEvent {
            kind: ResourceKind::Container,
            action: action.to_string(),
            id: summary.id.clone(),
            labels: summary.labels.clone(),
        });
    }

    /// Delay applied before every engine call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Fails the next `times` calls of `op` whose target (name or image) contains `target`.
    pub fn fail(&self, op: EngineOp, target: impl Into<String>, times: usize) {
        self.lock().faults.push(Fault {
            op,
            target: target.into(),
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Pulls of `image` will fail with `NotFound`.
    pub fn mark_image_missing(&self, image: impl Into<String>) {
        self.lock().missing_images.insert(image.into());
    }

    pub fn calls(&self, op: EngineOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn open_log_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.lock()
            .containers
            .values()
            .map(|c| c.summary.clone())
            .collect()
    }

    pub fn container(&self, id_or_name: &str) -> Option<ContainerSummary> {
        let state = self.lock();
        let id = state.resolve(id_or_name)?;
        state.containers.get(&id).map(|c| c.summary.clone())
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.keys().cloned().collect()
    }

    /// Adds a container directly, bypassing the gateway (for out-of-band resources).
    pub fn insert_container(
        &self,
        name: &str,
        image: &str,
        labels: HashMap<String, String>,
        state: &str,
    ) -> String {
        let mut guard = self.lock();
        let id = guard.next_id();
        let created = Utc::now().timestamp();
        let (logs, _) = broadcast::channel(LOG_BUFFER);
        guard.containers.insert(
            id.clone(),
            MemContainer {
                summary: ContainerSummary {
                    id: id.clone(),
                    name: name.to_string(),
                    image: image.to_string(),
                    state: state.to_string(),
                    labels,
                    created: Some(created),
                },
                networks: HashSet::new(),
                volumes: Vec::new(),
                history: Vec::new(),
                logs,
            },
        );
        id
    }

    /// Appends a line to a container's output, delivering it to followers.
    pub fn push_log(&self, id_or_name: &str, source: LogSource, text: &str) -> bool {
        let mut state = self.lock();
        let Some(id) = state.resolve(id_or_name) else {
            return false;
        };
        let Some(container) = state.containers.get_mut(&id) else {
            return false;
        };
        let chunk = LogChunk {
            source,
            timestamp: Some(Utc::now()),
            message: text.to_string(),
        };
        container.history.push(chunk.clone());
        let _ = container.logs.send(chunk);
        true
    }

    /// Simulates the container's process exiting on its own.
    pub fn crash(&self, id_or_name: &str) -> bool {
        let summary = {
            let mut state = self.lock();
            let Some(id) = state.resolve(id_or_name) else {
                return false;
            };
            let Some(container) = state.containers.get_mut(&id) else {
                return false;
            };
            container.summary.state = "exited".to_string();
            container.summary.clone()
        };
        self.emit(&summary, "die");
        true
    }
}

#[async_trait]
impl EngineGateway for MemoryEngine {
    async fn ping(&self) -> Result<()> {
        self.pause().await;
        self.lock().record(EngineOp::Ping, "")
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::EnsureImage, image)?;
        if state.images.contains(image) {
            return Ok(());
        }
        if state.missing_images.contains(image) {
            return Err(EngineError::NotFound(format!(
                "pull access denied for {image}, repository does not exist"
            )));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.pause().await;
        let summary = {
            let mut state = self.lock();
            state.record(EngineOp::CreateContainer, &spec.name)?;
            if state.containers.values().any(|c| c.summary.name == spec.name) {
                return Err(EngineError::AlreadyExists(format!(
                    "container name \"/{}\" is already in use",
                    spec.name
                )));
            }
            if !state.images.contains(&spec.image) {
                return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
            }
            if let Some(network) = &spec.network {
                if !state.networks.contains_key(network) {
                    return Err(EngineError::NotFound(format!("network {network} not found")));
                }
            }
            let volumes: Vec<String> = spec
                .mounts
                .iter()
                .filter(|m| m.kind == MountKind::Volume)
                .map(|m| m.source.clone())
                .collect();
            for volume in &volumes {
                // The engine creates unknown named volumes implicitly
                state.volumes.entry(volume.clone()).or_insert_with(|| VolumeSummary {
                    name: volume.clone(),
                    labels: HashMap::new(),
                });
            }

            let id = state.next_id();
            let created = Utc::now().timestamp();
            let (logs, _) = broadcast::channel(LOG_BUFFER);
            let summary = ContainerSummary {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "created".to_string(),
                labels: spec.labels.clone(),
                created: Some(created),
            };
            let networks: HashSet<String> = spec.network.iter().cloned().collect();
            for network in &networks {
                if let Some((_, attached)) = state.networks.get_mut(network) {
                    attached.insert(id.clone());
                }
            }
            state.containers.insert(
                id,
                MemContainer {
                    summary: summary.clone(),
                    networks,
                    volumes,
                    history: Vec::new(),
                    logs,
                },
            );
            summary
        };
        self.emit(&summary, "create");
        Ok(summary.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.pause().await;
        let summary = {
            let mut state = self.lock();
            let name = state.container_name(id);
            state.record(EngineOp::StartContainer, &name)?;
            let resolved = state
                .resolve(id)
                .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
            let Some(container) = state.containers.get_mut(&resolved) else {
                return Err(EngineError::NotFound(format!("No such container: {id}")));
            };
            if container.summary.state == "running" {
                return Ok(());
            }
            container.summary.state = "running".to_string();
            container.summary.clone()
        };
        self.emit(&summary, "start");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.pause().await;
        let summary = {
            let mut state = self.lock();
            let name = state.container_name(id);
            state.record(EngineOp::StopContainer, &name)?;
            let resolved = state
                .resolve(id)
                .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
            let Some(container) = state.containers.get_mut(&resolved) else {
                return Err(EngineError::NotFound(format!("No such container: {id}")));
            };
            if container.summary.state != "running" {
                return Ok(());
            }
            container.summary.state = "exited".to_string();
            container.summary.clone()
        };
        self.emit(&summary, "stop");
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.pause().await;
        let summary = {
            let mut state = self.lock();
            let name = state.container_name(id);
            state.record(EngineOp::RemoveContainer, &name)?;
            let resolved = state
                .resolve(id)
                .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
            let Some(container) = state.containers.remove(&resolved) else {
                return Err(EngineError::NotFound(format!("No such container: {id}")));
            };
            for network in &container.networks {
                if let Some((_, attached)) = state.networks.get_mut(network) {
                    attached.remove(&resolved);
                }
            }
            // Dropping `container` closes its log channel, ending followers.
            container.summary
        };
        self.emit(&summary, "destroy");
        Ok(())
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::ListContainers, "")?;
        Ok(state
            .containers
            .values()
            .filter(|c| filter.matches(&c.summary.labels))
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn create_network(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::CreateNetwork, name)?;
        if state.networks.contains_key(name) {
            return Err(EngineError::AlreadyExists(format!(
                "network with name {name} already exists"
            )));
        }
        let id = state.next_id();
        state.networks.insert(
            name.to_string(),
            (
                NetworkSummary {
                    id,
                    name: name.to_string(),
                    labels: labels.clone(),
                },
                HashSet::new(),
            ),
        );
        Ok(())
    }

    async fn connect_network(&self, network: &str, container_id: &str, _aliases: &[String]) -> Result<()> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::ConnectNetwork, network)?;
        let id = state
            .resolve(container_id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {container_id}")))?;
        let Some((_, attached)) = state.networks.get_mut(network) else {
            return Err(EngineError::NotFound(format!("network {network} not found")));
        };
        attached.insert(id.clone());
        if let Some(container) = state.containers.get_mut(&id) {
            container.networks.insert(network.to_string());
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::RemoveNetwork, name)?;
        match state.networks.get(name) {
            None => Err(EngineError::NotFound(format!("network {name} not found"))),
            Some((_, attached)) if !attached.is_empty() => Err(EngineError::Conflict(format!(
                "error while removing network: network {name} has active endpoints"
            ))),
            Some(_) => {
                state.networks.remove(name);
                Ok(())
            }
        }
    }

    async fn list_networks(&self, filter: &LabelFilter) -> Result<Vec<NetworkSummary>> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::ListNetworks, "")?;
        Ok(state
            .networks
            .values()
            .filter(|(n, _)| filter.matches(&n.labels))
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::CreateVolume, name)?;
        // Volume creation is idempotent on the real engine as well.
        state
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| VolumeSummary {
                name: name.to_string(),
                labels: labels.clone(),
            });
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::RemoveVolume, name)?;
        if !state.volumes.contains_key(name) {
            return Err(EngineError::NotFound(format!("no such volume: {name}")));
        }
        if state
            .containers
            .values()
            .any(|c| c.volumes.iter().any(|v| v == name))
        {
            return Err(EngineError::Conflict(format!("volume is in use: {name}")));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<VolumeSummary>> {
        self.pause().await;
        let mut state = self.lock();
        state.record(EngineOp::ListVolumes, "")?;
        Ok(state
            .volumes
            .values()
            .filter(|v| filter.matches(&v.labels))
            .cloned()
            .collect())
    }

    fn container_logs(&self, id: &str, options: LogOptions) -> EngineStream<LogChunk> {
        let opened = {
            let mut state = self.lock();
            let name = state.container_name(id);
            state.record(EngineOp::Logs, &name).and_then(|_| {
                let resolved = state
                    .resolve(id)
                    .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
                let container = state
                    .containers
                    .get(&resolved)
                    .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
                let skip = match options.tail {
                    Some(n) => container.history.len().saturating_sub(n as usize),
                    None => 0,
                };
                let history: Vec<LogChunk> = container.history[skip..].to_vec();
                let follower = options.follow.then(|| container.logs.subscribe());
                Ok((history, follower))
            })
        };

        let (history, follower) = match opened {
            Ok(opened) => opened,
            Err(e) => return Box::pin(stream::once(async move { Err::<LogChunk, _>(e) })),
        };

        let guard = StreamGuard::new(self.open_streams.clone());
        Box::pin(async_stream::stream! {
            let _guard = guard;
            for chunk in history {
                yield Ok::<_, EngineError>(chunk);
            }
            if let Some(mut rx) = follower {
                loop {
                    match rx.recv().await {
                        Ok(chunk) => yield Ok(chunk),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn events(&self, filter: &LabelFilter) -> EngineStream<EngineEvent> {
        let mut rx = self.events.subscribe();
        let filter = filter.clone();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if filter.matches(&event.labels) => yield Ok::<_, EngineError>(event),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
