//! Engine-neutral contract the orchestrator drives.
//!
//! Everything above this trait speaks in terms of names, labels and ids; only the
//! implementations know about the engine's wire types.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use kibutsu_common::{LogSource, PortBinding, ResourceKind, RestartPolicy};

use crate::Result;

pub type EngineStream<T> = BoxStream<'static, Result<T>>;

/// Label selector: every entry must match. A `None` value only requires the key to be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pub labels: Vec<(String, Option<String>)>,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), Some(value.into())));
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.labels.push((key.into(), None));
        self
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.labels.iter().all(|(key, value)| match value {
            Some(v) => labels.get(key) == Some(v),
            None => labels.contains_key(key),
        })
    }

    /// `key=value` / `key` entries as the engine's `label` filter expects them.
    pub fn to_engine_filters(&self) -> HashMap<String, Vec<String>> {
        let entries = self
            .labels
            .iter()
            .map(|(key, value)| match value {
                Some(v) => format!("{key}={v}"),
                None => key.clone(),
            })
            .collect();
        HashMap::from([("label".to_string(), entries)])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Volume,
    Bind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<MountSpec>,
    /// Primary network, joined at creation time.
    pub network: Option<String>,
    pub aliases: Vec<String>,
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    /// Unix seconds.
    pub created: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSummary {
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    /// Lines of history to replay; `None` replays everything the engine kept.
    pub tail: Option<u64>,
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            tail: Some(0),
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogChunk {
    pub source: LogSource,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// A lifecycle notification emitted by the engine itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub kind: ResourceKind,
    pub action: String,
    pub id: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait EngineGateway: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Makes `image` available locally, pulling it when absent.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Returns the engine-assigned container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    /// Forced removal; anonymous volumes are left to `remove_volume`.
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>>;

    async fn create_network(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;
    async fn connect_network(&self, network: &str, container_id: &str, aliases: &[String]) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;
    async fn list_networks(&self, filter: &LabelFilter) -> Result<Vec<NetworkSummary>>;

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;
    async fn remove_volume(&self, name: &str) -> Result<()>;
    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<VolumeSummary>>;

    /// Log stream of one container. Dropping the stream releases the underlying connection.
    fn container_logs(&self, id: &str, options: LogOptions) -> EngineStream<LogChunk>;

    /// Container lifecycle events for containers matching `filter`.
    fn events(&self, filter: &LabelFilter) -> EngineStream<EngineEvent>;
}
