use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kibutsu_common::{
    validate_name, validate_project_name, ChangeAction, ComposeError, InstanceStatus, LogLine, LogSource, OperationKind,
    OperationResult, ProjectDescriptor, ProjectSummary, ProjectView, ResourceKind, Result,
    ServiceInstance, ServiceOutcome, ServiceSpec, ServiceSummary,
};
use kibutsu_engine::{EngineError, EngineGateway, EngineStream, LogChunk, LogOptions};
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::context::{is_context_error, OperationContext};
use crate::labels;
use crate::notifier::ChangeNotifier;
use crate::serializer::OperationSerializer;
use crate::state::{ProjectReader, ProjectSnapshot};

/// How much history a log stream replays and whether it keeps following.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogsOptions {
    pub follow: bool,
    /// Lines of history per instance; `None` replays everything the engine kept.
    pub tail: Option<u64>,
}

impl Default for LogsOptions {
    fn default() -> Self {
        Self {
            follow: true,
            tail: Some(0),
        }
    }
}

/// Outcome of creating one instance; creation may succeed while attach/start fails.
struct Provisioned {
    name: String,
    index: u32,
    created: bool,
    error: Option<ComposeError>,
}

// --- Orchestrator Implementation ---
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn EngineGateway>,
    reader: ProjectReader,
    serializer: OperationSerializer,
    notifier: ChangeNotifier,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn EngineGateway>) -> Self {
        Self::with_config(engine, OrchestratorConfig::default())
    }

    pub fn with_config(engine: Arc<dyn EngineGateway>, config: OrchestratorConfig) -> Self {
        Self {
            reader: ProjectReader::new(Arc::clone(&engine)),
            engine,
            serializer: OperationSerializer::new(),
            notifier: ChangeNotifier::default(),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineGateway> {
        &self.engine
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn serializer(&self) -> &OperationSerializer {
        &self.serializer
    }

    pub async fn list(&self) -> Result<Vec<ProjectSummary>> {
        self.reader.list().await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, project: &str) -> Result<ProjectView> {
        validate_project_name(project)?;
        self.reader.read(project).await
    }

    pub async fn list_services(&self, project: &str) -> Result<Vec<ServiceSummary>> {
        Ok(self.get(project).await?.service_summaries())
    }

    /// Converges the project onto `descriptor`.
    ///
    /// Services are applied one at a time in declaration order. Within a service surplus
    /// instances go first (highest index first), then existing instances are started or
    /// recreated on spec drift, then missing instances are created at the lowest free
    /// indices. A failed step aborts only the current service; applied work is kept.
    #[instrument(skip_all, fields(project = %descriptor.name, request_id = %ctx.request_id()))]
    pub async fn up(
        &self,
        ctx: &OperationContext,
        descriptor: &ProjectDescriptor,
    ) -> Result<OperationResult> {
        descriptor.validate()?;
        let _lease = self
            .serializer
            .try_acquire(&descriptor.name, OperationKind::Up)?;
        let project = descriptor.name.as_str();
        let snapshot = ctx.run(self.reader.snapshot(project)).await?;

        let mut result = OperationResult::new(project, OperationKind::Up);
        result.warnings.extend(snapshot.view.warnings.iter().cloned());
        for service in snapshot.view.services.keys() {
            if descriptor.service(service).is_none() {
                warn!(%service, "Service not in descriptor, leaving it untouched");
                result.warnings.push(format!(
                    "service {service} is not in the descriptor and was left untouched"
                ));
            }
        }

        let unusable = match self
            .ensure_project_resources(ctx, descriptor, &snapshot, &mut result)
            .await
        {
            Ok(unusable) => unusable,
            Err(e) => {
                // No instance can be created without the project network
                for spec in &descriptor.services {
                    let existing = snapshot.view.instances(&spec.name);
                    let mut outcome = ServiceOutcome::new(&spec.name, spec.replicas);
                    outcome.errors.push(e.to_string());
                    result.services.push(outcome.finish(running_count(existing)));
                }
                return Ok(self.complete(result));
            }
        };

        for spec in &descriptor.services {
            let existing = snapshot.view.instances(&spec.name);
            let blocked = spec
                .networks
                .iter()
                .map(|n| labels::network_name(project, n))
                .find(|n| unusable.contains(n));
            let precondition = match blocked {
                Some(network) => Err(format!("network {network} is unavailable")),
                None => ctx.check().map_err(|e| e.to_string()),
            };
            if let Err(reason) = precondition {
                let mut outcome = ServiceOutcome::new(&spec.name, spec.replicas);
                outcome.errors.push(reason);
                result.services.push(outcome.finish(running_count(existing)));
                continue;
            }
            let outcome = self
                .apply_service(ctx, project, spec, existing, &mut result)
                .await;
            result.services.push(outcome);
        }

        Ok(self.complete(result))
    }

    /// Removes every resource labeled with `project`: containers (orphans included), then
    /// networks, then volumes unless `keep_volumes`. Individual failures are collected.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id()))]
    pub async fn down(
        &self,
        ctx: &OperationContext,
        project: &str,
        keep_volumes: bool,
    ) -> Result<OperationResult> {
        validate_project_name(project)?;
        let _lease = self.serializer.try_acquire(project, OperationKind::Down)?;
        let snapshot = ctx.run(self.reader.snapshot(project)).await?;
        let mut result = OperationResult::new(project, OperationKind::Down);
        if snapshot.is_empty() {
            debug!("Nothing labeled with project, nothing to remove");
            return Ok(self.complete(result));
        }

        let mut aborted = false;
        for (service, instances) in &snapshot.view.services {
            let mut outcome = ServiceOutcome::new(service, 0);
            for instance in instances {
                if aborted {
                    break;
                }
                match self.retire(ctx, instance, &mut result).await {
                    Ok(()) => outcome.removed += 1,
                    Err(e) => {
                        aborted = is_context_error(&e);
                        outcome.errors.push(format!("{}: {e}", instance.name));
                    }
                }
            }
            result.services.push(outcome.finish(0));
        }

        for orphan in &snapshot.view.orphans {
            if aborted {
                break;
            }
            let stopped = ctx
                .run(self.engine.stop_container(&orphan.container_id))
                .await;
            let removed = match stopped {
                Ok(()) => self.remove_container(ctx, &orphan.container_id).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => {
                    result.record_change(ResourceKind::Container, &orphan.name, ChangeAction::Removed)
                }
                Err(e) => {
                    aborted = is_context_error(&e);
                    result.record_failure(ResourceKind::Container, &orphan.name, e.to_string());
                }
            }
        }

        for network in &snapshot.view.networks {
            if aborted {
                break;
            }
            let removed = ctx
                .run(async {
                    match self.engine.remove_network(&network.name).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        other => other,
                    }
                })
                .await;
            match removed {
                Ok(()) => {
                    result.record_change(ResourceKind::Network, &network.name, ChangeAction::Removed)
                }
                Err(e) => {
                    aborted = is_context_error(&e);
                    warn!(network = %network.name, error = %e, "Network removal failed");
                    result.record_failure(ResourceKind::Network, &network.name, e.to_string());
                }
            }
        }

        if !keep_volumes {
            for volume in &snapshot.view.volumes {
                if aborted {
                    break;
                }
                let removed = ctx
                    .run(async {
                        match self.engine.remove_volume(&volume.name).await {
                            Err(e) if e.is_not_found() => Ok(()),
                            other => other,
                        }
                    })
                    .await;
                match removed {
                    Ok(()) => {
                        result.record_change(ResourceKind::Volume, &volume.name, ChangeAction::Removed)
                    }
                    Err(e) => {
                        aborted = is_context_error(&e);
                        warn!(volume = %volume.name, error = %e, "Volume removal failed");
                        result.record_failure(ResourceKind::Volume, &volume.name, e.to_string());
                    }
                }
            }
        }

        Ok(self.complete(result))
    }

    /// Moves `service` to `replicas` instances using the spec recorded on its live instances.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id()))]
    pub async fn scale(
        &self,
        ctx: &OperationContext,
        project: &str,
        service: &str,
        replicas: u32,
    ) -> Result<OperationResult> {
        validate_project_name(project)?;
        validate_name(service)?;
        let _lease = self.serializer.try_acquire(project, OperationKind::Scale)?;
        let snapshot = ctx.run(self.reader.snapshot(project)).await?;
        if snapshot.is_empty() {
            return Err(ComposeError::NotFound(format!("project {project}")));
        }

        let instances = snapshot.view.instances(service);
        let current = instances.len();
        let desired = replicas as usize;
        let mut result = OperationResult::new(project, OperationKind::Scale);
        let mut outcome = ServiceOutcome::new(service, replicas);
        outcome.running = running_count(instances);

        if desired == current {
            debug!(current, "Service already at requested scale");
        } else if desired > current {
            let mut spec = snapshot.recorded_spec(service).ok_or_else(|| {
                ComposeError::SpecUnavailable {
                    project: project.to_string(),
                    service: service.to_string(),
                }
            })?;
            spec.replicas = replicas;
            info!(from = current, to = desired, "Scaling up");
            match self.ensure_image(ctx, &spec.image).await {
                Ok(()) => {
                    let occupied: BTreeSet<u32> = instances.iter().map(|i| i.index).collect();
                    let attempts = self
                        .provision_many(ctx, project, &spec, free_indices(&occupied, desired - current))
                        .await;
                    absorb_attempts(attempts, &mut outcome, &mut result);
                }
                Err(e) => outcome.errors.push(e.to_string()),
            }
        } else {
            info!(from = current, to = desired, "Scaling down");
            // Descending, stopping at the first failure, so survivors stay the lowest indices
            for instance in instances[desired..].iter().rev() {
                let was_running = instance.status == InstanceStatus::Running;
                match self.retire(ctx, instance, &mut result).await {
                    Ok(()) => {
                        outcome.removed += 1;
                        if was_running {
                            outcome.running = outcome.running.saturating_sub(1);
                        }
                    }
                    Err(e) => {
                        outcome.errors.push(format!("{}: {e}", instance.name));
                        break;
                    }
                }
            }
        }

        let requested = desired.abs_diff(current);
        let achieved = outcome.created + outcome.removed;
        if achieved < requested {
            warn!(achieved, requested, "Scale applied partially");
            result.warnings.push(format!(
                "scaled {service} by {achieved} of {requested} requested instances"
            ));
        }
        let running = outcome.running;
        result.services.push(outcome.finish(running));
        Ok(self.complete(result))
    }

    /// Interleaved log lines of every instance of the project (or of one service).
    ///
    /// Order is preserved per instance only. Each instance's sub-stream ends with an
    /// `Ended` marker. Dropping the returned stream drops every engine stream under it; once
    /// the context ends the next poll yields `None` and releases them.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id()))]
    pub async fn logs(
        &self,
        ctx: &OperationContext,
        project: &str,
        service: Option<&str>,
        options: LogsOptions,
    ) -> Result<BoxStream<'static, LogLine>> {
        validate_project_name(project)?;
        let view = ctx.run(self.reader.read(project)).await?;
        let instances: Vec<ServiceInstance> = match service {
            Some(service) => {
                let found = view.instances(service);
                if found.is_empty() {
                    return Err(ComposeError::NotFound(format!(
                        "service {service} in project {project}"
                    )));
                }
                found.to_vec()
            }
            None => view.services.values().flatten().cloned().collect(),
        };

        let engine_options = LogOptions {
            follow: options.follow,
            tail: options.tail,
            timestamps: true,
        };
        let streams: Vec<BoxStream<'static, LogLine>> = instances
            .into_iter()
            .map(|instance| {
                let chunks = self.engine.container_logs(&instance.container_id, engine_options);
                instance_lines(chunks, instance.service, instance.index)
            })
            .collect();
        debug!(streams = streams.len(), "Multiplexing instance log streams");

        let done = ctx.done();
        let lines = async_stream::stream! {
            let mut merged = stream::select_all(streams);
            tokio::pin!(done);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = &mut done => None,
                    next = merged.next() => next,
                };
                match next {
                    Some(line) => yield line,
                    None => break,
                }
            }
            debug!("Log multiplexer closed");
        };
        Ok(lines.boxed())
    }

    fn complete(&self, result: OperationResult) -> OperationResult {
        let result = result.finish();
        self.notifier.publish_result(&result);
        info!(
            project = %result.project,
            operation = %result.operation,
            status = %result.status,
            changes = result.changes.len(),
            failures = result.failures.len(),
            "Operation finished"
        );
        result
    }

    async fn ensure_project_resources(
        &self,
        ctx: &OperationContext,
        descriptor: &ProjectDescriptor,
        snapshot: &ProjectSnapshot,
        result: &mut OperationResult,
    ) -> Result<HashSet<String>> {
        let project = descriptor.name.as_str();
        let networks: HashSet<&str> = snapshot
            .view
            .networks
            .iter()
            .map(|n| n.name.as_str())
            .collect();

        let default = labels::default_network(project);
        if !networks.contains(default.as_str()) {
            self.ensure_network(ctx, project, &default, result).await?;
        }

        let extra: BTreeSet<String> = descriptor
            .services
            .iter()
            .flat_map(|s| s.networks.iter())
            .map(|n| labels::network_name(project, n))
            .collect();
        let mut unusable = HashSet::new();
        for network in extra.iter().filter(|n| !networks.contains(n.as_str())) {
            if let Err(e) = self.ensure_network(ctx, project, network, result).await {
                if is_context_error(&e) {
                    return Err(e);
                }
                unusable.insert(network.clone());
            }
        }

        let existing_volumes: HashSet<&str> = snapshot
            .view
            .volumes
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        let volumes: BTreeSet<String> = descriptor
            .services
            .iter()
            .flat_map(|s| s.volumes.iter())
            .filter(|m| m.is_named_volume())
            .map(|m| labels::volume_name(project, &m.source))
            .collect();
        for volume in volumes.iter().filter(|v| !existing_volumes.contains(v.as_str())) {
            let created = ctx
                .run(self.engine.create_volume(volume, &labels::project_labels(project)))
                .await;
            match created {
                Ok(()) => {
                    info!(%volume, "Volume created");
                    result.record_change(ResourceKind::Volume, volume, ChangeAction::Created);
                }
                Err(e) => {
                    warn!(%volume, error = %e, "Volume creation failed");
                    result.record_failure(ResourceKind::Volume, volume, e.to_string());
                    if is_context_error(&e) {
                        return Err(e);
                    }
                }
            }
        }
        Ok(unusable)
    }

    async fn ensure_network(
        &self,
        ctx: &OperationContext,
        project: &str,
        name: &str,
        result: &mut OperationResult,
    ) -> Result<()> {
        let labels = labels::project_labels(project);
        let created = ctx
            .run(async {
                match self.engine.create_network(name, &labels).await {
                    Ok(()) => Ok(true),
                    Err(EngineError::AlreadyExists(_)) => {
                        // Only adopt a network that already carries this project's label
                        let owned = self
                            .engine
                            .list_networks(&labels::project_filter(project))
                            .await?
                            .iter()
                            .any(|n| n.name == name);
                        if owned {
                            Ok(false)
                        } else {
                            Err(EngineError::Conflict(format!(
                                "network {name} exists but does not belong to project {project}"
                            )))
                        }
                    }
                    Err(e) => Err(e),
                }
            })
            .await;
        match created {
            Ok(true) => {
                info!(network = %name, "Network created");
                result.record_change(ResourceKind::Network, name, ChangeAction::Created);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(network = %name, error = %e, "Network creation failed");
                result.record_failure(ResourceKind::Network, name, e.to_string());
                Err(e)
            }
        }
    }

    async fn apply_service(
        &self,
        ctx: &OperationContext,
        project: &str,
        spec: &ServiceSpec,
        existing: &[ServiceInstance],
        result: &mut OperationResult,
    ) -> ServiceOutcome {
        let mut outcome = ServiceOutcome::new(&spec.name, spec.replicas);
        if let Err(e) = self
            .reconcile_service(ctx, project, spec, existing, &mut outcome, result)
            .await
        {
            warn!(service = %spec.name, error = %e, "Service reconciliation aborted");
            outcome.errors.push(e.to_string());
        }
        let running = outcome.running;
        outcome.finish(running)
    }

    async fn reconcile_service(
        &self,
        ctx: &OperationContext,
        project: &str,
        spec: &ServiceSpec,
        existing: &[ServiceInstance],
        outcome: &mut ServiceOutcome,
        result: &mut OperationResult,
    ) -> Result<()> {
        let desired = spec.replicas as usize;
        let fingerprint = labels::fingerprint(spec);
        // Instances the engine is already removing count as absent but keep their index
        let (removing, live): (Vec<&ServiceInstance>, Vec<&ServiceInstance>) = existing
            .iter()
            .partition(|i| i.status == InstanceStatus::Removing);
        let (keep, surplus) = live.split_at(live.len().min(desired));

        for instance in surplus.iter().rev() {
            self.retire(ctx, instance, result).await?;
            outcome.removed += 1;
        }

        let mut image_ready = false;
        for instance in keep {
            let current = instance.fingerprint.as_deref() == Some(fingerprint.as_str());
            match (current, instance.status) {
                (true, InstanceStatus::Running) => outcome.running += 1,
                (true, InstanceStatus::Created | InstanceStatus::Stopped) => {
                    self.start(ctx, instance, result).await?;
                    outcome.started += 1;
                    outcome.running += 1;
                }
                _ => {
                    if !image_ready {
                        self.ensure_image(ctx, &spec.image).await?;
                        image_ready = true;
                    }
                    info!(service = %spec.name, index = instance.index, "Spec drift, recreating instance");
                    self.retire(ctx, instance, result).await?;
                    let provisioned = self.provision(ctx, project, spec, instance.index).await;
                    record_provisioned(provisioned, result)?;
                    outcome.recreated += 1;
                    outcome.running += 1;
                }
            }
        }

        let missing = desired.saturating_sub(keep.len());
        if missing == 0 {
            return Ok(());
        }
        if !image_ready {
            self.ensure_image(ctx, &spec.image).await?;
        }
        let occupied: BTreeSet<u32> = keep.iter().chain(&removing).map(|i| i.index).collect();
        let attempts = self
            .provision_many(ctx, project, spec, free_indices(&occupied, missing))
            .await;
        absorb_attempts(attempts, outcome, result);
        Ok(())
    }

    async fn ensure_image(&self, ctx: &OperationContext, image: &str) -> Result<()> {
        ctx.run(self.engine.ensure_image(image)).await
    }

    async fn start(
        &self,
        ctx: &OperationContext,
        instance: &ServiceInstance,
        result: &mut OperationResult,
    ) -> Result<()> {
        match ctx.run(self.engine.start_container(&instance.container_id)).await {
            Ok(()) => {
                result.record_change(ResourceKind::Container, &instance.name, ChangeAction::Started);
                Ok(())
            }
            Err(e) => {
                result.record_failure(ResourceKind::Container, &instance.name, e.to_string());
                Err(e)
            }
        }
    }

    /// Stops (when running) and removes one instance.
    async fn retire(
        &self,
        ctx: &OperationContext,
        instance: &ServiceInstance,
        result: &mut OperationResult,
    ) -> Result<()> {
        if instance.status == InstanceStatus::Running {
            if let Err(e) = ctx.run(self.engine.stop_container(&instance.container_id)).await {
                result.record_failure(ResourceKind::Container, &instance.name, e.to_string());
                return Err(e);
            }
            result.record_change(ResourceKind::Container, &instance.name, ChangeAction::Stopped);
        }
        if let Err(e) = self.remove_container(ctx, &instance.container_id).await {
            result.record_failure(ResourceKind::Container, &instance.name, e.to_string());
            return Err(e);
        }
        debug!(container = %instance.name, "Instance removed");
        result.record_change(ResourceKind::Container, &instance.name, ChangeAction::Removed);
        Ok(())
    }

    /// Forced removal; a container that is already gone counts as removed.
    async fn remove_container(&self, ctx: &OperationContext, id: &str) -> Result<()> {
        ctx.run(async {
            match self.engine.remove_container(id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn provision(
        &self,
        ctx: &OperationContext,
        project: &str,
        spec: &ServiceSpec,
        index: u32,
    ) -> Provisioned {
        let container = match labels::container_spec(project, spec, index) {
            Ok(container) => container,
            Err(e) => {
                return Provisioned {
                    name: labels::container_name(project, &spec.name, index),
                    index,
                    created: false,
                    error: Some(e),
                }
            }
        };
        let name = container.name.clone();
        match ctx.run(self.engine.create_container(&container)).await {
            Ok(id) => {
                debug!(container = %name, %id, "Instance created");
                let error = self.attach_and_start(ctx, project, spec, &id).await.err();
                Provisioned {
                    name,
                    index,
                    created: true,
                    error,
                }
            }
            Err(e) => Provisioned {
                name,
                index,
                created: false,
                error: Some(e),
            },
        }
    }

    async fn attach_and_start(
        &self,
        ctx: &OperationContext,
        project: &str,
        spec: &ServiceSpec,
        id: &str,
    ) -> Result<()> {
        for network in &spec.networks {
            let network = labels::network_name(project, network);
            ctx.run(
                self.engine
                    .connect_network(&network, id, std::slice::from_ref(&spec.name)),
            )
            .await?;
        }
        ctx.run(self.engine.start_container(id)).await
    }

    /// Creates instances at `indices`, at most `create_concurrency` at a time.
    async fn provision_many(
        &self,
        ctx: &OperationContext,
        project: &str,
        spec: &ServiceSpec,
        indices: Vec<u32>,
    ) -> Vec<Provisioned> {
        let pending: Vec<_> = indices
            .into_iter()
            .map(|index| self.provision(ctx, project, spec, index))
            .collect();
        let mut attempts: Vec<Provisioned> = stream::iter(pending)
            .buffer_unordered(self.config.create_concurrency.max(1))
            .collect()
            .await;
        attempts.sort_by_key(|attempt| attempt.index);
        attempts
    }
}

fn record_provisioned(provisioned: Provisioned, result: &mut OperationResult) -> Result<()> {
    if provisioned.created {
        result.record_change(ResourceKind::Container, &provisioned.name, ChangeAction::Created);
    }
    match provisioned.error {
        None => {
            info!(container = %provisioned.name, "Instance started");
            result.record_change(ResourceKind::Container, &provisioned.name, ChangeAction::Started);
            Ok(())
        }
        Some(e) => {
            result.record_failure(ResourceKind::Container, &provisioned.name, e.to_string());
            Err(e)
        }
    }
}

/// Concurrent creations fail individually; each failure is recorded, none aborts the rest.
fn absorb_attempts(
    attempts: Vec<Provisioned>,
    outcome: &mut ServiceOutcome,
    result: &mut OperationResult,
) {
    for attempt in attempts {
        let name = attempt.name.clone();
        if attempt.created {
            outcome.created += 1;
        }
        match record_provisioned(attempt, result) {
            Ok(()) => outcome.running += 1,
            Err(e) => outcome.errors.push(format!("{name}: {e}")),
        }
    }
}

fn running_count(instances: &[ServiceInstance]) -> usize {
    instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .count()
}

/// The `count` lowest indices not in `occupied`.
pub fn free_indices(occupied: &BTreeSet<u32>, count: usize) -> Vec<u32> {
    (0u32..)
        .filter(|index| !occupied.contains(index))
        .take(count)
        .collect()
}

fn instance_lines(
    chunks: EngineStream<LogChunk>,
    service: String,
    index: u32,
) -> BoxStream<'static, LogLine> {
    let ended = LogLine {
        service: service.clone(),
        instance_index: index,
        timestamp: None,
        source: LogSource::Ended,
        text: String::new(),
    };
    chunks
        .inspect(move |chunk| {
            if let Err(e) = chunk {
                debug!(index, error = %e, "Instance log stream ended with error");
            }
        })
        .take_while(|chunk| future::ready(chunk.is_ok()))
        .filter_map(move |chunk| {
            future::ready(chunk.ok().map(|chunk| LogLine {
                service: service.clone(),
                instance_index: index,
                timestamp: chunk.timestamp.or_else(|| Some(Utc::now())),
                source: chunk.source,
                text: chunk.message,
            }))
        })
        .chain(stream::once(future::lazy(move |_| LogLine {
            timestamp: Some(Utc::now()),
            ..ended
        })))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_indices_fill_gaps_first() {
        let occupied = BTreeSet::from([0, 2, 3]);
        assert_eq!(free_indices(&occupied, 3), vec![1, 4, 5]);
        assert_eq!(free_indices(&BTreeSet::new(), 2), vec![0, 1]);
        assert!(free_indices(&occupied, 0).is_empty());
    }

    #[test]
    fn test_logs_options_default_follows_without_history() {
        let options = LogsOptions::default();
        assert!(options.follow);
        assert_eq!(options.tail, Some(0));
    }
}
