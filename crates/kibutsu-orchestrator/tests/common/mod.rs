//! Shared fixtures for orchestrator tests
#![allow(dead_code)]

use kibutsu_common::{ProjectDescriptor, ServiceSpec};
use kibutsu_engine::{EngineGateway, MemoryEngine};
use kibutsu_orchestrator::{Orchestrator, OrchestratorConfig};
use std::sync::Arc;

pub fn setup() -> (Arc<MemoryEngine>, Orchestrator) {
    let engine = Arc::new(MemoryEngine::new());
    let gateway: Arc<dyn EngineGateway> = engine.clone();
    let orchestrator = Orchestrator::with_config(gateway, OrchestratorConfig::default());
    (engine, orchestrator)
}

pub fn web(replicas: u32) -> ServiceSpec {
    ServiceSpec::new("web", "nginx:latest").with_replicas(replicas)
}

pub fn project(name: &str, services: Vec<ServiceSpec>) -> ProjectDescriptor {
    ProjectDescriptor {
        name: name.to_string(),
        services,
    }
}

pub fn demo(replicas: u32) -> ProjectDescriptor {
    project("demo", vec![web(replicas)])
}
