//! Partial failure, contention and cancellation

mod common;

use common::{demo, project, setup, web};
use kibutsu_common::{ApplyStatus, ComposeError, LogSource, OperationKind, ServiceSpec};
use kibutsu_engine::{EngineGateway, EngineOp};
use kibutsu_orchestrator::{LogsOptions, OperationContext};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_up_is_rejected() {
    let (engine, orchestrator) = setup();
    engine.set_latency(Duration::from_millis(20));
    let descriptor = demo(2);
    let (first_ctx, second_ctx) = (OperationContext::new(), OperationContext::new());

    let (first, second) = tokio::join!(
        orchestrator.up(&first_ctx, &descriptor),
        orchestrator.up(&second_ctx, &descriptor)
    );

    let first = first.unwrap();
    assert_eq!(first.status, ApplyStatus::Applied);
    match second {
        Err(ComposeError::ProjectBusy { project, operation }) => {
            assert_eq!(project, "demo");
            assert_eq!(operation, OperationKind::Up);
        }
        other => panic!("expected ProjectBusy, got {other:?}"),
    }
    assert_eq!(engine.containers().len(), 2);
    assert!(!orchestrator.serializer().is_busy("demo"));
}

#[tokio::test]
async fn test_other_projects_are_not_blocked() {
    let (engine, orchestrator) = setup();
    engine.set_latency(Duration::from_millis(5));
    let ctx = OperationContext::new();
    let demo_project = demo(1);
    let other_project = project("other", vec![web(1)]);
    let (demo_result, other_result) = tokio::join!(
        orchestrator.up(&ctx, &demo_project),
        orchestrator.up(&ctx, &other_project)
    );
    assert!(demo_result.unwrap().is_applied());
    assert!(other_result.unwrap().is_applied());
}

#[tokio::test]
async fn test_failed_creation_keeps_applied_instances() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();
    engine.fail(EngineOp::CreateContainer, "demo_web_1", 1);

    let result = orchestrator.up(&ctx, &demo(3)).await?;
    assert_eq!(result.status, ApplyStatus::PartiallyApplied);
    let web = &result.services[0];
    assert_eq!(web.status, ApplyStatus::PartiallyApplied);
    assert_eq!(web.created, 2);
    assert_eq!(web.running, 2);
    assert_eq!(web.errors.len(), 1);
    assert!(web.errors[0].contains("demo_web_1"));
    assert_eq!(result.failures.len(), 1);
    assert!(matches!(
        result.clone().into_result(),
        Err(ComposeError::PartialFailure(_))
    ));

    let view = orchestrator.get("demo").await?;
    let indices: Vec<u32> = view.instances("web").iter().map(|i| i.index).collect();
    assert_eq!(indices, vec![0, 2]);

    // A retry fills the hole
    let retry = orchestrator.up(&ctx, &demo(3)).await?;
    assert!(retry.is_applied());
    assert_eq!(retry.services[0].created, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_service_does_not_stop_the_next() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();
    engine.mark_image_missing("broken:latest");
    let descriptor = project(
        "demo",
        vec![
            ServiceSpec::new("web", "broken:latest"),
            ServiceSpec::new("db", "postgres:16"),
        ],
    );

    let result = orchestrator.up(&ctx, &descriptor).await?;
    assert_eq!(result.status, ApplyStatus::PartiallyApplied);
    assert_eq!(result.services[0].service, "web");
    assert_eq!(result.services[0].status, ApplyStatus::Failed);
    assert_eq!(result.services[1].service, "db");
    assert_eq!(result.services[1].status, ApplyStatus::Applied);
    Ok(())
}

#[tokio::test]
async fn test_network_failure_fails_every_service() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    engine.fail(EngineOp::CreateNetwork, "demo_default", 1);

    let result = orchestrator.up(&OperationContext::new(), &demo(2)).await?;
    assert_eq!(result.status, ApplyStatus::Failed);
    assert_eq!(result.services[0].status, ApplyStatus::Failed);
    assert!(engine.containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unowned_network_is_not_adopted() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    engine.create_network("shop_backend", &HashMap::new()).await?;
    let mut api = ServiceSpec::new("api", "api:latest");
    api.networks.push("backend".into());

    let ctx = OperationContext::new();
    let result = orchestrator
        .up(&ctx, &project("shop", vec![api, web(1)]))
        .await?;
    assert_eq!(result.status, ApplyStatus::PartiallyApplied);
    assert_eq!(result.services[0].status, ApplyStatus::Failed);
    assert!(result.services[0].errors[0].contains("shop_backend"));
    assert_eq!(result.services[1].status, ApplyStatus::Applied);
    assert!(result.failures.iter().any(|f| f.name == "shop_backend"));
    assert!(engine.container("shop_api_0").is_none());

    let down = orchestrator.down(&ctx, "shop", false).await?;
    assert_eq!(down.status, ApplyStatus::Applied);
    assert_eq!(engine.network_names(), vec!["shop_backend".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_default_network_of_another_owner_fails_up() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    let foreign = HashMap::from([(
        kibutsu_orchestrator::labels::PROJECT_LABEL.to_string(),
        "elsewhere".to_string(),
    )]);
    engine.create_network("demo_default", &foreign).await?;

    let result = orchestrator.up(&OperationContext::new(), &demo(1)).await?;
    assert_eq!(result.status, ApplyStatus::Failed);
    assert!(result.services[0].errors[0].contains("does not belong"));
    assert!(engine.containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_project_names_reject_separator() {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();

    let up = orchestrator.up(&ctx, &project("a_b", vec![web(1)])).await;
    assert!(matches!(up, Err(ComposeError::InvalidName { .. })));
    let down = orchestrator.down(&ctx, "a_b", false).await;
    assert!(matches!(down, Err(ComposeError::InvalidName { .. })));
    assert_eq!(engine.calls(EngineOp::ListContainers), 0);

    // Hyphens stay legal on both sides without producing the same container
    orchestrator.up(&ctx, &project("a-b", vec![ServiceSpec::new("c", "nginx")])).await.unwrap();
    let result = orchestrator
        .up(&ctx, &project("a", vec![ServiceSpec::new("b-c", "nginx")]))
        .await
        .unwrap();
    assert_eq!(result.status, ApplyStatus::Applied);
    assert!(engine.container("a-b_c_0").is_some());
    assert!(engine.container("a_b-c_0").is_some());
}

#[tokio::test]
async fn test_down_is_best_effort() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();
    orchestrator.up(&ctx, &demo(3)).await?;
    engine.fail(EngineOp::RemoveContainer, "demo_web_1", 1);

    let result = orchestrator.down(&ctx, "demo", false).await?;
    assert_eq!(result.status, ApplyStatus::PartiallyApplied);
    assert_eq!(result.services[0].removed, 2);
    // The surviving container keeps the network attached
    assert_eq!(result.failures.len(), 2);
    assert_eq!(engine.containers().len(), 1);

    let retry = orchestrator.down(&ctx, "demo", false).await?;
    assert!(retry.is_applied());
    assert!(engine.containers().is_empty());
    assert!(engine.network_names().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_scale_down_stops_at_first_failure() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();
    orchestrator.up(&ctx, &demo(4)).await?;
    engine.fail(EngineOp::RemoveContainer, "demo_web_2", 1);

    let result = orchestrator.scale(&ctx, "demo", "web", 1).await?;
    assert_eq!(result.status, ApplyStatus::PartiallyApplied);
    assert_eq!(result.services[0].removed, 1);
    assert!(result.warnings[0].contains("1 of 3"));

    let view = orchestrator.get("demo").await?;
    let indices: Vec<u32> = view.instances("web").iter().map(|i| i.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_scale_requires_recorded_spec() -> anyhow::Result<()> {
    let (_engine, orchestrator) = setup();
    let ctx = OperationContext::new();

    assert!(matches!(
        orchestrator.scale(&ctx, "ghost", "web", 2).await,
        Err(ComposeError::NotFound(_))
    ));

    orchestrator.up(&ctx, &demo(1)).await?;
    match orchestrator.scale(&ctx, "demo", "db", 1).await {
        Err(ComposeError::SpecUnavailable { project, service }) => {
            assert_eq!(project, "demo");
            assert_eq!(service, "db");
        }
        other => panic!("expected SpecUnavailable, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_orphans_are_reported_not_deleted() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();
    orchestrator.up(&ctx, &demo(1)).await?;
    let labels = HashMap::from([
        ("io.kibutsu.project".to_string(), "demo".to_string()),
        ("io.kibutsu.service".to_string(), "web".to_string()),
        ("io.kibutsu.index".to_string(), "first".to_string()),
    ]);
    engine.insert_container("stray-web", "nginx:latest", labels, "running");

    let result = orchestrator.up(&ctx, &demo(2)).await?;
    assert!(result.warnings.iter().any(|w| w.contains("stray-web")));
    let view = orchestrator.get("demo").await?;
    assert_eq!(view.orphans.len(), 1);
    assert_eq!(view.instances("web").len(), 2);

    orchestrator.scale(&ctx, "demo", "web", 0).await?;
    assert!(engine.container("stray-web").is_some());

    orchestrator.down(&ctx, "demo", false).await?;
    assert!(engine.container("stray-web").is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_context_rejects_before_changes() {
    let (engine, orchestrator) = setup();
    let ctx = OperationContext::new();
    ctx.cancel();
    assert!(matches!(
        orchestrator.up(&ctx, &demo(1)).await,
        Err(ComposeError::Cancelled)
    ));
    assert!(engine.containers().is_empty());
    assert!(!orchestrator.serializer().is_busy("demo"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_stops_remaining_steps() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    engine.set_latency(Duration::from_millis(50));
    let ctx = OperationContext::new().with_timeout(Duration::from_millis(120));
    let descriptor = project(
        "demo",
        vec![web(1), ServiceSpec::new("db", "postgres:16")],
    );

    let result = orchestrator.up(&ctx, &descriptor).await?;
    assert!(result
        .services
        .iter()
        .all(|s| s.status == ApplyStatus::Failed));
    assert!(result.services[0].errors[0].contains("deadline"));
    assert!(result.services[1].errors[0].contains("deadline"));
    assert!(engine.containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_logs_stop_on_cancel() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    orchestrator.up(&OperationContext::new(), &demo(2)).await?;

    let ctx = OperationContext::new();
    let mut lines = orchestrator
        .logs(&ctx, "demo", None, LogsOptions::default())
        .await?;
    assert_eq!(engine.open_log_streams(), 2);

    engine.push_log("demo_web_1", LogSource::Stdout, "hello from one");
    let line = tokio::time::timeout(Duration::from_secs(1), lines.next())
        .await?
        .unwrap();
    assert_eq!(line.service, "web");
    assert_eq!(line.instance_index, 1);
    assert_eq!(line.text, "hello from one");

    // Lines waiting on the engine side are not delivered once the context ends
    for i in 0..3 {
        engine.push_log("demo_web_0", LogSource::Stdout, &format!("line {i}"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let end = tokio::time::timeout(Duration::from_secs(1), lines.next()).await?;
    assert!(end.is_none());
    assert_eq!(engine.open_log_streams(), 0);
    Ok(())
}

#[tokio::test]
async fn test_dropping_log_stream_closes_engine_streams() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    orchestrator.up(&OperationContext::new(), &demo(2)).await?;

    let lines = orchestrator
        .logs(&OperationContext::new(), "demo", None, LogsOptions::default())
        .await?;
    assert_eq!(engine.open_log_streams(), 2);

    drop(lines);
    assert_eq!(engine.open_log_streams(), 0);
    Ok(())
}

#[tokio::test]
async fn test_removed_instance_ends_with_marker() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    orchestrator.up(&OperationContext::new(), &demo(1)).await?;

    let mut lines = orchestrator
        .logs(&OperationContext::new(), "demo", Some("web"), LogsOptions::default())
        .await?;
    engine.remove_container("demo_web_0").await?;

    let marker = tokio::time::timeout(Duration::from_secs(1), lines.next())
        .await?
        .unwrap();
    assert_eq!(marker.source, LogSource::Ended);
    assert_eq!(marker.instance_index, 0);
    let end = tokio::time::timeout(Duration::from_secs(1), lines.next()).await?;
    assert!(end.is_none());
    Ok(())
}

#[tokio::test]
async fn test_logs_replay_history_when_asked() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    orchestrator.up(&OperationContext::new(), &demo(1)).await?;
    engine.push_log("demo_web_0", LogSource::Stdout, "booted");
    engine.push_log("demo_web_0", LogSource::Stderr, "warming up");

    let options = LogsOptions {
        follow: false,
        tail: None,
    };
    let lines: Vec<_> = orchestrator
        .logs(&OperationContext::new(), "demo", Some("web"), options)
        .await?
        .collect()
        .await;
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["booted", "warming up", ""]);
    assert_eq!(lines[1].source, LogSource::Stderr);
    assert_eq!(lines[2].source, LogSource::Ended);
    Ok(())
}

#[tokio::test]
async fn test_logs_for_unknown_service() -> anyhow::Result<()> {
    let (_engine, orchestrator) = setup();
    orchestrator.up(&OperationContext::new(), &demo(1)).await?;
    let result = orchestrator
        .logs(&OperationContext::new(), "demo", Some("db"), LogsOptions::default())
        .await;
    assert!(matches!(result, Err(ComposeError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_engine_unavailable_surfaces() {
    let (engine, orchestrator) = setup();
    engine.set_unavailable(true);
    assert!(matches!(
        orchestrator.up(&OperationContext::new(), &demo(1)).await,
        Err(ComposeError::EngineUnavailable(_))
    ));
    assert!(matches!(
        orchestrator.list().await,
        Err(ComposeError::EngineUnavailable(_))
    ));
}

#[tokio::test]
async fn test_engine_watcher_forwards_out_of_band_stops() -> anyhow::Result<()> {
    let (engine, orchestrator) = setup();
    orchestrator.up(&OperationContext::new(), &demo(1)).await?;
    let mut events = orchestrator.notifier().subscribe();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let watcher = orchestrator.notifier().watch_engine(
        orchestrator.engine().clone(),
        orchestrator.serializer().clone(),
        shutdown.clone(),
    );
    tokio::task::yield_now().await;

    engine.crash("demo_web_0");
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await??;
    assert_eq!(event.project, "demo");
    assert_eq!(event.action, kibutsu_common::ChangeAction::Stopped);

    shutdown.cancel();
    watcher.await?;
    Ok(())
}
