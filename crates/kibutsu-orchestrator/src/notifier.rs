//! Change notification fan-out
//!
//! Mutating operations publish one `ChangeEvent` per touched (kind, action) pair; subscribers
//! (the dashboard push channel) receive them over a broadcast channel. Delivery is best-effort:
//! no replay, and a lagging subscriber skips what it missed.

use std::sync::Arc;

use futures::StreamExt;
use kibutsu_common::{ChangeAction, ChangeEvent, OperationResult};
use kibutsu_engine::{EngineEvent, EngineGateway};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::labels::{managed_filter, ResourceIdentity};
use crate::serializer::OperationSerializer;

/// Broadcast channel buffer size
const BROADCAST_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    events_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(BROADCAST_BUFFER_SIZE)
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self { events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events_tx.receiver_count()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        // Err only means nobody is listening
        self.events_tx.send(event).unwrap_or(0)
    }

    /// Emits one event per resource category the operation touched.
    pub fn publish_result(&self, result: &OperationResult) -> usize {
        let mut published = 0;
        for (kind, action) in result.touched_categories() {
            self.publish(ChangeEvent {
                kind,
                project: result.project.clone(),
                action,
            });
            published += 1;
        }
        debug!(project = %result.project, published, "Change events published");
        published
    }

    /// Forwards container transitions the engine reports on its own (crashes, manual
    /// `docker stop`) for projects that are not mid-operation. Transitions caused by an
    /// operation are already covered by `publish_result`.
    pub fn watch_engine(
        &self,
        engine: Arc<dyn EngineGateway>,
        serializer: OperationSerializer,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let notifier = self.clone();
        let mut events = engine.events(&managed_filter());
        tokio::spawn(async move {
            info!("Watching engine events");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            if let Some(change) = translate(&event) {
                                if serializer.is_busy(&change.project) {
                                    continue;
                                }
                                notifier.publish(change);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Engine event stream failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Engine event watcher stopped");
        })
    }
}

fn translate(event: &EngineEvent) -> Option<ChangeEvent> {
    let identity = ResourceIdentity::parse(&event.labels)?;
    let action = match event.action.as_str() {
        "create" => ChangeAction::Created,
        "start" | "restart" | "unpause" => ChangeAction::Started,
        "die" | "stop" | "kill" | "oom" | "pause" => ChangeAction::Stopped,
        "destroy" => ChangeAction::Removed,
        _ => return None,
    };
    Some(ChangeEvent {
        kind: event.kind,
        project: identity.project().to_string(),
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibutsu_common::{OperationKind, ResourceKind};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_publish_result_emits_one_event_per_category() {
        let notifier = ChangeNotifier::default();
        let mut rx = notifier.subscribe();

        let mut result = OperationResult::new("demo", OperationKind::Up);
        result.record_change(ResourceKind::Network, "demo_default", ChangeAction::Created);
        result.record_change(ResourceKind::Container, "demo_web_0", ChangeAction::Created);
        result.record_change(ResourceKind::Container, "demo_web_1", ChangeAction::Created);
        result.record_change(ResourceKind::Container, "demo_web_0", ChangeAction::Started);

        assert_eq!(notifier.publish_result(&result), 3);
        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push((event.kind, event.action));
        }
        assert_eq!(
            received,
            vec![
                (ResourceKind::Container, ChangeAction::Created),
                (ResourceKind::Container, ChangeAction::Started),
                (ResourceKind::Network, ChangeAction::Created),
            ]
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = ChangeNotifier::default();
        let delivered = notifier.publish(ChangeEvent {
            kind: ResourceKind::Volume,
            project: "demo".into(),
            action: ChangeAction::Removed,
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_translate_engine_actions() {
        let event = EngineEvent {
            kind: ResourceKind::Container,
            action: "die".into(),
            id: "abc".into(),
            labels: HashMap::from([("io.kibutsu.project".to_string(), "demo".to_string())]),
        };
        let change = translate(&event).unwrap();
        assert_eq!(change.project, "demo");
        assert_eq!(change.action, ChangeAction::Stopped);

        let ignored = EngineEvent {
            action: "exec_start".into(),
            ..event
        };
        assert!(translate(&ignored).is_none());
    }
}
