use crate::types::EngineEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; publishing is fire-and-forget.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunId;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        // Must not panic or error with nobody listening.
        bus.publish(EngineEvent::ExecutionStarted {
            run_id: RunId::new(),
            ensemble: "e".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::StepStarted {
            run_id: RunId::from_str("r"),
            step: "a".into(),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::StepStarted { step, .. } => assert_eq!(step, "a"),
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
