// Event Bus
// Persist-then-broadcast: an event reaches subscribers only after its row is
// in the store, and emits are serialized so delivery order equals append order.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use astra_types::{Event, EventLevel, EventType};

use crate::error::Result;
use crate::storage::SqliteStore;

#[derive(Clone)]
pub struct EventBus {
    store: Arc<SqliteStore>,
    tx: broadcast::Sender<Event>,
    emit_lock: Arc<Mutex<()>>,
}

impl EventBus {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            store,
            tx,
            emit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit(
        &self,
        run_id: &str,
        event_type: EventType,
        message: &str,
        payload: Value,
        level: EventLevel,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<Event> {
        let _guard = self.emit_lock.lock().await;
        let event = self
            .store
            .append_event(run_id, event_type, message, &payload, level, task_id, step_id)
            .await?;
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    /// info-level emit without task/step attribution.
    pub async fn emit_info(
        &self,
        run_id: &str,
        event_type: EventType,
        message: &str,
        payload: Value,
    ) -> Result<Event> {
        self.emit(run_id, event_type, message, payload, EventLevel::Info, None, None)
            .await
    }

    /// Bounded replay for late subscribers, in append order.
    pub async fn replay(&self, run_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.store.list_events(run_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_sees_events_in_append_order() {
        let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
        let bus = EventBus::new(store.clone());
        let mut rx = bus.subscribe();

        for i in 0..4 {
            bus.emit_info("run-1", EventType::TaskProgress, "tick", json!({ "i": i }))
                .await
                .unwrap();
        }

        let mut last_id = 0;
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            assert!(event.id > last_id);
            last_id = event.id;
        }

        let stored = store.list_events("run-1", 10).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored.last().unwrap().id, last_id);
    }

    #[tokio::test]
    async fn replay_returns_last_n() {
        let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
        let bus = EventBus::new(store);
        for i in 0..6 {
            bus.emit_info("run-1", EventType::TaskProgress, "tick", json!({ "i": i }))
                .await
                .unwrap();
        }
        let replayed = bus.replay("run-1", 2).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].payload["i"], 5);
    }
}
