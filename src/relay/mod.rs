//! Task-lifecycle notification relay.
//!
//! The worker calls `on_start`/`on_finish` directly on an injected relay
//! instance; there is no implicit event wiring. Published events go through
//! the `EventBus` seam so tests can observe them without a socket.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{instrument, warn};

use crate::db::{self, Pool, TaskRef};
use crate::error::{SyncError, SyncResult};
use crate::model::{Notification, SyncTask, TaskStatus};

pub mod ws;

/// Broadcast topic carrying every started/completed event. Filtering to
/// "is this mine" is the client's job.
pub const NOTIFICATIONS_TOPIC: &str = "notifications";

/// Generic publish/subscribe primitive.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: String);
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: String,
}

/// Fan-out bus over a tokio broadcast channel. Lagging or absent
/// subscribers never block a publisher.
pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, topic: &str, payload: String) {
        // send only fails when there are no subscribers; that's fine.
        let _ = self.tx.send(BusEvent {
            topic: topic.to_string(),
            payload,
        });
    }
}

/// Relays task lifecycle to subscribed clients and records the durable
/// notification rows they acknowledge against.
#[derive(Clone)]
pub struct NotificationRelay {
    pool: Pool,
    bus: Arc<dyn EventBus>,
    settle_delay: Duration,
}

impl NotificationRelay {
    pub fn new(pool: Pool, bus: Arc<dyn EventBus>, settle_delay: Duration) -> Self {
        Self {
            pool,
            bus,
            settle_delay,
        }
    }

    /// Serialized notification shape shared by started and completed
    /// events. `extras` is the stored JSON object, `"{}"` when absent.
    pub fn serialize(notification: &Notification) -> Value {
        let extras = match notification.extras.as_deref() {
            Some(raw) => serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            None => Value::String("{}".to_string()),
        };
        json!({
            "id": notification.id,
            "user_id": notification.user_id,
            "resource_id": notification.resource_id,
            "resource": notification.resource,
            "operation": notification.operation,
            "task_id": notification.task_id,
            "extras": extras,
        })
    }

    fn publish_event(&self, event: &str, notification: &Notification) {
        let payload = json!({
            "event": event,
            "status": notification.status.as_str(),
            "notification": Self::serialize(notification),
        });
        self.bus.publish(NOTIFICATIONS_TOPIC, payload.to_string());
    }

    /// Lifecycle hook: a task is about to run. Creates the notification row
    /// and publishes the started event.
    #[instrument(skip_all, fields(task_id = task.id))]
    pub async fn on_start(&self, task: &SyncTask) -> SyncResult<Notification> {
        let notification = db::create_notification(
            &self.pool,
            task.user_id,
            &TaskRef::Task(task.id),
            Some(task.kind.resource()),
            task.external_id.as_deref(),
            task.kind.as_str(),
        )
        .await
        .map_err(SyncError::Other)?;
        self.publish_event("started", &notification);
        Ok(notification)
    }

    /// Lifecycle hook: a task reached a terminal state. Waits out the
    /// settling delay so an asynchronously-written result payload lands,
    /// refreshes the row, then publishes the completed event.
    #[instrument(skip_all, fields(task_id = task.id, status = status.as_str()))]
    pub async fn on_finish(&self, task: &SyncTask, status: TaskStatus) -> SyncResult<()> {
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }

        let Some(notification) = db::notification_for_task(&self.pool, task.id)
            .await
            .map_err(SyncError::Other)?
        else {
            warn!(task_id = task.id, "no notification to complete");
            return Ok(());
        };
        db::update_notification_status(&self.pool, notification.id, status, None)
            .await
            .map_err(SyncError::Other)?;
        let Some(notification) = db::get_notification(&self.pool, notification.id)
            .await
            .map_err(SyncError::Other)?
        else {
            return Ok(());
        };
        self.publish_event("completed", &notification);
        Ok(())
    }

    /// Group variant of `on_start`, for callers tracking a task group as a
    /// single client-facing unit.
    #[instrument(skip_all, fields(group_key))]
    pub async fn on_start_group(
        &self,
        user_id: i64,
        group_key: &str,
        operation: &str,
    ) -> SyncResult<Notification> {
        let notification = db::create_notification(
            &self.pool,
            user_id,
            &TaskRef::Group(group_key.to_string()),
            None,
            None,
            operation,
        )
        .await
        .map_err(SyncError::Other)?;
        self.publish_event("started", &notification);
        Ok(notification)
    }

    /// Group variant of `on_finish`.
    #[instrument(skip_all, fields(group_key, status = status.as_str()))]
    pub async fn on_finish_group(&self, group_key: &str, status: TaskStatus) -> SyncResult<()> {
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }
        let Some(notification) = db::notification_for_group(&self.pool, group_key)
            .await
            .map_err(SyncError::Other)?
        else {
            warn!(group_key, "no group notification to complete");
            return Ok(());
        };
        db::update_notification_status(&self.pool, notification.id, status, None)
            .await
            .map_err(SyncError::Other)?;
        if let Some(notification) = db::get_notification(&self.pool, notification.id)
            .await
            .map_err(SyncError::Other)?
        {
            self.publish_event("completed", &notification);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    #[test]
    fn serialize_absent_extras_as_string() {
        let n = Notification {
            id: 1,
            user_id: 2,
            task_id: Some(3),
            group_key: None,
            resource: Some("playlist".into()),
            resource_id: Some("p1".into()),
            operation: "sync-playlist".into(),
            status: TaskStatus::Running,
            extras: None,
        };
        let v = NotificationRelay::serialize(&n);
        assert_eq!(v["extras"], "{}");
        assert_eq!(v["resource"], "playlist");
        assert_eq!(v["task_id"], 3);
    }

    #[test]
    fn serialize_parses_stored_extras() {
        let n = Notification {
            id: 1,
            user_id: 2,
            task_id: Some(3),
            group_key: None,
            resource: None,
            resource_id: None,
            operation: "compute".into(),
            status: TaskStatus::Success,
            extras: Some(r#"{"tracks": 12}"#.into()),
        };
        let v = NotificationRelay::serialize(&n);
        assert_eq!(v["extras"]["tracks"], 12);
    }

    #[tokio::test]
    async fn broadcast_bus_fans_out_to_all_subscribers() {
        let bus = BroadcastBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(NOTIFICATIONS_TOPIC, "hello".into());

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.payload, "hello");
        assert_eq!(e2.payload, "hello");
        assert_eq!(e1.topic, NOTIFICATIONS_TOPIC);
    }
}
