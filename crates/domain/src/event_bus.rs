use tokio::sync::broadcast;
use tracing::trace;

use crate::events::{DomainEvent, PoolEvent, PoolEventKind};

/// 事件总线
///
/// 基于 `broadcast` 通道，没有订阅者时发布的事件直接丢弃；
/// 处理过慢的订阅者会丢失最旧的事件，不会阻塞发布方。
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, kind: impl Into<PoolEventKind>) {
        let event = PoolEvent::new(kind.into());
        trace!(
            "发布事件: {} ({})",
            event.event_type(),
            event.aggregate_id()
        );
        // 没有订阅者时返回错误，忽略即可
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskEvent;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(TaskEvent::Cancelled {
            task_id: "t-1".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(TaskEvent::CancelRequested {
            task_id: "t-1".to_string(),
        });
        bus.publish(TaskEvent::Cancelled {
            task_id: "t-1".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap().event_type(), "TaskCancelRequested");
        assert_eq!(rx.recv().await.unwrap().event_type(), "TaskCancelled");
    }
}
