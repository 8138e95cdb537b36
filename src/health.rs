//! Liveness snapshot combining both transport roles

use serde::Serialize;

use crate::messaging::{Consumer, ConsumerStats, MessageHandler, Producer, ProducerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub producer_healthy: bool,
    pub consumer_healthy: bool,
    pub producer: ProducerStats,
    pub consumer: ConsumerStats,
}

impl HealthReport {
    pub fn collect<H: MessageHandler>(producer: &Producer, consumer: &Consumer<H>) -> Self {
        let producer_healthy = producer.is_healthy();
        let consumer_healthy = consumer.is_healthy();
        Self {
            healthy: producer_healthy && consumer_healthy,
            producer_healthy,
            consumer_healthy,
            producer: producer.stats(),
            consumer: consumer.stats(),
        }
    }

    /// Log at info when healthy, warn otherwise
    pub fn log(&self) {
        let report = serde_json::to_string(self).unwrap_or_default();
        if self.healthy {
            tracing::info!(report = %report, "Health report");
        } else {
            tracing::warn!(
                producer_healthy = self.producer_healthy,
                consumer_healthy = self.consumer_healthy,
                buffered = self.producer.buffered_messages,
                report = %report,
                "Health report: degraded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::messaging::{BusinessFailure, ConsumerConfig, ProducerConfig};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        type Message = serde_json::Value;

        async fn handle(&self, _message: serde_json::Value) -> Result<(), BusinessFailure> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_report_reflects_both_roles() {
        let broker = InMemoryBroker::new();
        let producer = Producer::new(Arc::new(broker.clone()), ProducerConfig::default());
        let consumer = Consumer::new(
            Arc::new(broker.clone()),
            ConsumerConfig::default(),
            Arc::new(Noop),
        );

        let before = HealthReport::collect(&producer, &consumer);
        assert!(!before.healthy);

        producer.start().await;
        consumer.start().await;
        let running = HealthReport::collect(&producer, &consumer);
        assert!(running.healthy);
        assert!(running.producer.is_connected);
        assert!(running.consumer.should_reconnect);

        let value = serde_json::to_value(running).unwrap();
        assert_eq!(value["producer"]["buffered_messages"], 0);

        producer.close().await;
        consumer.close().await;
        let closed = HealthReport::collect(&producer, &consumer);
        assert!(!closed.healthy);
        assert!(closed.producer.is_shutting_down);
        assert!(!closed.consumer.should_reconnect);
    }
}
