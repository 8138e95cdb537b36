//! Request Consumer
//!
//! Pulls recharge requests from the request queue with manual acknowledgement
//! and hands each decoded message to a [`MessageHandler`].
//!
//! # Delivery outcomes
//!
//! | Outcome                         | Action                                         |
//! |---------------------------------|------------------------------------------------|
//! | handler ok                      | ack                                            |
//! | body is not valid JSON          | nack, no requeue                               |
//! | handler failed, retries left    | republish after `base × 2^retry`, then ack     |
//! | handler failed, retries spent   | nack, no requeue                               |
//!
//! Retries travel in the `x-retry-count` / `x-original-timestamp` headers, so
//! the budget survives process restarts.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::supervisor::{ReconnectScheduler, Supervised, schedule_reconnect};
use crate::broker::{
    Broker, BrokerChannel, BrokerError, ConnectionEvent, ConnectionEvents, ConnectionManager,
    DeliveryStream, MessageHeaders, MessageProperties, QueueMessage, ReconnectPolicy, Transition,
    now_millis,
};

pub const DEFAULT_REQUEST_QUEUE: &str = "recharge-queue";
const CONSUMER_CHANNEL: &str = "consumer";

/// Business-level processing failure reported by a handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BusinessFailure(pub String);

impl BusinessFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Processing failed: {0}")]
    Business(#[from] BusinessFailure),
}

/// Business logic invoked once per decoded delivery
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + Send + 'static;

    async fn handle(&self, message: Self::Message) -> Result<(), BusinessFailure>;
}

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Malformed body, dropped without requeue
    Rejected,
    /// Acked; a copy will be republished after `delay`
    RetryScheduled { attempt: u32, delay: Duration },
    /// Retry budget exhausted, dropped without requeue
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub prefetch: u16,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_REQUEST_QUEUE.to_string(),
            prefetch: 1,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            reconnect: ReconnectPolicy::unbounded(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsumerConfig {
    /// Republish delay for a message that has already been retried `retry_count` times
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub should_reconnect: bool,
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Clone)]
struct Link {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

struct ConsumerInner<H: MessageHandler> {
    config: ConsumerConfig,
    manager: ConnectionManager,
    scheduler: ReconnectScheduler,
    handler: Arc<H>,
    consumer_tag: String,
    link: Mutex<Option<Link>>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

pub struct Consumer<H: MessageHandler> {
    inner: Arc<ConsumerInner<H>>,
    _handler: PhantomData<fn() -> H>,
}

impl<H: MessageHandler> Clone for Consumer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _handler: PhantomData,
        }
    }
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig, handler: Arc<H>) -> Self {
        let manager = ConnectionManager::new(
            "consumer",
            broker,
            config.reconnect,
            config.connect_timeout,
        );
        Self {
            inner: Arc::new(ConsumerInner {
                config,
                manager,
                scheduler: ReconnectScheduler::default(),
                handler,
                consumer_tag: format!("recharge-relay-{}", ulid::Ulid::new()),
                link: Mutex::new(None),
                consume_task: Mutex::new(None),
                watcher: Mutex::new(None),
                counters: Counters::default(),
            }),
            _handler: PhantomData,
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.config.queue
    }

    /// Subscribe; on failure keep retrying in the background
    pub async fn start(&self) {
        if let Err(e) = self.subscribe().await {
            warn!(queue = %self.inner.config.queue, error = %e, "Consumer failed to subscribe, will retry");
            schedule_reconnect(self);
        }
    }

    async fn subscribe(&self) -> Result<(), BrokerError> {
        let connected = self.inner.manager.connect().await?;
        let generation = connected.generation;
        if let Some(events) = connected.events {
            self.watch(generation, events);
        }

        let (channel, stream) = match self.open_subscription().await {
            Ok(opened) => opened,
            Err(e) => {
                self.inner
                    .manager
                    .handle_event(generation, ConnectionEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        *self.inner.link.lock() = Some(Link {
            generation,
            channel: channel.clone(),
        });

        let consumer = self.clone();
        let task = tokio::spawn(async move { consumer.consume_loop(generation, channel, stream).await });
        if let Some(previous) = self.inner.consume_task.lock().replace(task) {
            previous.abort();
        }

        info!(
            queue = %self.inner.config.queue,
            prefetch = self.inner.config.prefetch,
            generation,
            "Waiting for messages"
        );
        Ok(())
    }

    async fn open_subscription(
        &self,
    ) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), BrokerError> {
        let config = &self.inner.config;
        let (_, channel) = self
            .inner
            .manager
            .create_channel(Some(CONSUMER_CHANNEL))
            .await?;
        channel.prefetch(config.prefetch).await?;
        channel.assert_queue(&config.queue, true).await?;
        let stream = channel
            .consume(&config.queue, &self.inner.consumer_tag)
            .await?;
        Ok((channel, stream))
    }

    fn watch(&self, generation: u64, mut events: ConnectionEvents) {
        let consumer = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                consumer.on_link_event(generation, event);
            }
        });
        if let Some(previous) = self.inner.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn on_link_event(&self, generation: u64, event: ConnectionEvent) {
        match self.inner.manager.handle_event(generation, event) {
            Transition::Lost { reconnect } => {
                {
                    let mut link = self.inner.link.lock();
                    if link.as_ref().is_some_and(|l| l.generation == generation) {
                        *link = None;
                    }
                }
                if reconnect {
                    schedule_reconnect(self);
                }
            }
            Transition::Ignored => {}
        }
    }

    async fn consume_loop(
        self,
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
        mut stream: DeliveryStream,
    ) {
        while let Some(delivery) = stream.next().await {
            match delivery {
                Ok(message) => {
                    self.process_message(&channel, message).await;
                }
                Err(e) => {
                    warn!(error = %e, "Delivery stream failed");
                    break;
                }
            }
        }

        if self.inner.manager.state().is_shutting_down() {
            debug!("Delivery stream ended during shutdown");
            return;
        }
        self.on_link_event(
            generation,
            ConnectionEvent::Error("delivery stream ended".to_string()),
        );
    }

    fn decode(body: &[u8]) -> Result<H::Message, ProcessError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Decode, dispatch and settle a single delivery
    pub async fn process_message(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        message: QueueMessage,
    ) -> Disposition {
        let counters = &self.inner.counters;
        let tag = message.delivery_tag;
        let retry_count = message.headers.retry_count();

        let decoded = match Self::decode(&message.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(delivery_tag = tag, error = %e, "Rejecting malformed message");
                settle(channel.nack(tag, false).await, tag, "nack");
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Disposition::Rejected;
            }
        };

        let failure = match self.inner.handler.handle(decoded).await {
            Ok(()) => {
                settle(channel.ack(tag).await, tag, "ack");
                counters.processed.fetch_add(1, Ordering::Relaxed);
                return Disposition::Acked;
            }
            Err(failure) => ProcessError::from(failure),
        };

        let max_retries = self.inner.config.max_retries;
        if retry_count < max_retries {
            let attempt = retry_count + 1;
            let delay = self.inner.config.retry_delay(retry_count);
            let original = message.headers.original_timestamp().unwrap_or_else(now_millis);
            warn!(
                delivery_tag = tag,
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Processing failed, scheduling retry"
            );
            self.schedule_republish(
                message.body,
                MessageHeaders::for_retry(attempt, original),
                delay,
            );
            settle(channel.ack(tag).await, tag, "ack");
            counters.retried.fetch_add(1, Ordering::Relaxed);
            Disposition::RetryScheduled { attempt, delay }
        } else {
            error!(
                delivery_tag = tag,
                retry_count,
                error = %failure,
                "Retry budget exhausted, dead-lettering message"
            );
            settle(channel.nack(tag, false).await, tag, "nack");
            counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            Disposition::DeadLettered
        }
    }

    /// Republish `body` to the request queue once `delay` has elapsed.
    ///
    /// Uses whichever channel is current at that point, waiting for the link
    /// to come back if necessary; shutdown abandons the copy.
    fn schedule_republish(&self, body: Vec<u8>, headers: MessageHeaders, delay: Duration) {
        let consumer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let queue = &consumer.inner.config.queue;
            let properties = MessageProperties {
                persistent: true,
                content_type: Some("application/json".to_string()),
                timestamp: u64::try_from(now_millis()).ok(),
                headers,
                ..Default::default()
            };

            loop {
                if consumer.inner.manager.state().is_shutting_down() {
                    error!(queue = %queue, retry_count = properties.headers.retry_count(), "Shutdown before retry could be republished, message dropped");
                    return;
                }
                let generation = consumer.inner.manager.generation();
                if let Some(channel) = consumer.current_channel() {
                    match channel.publish(queue, &body, &properties).await {
                        Ok(()) => {
                            debug!(queue = %queue, retry_count = properties.headers.retry_count(), "Retry republished");
                            return;
                        }
                        Err(e) if e.is_link_failure() => {
                            warn!(queue = %queue, error = %e, "Retry republish lost the link");
                            consumer.on_link_event(generation, ConnectionEvent::Error(e.to_string()));
                        }
                        Err(e) => warn!(queue = %queue, error = %e, "Retry republish failed"),
                    }
                }
                tokio::time::sleep(consumer.inner.config.retry_base_delay).await;
            }
        });
    }

    fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        if !self.inner.manager.state().is_connected() {
            return None;
        }
        self.inner
            .link
            .lock()
            .as_ref()
            .filter(|l| l.generation == self.inner.manager.generation() && l.channel.is_open())
            .map(|l| l.channel.clone())
    }

    /// Stop consuming and close the link; no reconnect happens afterwards
    pub async fn close(&self) {
        self.inner.manager.begin_shutdown();
        self.inner.scheduler.cancel();
        *self.inner.link.lock() = None;
        self.inner.manager.close().await;
        if let Some(task) = self.inner.consume_task.lock().take() {
            task.abort();
        }
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
        info!(queue = %self.inner.config.queue, "Consumer closed");
    }

    pub fn is_healthy(&self) -> bool {
        self.current_channel()
            .is_some_and(|c| !c.is_closing())
    }

    pub fn stats(&self) -> ConsumerStats {
        let state = self.inner.manager.state();
        let counters = &self.inner.counters;
        ConsumerStats {
            is_connected: state.is_connected(),
            reconnect_attempts: state.reconnect_attempts(),
            should_reconnect: !state.is_shutting_down(),
            processed: counters.processed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }
}

fn settle(result: Result<(), BrokerError>, delivery_tag: u64, op: &str) {
    if let Err(e) = result {
        // The broker redelivers anything left unsettled once the channel closes
        warn!(delivery_tag, op, error = %e, "Failed to settle delivery");
    }
}

impl<H: MessageHandler> Supervised for Consumer<H> {
    fn role(&self) -> &'static str {
        "consumer"
    }

    fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    fn scheduler(&self) -> &ReconnectScheduler {
        &self.inner.scheduler
    }

    async fn establish(&self) -> Result<(), BrokerError> {
        self.subscribe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Deserialize)]
    struct Job {
        id: u32,
    }

    /// Fails every job whose id is listed; counts calls
    #[derive(Default)]
    struct FlakyHandler {
        failing: Mutex<Vec<u32>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        type Message = Job;

        async fn handle(&self, job: Job) -> Result<(), BusinessFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(&job.id) {
                return Err(BusinessFailure::new(format!("job {} failed", job.id)));
            }
            Ok(())
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            queue: "requests".to_string(),
            retry_base_delay: Duration::from_millis(5),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_attempts: None,
            },
            ..Default::default()
        }
    }

    fn consumer(broker: &InMemoryBroker, handler: Arc<FlakyHandler>) -> Consumer<FlakyHandler> {
        Consumer::new(Arc::new(broker.clone()), config(), handler)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = ConsumerConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_secs(1));
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FlakyHandler::default());
        let consumer = consumer(&broker, handler.clone());
        consumer.start().await;

        broker.inject("requests", br#"{"id":1}"#, MessageHeaders::new());
        eventually(|| broker.acked_count() == 1).await;
        assert_eq!(consumer.stats().processed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(consumer.is_healthy());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected_without_handler() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FlakyHandler::default());
        let consumer = consumer(&broker, handler.clone());
        consumer.start().await;

        broker.inject("requests", b"not json", MessageHeaders::new());
        eventually(|| broker.dead_lettered().len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(consumer.stats().rejected, 1);
        assert!(broker.ready_messages("requests").is_empty());
    }

    #[tokio::test]
    async fn test_failures_retry_with_headers_then_dead_letter() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FlakyHandler::default());
        handler.failing.lock().push(7);
        let consumer = consumer(&broker, handler.clone());
        consumer.start().await;

        broker.inject("requests", br#"{"id":7}"#, MessageHeaders::new());
        eventually(|| broker.dead_lettered().len() == 1).await;

        // first delivery plus three retries
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        let retries: Vec<_> = broker
            .published("requests")
            .iter()
            .map(|r| r.properties.headers.retry_count())
            .collect();
        assert_eq!(retries, vec![1, 2, 3]);

        let originals: Vec<_> = broker
            .published("requests")
            .iter()
            .map(|r| r.properties.headers.original_timestamp())
            .collect();
        assert!(originals.iter().all(|ts| ts.is_some() && *ts == originals[0]));

        let stats = consumer.stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_lettered()[0].headers.retry_count(), 3);
    }

    #[tokio::test]
    async fn test_direct_dispositions() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FlakyHandler::default());
        handler.failing.lock().push(2);
        let consumer = consumer(&broker, handler);

        let (conn, _events) = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.assert_queue("inbox", true).await.unwrap();
        let mut stream = channel.consume("inbox", "t").await.unwrap();

        broker.inject("inbox", br#"{"id":2}"#, MessageHeaders::for_retry(1, 42));
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(
            consumer.process_message(&channel, msg).await,
            Disposition::RetryScheduled {
                attempt: 2,
                delay: Duration::from_millis(10)
            }
        );

        broker.inject("inbox", br#"{"id":2}"#, MessageHeaders::for_retry(3, 42));
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(
            consumer.process_message(&channel, msg).await,
            Disposition::DeadLettered
        );
    }

    #[tokio::test]
    async fn test_resubscribes_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(FlakyHandler::default());
        let consumer = consumer(&broker, handler);
        consumer.start().await;

        broker.disconnect_all();
        eventually(|| broker.connect_attempts() == 2 && consumer.is_healthy()).await;

        broker.inject("requests", br#"{"id":3}"#, MessageHeaders::new());
        eventually(|| broker.acked_count() == 1).await;
        assert_eq!(consumer.stats().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, Arc::new(FlakyHandler::default()));
        consumer.start().await;

        consumer.close().await;
        consumer.close().await;
        let stats = consumer.stats();
        assert!(!stats.should_reconnect);
        assert!(!stats.is_connected);
        assert_eq!(broker.open_connections(), 0);

        broker.inject("requests", br#"{"id":1}"#, MessageHeaders::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.acked_count(), 0);
        assert_eq!(broker.connect_attempts(), 1);
    }
}
