//! Response Producer
//!
//! Publishes outcome events to the response queue with publisher confirms.
//! While the link is down, messages are appended to an in-memory FIFO buffer
//! and flushed, in order, as soon as a new channel is ready. The buffer is
//! unbounded and lives only as long as the process.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::supervisor::{ReconnectScheduler, Supervised, schedule_reconnect};
use crate::broker::{
    Broker, BrokerChannel, BrokerError, ConnectionEvent, ConnectionEvents, ConnectionManager,
    MessageHeaders, MessageProperties, ReconnectPolicy, Transition, now_millis,
};

pub const DEFAULT_RESPONSE_QUEUE: &str = "recharge-response-queue";
const PRODUCER_CHANNEL: &str = "producer";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub queue: String,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_RESPONSE_QUEUE.to_string(),
            reconnect: ReconnectPolicy::bounded(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-message publish options
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Generated (UUID v4) when absent; kept stable across re-buffering
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: MessageHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Confirmed by the broker
    Published { message_id: String },
    /// Held in the local buffer until the link is back
    Buffered { message_id: String, buffered: usize },
}

impl SendOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            SendOutcome::Published { message_id } | SendOutcome::Buffered { message_id, .. } => {
                message_id
            }
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, SendOutcome::Published { .. })
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub buffered_messages: usize,
    pub is_shutting_down: bool,
}

struct PendingMessage {
    body: Vec<u8>,
    options: PublishOptions,
}

#[derive(Clone)]
struct Link {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

struct ProducerInner {
    config: ProducerConfig,
    manager: ConnectionManager,
    scheduler: ReconnectScheduler,
    /// Serializes publishes and buffer drains
    gate: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    buffer: Mutex<VecDeque<PendingMessage>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, config: ProducerConfig) -> Self {
        let manager = ConnectionManager::new(
            "producer",
            broker,
            config.reconnect,
            config.connect_timeout,
        );
        Self {
            inner: Arc::new(ProducerInner {
                config,
                manager,
                scheduler: ReconnectScheduler::default(),
                gate: tokio::sync::Mutex::new(()),
                link: Mutex::new(None),
                buffer: Mutex::new(VecDeque::new()),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.config.queue
    }

    /// Open the link; on failure keep buffering and reconnect in the background
    pub async fn start(&self) {
        if let Err(e) = self.connect().await {
            warn!(queue = %self.inner.config.queue, error = %e, "Producer failed to connect, buffering until reconnected");
            schedule_reconnect(self);
        }
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let _gate = self.inner.gate.lock().await;

        if let Some(link) = self.current_link() {
            self.drain(&link).await;
            return Ok(());
        }

        let connected = self.inner.manager.connect().await?;
        let generation = connected.generation;
        if let Some(events) = connected.events {
            self.watch(generation, events);
        }

        let channel = match self.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.inner
                    .manager
                    .handle_event(generation, ConnectionEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let link = Link {
            generation,
            channel,
        };
        *self.inner.link.lock() = Some(link.clone());
        info!(queue = %self.inner.config.queue, generation, "Producer channel ready");

        self.drain(&link).await;
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let (_, channel) = self
            .inner
            .manager
            .create_channel(Some(PRODUCER_CHANNEL))
            .await?;
        channel.confirm_select().await?;
        channel.assert_queue(&self.inner.config.queue, true).await?;
        Ok(channel)
    }

    fn current_link(&self) -> Option<Link> {
        if !self.inner.manager.state().is_connected() {
            return None;
        }
        self.inner
            .link
            .lock()
            .clone()
            .filter(|l| l.generation == self.inner.manager.generation() && l.channel.is_open())
    }

    fn watch(&self, generation: u64, mut events: ConnectionEvents) {
        let producer = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                producer.on_link_event(generation, event);
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

    /// A channel can die while its connection stays up (broker channel
    /// exception) and no connection event reports it. Treat it as link loss.
    fn check_channel(&self) {
        let dead = self
            .inner
            .link
            .lock()
            .as_ref()
            .filter(|l| l.generation == self.inner.manager.generation() && !l.channel.is_open())
            .map(|l| l.generation);
        if let Some(generation) = dead {
            self.inner
                .manager
                .untrack_channel(PRODUCER_CHANNEL, "producer channel closed");
            self.on_link_event(
                generation,
                ConnectionEvent::Error(BrokerError::ChannelClosed.to_string()),
            );
        }
    }

    /// Publish buffered messages in FIFO order. Caller holds the gate.
    ///
    /// Returns false when a publish failed; that message is back at the
    /// buffer front and the link is marked lost.
    async fn drain(&self, link: &Link) -> bool {
        let mut flushed = 0usize;
        loop {
            let Some(message) = self.inner.buffer.lock().pop_front() else {
                break;
            };
            match self.publish(&link.channel, &message).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    self.inner.buffer.lock().push_front(message);
                    warn!(error = %e, flushed, "Buffer flush interrupted");
                    self.on_link_event(link.generation, ConnectionEvent::Error(e.to_string()));
                    return false;
                }
            }
        }
        if flushed > 0 {
            info!(flushed, queue = %self.inner.config.queue, "Flushed buffered messages");
        }
        true
    }

    async fn flush(&self) {
        let gate = self.inner.gate.lock().await;
        match self.current_link() {
            Some(link) => {
                self.drain(&link).await;
            }
            None => {
                drop(gate);
                self.check_channel();
            }
        }
    }

    async fn publish(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        message: &PendingMessage,
    ) -> Result<(), BrokerError> {
        let properties = MessageProperties {
            persistent: true,
            message_id: message.options.message_id.clone(),
            timestamp: u64::try_from(now_millis()).ok(),
            content_type: message.options.content_type.clone(),
            headers: message.options.headers.clone(),
        };
        channel
            .publish(&self.inner.config.queue, &message.body, &properties)
            .await
    }

    fn push(&self, message: PendingMessage, message_id: String, reason: &str) -> SendOutcome {
        let buffered = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push_back(message);
            buffer.len()
        };
        debug!(message_id = %message_id, buffered, reason, "Message buffered");
        SendOutcome::Buffered {
            message_id,
            buffered,
        }
    }

    /// Buffer without taking the gate
    fn buffer(&self, message: PendingMessage, message_id: String, reason: &str) -> SendOutcome {
        let outcome = self.push(message, message_id, reason);

        // The link may have come back between the check and the push
        if self.current_link().is_some() {
            let producer = self.clone();
            tokio::spawn(async move { producer.flush().await });
        }
        outcome
    }

    /// Publish a message, or buffer it when the link is down or the publish fails
    pub async fn send_message(&self, body: Vec<u8>, options: PublishOptions) -> SendOutcome {
        let mut options = options;
        let message_id = options
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let message = PendingMessage { body, options };

        if !self.inner.manager.state().is_connected() {
            return self.buffer(message, message_id, "disconnected");
        }

        let gate = self.inner.gate.lock().await;
        let Some(link) = self.current_link() else {
            let outcome = self.push(message, message_id, "no open channel");
            drop(gate);
            self.check_channel();
            return outcome;
        };

        // Anything buffered before this call goes out first
        if !self.drain(&link).await {
            return self.push(message, message_id, "buffer flush interrupted");
        }

        match self.publish(&link.channel, &message).await {
            Ok(()) => {
                debug!(message_id = %message_id, queue = %self.inner.config.queue, "Message published");
                SendOutcome::Published { message_id }
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Publish failed, re-buffering");
                let outcome = self.push(message, message_id, "publish failed");
                drop(gate);
                self.on_link_event(link.generation, ConnectionEvent::Error(e.to_string()));
                outcome
            }
        }
    }

    /// Serialize `payload` as JSON and send it
    pub async fn send_json<T: Serialize>(
        &self,
        payload: &T,
        options: PublishOptions,
    ) -> Result<SendOutcome, ProducerError> {
        let body = serde_json::to_vec(payload)?;
        let options = PublishOptions {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..options
        };
        Ok(self.send_message(body, options).await)
    }

    /// Stop reconnecting and close the link. Buffered messages are discarded.
    pub async fn close(&self) {
        self.inner.manager.begin_shutdown();
        self.inner.scheduler.cancel();
        {
            let _gate = self.inner.gate.lock().await;
            *self.inner.link.lock() = None;
            self.inner.manager.close().await;
        }
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        let discarded = self.inner.buffer.lock().len();
        if discarded > 0 {
            warn!(discarded, "Producer closed with undelivered buffered messages");
        } else {
            info!("Producer closed");
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.current_link()
            .is_some_and(|l| l.channel.is_open() && !l.channel.is_closing())
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Bodies of buffered messages, oldest first
    pub fn buffered_bodies(&self) -> Vec<Vec<u8>> {
        self.inner
            .buffer
            .lock()
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    pub fn stats(&self) -> ProducerStats {
        let state = self.inner.manager.state();
        ProducerStats {
            is_connected: state.is_connected(),
            reconnect_attempts: state.reconnect_attempts(),
            buffered_messages: self.buffered_len(),
            is_shutting_down: state.is_shutting_down(),
        }
    }
}

impl Supervised for Producer {
    fn role(&self) -> &'static str {
        "producer"
    }

    fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    fn scheduler(&self) -> &ReconnectScheduler {
        &self.inner.scheduler
    }

    async fn establish(&self) -> Result<(), BrokerError> {
        self.connect().await
    }
}
