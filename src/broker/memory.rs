//! In-process broker
//!
//! Implements the transport traits without a network hop. Semantics follow
//! RabbitMQ where the relay depends on them:
//! - durable named queues behind the default exchange; unroutable publishes are dropped
//! - per-channel prefetch with manual ack/nack
//! - unacked deliveries go back to the queue head when their channel or connection dies
//! - publisher confirms (can be switched to nack everything)
//!
//! Used by `broker.kind: memory` local runs and by the test suites, which
//! also use the fault-injection knobs (unreachable broker, dropped links).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::BrokerError;
use super::{
    Broker, BrokerChannel, BrokerConnection, ConnectionEvent, ConnectionEvents, DeliveryStream,
    MessageHeaders, MessageProperties, QueueMessage,
};

/// Inspection history kept per kind (publishes, dead letters); oldest entries are evicted
pub const HISTORY_LIMIT: usize = 1024;

fn record<T>(history: &mut VecDeque<T>, entry: T) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(entry);
}

/// A publish observed by the broker, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    headers: MessageHeaders,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> QueueMessage {
        QueueMessage {
            body: self.body.clone(),
            delivery_tag,
            message_id: self.message_id.clone(),
            redelivered: self.redelivered,
            headers: self.headers.clone(),
        }
    }
}

struct ConsumerEntry {
    channel_id: u64,
    tx: mpsc::UnboundedSender<QueueMessage>,
}

struct QueueEntry {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

impl QueueEntry {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct ChannelEntry {
    conn_id: u64,
    prefetch: u16,
    confirms: bool,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    nack_publishes: bool,
    next_id: u64,
    next_tag: u64,
    connect_attempts: u32,
    connections: HashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
    unacked: HashMap<u64, Unacked>,
    acked: u64,
    dead_lettered: VecDeque<QueueMessage>,
    published: VecDeque<PublishRecord>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn has_capacity(&self, channel_id: u64) -> bool {
        let Some(channel) = self.channels.get(&channel_id) else {
            return false;
        };
        if channel.prefetch == 0 {
            return true;
        }
        let in_flight = self
            .unacked
            .values()
            .filter(|u| u.channel_id == channel_id)
            .count();
        in_flight < usize::from(channel.prefetch)
    }

    /// Hand ready messages to consumers that have prefetch room
    fn pump(&mut self, queue_name: &str) {
        loop {
            let candidates: Vec<u64> = match self.queues.get(queue_name) {
                Some(q) if !q.ready.is_empty() => {
                    q.consumers.iter().map(|c| c.channel_id).collect()
                }
                _ => return,
            };
            if candidates.is_empty() {
                return;
            }
            let start = self.queues[queue_name].next_consumer;
            let n = candidates.len();
            let Some(idx) = (0..n)
                .map(|offset| (start + offset) % n)
                .find(|&i| self.has_capacity(candidates[i]))
            else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let consumer = &queue.consumers[idx];
            if consumer.tx.send(message.to_delivery(tag)).is_err() {
                // Subscriber went away without closing its channel
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }
            let channel_id = consumer.channel_id;
            queue.next_consumer = idx + 1;
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    channel_id,
                    message,
                },
            );
        }
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.ready.push_back(message);
            self.pump(queue_name);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort_unstable();

        let mut touched = Vec::new();
        // Newest first so the oldest ends up at the head
        for tag in orphaned.into_iter().rev() {
            if let Some(mut entry) = self.unacked.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.ready.push_front(entry.message);
                }
                touched.push(entry.queue);
            }
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.pump(&queue);
        }
    }

    fn drop_connection(&mut self, conn_id: u64, event: ConnectionEvent) {
        let Some(events) = self.connections.remove(&conn_id) else {
            return;
        };
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.conn_id == conn_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id);
        }
        let _ = events.send(event);
    }

    fn channel_open(&self, channel_id: u64) -> Result<&ChannelEntry, BrokerError> {
        self.channels
            .get(&channel_id)
            .filter(|c| self.connections.contains_key(&c.conn_id))
            .ok_or(BrokerError::ChannelClosed)
    }
}

/// In-process broker handle; clones share the same broker
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Negatively confirm every publish on confirm-mode channels
    pub fn set_nack_publishes(&self, nack: bool) {
        self.state.lock().nack_publishes = nack;
    }

    /// Drop every open connection, as a broker restart would
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(
                id,
                ConnectionEvent::Error("connection reset by broker".to_string()),
            );
        }
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Publish as an external producer would; declares the queue if needed
    pub fn inject(&self, queue: &str, body: &[u8], headers: MessageHeaders) {
        let mut state = self.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueEntry::new(true));
        state.enqueue(
            queue,
            StoredMessage {
                body: body.to_vec(),
                message_id: None,
                headers,
                redelivered: false,
            },
        );
    }

    /// Messages waiting in a queue (not yet delivered)
    pub fn ready_messages(&self, queue: &str) -> Vec<QueueMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.to_delivery(0)).collect())
            .unwrap_or_default()
    }

    /// Recent publishes that went through a channel, in arrival order
    pub fn published(&self, queue: &str) -> Vec<PublishRecord> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|r| r.queue == queue)
            .cloned()
            .collect()
    }

    /// Recent messages nacked without requeue
    pub fn dead_lettered(&self) -> Vec<QueueMessage> {
        self.state.lock().dead_lettered.iter().cloned().collect()
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().acked
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, ConnectionEvents), BrokerError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        let id = state.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(id, tx);

        let connection = MemoryConnection {
            id,
            broker: self.clone(),
        };
        Ok((Arc::new(connection), rx))
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                conn_id: self.id,
                prefetch: 0,
                confirms: false,
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker
            .state
            .lock()
            .drop_connection(self.id, ConnectionEvent::Closed);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        match state.queues.get(queue) {
            Some(existing) if existing.durable != durable => {
                // RabbitMQ closes the channel on an inequivalent redeclare
                state.close_channel(self.id);
                Err(BrokerError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    queue
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.to_string(), QueueEntry::new(durable));
                Ok(())
            }
        }
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirms = true;
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        let confirms = state.channel_open(self.id)?.confirms;
        if confirms && state.nack_publishes {
            return Err(BrokerError::PublishUnconfirmed(
                "broker returned basic.nack".to_string(),
            ));
        }

        record(
            &mut state.published,
            PublishRecord {
                queue: queue.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
            },
        );
        state.enqueue(
            queue,
            StoredMessage {
                body: body.to_vec(),
                message_id: properties.message_id.clone(),
                headers: properties.headers.clone(),
                redelivered: false,
            },
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        entry.consumers.push(ConsumerEntry {
            channel_id: self.id,
            tx,
        });
        state.pump(queue);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (Ok(message), rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        let entry = take_unacked(&mut state, self.id, delivery_tag)?;
        state.acked += 1;
        state.pump(&entry.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        state.channel_open(self.id)?;
        let mut entry = take_unacked(&mut state, self.id, delivery_tag)?;
        if requeue {
            entry.message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                queue.ready.push_front(entry.message);
            }
        } else {
            let dead = entry.message.to_delivery(delivery_tag);
            record(&mut state.dead_lettered, dead);
        }
        state.pump(&entry.queue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().channel_open(self.id).is_ok()
    }

    fn is_closing(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}

fn take_unacked(
    state: &mut BrokerState,
    channel_id: u64,
    delivery_tag: u64,
) -> Result<Unacked, BrokerError> {
    match state.unacked.get(&delivery_tag) {
        Some(u) if u.channel_id == channel_id => Ok(state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::ChannelClosed)?),
        _ => Err(BrokerError::Channel(format!(
            "PRECONDITION_FAILED - unknown delivery tag {}",
            delivery_tag
        ))),
    }
}
