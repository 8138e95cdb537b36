//! AMQP 0-9-1 transport (RabbitMQ) backed by lapin

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::debug;

use super::error::BrokerError;
use super::{
    Broker, BrokerChannel, BrokerConnection, ConnectionEvent, ConnectionEvents, DeliveryStream,
    MessageHeaders, MessageProperties, QueueMessage,
};

/// Heartbeat negotiated with the broker
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ broker reachable at an `amqp://` URL
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
    heartbeat: Duration,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>, heartbeat: Duration) -> Self {
        Self {
            url: url.into(),
            heartbeat,
        }
    }

    /// Connection URL with the heartbeat carried as a URI query parameter
    pub fn connection_url(&self) -> String {
        if self.url.contains("heartbeat=") {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}heartbeat={}",
            self.url,
            separator,
            self.heartbeat.as_secs()
        )
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, ConnectionEvents), BrokerError> {
        let connection =
            Connection::connect(&self.connection_url(), ConnectionProperties::default()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = tx.send(ConnectionEvent::Error(err.to_string()));
        });

        Ok((Arc::new(AmqpConnection { inner: connection }), rx))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "relay shutdown").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
}

fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        table.insert(ShortString::from(key.to_string()), AMQPValue::LongLongInt(value));
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> MessageHeaders {
    let mut headers = MessageHeaders::new();
    let Some(table) = table else {
        return headers;
    };
    for (key, value) in table.inner() {
        let number = match value {
            AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::LongInt(v) => Some(i64::from(*v)),
            AMQPValue::LongUInt(v) => Some(i64::from(*v)),
            AMQPValue::LongLongInt(v) => Some(*v),
            AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
            _ => None,
        };
        if let Some(number) = number {
            headers.insert(key.as_str(), number);
        }
    }
    headers
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if properties.persistent {
        props = props.with_delivery_mode(2);
    }
    if let Some(id) = &properties.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(ts) = properties.timestamp {
        props = props.with_timestamp(ts);
    }
    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }
    if !properties.headers.is_empty() {
        props = props.with_headers(to_field_table(&properties.headers));
    }
    props
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::PublishUnconfirmed(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishUnconfirmed(
                "broker returned basic.nack".to_string(),
            ));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue, consumer_tag, "AMQP consumer registered");

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| QueueMessage {
                    headers: from_field_table(d.properties.headers().as_ref()),
                    message_id: d.properties.message_id().as_ref().map(|s| s.as_str().to_string()),
                    delivery_tag: d.delivery_tag,
                    redelivered: d.redelivered,
                    body: d.data,
                })
                .map_err(BrokerError::from)
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn is_closing(&self) -> bool {
        self.inner.status().closing()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "relay shutdown").await?;
        Ok(())
    }
}
