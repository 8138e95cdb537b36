//! End-to-end pipeline runs over the in-process broker:
//! request queue -> consumer -> state machine -> producer -> response queue.

use std::sync::Arc;
use std::time::Duration;

use recharge_relay::broker::{InMemoryBroker, MessageHeaders, ReconnectPolicy};
use recharge_relay::messaging::{Consumer, ConsumerConfig, Producer, ProducerConfig};
use recharge_relay::recharge::{
    ClaimOutcome, InMemoryRechargeStore, RechargeId, RechargeService, RechargeStatus,
    RechargeStore, Resolution, ResponseEvent, WebhookNotifier,
};

const REQUESTS: &str = "recharge-queue";
const RESPONSES: &str = "recharge-response-queue";

fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts,
    }
}

struct Pipeline {
    store: Arc<InMemoryRechargeStore>,
    service: Arc<RechargeService>,
    producer: Producer,
    consumer: Consumer<RechargeService>,
}

impl Pipeline {
    /// Consumer on `requests`, producer on `responses`; the two may be different brokers
    async fn start(requests: &InMemoryBroker, responses: &InMemoryBroker) -> Self {
        let store = Arc::new(InMemoryRechargeStore::new());
        let producer = Producer::new(
            Arc::new(responses.clone()),
            ProducerConfig {
                queue: RESPONSES.to_string(),
                reconnect: fast_reconnect(None),
                connect_timeout: Duration::from_secs(1),
            },
        );
        producer.start().await;

        // No URL/secret: webhooks are skipped and only logged
        let notifier = WebhookNotifier::new(None, None, Duration::from_secs(1)).unwrap();
        let service = Arc::new(RechargeService::new(
            store.clone(),
            Arc::new(notifier),
            Arc::new(producer.clone()),
        ));

        let consumer = Consumer::new(
            Arc::new(requests.clone()),
            ConsumerConfig {
                queue: REQUESTS.to_string(),
                retry_base_delay: Duration::from_millis(5),
                reconnect: fast_reconnect(None),
                ..Default::default()
            },
            service.clone(),
        );
        consumer.start().await;

        Self {
            store,
            service,
            producer,
            consumer,
        }
    }

    async fn shutdown(&self) {
        self.consumer.close().await;
        self.producer.close().await;
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn request(id: &str, amount: &str) -> Vec<u8> {
    format!(
        r#"{{"rechargeId":"{}","userId":"u-1","phoneNumber":"01711000000","operator":"Grameenphone","amount":{}}}"#,
        id, amount
    )
    .into_bytes()
}

#[tokio::test]
async fn test_request_to_response_event() {
    let broker = InMemoryBroker::new();
    let pipeline = Pipeline::start(&broker, &broker).await;

    broker.inject(REQUESTS, &request("r-100", "\"50\""), MessageHeaders::new());
    eventually(|| broker.acked_count() == 1).await;

    let job = pipeline
        .store
        .get(&RechargeId::from("r-100"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, RechargeStatus::Pending);
    assert_eq!(job.user_id.as_deref(), Some("u-1"));

    let ticket = match pipeline.service.claim().await.unwrap() {
        ClaimOutcome::Claimed(ticket) => ticket,
        ClaimOutcome::Empty => panic!("expected a claim"),
    };
    assert_eq!(ticket.recharge_id.as_str(), "r-100");

    let outcome = pipeline
        .service
        .resolve(Resolution {
            recharge_id: ticket.recharge_id,
            is_success: true,
            description: "topped up".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, RechargeStatus::Completed);

    let published = broker.published(RESPONSES);
    assert_eq!(published.len(), 1);
    assert!(published[0].properties.persistent);
    let event: ResponseEvent = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(event.recharge_id.as_str(), "r-100");
    assert_eq!(event.status, RechargeStatus::Completed);
    assert_eq!(event.amount.whole_units(), 50);
    assert_eq!(broker.ready_messages(RESPONSES).len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_delivery_creates_one_job() {
    let broker = InMemoryBroker::new();
    let pipeline = Pipeline::start(&broker, &broker).await;

    broker.inject(REQUESTS, &request("dup", "20"), MessageHeaders::new());
    broker.inject(REQUESTS, &request("dup", "20"), MessageHeaders::new());
    eventually(|| broker.acked_count() == 2).await;

    assert_eq!(pipeline.store.len(), 1);
    assert_eq!(pipeline.consumer.stats().processed, 2);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_poison_message_is_dropped_once() {
    let broker = InMemoryBroker::new();
    let pipeline = Pipeline::start(&broker, &broker).await;

    broker.inject(REQUESTS, b"{not json", MessageHeaders::new());
    eventually(|| broker.dead_lettered().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.dead_lettered().len(), 1);
    assert!(broker.published(REQUESTS).is_empty());
    assert!(broker.ready_messages(REQUESTS).is_empty());
    assert_eq!(broker.unacked_count(), 0);
    assert!(pipeline.store.is_empty());
    assert_eq!(pipeline.consumer.stats().rejected, 1);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_failing_request_retries_three_times_then_dead_letters() {
    let broker = InMemoryBroker::new();
    let pipeline = Pipeline::start(&broker, &broker).await;

    // Zero amount fails validation every time
    broker.inject(REQUESTS, &request("bad", "0"), MessageHeaders::new());
    eventually(|| broker.dead_lettered().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let retries: Vec<u32> = broker
        .published(REQUESTS)
        .iter()
        .map(|r| r.properties.headers.retry_count())
        .collect();
    assert_eq!(retries, vec![1, 2, 3]);
    assert_eq!(broker.dead_lettered().len(), 1);
    assert!(broker.ready_messages(REQUESTS).is_empty());

    let stats = pipeline.consumer.stats();
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert!(pipeline.store.is_empty());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_response_is_buffered_until_broker_returns() {
    let requests = InMemoryBroker::new();
    let responses = InMemoryBroker::new();
    responses.set_reachable(false);
    let pipeline = Pipeline::start(&requests, &responses).await;

    requests.inject(REQUESTS, &request("r-200", "\"75.5\""), MessageHeaders::new());
    eventually(|| requests.acked_count() == 1).await;

    pipeline
        .service
        .resolve(Resolution {
            recharge_id: RechargeId::from("r-200"),
            is_success: true,
            description: "done".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(pipeline.producer.buffered_len(), 1);
    assert!(!pipeline.producer.stats().is_connected);

    responses.set_reachable(true);
    eventually(|| pipeline.producer.buffered_len() == 0).await;

    let published = responses.published(RESPONSES);
    assert_eq!(published.len(), 1);
    let event: ResponseEvent = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(event.recharge_id.as_str(), "r-200");
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_consumer_survives_broker_restart() {
    let broker = InMemoryBroker::new();
    let pipeline = Pipeline::start(&broker, &broker).await;

    broker.disconnect_all();
    eventually(|| pipeline.consumer.is_healthy() && pipeline.producer.is_healthy()).await;

    broker.inject(REQUESTS, &request("after-restart", "10"), MessageHeaders::new());
    eventually(|| broker.acked_count() == 1).await;
    assert_eq!(pipeline.store.len(), 1);
    pipeline.shutdown().await;
}
