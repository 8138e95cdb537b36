use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use recharge_relay::broker::{AmqpBroker, Broker, InMemoryBroker};
use recharge_relay::config::{AppConfig, BrokerKind, StorageKind};
use recharge_relay::health::HealthReport;
use recharge_relay::messaging::{Consumer, Producer};
use recharge_relay::recharge::{
    InMemoryRechargeStore, PgRechargeStore, RechargeService, RechargeStore, WebhookNotifier,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|pair| pair[0] == "--env" || pair[0] == "-e")
        .map(|pair| pair[1].clone())
        .unwrap_or_else(|| "dev".to_string())
}

fn build_broker(config: &AppConfig) -> Arc<dyn Broker> {
    match config.broker.kind {
        BrokerKind::Amqp => Arc::new(AmqpBroker::new(config.broker.url.clone(), config.heartbeat())),
        BrokerKind::Memory => {
            warn!("Using the in-process broker; nothing outside this process can reach it");
            Arc::new(InMemoryBroker::new())
        }
    }
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RechargeStore>> {
    match config.storage.kind {
        StorageKind::Memory => {
            warn!("Using in-memory recharge storage; jobs are lost on restart");
            Ok(Arc::new(InMemoryRechargeStore::new()))
        }
        StorageKind::Postgres => {
            let url = config
                .storage
                .postgres_url
                .as_deref()
                .context("storage.postgres_url is not set")?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.storage.max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PgRechargeStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("Failed to prepare recharge schema")?;
            info!("Connected to PostgreSQL recharge store");
            Ok(Arc::new(store))
        }
    }
}

/// Run until Ctrl-C. Returns whether shutdown finished within its deadline.
async fn run(config: AppConfig) -> anyhow::Result<bool> {
    let store = build_store(&config).await?;
    let broker = build_broker(&config);

    let producer = Producer::new(broker.clone(), config.producer_config());
    producer.start().await;

    let notifier = WebhookNotifier::new(
        config.webhook.url.clone(),
        config.webhook.secret.clone(),
        Duration::from_millis(config.webhook.timeout_ms),
    )
    .context("Failed to build webhook client")?;
    if !notifier.is_configured() {
        warn!("Webhook URL or secret not set; status webhooks will be skipped");
    }

    let service = Arc::new(
        RechargeService::new(store, Arc::new(notifier), Arc::new(producer.clone()))
            .with_retry_budget(config.recharge.retry_budget),
    );

    let consumer = Consumer::new(broker, config.consumer_config(), service);
    consumer.start().await;

    let health_task = (config.health_interval_secs > 0).then(|| {
        let producer = producer.clone();
        let consumer = consumer.clone();
        let period = Duration::from_secs(config.health_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                HealthReport::collect(&producer, &consumer).log();
            }
        })
    });

    info!(
        request_queue = %config.queues.request,
        response_queue = %config.queues.response,
        "Recharge relay running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    if let Some(task) = health_task {
        task.abort();
    }

    let shutdown = async {
        consumer.close().await;
        producer.close().await;
    };
    match tokio::time::timeout(config.shutdown_timeout(), shutdown).await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(true)
        }
        Err(_) => {
            error!(
                timeout_ms = config.shutdown_timeout_ms,
                "Graceful shutdown timed out, forcing exit"
            );
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)
        .with_context(|| format!("Failed to load configuration for env '{}'", env))?;
    let log_guard = recharge_relay::logging::init_logging(&app_config);

    info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("RELAY_GIT_HASH"),
        "Starting recharge relay"
    );

    let clean = match run(app_config).await {
        Ok(clean) => clean,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Recharge relay failed");
            drop(log_guard);
            return Err(e);
        }
    };

    drop(log_guard);
    if !clean {
        std::process::exit(1);
    }
    Ok(())
}
