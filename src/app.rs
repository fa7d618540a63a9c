use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api::{AppState, run_api_server},
    clients::{
        broker::Broker,
        health::HealthChecker,
        memory::{InMemoryBroker, MemoryBrokerSettings},
        rbmq::RabbitMqBroker,
        redis::RedisRedeliveryTracker,
    },
    config::{BrokerKind, Config},
    models::stats::DispatchStats,
    services::{
        consumer::NotificationConsumer,
        dispatcher::NotificationDispatcher,
        producer::NotificationProducer,
        redelivery::{LocalRedeliveryTracker, RedeliveryTracker},
        worker::{ConsumerRole, WorkerPool, WorkerSettings},
    },
};

/// Producer plus the primary and dead letter consumer pools, wired to one
/// broker and one set of counters.
pub struct Pipeline {
    producer: NotificationProducer,
    stats: Arc<DispatchStats>,
    primary: WorkerPool,
    dead_letter: WorkerPool,
}

impl Pipeline {
    /// Starts both consumer pools. Workers stop when `token` is cancelled; if
    /// either pool fails to start, the workers already running are stopped
    /// before the error is returned.
    pub async fn start(
        config: &Config,
        broker: Arc<dyn Broker>,
        tracker: Arc<dyn RedeliveryTracker>,
        dispatcher: NotificationDispatcher,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        let token = token.child_token();
        let stats = Arc::new(DispatchStats::default());
        let producer = NotificationProducer::new(Arc::clone(&broker), config, Arc::clone(&stats));

        let consumer = Arc::new(NotificationConsumer::new(
            producer.clone(),
            Arc::new(dispatcher),
            tracker,
            Arc::clone(&stats),
            config.max_redeliveries,
        ));

        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        let primary = WorkerPool::start(
            Arc::clone(&broker),
            Arc::clone(&consumer),
            ConsumerRole::Primary,
            WorkerSettings {
                topic: config.notifications_topic.clone(),
                group_id: config.consumer_group_id.clone(),
                concurrency: config.consumer_concurrency,
                poll_interval,
            },
            token.clone(),
        )
        .await?;

        let dead_letter = match WorkerPool::start(
            broker,
            consumer,
            ConsumerRole::DeadLetter,
            WorkerSettings {
                topic: config.dlq_topic.clone(),
                group_id: config.dlq_group_id(),
                concurrency: 1,
                poll_interval,
            },
            token.clone(),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Failed to start dead letter consumer, stopping primary workers");
                token.cancel();
                primary.join().await;
                return Err(e);
            }
        };

        Ok(Self {
            producer,
            stats,
            primary,
            dead_letter,
        })
    }

    pub fn producer(&self) -> &NotificationProducer {
        &self.producer
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Waits for both pools to drain after their token was cancelled.
    pub async fn join(self) {
        self.primary.join().await;
        self.dead_letter.join().await;
    }
}

pub async fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>, Error> {
    match config.broker_kind {
        BrokerKind::Rabbitmq => Ok(Arc::new(RabbitMqBroker::connect(config).await?)),
        BrokerKind::Memory => {
            warn!("Using the in-memory broker, records do not survive a restart");

            let broker = InMemoryBroker::new(MemoryBrokerSettings::from_config(config));
            broker.create_topic(&config.notifications_topic, config.topic_partitions)?;
            broker.create_topic(&config.dlq_topic, config.dlq_partitions)?;

            Ok(Arc::new(broker))
        }
    }
}

pub async fn build_tracker(config: &Config) -> Result<Arc<dyn RedeliveryTracker>, Error> {
    match &config.redis_url {
        Some(redis_url) => Ok(Arc::new(
            RedisRedeliveryTracker::connect(redis_url, config).await?,
        )),
        None => {
            if config.broker_kind == BrokerKind::Rabbitmq && config.max_redeliveries > 0 {
                warn!("REDIS_URL not set, redelivery counts are kept per process");
            }
            Ok(Arc::new(LocalRedeliveryTracker::new()))
        }
    }
}

pub async fn run(config: Config) -> Result<(), Error> {
    let broker = connect_broker(&config).await?;
    let tracker = build_tracker(&config).await?;
    let dispatcher = NotificationDispatcher::with_simulated_senders(&config.sender_config());
    let token = CancellationToken::new();

    let pipeline = Pipeline::start(
        &config,
        Arc::clone(&broker),
        Arc::clone(&tracker),
        dispatcher,
        token.clone(),
    )
    .await?;

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(broker, tracker),
        stats: Arc::clone(pipeline.stats()),
    });
    let server_token = token.clone();
    let port = config.server_port;
    let server = tokio::spawn(async move {
        let result = run_api_server(state, port, server_token.clone()).await;
        // A dead health server takes the process down with it.
        if result.is_err() {
            server_token.cancel();
        }
        result
    });

    info!(
        broker = ?config.broker_kind,
        topic = %config.notifications_topic,
        group_id = %config.consumer_group_id,
        "Notification dispatcher running"
    );

    tokio::select! {
        result = shutdown_signal() => result?,
        _ = token.cancelled() => {}
    }

    info!("Shutting down, draining consumer workers");
    token.cancel();
    pipeline.join().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health and stats server exited with an error"),
        Err(e) => error!(error = %e, "Health and stats server task failed"),
    }

    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() -> Result<(), Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow!("Failed to set up SIGINT handler: {}", e))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow!("Failed to set up SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
