use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::{StreamExt, stream::SelectAll};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    clients::broker::{Acknowledger, Broker, Delivery, GroupMember},
    config::Config,
    models::message::{Record, RecordMetadata},
    utils::partition_for_key,
};

/// Partitioned topics on top of RabbitMQ.
///
/// A topic is a durable direct exchange. Every consumer group gets one
/// durable queue per partition, bound with the partition number as routing
/// key. Queues are single-active-consumer, so at most one member of a group
/// reads a partition at any time, and carry a consumer timeout so a record
/// left unacknowledged is handed out again once the timeout lapses.
pub struct RabbitMqBroker {
    connection: Arc<Connection>,
    publish_channel: Channel,
    partitions: HashMap<String, u32>,
    prefetch_count: u16,
}

impl RabbitMqBroker {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        let broker = Self {
            connection: Arc::new(connection),
            publish_channel,
            partitions: HashMap::from([
                (config.notifications_topic.clone(), config.topic_partitions),
                (config.dlq_topic.clone(), config.dlq_partitions),
            ]),
            prefetch_count: config.prefetch_count,
        };

        broker
            .declare_topic(
                &config.notifications_topic,
                config.topic_partitions,
                &config.consumer_group_id,
                config.session_timeout_ms,
            )
            .await?;

        broker
            .declare_topic(
                &config.dlq_topic,
                config.dlq_partitions,
                &config.dlq_group_id(),
                config.session_timeout_ms,
            )
            .await?;

        Ok(broker)
    }

    async fn declare_topic(
        &self,
        topic: &str,
        partitions: u32,
        group_id: &str,
        consumer_timeout_ms: u64,
    ) -> Result<(), Error> {
        self.publish_channel
            .exchange_declare(
                topic,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange {}: {}", topic, e))?;

        for partition in 0..partitions {
            let queue = partition_queue(topic, group_id, partition);

            let mut arguments = FieldTable::default();
            arguments.insert(
                ShortString::from("x-single-active-consumer"),
                AMQPValue::Boolean(true),
            );
            arguments.insert(
                ShortString::from("x-consumer-timeout"),
                AMQPValue::LongLongInt(consumer_timeout_ms as i64),
            );

            self.publish_channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    arguments,
                )
                .await
                .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;

            self.publish_channel
                .queue_bind(
                    &queue,
                    topic,
                    &partition.to_string(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| anyhow!("Failed to bind queue {}: {}", queue, e))?;
        }

        info!(topic, group_id, partitions, "Topic declared");

        Ok(())
    }

    fn partitions_of(&self, topic: &str) -> Result<u32, Error> {
        self.partitions
            .get(topic)
            .copied()
            .ok_or_else(|| anyhow!("Topic {} was not declared on this connection", topic))
    }
}

fn partition_queue(topic: &str, group_id: &str, partition: u32) -> String {
    format!("{}.{}.{}", topic, group_id, partition)
}

#[async_trait]
impl Broker for RabbitMqBroker {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<RecordMetadata, Error> {
        let partition = partition_for_key(key, self.partitions_of(topic)?);
        self.send_to_partition(topic, partition, key, payload).await
    }

    async fn send_to_partition(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
    ) -> Result<RecordMetadata, Error> {
        let partitions = self.partitions_of(topic)?;
        if partition >= partitions {
            return Err(anyhow!(
                "Partition {} does not exist on topic {} ({} partitions)",
                partition,
                topic,
                partitions
            ));
        }

        let confirmation = self
            .publish_channel
            .basic_publish(
                topic,
                &partition.to_string(),
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type(ShortString::from("application/json"))
                    .with_message_id(ShortString::from(key.to_string())),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", topic, e))?
            .await
            .map_err(|e| anyhow!("Publisher confirm for {} failed: {}", topic, e))?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset: None,
            }),
            Confirmation::Ack(Some(_)) => Err(anyhow!(
                "Record for partition {} of {} was unroutable",
                partition,
                topic
            )),
            Confirmation::Nack(_) => Err(anyhow!("Broker rejected record for {}", topic)),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        concurrency: usize,
    ) -> Result<Vec<Box<dyn GroupMember>>, Error> {
        let partitions = self.partitions_of(topic)?;
        let concurrency = concurrency.max(1);

        if concurrency > partitions as usize {
            warn!(
                topic,
                concurrency,
                partitions,
                "More workers than partitions, some workers will stay idle"
            );
        }

        let members = (0..concurrency)
            .map(|worker| {
                let queues = (0..partitions)
                    .filter(|partition| *partition as usize % concurrency == worker)
                    .map(|partition| (partition, partition_queue(topic, group_id, partition)))
                    .collect();

                Box::new(RabbitMqMember {
                    connection: Arc::clone(&self.connection),
                    member_id: format!("{}-{}", group_id, worker),
                    topic: topic.to_string(),
                    queues,
                    prefetch_count: self.prefetch_count,
                    channel: None,
                    stream: None,
                }) as Box<dyn GroupMember>
            })
            .collect();

        info!(topic, group_id, concurrency, partitions, "Joined RabbitMQ consumer group");

        Ok(members)
    }

    async fn health_check(&self) -> Result<(), Error> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(anyhow!("RabbitMQ connection is not open"))
        }
    }
}

struct RabbitMqMember {
    connection: Arc<Connection>,
    member_id: String,
    topic: String,
    queues: Vec<(u32, String)>,
    prefetch_count: u16,
    channel: Option<Channel>,
    stream: Option<SelectAll<Consumer>>,
}

impl RabbitMqMember {
    async fn open(&mut self) -> Result<(), Error> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        let mut consumers = Vec::with_capacity(self.queues.len());
        for (partition, queue) in &self.queues {
            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("{}-p{}", self.member_id, partition),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| anyhow!("Failed to consume {}: {}", queue, e))?;
            consumers.push(consumer);
        }

        debug!(member_id = %self.member_id, queues = self.queues.len(), "Consumer channel opened");

        self.stream = Some(futures_util::stream::select_all(consumers));
        self.channel = Some(channel);

        Ok(())
    }

    fn reset(&mut self) {
        self.stream = None;
        self.channel = None;
    }
}

#[async_trait]
impl GroupMember for RabbitMqMember {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Option<Delivery>, Error> {
        if self.queues.is_empty() {
            sleep(max_wait).await;
            return Ok(None);
        }

        if self.stream.is_none() {
            self.open().await?;
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let delivery = match timeout(max_wait, stream.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                self.reset();
                return Err(anyhow!("Consumer stream for {} closed", self.member_id));
            }
            Ok(Some(Err(e))) => {
                self.reset();
                return Err(anyhow!("Consumer stream for {} failed: {}", self.member_id, e));
            }
            Ok(Some(Ok(delivery))) => delivery,
        };

        let partition = delivery
            .routing_key
            .as_str()
            .parse::<u32>()
            .map_err(|_| anyhow!("Unexpected routing key {}", delivery.routing_key))?;

        let key = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();

        let record = Record {
            topic: self.topic.clone(),
            partition,
            offset: delivery.delivery_tag,
            key,
            payload: delivery.data,
            delivery_count: if delivery.redelivered { 2 } else { 1 },
        };

        Ok(Some(Delivery::new(
            record,
            Box::new(RabbitMqAcker {
                acker: delivery.acker,
            }),
        )))
    }

    async fn leave(self: Box<Self>) -> Result<(), Error> {
        if let Some(channel) = &self.channel {
            channel
                .close(200, "consumer leaving group")
                .await
                .map_err(|e| anyhow!("Failed to close channel for {}: {}", self.member_id, e))?;
        }

        info!(member_id = %self.member_id, topic = %self.topic, "Left consumer group");

        Ok(())
    }
}

struct RabbitMqAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for RabbitMqAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }
}
