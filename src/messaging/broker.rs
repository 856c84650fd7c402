use crate::config::MessageBrokerConfig;
use crate::error::Error;
use crate::ingest::{InboundMessage, InboundSink};
use crate::messaging::event::EventMessage;
use crate::utils::Backoff;
use anyhow::Result;
use chrono::Utc;
use deadpool_lapin::{Config, Pool};
use futures_util::stream::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// MQTT topic filter to an AMQP binding key on the MQTT plugin's topic exchange
pub fn topic_filter_to_routing_key(filter: &str) -> String {
    filter
        .split('/')
        .map(|segment| match segment {
            "+" => "*".to_string(),
            "#" => "#".to_string(),
            other => other.replace('.', "/"),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// AMQP routing key back to the MQTT topic it was published on
pub fn routing_key_to_topic(routing_key: &str) -> String {
    routing_key
        .split('.')
        .map(|segment| segment.replace('/', "."))
        .collect::<Vec<_>>()
        .join("/")
}

/// RabbitMQ message broker: subscribes to device telemetry and publishes the
/// incident and alert event streams
pub struct MessageBroker {
    /// Connection pool
    pool: Pool,
    config: MessageBrokerConfig,
    /// Publishing channel, recreated when it drops
    channel: Mutex<Option<Channel>>,
    connected: AtomicBool,
}

impl MessageBroker {
    /// Create the broker. No connection is made until first use.
    pub fn new(config: MessageBrokerConfig) -> Result<Self> {
        let pool_config = Config {
            url: Some(config.uri.clone()),
            pool: Some(deadpool_lapin::PoolConfig {
                max_size: config.pool_size as usize,
                queue_mode: deadpool::managed::QueueMode::Fifo,
                timeouts: deadpool::managed::Timeouts {
                    wait: Some(config.timeout()),
                    create: Some(config.timeout()),
                    recycle: Some(config.timeout()),
                },
            }),
            connection_properties: ConnectionProperties::default(),
        };
        let pool = pool_config
            .create_pool(Some(deadpool_lapin::Runtime::Tokio1))
            .map_err(|e| Error::Transport(format!("Failed to create RabbitMQ pool: {}", e)))?;

        Ok(Self {
            pool,
            config,
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MessageBrokerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Connect and declare exchanges; used as the startup reachability check
    pub async fn connect(&self) -> Result<()> {
        let channel = self.get_channel().await?;
        self.init(&channel).await?;
        self.connected.store(true, Ordering::Relaxed);
        info!("Connected to RabbitMQ at {}", redact_uri(&self.config.uri));
        Ok(())
    }

    /// Declare the event exchange and its dead letter exchange
    async fn init(&self, channel: &Channel) -> Result<()> {
        for exchange in [&self.config.events_exchange, &self.config.dead_letter_exchange] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Transport(format!("Failed to declare exchange {}: {}", exchange, e)))?;
        }
        Ok(())
    }

    /// Open a fresh channel on a pooled connection
    async fn create_channel(&self) -> Result<Channel> {
        let connection = tokio::time::timeout(self.config.timeout(), self.pool.get())
            .await
            .map_err(|_| Error::Transport("Timed out waiting for RabbitMQ connection".to_string()))?
            .map_err(|e| Error::Transport(format!("Failed to get RabbitMQ connection: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Transport(format!("Failed to create RabbitMQ channel: {}", e)))?;
        Ok(channel)
    }

    /// Get the publishing channel or create a new one
    async fn get_channel(&self) -> Result<Channel> {
        let mut channel_guard = self.channel.lock().await;

        if let Some(channel) = &*channel_guard {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.create_channel().await?;
        *channel_guard = Some(channel.clone());
        Ok(channel)
    }

    /// Publish an event on the events exchange
    pub async fn publish(&self, event: &EventMessage) -> Result<()> {
        let body = serde_json::to_vec(event).map_err(Error::from)?;
        let routing_key = event.routing_key();
        let exchange = self.config.events_exchange.clone();

        self.publish_raw(&exchange, &routing_key, &body).await?;
        debug!("Published event: {} with routing key: {}", event.id, routing_key);
        Ok(())
    }

    /// Publish a payload on an MQTT topic through the topic exchange
    pub async fn publish_topic(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let exchange = self.config.topic_exchange.clone();
        self.publish_raw(&exchange, &topic_filter_to_routing_key(topic), payload)
            .await
    }

    async fn publish_raw(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let publish = async {
            let channel = self.get_channel().await?;
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    BasicProperties::default()
                        .with_content_type("application/json".into())
                        .with_delivery_mode(2),
                )
                .await
                .map_err(|e| Error::Transport(format!("Failed to publish message: {}", e)))?;
            Ok::<_, anyhow::Error>(())
        };

        match tokio::time::timeout(self.config.timeout(), publish).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!("Publishing to {} timed out", exchange)).into()),
        }
    }

    /// Consume the given MQTT topic filters until cancelled, reconnecting with
    /// capped exponential backoff
    pub fn run_subscriber(
        self: Arc<Self>,
        filters: Vec<String>,
        sink: Arc<dyn InboundSink>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Backoff::new(
                Duration::from_millis(self.config.retry_initial_ms),
                Duration::from_millis(self.config.retry_max_ms),
            )
            .with_jitter();

            while !cancel.is_cancelled() {
                match self.consume(&filters, &sink, &cancel, &mut backoff).await {
                    Ok(()) => break,
                    Err(e) => {
                        self.connected.store(false, Ordering::Relaxed);
                        let delay = backoff.next_delay();
                        warn!("Subscriber disconnected: {}. Reconnecting in {:?}", e, delay);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            info!("Subscriber stopped");
        })
    }

    /// One connection's worth of consuming. Ok means a clean unsubscribe.
    async fn consume(
        &self,
        filters: &[String],
        sink: &Arc<dyn InboundSink>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<()> {
        let channel = self.create_channel().await?;
        self.init(&channel).await?;

        let queue_name = format!("rtls-pipeline.ingest.{}", Uuid::new_v4());
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.config.dead_letter_exchange.clone().into()),
        );
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| Error::Transport(format!("Failed to declare queue: {}", e)))?;

        for filter in filters {
            let binding = topic_filter_to_routing_key(filter);
            channel
                .queue_bind(
                    &queue_name,
                    &self.config.topic_exchange,
                    &binding,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::Transport(format!("Failed to bind {}: {}", filter, e)))?;
            debug!("Bound {} to {} ({})", queue_name, binding, filter);
        }

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Transport(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Transport(format!("Failed to create consumer: {}", e)))?;

        self.connected.store(true, Ordering::Relaxed);
        backoff.reset();
        info!("Subscribed to {:?}", filters);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = channel
                        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                        .await
                    {
                        warn!("Failed to cancel consumer {}: {}", consumer_tag, e);
                    }
                    self.connected.store(false, Ordering::Relaxed);
                    info!("Unsubscribed from {:?}", filters);
                    return Ok(());
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let message = InboundMessage {
                            topic: routing_key_to_topic(delivery.routing_key.as_str()),
                            payload: delivery.data.clone(),
                            received_at: Utc::now(),
                        };
                        if let Err(e) = sink.submit(message).await {
                            error!("Failed to hand off message: {}", e);
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            error!("Failed to acknowledge message: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(Error::Transport(format!("Error receiving message: {}", e)).into());
                    }
                    None => {
                        return Err(Error::Transport("Consumer stream closed".to_string()).into());
                    }
                }
            }
        }
    }
}

fn redact_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid uri>".to_string(),
    }
}

/// Create a message broker service
pub fn create_message_broker(config: MessageBrokerConfig) -> Result<Arc<MessageBroker>> {
    let broker = MessageBroker::new(config)?;

    Ok(Arc::new(broker))
}
