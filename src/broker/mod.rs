pub mod events;

use std::sync::Arc;
use std::time::Duration;

use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use events::BrokerEvent;

/// Durable topic exchange every event flows through.
pub const MESSAGES_EXCHANGE: &str = "messages";
/// Fan-out exchange collecting rejected deliveries.
pub const DEAD_LETTER_EXCHANGE: &str = "dead-letters";
/// Queue bound `#` on the dead-letter exchange.
pub const DEAD_LETTER_QUEUE: &str = "dead_letters";
/// The message service's inbound queue (auto-deliver transitions). Also the
/// target of the direct-publish fallback when the exchange is unreachable.
pub const MESSAGE_EVENTS_QUEUE: &str = "message-events";

pub const MESSAGE_PATTERN: &str = "message.#";
pub const STATUS_PATTERN: &str = "status.#";
pub const TYPING_PATTERN: &str = "typing.#";

/// Fixed re-dial backoff after a lost broker connection.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// A durable queue plus the bindings it needs on the `messages` exchange.
///
/// Declarations are recorded so a reconnect can restore the full topology
/// before publishes resume.
#[derive(Clone, Debug)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<String>,
    /// Route rejected deliveries to the dead-letter exchange.
    pub dead_lettered: bool,
}

impl QueueSpec {
    pub fn gateway(name: &str) -> Self {
        QueueSpec {
            name: name.to_string(),
            bindings: vec![
                MESSAGE_PATTERN.to_string(),
                STATUS_PATTERN.to_string(),
                TYPING_PATTERN.to_string(),
            ],
            dead_lettered: false,
        }
    }

    pub fn message_events() -> Self {
        QueueSpec {
            name: MESSAGE_EVENTS_QUEUE.to_string(),
            bindings: vec![MESSAGE_PATTERN.to_string()],
            dead_lettered: true,
        }
    }

    fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if self.dead_lettered {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
            );
        }
        args
    }
}

struct Active {
    // The connection must be kept alive alongside the channel cloned out of
    // it; dropping it tears the channel down.
    _connection: Connection,
    channel: Channel,
}

struct BrokerInner {
    url: String,
    active: Mutex<Active>,
    queues: Mutex<Vec<QueueSpec>>,
}

/// Shared broker handle. Cheaply cloneable; the publisher channel lives
/// behind a lock and is cloned out before any I/O so no await happens while
/// the lock is held.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Dial the broker and declare the exchanges and the dead-letter queue.
    /// Failure here is fatal for the calling service.
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        info!("🔌 Connecting to broker...");
        let (connection, channel) = dial(url).await?;
        declare_topology(&channel).await?;
        info!("✅ Broker connected, topology declared");

        Ok(Broker {
            inner: Arc::new(BrokerInner {
                url: url.to_string(),
                active: Mutex::new(Active {
                    _connection: connection,
                    channel,
                }),
                queues: Mutex::new(Vec::new()),
            }),
        })
    }

    async fn channel(&self) -> Channel {
        self.inner.active.lock().await.channel.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.channel().await.status().connected()
    }

    /// Declare a durable queue, bind its patterns on the `messages`
    /// exchange, and record the spec for re-declaration after a reconnect.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), lapin::Error> {
        let channel = self.channel().await;
        declare_and_bind(&channel, spec).await?;

        let mut queues = self.inner.queues.lock().await;
        if !queues.iter().any(|q| q.name == spec.name) {
            queues.push(spec.clone());
        }
        Ok(())
    }

    /// Publish an event to the `messages` exchange with the given routing
    /// key. Payloads are persistent; callers decide whether a failure is
    /// fatal, a fallback, or log-and-continue.
    pub async fn publish(&self, routing_key: &str, event: &BrokerEvent) -> AppResult<()> {
        let payload = serde_json::to_vec(event).map_err(|e| {
            error!(error = ?e, "Failed to serialize broker event; this is a programming error");
            AppError::Internal
        })?;

        let channel = self.channel().await;
        channel
            .basic_publish(
                MESSAGES_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Fallback path: publish through the default exchange straight into a
    /// named queue, bypassing the topic exchange.
    pub async fn publish_direct(&self, queue: &str, event: &BrokerEvent) -> AppResult<()> {
        let payload = serde_json::to_vec(event).map_err(|e| {
            error!(error = ?e, "Failed to serialize broker event; this is a programming error");
            AppError::Internal
        })?;

        let channel = self.channel().await;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Declare the queue (idempotent) and start consuming from it. Consumer
    /// loops call this again after any stream interruption, which restores
    /// the binding before consumption resumes.
    pub async fn consume(&self, spec: &QueueSpec, tag: &str) -> Result<Consumer, lapin::Error> {
        self.declare_queue(spec).await?;
        let channel = self.channel().await;
        channel
            .basic_consume(
                &spec.name,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    /// Re-dial and restore every declared exchange, queue, and binding, then
    /// swap the live channel. Publishes observe the new channel on their
    /// next lock acquisition.
    async fn reconnect(&self) -> Result<(), lapin::Error> {
        let (connection, channel) = dial(&self.inner.url).await?;
        declare_topology(&channel).await?;

        let queues = self.inner.queues.lock().await.clone();
        for spec in &queues {
            declare_and_bind(&channel, spec).await?;
        }

        let mut active = self.inner.active.lock().await;
        *active = Active {
            _connection: connection,
            channel,
        };
        info!("✅ Broker reconnected, topology restored");
        Ok(())
    }

    /// Background watchdog: checks connection health every 5 seconds and
    /// re-dials with the same fixed backoff until it succeeds.
    pub fn spawn_reconnect_monitor(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                if broker.is_connected().await {
                    continue;
                }
                warn!("Broker connection lost; attempting reconnect");
                if let Err(e) = broker.reconnect().await {
                    warn!(error = ?e, "Broker reconnect failed; will retry");
                }
            }
        })
    }
}

async fn dial(url: &str) -> Result<(Connection, Channel), lapin::Error> {
    let connection = Connection::connect(url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    Ok((connection, channel))
}

async fn declare_topology(channel: &Channel) -> Result<(), lapin::Error> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            MESSAGES_EXCHANGE,
            ExchangeKind::Topic,
            durable,
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Fanout,
            durable,
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            DEAD_LETTER_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            DEAD_LETTER_QUEUE,
            DEAD_LETTER_EXCHANGE,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

async fn declare_and_bind(channel: &Channel, spec: &QueueSpec) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            &spec.name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            spec.arguments(),
        )
        .await?;

    for pattern in &spec.bindings {
        channel
            .queue_bind(
                &spec.name,
                MESSAGES_EXCHANGE,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_spec_binds_all_three_patterns() {
        let spec = QueueSpec::gateway("gateway.test");
        assert_eq!(spec.name, "gateway.test");
        assert_eq!(spec.bindings, vec!["message.#", "status.#", "typing.#"]);
        assert!(!spec.dead_lettered);
        assert!(spec.arguments().inner().is_empty());
    }

    #[test]
    fn message_events_spec_is_dead_lettered() {
        let spec = QueueSpec::message_events();
        assert_eq!(spec.name, MESSAGE_EVENTS_QUEUE);
        assert_eq!(spec.bindings, vec!["message.#"]);

        let args = spec.arguments();
        let expected = AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into());
        assert!(args
            .inner()
            .iter()
            .any(|(key, value)| key.as_str() == "x-dead-letter-exchange" && *value == expected));
    }
}
