// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! Publishes envelopes to the configured topic exchange. Publishing is best
//! effort: [`EventPublisher::publish`] never returns an error and never waits
//! for the broker to come back, it reports a [`PublishOutcome`] that callers
//! are free to ignore.
//!
//! The publisher owns its own channel, opened and prepared by the connection
//! manager on every (re)connect. In confirm mode every publish waits for the
//! broker acknowledgement of that specific message.

use crate::{
    channel::AmqpChannel,
    configs::AmqpConfigs,
    connection::{ConnectionHook, ConnectionSignal},
    envelope::{new_correlation_id, new_message_id, Envelope, LogLevel},
    errors::{AmqpError, EnvelopeError},
    otel,
    topology::{ensure_topology, TopologyChannel},
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Connection,
};
#[cfg(test)]
use mockall::automock;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const UTF8_ENCODING: &str = "utf-8";
/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
pub const SERVICE_HEADER: &str = "x-service";

/// Result of a best-effort publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Acknowledged by the broker.
    Published,
    /// Written to the socket; the channel is not in confirm mode.
    Sent,
    /// The envelope failed validation; nothing was sent.
    Invalid,
    /// No usable connection.
    Unavailable,
    /// The local send failed.
    Rejected,
    /// The broker refused the message.
    Nacked,
}

impl PublishOutcome {
    pub fn published(&self) -> bool {
        matches!(self, PublishOutcome::Published | PublishOutcome::Sent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Published => "published",
            PublishOutcome::Sent => "sent",
            PublishOutcome::Invalid => "invalid",
            PublishOutcome::Unavailable => "unavailable",
            PublishOutcome::Rejected => "rejected",
            PublishOutcome::Nacked => "nacked",
        }
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the broker reported for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Acked,
    Nacked,
    /// The channel is not in confirm mode.
    Unconfirmed,
}

/// Channel operations the publisher needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Whether the broker acknowledges every publish on this channel.
    fn confirms_enabled(&self) -> bool;

    async fn is_open(&self) -> bool;

    /// Sends `message`; in confirm mode waits for the broker's answer to
    /// this specific message. Local send failures and confirmation failures
    /// are `AmqpError::PublishRejected`.
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<Receipt, AmqpError>;
}

/// An envelope encoded for the wire.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub correlation_id: String,
    pub message_id: String,
    pub properties: BasicProperties,
}

impl OutboundMessage {
    /// Serializes `envelope` and builds its message properties.
    ///
    /// The correlation id is `correlation_id` when given, else the envelope's
    /// own, else a fresh one; the serialized body carries the same value.
    pub fn encode(envelope: &Envelope, correlation_id: Option<&str>) -> Result<Self, EnvelopeError> {
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_owned)
            .or_else(|| {
                Some(envelope.correlation_id.clone()).filter(|id| !id.trim().is_empty())
            })
            .unwrap_or_else(new_correlation_id);

        let payload = if envelope.correlation_id == correlation_id {
            serde_json::to_vec(envelope)
        } else {
            serde_json::to_vec(&envelope.clone().with_correlation_id(&correlation_id))
        }
        .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;

        let message_id = new_message_id();

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_current(&mut headers);
        headers.insert(
            ShortString::from(SERVICE_HEADER),
            AMQPValue::LongString(LongString::from(envelope.service.clone())),
        );

        let timestamp = u64::try_from(envelope.timestamp.timestamp_millis()).unwrap_or_default();

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_content_encoding(ShortString::from(UTF8_ENCODING))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(message_id.clone()))
            .with_correlation_id(ShortString::from(correlation_id.clone()))
            .with_timestamp(timestamp)
            .with_type(ShortString::from(envelope.category()))
            .with_app_id(ShortString::from(envelope.service.clone()))
            .with_headers(FieldTable::from(headers));

        Ok(OutboundMessage {
            payload,
            correlation_id,
            message_id,
            properties,
        })
    }
}

/// Publishes envelopes for one service.
pub struct EventPublisher {
    cfg: AmqpConfigs,
    channel: RwLock<Option<Arc<dyn PublishChannel>>>,
    signal: RwLock<Option<ConnectionSignal>>,
}

impl EventPublisher {
    pub fn new(cfg: AmqpConfigs) -> Arc<EventPublisher> {
        Arc::new(EventPublisher {
            cfg,
            channel: RwLock::new(None),
            signal: RwLock::new(None),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.cfg.service_name
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.read().await.is_some()
    }

    /// `None` while disconnected; `Some(false)` when the broker refused
    /// confirm mode and publishes are unconfirmed.
    pub async fn confirms_enabled(&self) -> Option<bool> {
        self.channel
            .read()
            .await
            .as_ref()
            .map(|channel| channel.confirms_enabled())
    }

    /// Publishes `envelope` to the configured exchange and routing key.
    ///
    /// Best effort: never fails and never waits for a reconnect.
    ///
    /// # Parameters
    /// * `envelope` - The event to publish. It is validated before anything
    ///   is sent.
    /// * `correlation_id` - Correlation id to publish under. When absent or
    ///   blank the envelope's own id is used, else a fresh one is generated.
    ///
    /// # Returns
    /// * `PublishOutcome::Invalid` when validation or encoding fails
    /// * `PublishOutcome::Unavailable` when there is no usable channel
    /// * `PublishOutcome::Published` once the broker acked the message, or
    ///   `PublishOutcome::Sent` when the channel does not confirm
    /// * `PublishOutcome::Nacked` when the broker refused the message
    /// * `PublishOutcome::Rejected` when the send itself failed; a closed
    ///   channel is then reported to the connection manager
    pub async fn publish(&self, envelope: &Envelope, correlation_id: Option<&str>) -> PublishOutcome {
        if let Err(err) = envelope.validate() {
            warn!(error = err.to_string(), "refusing to publish an invalid envelope");
            return PublishOutcome::Invalid;
        }

        let Some(channel) = self.channel.read().await.clone() else {
            debug!("not connected, dropping event");
            return PublishOutcome::Unavailable;
        };

        let message = match OutboundMessage::encode(envelope, correlation_id) {
            Ok(message) => message,
            Err(err) => {
                error!(error = err.to_string(), "failure to encode envelope");
                return PublishOutcome::Invalid;
            }
        };

        let receipt = channel
            .send(&self.cfg.exchange, &self.cfg.routing_key, &message)
            .await;

        match receipt {
            Ok(Receipt::Acked) => {
                debug!(
                    correlation_id = %message.correlation_id,
                    message_id = %message.message_id,
                    "message confirmed"
                );
                PublishOutcome::Published
            }
            Ok(Receipt::Unconfirmed) => {
                debug!(
                    correlation_id = %message.correlation_id,
                    message_id = %message.message_id,
                    "message sent without confirmation"
                );
                PublishOutcome::Sent
            }
            Ok(Receipt::Nacked) => {
                warn!(correlation_id = %message.correlation_id, "broker nacked message");
                PublishOutcome::Nacked
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    correlation_id = %message.correlation_id,
                    "error publishing message"
                );
                self.report_if_closed(channel.as_ref()).await;
                PublishOutcome::Rejected
            }
        }
    }

    /// Publishes a log record for this service.
    pub async fn log(
        &self,
        level: LogLevel,
        message: &str,
        metadata: Map<String, Value>,
    ) -> PublishOutcome {
        let envelope = Envelope::log(&self.cfg.service_name, level, message).with_metadata(metadata);
        self.publish(&envelope, None).await
    }

    /// Re-asserts the topology on `channel` and publishes through it until
    /// the next disconnect.
    pub(crate) async fn install<C>(&self, channel: Arc<C>, signal: ConnectionSignal) -> Result<(), AmqpError>
    where
        C: TopologyChannel + PublishChannel + 'static,
    {
        ensure_topology(channel.as_ref(), &self.cfg).await?;

        if self.cfg.confirm_channel && !channel.confirms_enabled() {
            warn!("publishing without broker confirmation");
        }

        *self.channel.write().await = Some(channel as Arc<dyn PublishChannel>);
        *self.signal.write().await = Some(signal);

        Ok(())
    }

    async fn report_if_closed(&self, channel: &dyn PublishChannel) {
        if channel.is_open().await {
            return;
        }

        if let Some(signal) = self.signal.read().await.as_ref() {
            signal.lost("publisher channel closed");
        }
    }
}

#[async_trait]
impl ConnectionHook for EventPublisher {
    fn name(&self) -> &str {
        "publisher"
    }

    async fn on_connected(
        &self,
        connection: Arc<Connection>,
        signal: ConnectionSignal,
    ) -> Result<(), AmqpError> {
        let channel = AmqpChannel::open(connection, self.cfg.confirm_channel).await?;
        self.install(Arc::new(channel), signal).await
    }

    async fn on_disconnected(&self) {
        self.channel.write().await.take();
        self.signal.write().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionEvent,
        envelope::EventBody,
        exchange::ExchangeDefinition,
        queue::{QueueBinding, QueueDefinition},
        topology::QueueInspection,
    };
    use serde_json::json;
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connected(
        channel: MockPublishChannel,
    ) -> (Arc<EventPublisher>, UnboundedReceiver<ConnectionEvent>) {
        let publisher = EventPublisher::new(AmqpConfigs::producer());
        let (signal, events) = ConnectionSignal::channel(1);

        *publisher.channel.try_write().unwrap() = Some(Arc::new(channel) as Arc<dyn PublishChannel>);
        *publisher.signal.try_write().unwrap() = Some(signal);

        (publisher, events)
    }

    fn answering(receipt: Result<Receipt, AmqpError>) -> MockPublishChannel {
        let mut channel = MockPublishChannel::new();
        channel.expect_confirms_enabled().return_const(true);
        channel
            .expect_send()
            .times(1)
            .returning(move |_, _, _| receipt.clone());
        channel
    }

    fn event() -> Envelope {
        Envelope::log("data-service-a", LogLevel::Info, "cities refreshed")
    }

    /// Topology and publish calls against one channel, as a broker would
    /// see them.
    #[derive(Default)]
    struct BrokerChannel {
        declared_exchanges: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TopologyChannel for BrokerChannel {
        async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
            self.declared_exchanges
                .lock()
                .unwrap()
                .push(def.name().to_owned());
            Ok(())
        }

        async fn declare_queue(&self, _def: &QueueDefinition) -> Result<QueueInspection, AmqpError> {
            Ok(QueueInspection::default())
        }

        async fn bind_queue(&self, _binding: &QueueBinding) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn set_prefetch(&self, _prefetch: u16) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn inspect_exchange(&self, _name: &str) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn inspect_queue(&self, _name: &str) -> Result<QueueInspection, AmqpError> {
            Ok(QueueInspection::default())
        }
    }

    #[async_trait]
    impl PublishChannel for BrokerChannel {
        fn confirms_enabled(&self) -> bool {
            true
        }

        async fn is_open(&self) -> bool {
            true
        }

        async fn send(
            &self,
            exchange: &str,
            routing_key: &str,
            _message: &OutboundMessage,
        ) -> Result<Receipt, AmqpError> {
            self.sent
                .lock()
                .unwrap()
                .push((exchange.to_owned(), routing_key.to_owned()));
            Ok(Receipt::Acked)
        }
    }

    fn header<'a>(message: &'a OutboundMessage, name: &str) -> Option<&'a AMQPValue> {
        message
            .properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(&ShortString::from(name)))
    }

    #[test]
    fn encode_sets_the_wire_properties() {
        let envelope = Envelope::log("data-service-a", LogLevel::Warn, "slow upstream");

        let message = OutboundMessage::encode(&envelope, None).unwrap();
        let props = &message.properties;

        assert_eq!(
            props.content_type().as_ref().map(|v| v.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            props.content_encoding().as_ref().map(|v| v.as_str()),
            Some(UTF8_ENCODING)
        );
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.message_id().as_ref().map(|v| v.as_str()),
            Some(message.message_id.as_str())
        );
        assert_eq!(props.kind().as_ref().map(|v| v.as_str()), Some("warn"));
        assert_eq!(
            props.app_id().as_ref().map(|v| v.as_str()),
            Some("data-service-a")
        );
        assert_eq!(
            *props.timestamp(),
            Some(envelope.timestamp.timestamp_millis() as u64)
        );
        assert_eq!(
            header(&message, SERVICE_HEADER),
            Some(&AMQPValue::LongString(LongString::from("data-service-a")))
        );
    }

    #[test]
    fn explicit_correlation_id_wins() {
        let envelope = Envelope::log("svc", LogLevel::Info, "hi").with_correlation_id("from-envelope");

        let message = OutboundMessage::encode(&envelope, Some("from-caller")).unwrap();
        let body: Value = serde_json::from_slice(&message.payload).unwrap();

        assert_eq!(message.correlation_id, "from-caller");
        assert_eq!(body["correlationId"], "from-caller");
        assert_eq!(
            message.properties.correlation_id().as_ref().map(|v| v.as_str()),
            Some("from-caller")
        );
    }

    #[test]
    fn envelope_correlation_id_is_used_when_none_is_given() {
        let envelope = Envelope::log("svc", LogLevel::Info, "hi").with_correlation_id("from-envelope");

        let message = OutboundMessage::encode(&envelope, Some("  ")).unwrap();

        assert_eq!(message.correlation_id, "from-envelope");
    }

    #[test]
    fn missing_correlation_id_is_generated() {
        let mut envelope = Envelope::log("svc", LogLevel::Info, "hi");
        envelope.correlation_id.clear();

        let message = OutboundMessage::encode(&envelope, None).unwrap();
        let body: Value = serde_json::from_slice(&message.payload).unwrap();

        assert!(message.correlation_id.starts_with("corr-"));
        assert_eq!(body["correlationId"], json!(message.correlation_id));
    }

    #[tokio::test]
    async fn publish_while_disconnected_returns_immediately() {
        let publisher = EventPublisher::new(AmqpConfigs::producer());
        let envelope = Envelope::log("data-service-a", LogLevel::Info, "hello");

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            publisher.publish(&envelope, None),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PublishOutcome::Unavailable);
        assert!(!outcome.published());
        assert_eq!(publisher.confirms_enabled().await, None);
    }

    #[tokio::test]
    async fn invalid_envelope_is_refused_before_any_io() {
        let publisher = EventPublisher::new(AmqpConfigs::producer());
        let envelope = Envelope::new("data-service-a", EventBody::error(""));

        assert_eq!(
            publisher.publish(&envelope, None).await,
            PublishOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn log_uses_the_configured_service() {
        let publisher = EventPublisher::new(AmqpConfigs::producer());

        let outcome = publisher
            .log(LogLevel::Info, "started", Map::new())
            .await;

        assert_eq!(publisher.service_name(), "data-service");
        assert_eq!(outcome, PublishOutcome::Unavailable);
    }

    #[tokio::test]
    async fn broker_ack_is_published() {
        let mut channel = MockPublishChannel::new();
        channel.expect_confirms_enabled().return_const(true);
        channel
            .expect_send()
            .withf(|exchange, routing_key, message| {
                exchange == "data.service.events"
                    && routing_key == "data.service.logs"
                    && message.correlation_id == "order-1"
            })
            .times(1)
            .returning(|_, _, _| Ok(Receipt::Acked));
        let (publisher, _events) = connected(channel);

        let outcome = publisher.publish(&event(), Some("order-1")).await;

        assert_eq!(outcome, PublishOutcome::Published);
        assert!(outcome.published());
        assert_eq!(publisher.confirms_enabled().await, Some(true));
    }

    #[tokio::test]
    async fn broker_nack_is_not_published() {
        let (publisher, _events) = connected(answering(Ok(Receipt::Nacked)));

        let outcome = publisher.publish(&event(), None).await;

        assert_eq!(outcome, PublishOutcome::Nacked);
        assert!(!outcome.published());
    }

    #[tokio::test]
    async fn unconfirmed_send_counts_as_published() {
        let (publisher, _events) = connected(answering(Ok(Receipt::Unconfirmed)));

        let outcome = publisher.publish(&event(), None).await;

        assert_eq!(outcome, PublishOutcome::Sent);
        assert!(outcome.published());
    }

    #[tokio::test]
    async fn failed_send_on_an_open_channel_is_rejected_quietly() {
        let mut channel = answering(Err(AmqpError::PublishRejected("buffer full".to_owned())));
        channel.expect_is_open().times(1).return_const(true);
        let (publisher, mut events) = connected(channel);

        let outcome = publisher.publish(&event(), None).await;

        assert_eq!(outcome, PublishOutcome::Rejected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_send_on_a_closed_channel_reports_the_loss() {
        let mut channel = answering(Err(AmqpError::PublishRejected("channel closed".to_owned())));
        channel.expect_is_open().times(1).return_const(false);
        let (publisher, mut events) = connected(channel);

        let outcome = publisher.publish(&event(), None).await;

        assert_eq!(outcome, PublishOutcome::Rejected);
        assert!(matches!(
            events.try_recv(),
            Ok(ConnectionEvent::Lost { generation: 1, .. })
        ));
    }

    #[tokio::test]
    async fn every_install_reasserts_the_topology() {
        let publisher = EventPublisher::new(AmqpConfigs::producer());

        for generation in 1..=2 {
            let channel = Arc::new(BrokerChannel::default());
            let (signal, _events) = ConnectionSignal::channel(generation);
            publisher.install(channel.clone(), signal).await.unwrap();

            assert_eq!(
                *channel.declared_exchanges.lock().unwrap(),
                vec!["data.service.events", "data.service.events.dlx"]
            );
            assert_eq!(
                publisher.publish(&event(), None).await,
                PublishOutcome::Published
            );
            assert_eq!(
                *channel.sent.lock().unwrap(),
                vec![("data.service.events".to_owned(), "data.service.logs".to_owned())]
            );

            publisher.on_disconnected().await;
            assert_eq!(
                publisher.publish(&event(), None).await,
                PublishOutcome::Unavailable
            );
        }
    }
}
