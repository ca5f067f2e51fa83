// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Consumer
//!
//! Per-delivery processing: decode, run every registered handler, then settle
//! the delivery with the broker.
//!
//! - a body that is not UTF-8 JSON, or cannot be normalized into an envelope,
//!   is dead-lettered right away, retrying it cannot help;
//! - when every handler succeeds the delivery is acked;
//! - when a handler fails on the first delivery the message is requeued once,
//!   and dead-lettered when it fails again on redelivery.
//!
//! The "already retried" decision relies on the broker's `redelivered` flag,
//! which is also set when a delivery is replayed after a connection loss. Such
//! a message gets no second chance if its handler fails. Handlers run without
//! a timeout; a handler that never returns holds its delivery unacked, and the
//! prefetch window bounds how many can pile up.

use crate::{
    envelope::{Envelope, EventType, WireProperties},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, fmt, sync::Arc};
use tracing::{debug, error, warn};

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack with requeue, for one more attempt.
    Requeue,
    /// Nack without requeue, routed to the dead-letter exchange.
    DeadLetter,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing data and message properties of one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: WireProperties,
}

impl DeliveryInfo {
    pub fn new(routing_key: &str, redelivered: bool) -> Self {
        DeliveryInfo {
            routing_key: routing_key.to_owned(),
            redelivered,
            properties: WireProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: WireProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Routing key, redelivery flag, and the `timestamp` / `correlation_id`
    /// properties of `delivery`.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let properties = WireProperties {
            timestamp: *delivery.properties.timestamp(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_owned()),
        };

        DeliveryInfo::new(delivery.routing_key.as_str(), delivery.redelivered)
            .with_properties(properties)
    }
}

/// A decoded delivery handed to every handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
    /// The body as parsed, before normalization.
    pub payload: Value,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ReceivedEvent) -> anyhow::Result<()>;
}

/// Event type named by the last segment of the routing key, if any
/// (`data.service.error` gives `error`).
pub fn routing_key_hint(routing_key: &str) -> Option<EventType> {
    routing_key
        .rsplit('.')
        .next()
        .and_then(|segment| segment.parse().ok())
}

/// Decodes one delivered body and runs every handler over it.
///
/// # Parameters
/// * `handlers` - Handlers to run, in registration order. Every handler runs
///   even after an earlier one fails.
/// * `info` - Routing key, redelivery flag and message properties of the
///   delivery. The last routing-key segment types a body without an explicit
///   type; the properties fill a missing timestamp or correlation id.
/// * `data` - The raw message body.
///
/// # Returns
/// How the delivery must be settled:
/// * [`Disposition::DeadLetter`] when the body cannot be decoded, or when a
///   handler fails on a redelivered message
/// * [`Disposition::Requeue`] when a handler fails on the first delivery
/// * [`Disposition::Ack`] when every handler succeeds
pub async fn process_delivery(
    handlers: &[Arc<dyn EventHandler>],
    info: &DeliveryInfo,
    data: &[u8],
) -> Disposition {
    let routing_key = info.routing_key.as_str();
    let redelivered = info.redelivered;

    let decoded = Envelope::decode(data, routing_key_hint(routing_key), &info.properties);
    let (envelope, payload) = match decoded {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(
                error = err.to_string(),
                routing_key, "malformed message, dead-lettering"
            );
            return Disposition::DeadLetter;
        }
    };

    let event = ReceivedEvent {
        routing_key: routing_key.to_owned(),
        redelivered,
        envelope,
        payload,
    };

    let mut failures = 0;
    for handler in handlers {
        if let Err(err) = handler.handle(&event).await {
            error!(
                error = %err,
                correlation_id = %event.envelope.correlation_id,
                "handler failed"
            );
            failures += 1;
        }
    }

    match (failures, redelivered) {
        (0, _) => Disposition::Ack,
        (_, false) => {
            warn!(
                correlation_id = %event.envelope.correlation_id,
                "processing failed, requeuing for one more attempt"
            );
            Disposition::Requeue
        }
        (_, true) => {
            error!(
                correlation_id = %event.envelope.correlation_id,
                "processing failed on redelivery, dead-lettering"
            );
            Disposition::DeadLetter
        }
    }
}

/// Acks or nacks `delivery` according to `disposition`.
pub async fn settle(delivery: &Delivery, disposition: Disposition) -> Result<(), AmqpError> {
    let result = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions { multiple: false }).await,
        Disposition::Requeue | Disposition::DeadLetter => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: disposition == Disposition::Requeue,
                })
                .await
        }
    };

    result.map_err(|err| {
        error!(error = err.to_string(), disposition = %disposition, "error settling msg");
        match disposition {
            Disposition::Ack => AmqpError::AckMessageError,
            _ => AmqpError::NackMessageError,
        }
    })
}

/// Processes and settles one delivery under a consumer span.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handlers: &[Arc<dyn EventHandler>],
) -> Result<Disposition, AmqpError> {
    let info = DeliveryInfo::from_delivery(delivery);
    let (_ctx, mut span) = otel::new_span(&delivery.properties, tracer, &info.routing_key);

    debug!(
        routing_key = %info.routing_key,
        redelivered = info.redelivered,
        correlation_id = info.properties.correlation_id.as_deref().unwrap_or_default(),
        "received message"
    );

    let disposition = process_delivery(handlers, &info, &delivery.data).await;

    match disposition {
        Disposition::Ack => span.set_status(Status::Ok),
        other => span.set_status(Status::Error {
            description: Cow::from(other.as_str()),
        }),
    }

    if let Err(err) = settle(delivery, disposition).await {
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error settling msg"),
        });
        return Err(err);
    }

    Ok(disposition)
}
