// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. Each
//! role (publisher, consumer, health probe) gets its own [`AmqpChannel`] on the
//! shared connection, since flow control and ack state are channel-scoped.
//!
//! A channel-level protocol error (a conflicting declaration, a failed passive
//! check) makes the broker close the channel. [`AmqpChannel`] transparently
//! opens a replacement so the owning role keeps a usable channel.

use crate::{
    configs::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::{OutboundMessage, PublishChannel, Receipt},
    queue::{QueueBinding, QueueDefinition},
    topology::{QueueInspection, TopologyChannel},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Opens a connection to the broker configured in `cfg`.
///
/// The connection is named after the service so it can be told apart in the
/// broker's management UI.
pub async fn new_amqp_connection(cfg: &AmqpConfigs) -> Result<Connection, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.service_name.clone()));

    match Connection::connect(&cfg.url, options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }
}

/// A channel owned by one role, recreated after channel-level errors.
pub struct AmqpChannel {
    connection: Arc<Connection>,
    inner: RwLock<Channel>,
    confirm_requested: bool,
    confirms: AtomicBool,
}

impl AmqpChannel {
    /// Opens a channel on `connection`. When `confirm` is set the channel is
    /// put in confirm mode, falling back to a non-confirming channel if the
    /// broker refuses.
    pub async fn open(connection: Arc<Connection>, confirm: bool) -> Result<Self, AmqpError> {
        let (channel, confirms) = create_channel(&connection, confirm).await?;

        Ok(AmqpChannel {
            connection,
            inner: RwLock::new(channel),
            confirm_requested: confirm,
            confirms: AtomicBool::new(confirms),
        })
    }

    /// The current lapin channel.
    pub async fn channel(&self) -> Channel {
        self.inner.read().await.clone()
    }

    /// Whether the broker acknowledges every publish on this channel.
    pub fn confirms_enabled(&self) -> bool {
        self.confirms.load(Ordering::Acquire)
    }

    /// Replaces the current channel with a freshly opened one.
    pub async fn reopen(&self) -> Result<(), AmqpError> {
        let (channel, confirms) = create_channel(&self.connection, self.confirm_requested).await?;

        *self.inner.write().await = channel;
        self.confirms.store(confirms, Ordering::Release);
        debug!("channel reopened");

        Ok(())
    }

    pub async fn close(&self) {
        let channel = self.channel().await;
        if channel.status().connected() {
            if let Err(err) = channel.close(200, "closing").await {
                debug!(error = err.to_string(), "error closing channel");
            }
        }
    }

    /// Maps a lapin failure to an `AmqpError`, reopening the channel first
    /// when the broker closed it.
    async fn failure(
        &self,
        err: lapin::Error,
        name: &str,
        otherwise: impl FnOnce() -> AmqpError,
    ) -> AmqpError {
        let soft = soft_error(&err);

        if soft.is_some() {
            if let Err(reopen_err) = self.reopen().await {
                return reopen_err;
            }
        }

        match soft {
            Some(AMQPSoftError::PRECONDITIONFAILED) => AmqpError::TopologyConflict(name.to_owned()),
            Some(AMQPSoftError::NOTFOUND) => AmqpError::NotFound(name.to_owned()),
            _ => {
                error!(error = err.to_string(), name, "amqp operation failed");
                otherwise()
            }
        }
    }
}

async fn create_channel(connection: &Connection, confirm: bool) -> Result<(Channel, bool), AmqpError> {
    debug!("creating amqp channel...");
    let channel = connection.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "error to create the channel");
        AmqpError::ChannelError(err.to_string())
    })?;

    if !confirm {
        return Ok((channel, false));
    }

    match channel.confirm_select(ConfirmSelectOptions::default()).await {
        Ok(()) => {
            debug!("confirm channel created");
            Ok((channel, true))
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                "confirm mode unavailable, publishing without broker confirmation"
            );

            if channel.status().connected() {
                return Ok((channel, false));
            }

            let plain = connection.create_channel().await.map_err(|err| {
                error!(error = err.to_string(), "error to create the channel");
                AmqpError::ChannelError(err.to_string())
            })?;
            Ok((plain, false))
        }
    }
}

fn soft_error(err: &lapin::Error) -> Option<AMQPSoftError> {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(soft) => Some(soft.clone()),
            AMQPErrorKind::Hard(_) => None,
        },
        _ => None,
    }
}

#[async_trait]
impl TopologyChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let result = self
            .channel()
            .await
            .exchange_declare(
                def.name(),
                def.kind(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self
                .failure(err, def.name(), || {
                    AmqpError::DeclareExchangeError(def.name().to_owned())
                })
                .await),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInspection, AmqpError> {
        let result = self
            .channel()
            .await
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await;

        match result {
            Ok(queue) => Ok(QueueInspection {
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
            Err(err) => Err(self
                .failure(err, def.name(), || {
                    AmqpError::DeclareQueueError(def.name().to_owned())
                })
                .await),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let result = self
            .channel()
            .await
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self
                .failure(err, binding.queue_name(), || {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name().to_owned(),
                        binding.queue_name().to_owned(),
                    )
                })
                .await),
        }
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .channel()
            .await
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
        }
    }

    async fn inspect_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let result = self
            .channel()
            .await
            .exchange_declare(
                name,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self
                .failure(err, name, || AmqpError::DeclareExchangeError(name.to_owned()))
                .await),
        }
    }

    async fn inspect_queue(&self, name: &str) -> Result<QueueInspection, AmqpError> {
        let result = self
            .channel()
            .await
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(queue) => Ok(QueueInspection {
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
            Err(err) => Err(self
                .failure(err, name, || AmqpError::DeclareQueueError(name.to_owned()))
                .await),
        }
    }
}

#[async_trait]
impl PublishChannel for AmqpChannel {
    fn confirms_enabled(&self) -> bool {
        AmqpChannel::confirms_enabled(self)
    }

    async fn is_open(&self) -> bool {
        self.channel().await.status().connected()
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<Receipt, AmqpError> {
        let confirm = self
            .channel()
            .await
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &message.payload,
                message.properties.clone(),
            )
            .await
            .map_err(|err| AmqpError::PublishRejected(err.to_string()))?;

        if !AmqpChannel::confirms_enabled(self) {
            return Ok(Receipt::Unconfirmed);
        }

        match confirm.await {
            Ok(Confirmation::Ack(_)) => Ok(Receipt::Acked),
            Ok(Confirmation::Nack(_)) => Ok(Receipt::Nacked),
            Ok(Confirmation::NotRequested) => Ok(Receipt::Unconfirmed),
            Err(err) => Err(AmqpError::PublishRejected(format!(
                "confirmation failed: {}",
                err
            ))),
        }
    }
}
