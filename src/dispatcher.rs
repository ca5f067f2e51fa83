// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Dispatcher
//!
//! [`EventConsumer`] subscribes to the configured queue and dispatches every
//! delivery to its registered handlers, in registration order.
//!
//! It is driven by the connection manager: on every (re)connect it opens its
//! own channel, re-asserts the topology (which also applies the prefetch
//! window), and starts a consume loop. The loop ending is reported as a lost
//! connection so the manager reconnects.

use crate::{
    channel::AmqpChannel,
    configs::AmqpConfigs,
    connection::{ConnectionHook, ConnectionSignal},
    consumer::{consume, EventHandler},
    errors::AmqpError,
    topology::ensure_topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Connection};
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info};
use uuid::Uuid;

pub struct EventConsumer {
    cfg: AmqpConfigs,
    handlers: Vec<Arc<dyn EventHandler>>,
    channel: RwLock<Option<Arc<AmqpChannel>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(cfg: AmqpConfigs) -> Self {
        EventConsumer {
            cfg,
            handlers: vec![],
            channel: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Adds a handler; handlers run in registration order.
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn is_consuming(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.channel.write().await.take();
    }
}

#[async_trait]
impl ConnectionHook for EventConsumer {
    fn name(&self) -> &str {
        "consumer"
    }

    async fn on_connected(
        &self,
        connection: Arc<Connection>,
        signal: ConnectionSignal,
    ) -> Result<(), AmqpError> {
        self.stop().await;

        let channel = Arc::new(AmqpChannel::open(connection, self.cfg.confirm_channel).await?);
        ensure_topology(channel.as_ref(), &self.cfg).await?;

        let consumer_tag = format!("{}-{}", self.cfg.service_name, Uuid::new_v4());
        let mut consumer = match channel
            .channel()
            .await
            .basic_consume(
                &self.cfg.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(self.cfg.queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(
            queue = %self.cfg.queue,
            consumer_tag = %consumer_tag,
            prefetch = self.cfg.prefetch,
            "consuming"
        );

        let handlers = self.handlers.clone();
        let spawned = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = consume(&tracer, &delivery, &handlers).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "consumer stream failed");
                        break;
                    }
                }
            }

            debug!("consumer stream ended");
            signal.lost("consumer stream ended");
        });

        *self.task.lock().await = Some(spawned);
        *self.channel.write().await = Some(channel);

        Ok(())
    }

    async fn on_disconnected(&self) {
        self.stop().await;
    }
}
