// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker-side entities the pipeline depends on and
//! never assumes pre-exist: the main topic exchange, the main queue, the
//! dead-letter exchange and queue, and the bindings between them.
//!
//! The main components are:
//! - `TopologyChannel` trait: the declare/bind/inspect operations of a channel
//! - `AmqpTopology`: an ordered set of declarations installed on a channel
//! - `TopologySpec` / `ensure_topology`: the pipeline's topology derived from configuration
//!
//! Installation is idempotent. Re-declaring an entity with identical arguments
//! is a no-op on the broker; a declaration that conflicts with an existing
//! definition is logged and the existing entity is used as-is after a passive
//! existence check.

use crate::{
    configs::{AmqpConfigs, Role},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

/// Depth and consumer count reported for a queue by a declare or passive check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInspection {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Channel operations needed to install and inspect the topology.
///
/// Implementations report a declaration conflicting with existing broker state
/// as `AmqpError::TopologyConflict` and a failed passive check as
/// `AmqpError::NotFound`; they are responsible for leaving the channel usable
/// after either.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInspection, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Passive exchange check; never creates or mutates the exchange.
    async fn inspect_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Passive queue check; never creates or mutates the queue.
    async fn inspect_queue(&self, name: &str) -> Result<QueueInspection, AmqpError>;
}

/// Interface for registering topology entities and installing them.
#[async_trait]
pub trait Topology {
    fn exchange(self, def: ExchangeDefinition) -> Self;

    fn queue(self, def: QueueDefinition) -> Self;

    fn queue_binding(self, binding: QueueBinding) -> Self;

    fn prefetch(self, prefetch: u16) -> Self;

    /// Declares every exchange, then every queue, then every binding, then
    /// applies the prefetch, in registration order.
    async fn install(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError>;
}

/// Ordered collection of declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) prefetch: Option<u16>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    async fn install(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await?;

        if let Some(prefetch) = self.prefetch {
            channel.set_prefetch(prefetch).await?;
            debug!(prefetch, "prefetch applied");
        }

        Ok(())
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("declaring exchange: {}", exch.name);

            match channel.declare_exchange(exch).await {
                Ok(()) => debug!("exchange: {} is ready", exch.name),
                Err(AmqpError::TopologyConflict(name)) => {
                    warn!(
                        exchange = %name,
                        "exchange exists with different arguments, using the existing one"
                    );
                    channel.inspect_exchange(&exch.name).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("declaring queue: {}", def.name);

            match channel.declare_queue(def).await {
                Ok(inspection) => debug!(
                    messages = inspection.message_count,
                    consumers = inspection.consumer_count,
                    "queue: {} is ready",
                    def.name
                ),
                Err(AmqpError::TopologyConflict(name)) => {
                    warn!(
                        queue = %name,
                        "queue exists with different arguments, using the existing one"
                    );
                    channel.inspect_queue(&def.name).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// The pipeline topology for one side, derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter: Option<DeadLetterSpec>,
    pub prefetch: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSpec {
    pub exchange: String,
    pub queue: String,
    /// Key the main queue dead-letters with.
    pub routing_key: String,
    /// Key the dead-letter queue is bound with.
    pub binding_key: String,
}

impl TopologySpec {
    pub fn from_configs(cfg: &AmqpConfigs) -> Self {
        let dead_letter = cfg.dead_letter_enabled.then(|| DeadLetterSpec {
            exchange: cfg.dead_letter_exchange(),
            queue: cfg.dead_letter_queue(),
            routing_key: cfg.dead_letter_routing_key.clone(),
            binding_key: cfg.dead_letter_binding.clone(),
        });

        TopologySpec {
            exchange: cfg.exchange.clone(),
            queue: cfg.queue.clone(),
            routing_key: cfg.routing_key.clone(),
            dead_letter,
            prefetch: cfg.prefetch,
        }
    }

    /// Declarations in installation order: main exchange, dead-letter
    /// exchange, dead-letter queue, main queue, then the dead-letter and main
    /// bindings.
    pub fn to_topology(&self) -> AmqpTopology {
        let mut topology = AmqpTopology::new().exchange(
            ExchangeDefinition::new(&self.exchange).durable(),
        );
        let mut main_queue = QueueDefinition::new(&self.queue).durable();

        if let Some(dl) = &self.dead_letter {
            topology = topology
                .exchange(ExchangeDefinition::new(&dl.exchange).durable())
                .queue(QueueDefinition::new(&dl.queue).durable())
                .queue_binding(
                    QueueBinding::new(&dl.queue)
                        .exchange(&dl.exchange)
                        .routing_key(&dl.binding_key),
                );
            main_queue = main_queue.with_dead_letter(&dl.exchange, &dl.routing_key);
        }

        topology
            .queue(main_queue)
            .queue_binding(
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(&self.routing_key),
            )
            .prefetch(self.prefetch)
    }
}

/// Idempotently establishes the pipeline topology for `cfg` on `channel`.
///
/// Runs on every (re)connect, before the owning role uses its channel.
/// Declarations identical to what the broker already holds are no-ops; a
/// conflicting one is logged and the existing entity is used as it is.
///
/// # Parameters
/// * `channel` - The role's own channel.
/// * `cfg` - Names, routing and binding keys, dead-letter settings and
///   prefetch for this side of the pipeline.
///
/// # Returns
/// * `Ok(())` once the exchange, queue, binding and, when enabled, the
///   dead-letter exchange, queue and binding exist
/// * `Err(AmqpError)` for the first declaration that neither succeeded nor
///   matched an existing entity
pub async fn ensure_topology(
    channel: &dyn TopologyChannel,
    cfg: &AmqpConfigs,
) -> Result<(), AmqpError> {
    let spec = TopologySpec::from_configs(cfg);
    spec.to_topology().install(channel).await?;

    debug!(
        side = match cfg.role {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        },
        exchange = %spec.exchange,
        queue = %spec.queue,
        routing_key = %spec.routing_key,
        "topology ensured"
    );

    Ok(())
}
