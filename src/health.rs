// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Health Probe
//!
//! Passively checks that the pipeline's exchange and queues exist and reports
//! their depth. Checks never declare or modify anything. The last result is
//! cached so [`HealthProbe::get_status`] answers without a broker round-trip.

use crate::{
    channel::AmqpChannel,
    configs::AmqpConfigs,
    connection::{ConnectionHook, ConnectionSignal, ConnectionState},
    errors::AmqpError,
    publisher::EventPublisher,
    topology::{QueueInspection, TopologyChannel},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::Connection;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    /// Name of the connection state.
    pub connection: String,
    pub exchange_ok: bool,
    pub queue_ok: bool,
    /// `false` as well when dead-lettering is disabled.
    pub dead_letter_ok: bool,
    pub message_count: u32,
    pub consumer_count: u32,
    pub dead_letter_count: u32,
    /// `Some(false)` when the publisher fell back to unconfirmed publishing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_confirms: Option<bool>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn down(connection: &str) -> Self {
        HealthStatus {
            status: HealthState::Down,
            connection: connection.to_owned(),
            exchange_ok: false,
            queue_ok: false,
            dead_letter_ok: false,
            message_count: 0,
            consumer_count: 0,
            dead_letter_count: 0,
            delivery_confirms: None,
            last_checked: None,
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthState::Up
    }
}

pub struct HealthProbe {
    cfg: AmqpConfigs,
    connection_state: Option<watch::Receiver<ConnectionState>>,
    publisher: Option<Arc<EventPublisher>>,
    channel: RwLock<Option<Arc<dyn TopologyChannel>>>,
    status: RwLock<HealthStatus>,
}

impl HealthProbe {
    pub fn new(cfg: AmqpConfigs) -> Self {
        HealthProbe {
            cfg,
            connection_state: None,
            publisher: None,
            channel: RwLock::new(None),
            status: RwLock::new(HealthStatus::down(ConnectionState::Disconnected.as_str())),
        }
    }

    /// Reports the manager's connection state; checks are skipped while it
    /// is not connected.
    pub fn with_connection_state(mut self, state: watch::Receiver<ConnectionState>) -> Self {
        self.connection_state = Some(state);
        self
    }

    /// Reports whether `publisher` runs in confirm mode.
    pub fn with_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Uses `channel` for passive checks until the next disconnect.
    pub async fn attach(&self, channel: Arc<dyn TopologyChannel>) {
        *self.channel.write().await = Some(channel);
    }

    /// The last computed status.
    pub async fn get_status(&self) -> HealthStatus {
        self.status.read().await.clone()
    }

    /// Runs the passive checks, caches and returns the result.
    pub async fn check_health(&self) -> HealthStatus {
        let connection = self.connection_name().await;
        let delivery_confirms = match &self.publisher {
            Some(publisher) => publisher.confirms_enabled().await,
            None => None,
        };

        let connected = self
            .connection_state
            .as_ref()
            .map_or(true, |state| state.borrow().is_connected());
        let channel = self.channel.read().await.clone();

        let mut status = match channel {
            Some(channel) if connected => match self.inspect(channel.as_ref()).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(error = err.to_string(), "health check failed");
                    HealthStatus::down(&connection)
                }
            },
            _ => HealthStatus::down(&connection),
        };

        status.connection = connection;
        status.delivery_confirms = delivery_confirms;
        status.last_checked = Some(Utc::now());

        debug!(up = status.is_up(), "health checked");
        *self.status.write().await = status.clone();

        status
    }

    /// Re-runs [`HealthProbe::check_health`] every `interval`, first run
    /// immediately.
    ///
    /// With a connection state attached, a check also runs every time the
    /// manager reaches `Connected`, so the cached status turns up as soon as
    /// a (re)connect completes rather than on the next tick.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let probe = self.clone();
        let mut watcher = self.connection_state.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                let changed = match watcher.as_mut() {
                    None => {
                        ticker.tick().await;
                        None
                    }
                    Some(state) => tokio::select! {
                        _ = ticker.tick() => None,
                        changed = state.changed() => {
                            Some(changed.map(|()| state.borrow_and_update().is_connected()))
                        }
                    },
                };

                match changed {
                    Some(Err(_)) => {
                        debug!("connection state closed, checking on the interval only");
                        watcher = None;
                        continue;
                    }
                    Some(Ok(false)) => continue,
                    Some(Ok(true)) | None => {}
                }

                probe.check_health().await;
            }
        })
    }

    async fn inspect(&self, channel: &dyn TopologyChannel) -> Result<HealthStatus, AmqpError> {
        channel.inspect_exchange(&self.cfg.exchange).await?;
        let queue = channel.inspect_queue(&self.cfg.queue).await?;

        let mut dead_letter = None;
        if self.cfg.dead_letter_enabled {
            channel
                .inspect_exchange(&self.cfg.dead_letter_exchange())
                .await?;
            dead_letter = Some(
                channel
                    .inspect_queue(&self.cfg.dead_letter_queue())
                    .await?,
            );
        }

        let QueueInspection {
            message_count,
            consumer_count,
        } = queue;

        Ok(HealthStatus {
            status: HealthState::Up,
            connection: String::new(),
            exchange_ok: true,
            queue_ok: true,
            dead_letter_ok: dead_letter.is_some(),
            message_count,
            consumer_count,
            dead_letter_count: dead_letter.map(|dl| dl.message_count).unwrap_or_default(),
            delivery_confirms: None,
            last_checked: None,
        })
    }

    async fn connection_name(&self) -> String {
        if let Some(state) = &self.connection_state {
            return state.borrow().as_str().to_owned();
        }

        let state = if self.channel.read().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        state.as_str().to_owned()
    }
}

#[async_trait]
impl ConnectionHook for HealthProbe {
    fn name(&self) -> &str {
        "health"
    }

    async fn on_connected(
        &self,
        connection: Arc<Connection>,
        _signal: ConnectionSignal,
    ) -> Result<(), AmqpError> {
        let channel = AmqpChannel::open(connection, false).await?;
        self.attach(Arc::new(channel)).await;
        Ok(())
    }

    async fn on_disconnected(&self) {
        self.channel.write().await.take();

        let mut status = self.status.write().await;
        *status = HealthStatus {
            delivery_confirms: status.delivery_confirms,
            last_checked: Some(Utc::now()),
            ..HealthStatus::down(ConnectionState::Disconnected.as_str())
        };
    }
}
