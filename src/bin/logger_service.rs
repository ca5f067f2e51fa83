// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use event_pipeline::{
    configs::{AmqpConfigs, Role},
    connection::ConnectionManager,
    dispatcher::EventConsumer,
    health::HealthProbe,
    http::{logger_router, serve, LoggerState},
    store::{MemoryEventStore, StoringHandler},
    telemetry,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::try_init()?;

    let cfg = AmqpConfigs::from_env(Role::Consumer)?;
    info!(
        service = %cfg.service_name,
        queue = %cfg.queue,
        routing_key = %cfg.routing_key,
        "starting logger service"
    );

    let store = MemoryEventStore::new();
    let consumer = Arc::new(EventConsumer::new(cfg.clone()).register(StoringHandler::new(store.clone())));

    let manager = ConnectionManager::new(cfg.clone()).with_hook(consumer);
    let health = Arc::new(HealthProbe::new(cfg.clone()).with_connection_state(manager.subscribe()));
    let manager = Arc::new(manager.with_hook(health.clone()));

    let supervisor = manager.start().await?;
    let checks = health.spawn_periodic(cfg.health_check_interval);

    let router = logger_router(LoggerState { store, health });
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    };
    serve(router, cfg.http_port, shutdown).await?;

    checks.abort();
    manager.shutdown().await;
    let _ = supervisor.await;

    Ok(())
}
