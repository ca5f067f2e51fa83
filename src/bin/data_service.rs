// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use event_pipeline::{
    configs::{AmqpConfigs, Role},
    connection::ConnectionManager,
    health::HealthProbe,
    http::{data_router, serve, DataState},
    publisher::EventPublisher,
    telemetry,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::try_init()?;

    let cfg = AmqpConfigs::from_env(Role::Producer)?;
    info!(
        service = %cfg.service_name,
        exchange = %cfg.exchange,
        routing_key = %cfg.routing_key,
        "starting data service"
    );

    let publisher = EventPublisher::new(cfg.clone());
    let manager = ConnectionManager::new(cfg.clone()).with_hook(publisher.clone());
    let health = Arc::new(
        HealthProbe::new(cfg.clone())
            .with_connection_state(manager.subscribe())
            .with_publisher(publisher.clone()),
    );
    let manager = Arc::new(manager.with_hook(health.clone()));

    let supervisor = manager.start().await?;
    let checks = health.spawn_periodic(cfg.health_check_interval);

    let router = data_router(DataState {
        publisher,
        health,
    });
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
