// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Logging and trace propagation setup for the service binaries.

use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the W3C trace-context propagator and a `fmt` subscriber filtered
/// by `RUST_LOG`, `info` when unset.
pub fn try_init() -> anyhow::Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
