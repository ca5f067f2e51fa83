// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable event pipeline over RabbitMQ: a publisher side that emits log
//! records and structured events, and a consumer side that stores them, with
//! reconnects, dead-lettering and health reporting shared by both.

mod otel;

pub mod backoff;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod health;
pub mod http;
pub mod publisher;
pub mod queue;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod topology;
