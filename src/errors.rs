// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Pipeline
//!
//! This module provides the error types shared by the producer and consumer
//! sides of the pipeline. `AmqpError` covers everything that can go wrong
//! while talking to the broker, `EnvelopeError` covers envelopes that fail
//! validation or cannot be decoded, `StoreError` covers the log store, and
//! `ConfigError` covers bad environment configuration.
//!
//! None of these are meant to cross a component boundary as a panic or an
//! unhandled failure: publishers turn them into a `PublishOutcome`, consumers
//! turn them into an ack/nack decision, and both log them.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker is unreachable, rejected the credentials or dropped the connection
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection manager was shut down
    #[error("connection manager closed")]
    Closed,

    /// The reconnect budget is exhausted; the broker is treated as unavailable
    #[error("broker unavailable after {0} reconnect attempts")]
    BrokerUnavailable(u32),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// A declaration conflicts with what already exists on the broker
    #[error("declaration of `{0}` conflicts with the existing broker definition")]
    TopologyConflict(String),

    /// A passive check found no entity with the given name
    #[error("`{0}` does not exist on the broker")]
    NotFound(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// The local send or the broker refused the message
    #[error("publish rejected `{0}`")]
    PublishRejected(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

/// Errors produced while building, validating or decoding an event envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The body is not valid UTF-8 JSON
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A required field is missing or empty
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field carries a value outside its allowed range
    #[error("invalid value `{value}` for field `{field}`")]
    InvalidField { field: &'static str, value: String },
}

/// Errors produced while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed into the expected type
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

/// Errors produced by an event store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The range end precedes its start
    #[error("invalid range `{start}` to `{end}`")]
    InvalidRange { start: String, end: String },

    /// The requested category is neither a log level nor an event type
    #[error("unknown event type `{0}`")]
    UnknownType(String),

    /// The backing storage failed
    #[error("storage failure `{0}`")]
    Storage(String),
}
