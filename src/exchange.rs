// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The pipeline declares two exchanges, the main one and its dead-letter
//! exchange. Both are topic exchanges and neither is ever auto-deleted.

/// Definition of a topic exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable topic exchange definition named `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> lapin::ExchangeKind {
        lapin::ExchangeKind::Topic
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
