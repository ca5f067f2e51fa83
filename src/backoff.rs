// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Backoff
//!
//! Exponential backoff used by the connection manager. The delay before the
//! `k`-th reconnect attempt is `min(base * 2^(k-1), 30s)`, and no attempt is
//! made past the configured maximum.

use crate::{configs::AmqpConfigs, errors::AmqpError};
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Upper bound for a single backoff delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            max_delay: MAX_RECONNECT_DELAY,
            max_attempts,
        }
    }

    pub fn from_configs(cfg: &AmqpConfigs) -> Self {
        Self::new(cfg.reconnect_base_delay, cfg.max_reconnect_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait before the 1-based `attempt`, or `None` once the attempt
    /// budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max_delay);

        Some(delay.min(self.max_delay))
    }

    /// Runs `op` until it succeeds, sleeping the backoff delay before every
    /// attempt.
    ///
    /// # Parameters
    /// * `cancelled` - Resolves when retrying must stop. It is raced against
    ///   every delay and every attempt.
    /// * `op` - One attempt, given its 1-based number.
    ///
    /// # Returns
    /// The first successful result, `AmqpError::Closed` once `cancelled`
    /// resolves, or `AmqpError::BrokerUnavailable` when every attempt failed.
    pub async fn retry<T, F, Fut, C>(&self, cancelled: C, mut op: F) -> Result<T, AmqpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancelled);
        let mut attempt = 1;

        while let Some(delay) = self.delay(attempt) {
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect attempt"
            );

            let result = tokio::select! {
                _ = &mut cancelled => None,
                result = async {
                    tokio::time::sleep(delay).await;
                    op(attempt).await
                } => Some(result),
            };

            match result {
                None => {
                    debug!(attempt, "reconnect cancelled");
                    return Err(AmqpError::Closed);
                }
                Some(Ok(value)) => return Ok(value),
                Some(Err(err)) => warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    error = err.to_string(),
                    "reconnect attempt failed"
                ),
            }

            attempt += 1;
        }

        Err(AmqpError::BrokerUnavailable(self.max_attempts))
    }
}
