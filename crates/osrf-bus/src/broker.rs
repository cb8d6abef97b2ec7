//! The ordered-list broker primitive the bus transport is built on.
//!
//! Spec §1 explicitly puts the broker itself out of scope: "we assume an
//! ordered list service per address with blocking pop (BLPOP-style) and
//! non-blocking pop, plus authenticated append (RPUSH-style)". This trait
//! *is* that assumption, expressed so a real network client and the
//! in-process test double (`osrf-testkit`) can share everything above it.

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopTimeout {
    /// `timeout == 0`: return immediately, `Ok(None)` if the list is empty.
    NonBlocking,
    /// `timeout < 0`: block until an item is available.
    Indefinite,
    /// `timeout > 0`: block up to this many whole seconds.
    Seconds(u32),
}

impl From<i64> for PopTimeout {
    fn from(timeout: i64) -> Self {
        match timeout {
            0 => PopTimeout::NonBlocking,
            t if t < 0 => PopTimeout::Indefinite,
            t => PopTimeout::Seconds(t as u32),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

/// An ordered list service: authenticated append on one side, blocking or
/// non-blocking pop on the other.
#[async_trait]
pub trait ListBroker: Send + Sync {
    async fn connect(&self, host: &str, port: u16, user: &str, password: &str) -> Result<(), BrokerError>;

    async fn push(&self, address: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Pop one item from `address`'s list.
    ///
    /// `timeout` governs blocking behavior per [`PopTimeout`]. Implementations
    /// of `Seconds` MUST loop internally if the underlying primitive returns
    /// early (clock drift may shorten an individual attempt) until the full
    /// duration has elapsed or an item arrives — callers only ever see one
    /// logical wait.
    async fn pop(&self, address: &str, timeout: PopTimeout) -> Result<Option<Vec<u8>>, BrokerError>;

    async fn disconnect(&self);
}

/// Back-off applied after a broker-level error, to avoid flooding the log
/// with repeated failures (spec §4.2).
pub const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(3);
