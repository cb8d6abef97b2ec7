//! Broker-backed bus transport: the [`broker::ListBroker`] abstraction, its
//! per-domain [`transport::Bus`], and the process-wide [`client::TransportClient`]
//! that routes by recipient domain (spec §4.2-4.3).

mod broker;
mod client;
mod frame;
mod transport;

pub use broker::{BrokerError, ListBroker, PopTimeout, BROKER_ERROR_BACKOFF};
pub use client::{ClientError, TransportClient};
pub use transport::{Bus, BusError};
