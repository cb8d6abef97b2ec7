//! One authenticated connection to a single bus domain (spec §4.2).

use std::sync::Arc;

use osrf_wire::Envelope;
use tracing::warn;

use crate::broker::{BrokerError, ListBroker, PopTimeout, BROKER_ERROR_BACKOFF};
use crate::frame;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("malformed frame popped from broker: {0}")]
    MalformedFrame(String),
}

/// A bus transport for one domain. Owns one authenticated [`ListBroker`]
/// connection; a process holds one `Bus` per domain it talks to
/// ([`crate::TransportClient`]).
#[derive(Clone)]
pub struct Bus {
    broker: Arc<dyn ListBroker>,
    domain: String,
}

impl Bus {
    pub fn new(broker: Arc<dyn ListBroker>, domain: impl Into<String>) -> Self {
        Bus {
            broker,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub async fn connect(&self, host: &str, port: u16, user: &str, password: &str) -> Result<(), BusError> {
        self.broker
            .connect(host, port, user, password)
            .await
            .inspect_err(|e| warn!(domain = %self.domain, error = %e, "bus connect failed"))?;
        Ok(())
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let bytes = frame::encode(envelope);
        match self.broker.push(&envelope.recipient.to_string(), bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(domain = %self.domain, recipient = %envelope.recipient, error = %e, "broker push failed; backing off");
                tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                Err(e.into())
            }
        }
    }

    /// `recv` with `timeout=0` is non-blocking; `timeout<0` blocks
    /// indefinitely; `timeout>0` blocks up to that many whole seconds. A
    /// missing item (empty list) is `Ok(None)`, never an error.
    pub async fn recv(&self, stream_address: &str, timeout: PopTimeout) -> Result<Option<Envelope>, BusError> {
        match self.broker.pop(stream_address, timeout).await {
            Ok(None) => Ok(None),
            Ok(Some(bytes)) => frame::decode(&bytes)
                .map(Some)
                .map_err(BusError::MalformedFrame),
            Err(e) => {
                warn!(domain = %self.domain, stream = %stream_address, error = %e, "broker pop failed; backing off");
                tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                Err(e.into())
            }
        }
    }

    pub async fn disconnect(&self) {
        self.broker.disconnect().await;
    }
}
