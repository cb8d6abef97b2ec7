//! Test-only scaffolding: an in-process broker double plus helpers to wire
//! a client and a service together against it without a real network.

mod broker;

pub use broker::InProcessBroker;

use std::sync::Arc;

use osrf_bus::{ListBroker, TransportClient};
use osrf_wire::Address;

pub const DOMAIN: &str = "private.localhost";

/// Builds a [`TransportClient`] for `primary` against `broker`, already
/// connected (the double accepts any credentials).
pub async fn build_transport(broker: &InProcessBroker, primary: Address) -> Arc<TransportClient> {
    let handle = broker.handle();
    let factory: Arc<dyn Fn() -> Arc<dyn ListBroker> + Send + Sync> = Arc::new(move || handle.clone());
    let client = TransportClient::new(primary, factory);
    client.connect(DOMAIN, "localhost", 0, "opensrf", "testkit").await.unwrap();
    Arc::new(client)
}

pub fn client_address(hostname: &str, pid: u32, rand8: &str) -> Address {
    Address::client("opensrf", DOMAIN, hostname, pid, rand8)
}

pub fn service_address(service: &str) -> Address {
    Address::service("opensrf", DOMAIN, service)
}
