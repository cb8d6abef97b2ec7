//! An in-process stand-in for the real ordered-list broker, sharable
//! between a test's "client" and "service" transport clients so they can
//! talk to each other without a network (spec §1's broker is explicitly
//! out of scope; this is the test double against that boundary).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use osrf_bus::{BrokerError, ListBroker, PopTimeout};
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct Lists {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
}

/// Cloneable handle onto one shared in-memory broker. Every `TransportClient`
/// in a test that should be able to reach every other one is built from
/// the same `InProcessBroker::handle()`.
#[derive(Clone)]
pub struct InProcessBroker {
    lists: Arc<Mutex<Lists>>,
    notify: Arc<Notify>,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        InProcessBroker {
            lists: Arc::new(Mutex::new(Lists::default())),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<dyn ListBroker> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ListBroker for InProcessBroker {
    async fn connect(&self, _host: &str, _port: u16, _user: &str, _password: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn push(&self, address: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.lists.lock().await.queues.entry(address.to_owned()).or_default().push_back(payload);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, address: &str, timeout: PopTimeout) -> Result<Option<Vec<u8>>, BrokerError> {
        if let Some(item) = self.try_pop(address).await {
            return Ok(Some(item));
        }
        match timeout {
            PopTimeout::NonBlocking => Ok(None),
            PopTimeout::Indefinite => loop {
                self.notify.notified().await;
                if let Some(item) = self.try_pop(address).await {
                    return Ok(Some(item));
                }
            },
            PopTimeout::Seconds(seconds) => {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(u64::from(seconds));
                loop {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return Ok(self.try_pop(address).await);
                    }
                    let woke = tokio::time::timeout(remaining, self.notify.notified()).await.is_ok();
                    if let Some(item) = self.try_pop(address).await {
                        return Ok(Some(item));
                    }
                    if !woke {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn disconnect(&self) {}
}

impl InProcessBroker {
    async fn try_pop(&self, address: &str) -> Option<Vec<u8>> {
        self.lists.lock().await.queues.get_mut(address).and_then(|q| q.pop_front())
    }
}
