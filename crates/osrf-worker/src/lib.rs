//! Worker-pool listener (spec §4.6), redesigned from one-process-per-worker
//! to one-tokio-task-per-worker within a single process (see `SPEC_FULL.md`
//! REDESIGN FLAGS). A worker "dying" is a task ending instead of a child
//! process exiting; it's reaped the same way — noticed, removed from the
//! child list, and replaced if below `min_children`.
//!
//! The original's IPC pipe pair (parent hands an envelope to a worker, the
//! worker signals idle back) becomes a pair of `tokio::sync::mpsc` channels.
//! Since every task shares the process's one [`osrf_bus::TransportClient`]
//! rather than a duplicated per-child socket, there's no "discard, don't
//! disconnect" step to perform on handoff — that step existed only to free
//! a child's private connection state, which doesn't exist here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use osrf_bus::TransportClient;
use osrf_session::Stack;
use osrf_wire::{status, Address, Envelope};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub min_children: u32,
    pub max_children: u32,
    pub max_backlog_queue: u32,
    pub max_requests: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            min_children: 3,
            max_children: 30,
            max_backlog_queue: 1000,
            max_requests: 1000,
        }
    }
}

type WorkerTx = mpsc::Sender<Envelope>;

/// Owns the idle/active worker accounting and the backlog queue for one
/// service. One `WorkerPool` per registered application (spec: "one
/// process per registered C-language service").
pub struct WorkerPool {
    config: WorkerPoolConfig,
    stack: Arc<Stack>,
    transport: Arc<TransportClient>,
    idle: Mutex<VecDeque<WorkerTx>>,
    active_count: AtomicU32,
    backlog: Mutex<VecDeque<Envelope>>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, stack: Arc<Stack>, transport: Arc<TransportClient>) -> Self {
        WorkerPool {
            config,
            stack,
            transport,
            idle: Mutex::new(VecDeque::new()),
            active_count: AtomicU32::new(0),
            backlog: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Brings the pool up to `min_children` idle workers. Call once at
    /// startup, before accepting REQUESTs.
    pub async fn warm_up(self: &Arc<Self>) {
        for _ in 0..self.config.min_children {
            self.spawn_worker().await;
        }
    }

    pub async fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    async fn spawn_worker(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel(1);
        self.active_count.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(pool.run_worker(rx, tx.clone()));
        drop(tasks);
        self.idle.lock().await.push_back(tx);
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>, self_tx: WorkerTx) {
        let mut served = 0u32;
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = self.stack.handle_envelope(envelope).await {
                warn!(error = %e, "worker: error handling envelope");
            }
            served += 1;
            if served >= self.config.max_requests {
                debug!(served, "worker retiring after max_requests");
                break;
            }
            self.drain_backlog_into(&self_tx).await;
            self.idle.lock().await.push_back(self_tx.clone());
        }
        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// If the backlog has work waiting, hand the oldest entry straight to
    /// this worker instead of going back on the idle list — equivalent to
    /// the original picking this worker off the idle list immediately.
    async fn drain_backlog_into(&self, tx: &WorkerTx) {
        let mut backlog = self.backlog.lock().await;
        if let Some(envelope) = backlog.pop_front() {
            drop(backlog);
            let _ = tx.send(envelope).await;
        }
    }

    /// Hands `envelope` to an idle worker, spawning one if below
    /// `max_children`, queuing it if at the ceiling, or replying
    /// STATUS(SERVICE_UNAVAILABLE) if the backlog is also full (spec
    /// §4.6).
    pub async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        if let Some(tx) = self.idle.lock().await.pop_front() {
            if tx.send(envelope).await.is_err() {
                warn!("idle worker channel closed; dropping envelope");
            }
            return;
        }

        if self.active_count().await < self.config.max_children {
            self.spawn_worker().await;
            if let Some(tx) = self.idle.lock().await.pop_front() {
                let _ = tx.send(envelope).await;
                return;
            }
        }

        let mut backlog = self.backlog.lock().await;
        if (backlog.len() as u32) < self.config.max_backlog_queue {
            backlog.push_back(envelope);
            return;
        }
        drop(backlog);

        warn!("backlog full; replying service-unavailable");
        self.reply_service_unavailable(&envelope).await;
    }

    async fn reply_service_unavailable(&self, envelope: &Envelope) {
        let message = osrf_wire::ProtocolMessage::status(0, status::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", "backlog full");
        let codec = osrf_wire::JsonCodec;
        let mut locale = osrf_wire::LocaleContext::new();
        use osrf_wire::EnvelopeCodec;
        let body = codec.serialize_batch(std::slice::from_ref(&message), &mut locale);
        let reply = Envelope::new(envelope.recipient.clone(), envelope.sender.clone(), envelope.thread.clone());
        if let Ok(reply) = reply {
            let _ = self.transport.send(&reply.with_body(body)).await;
        }
    }

    /// Reaps any workers that exited on their own (error, `max_requests`
    /// reached) and respawns until back at `min_children`. Intended to run
    /// on a periodic tick from the owning service loop.
    pub async fn reap_and_respawn(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        drop(tasks);
        while self.active_count().await < self.config.min_children {
            self.spawn_worker().await;
        }
    }

    /// Cooperative shutdown: aborts every worker task. The in-process
    /// equivalent of sending SIGTERM to the process group.
    pub async fn shutdown(&self) {
        info!("worker pool shutting down");
        self.tasks.lock().await.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osrf_bus::{BrokerError, ListBroker, PopTimeout};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct NullBroker {
        lists: StdMutex<std::collections::HashMap<String, Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl ListBroker for NullBroker {
        async fn connect(&self, _h: &str, _p: u16, _u: &str, _pw: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn push(&self, address: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.lists.lock().unwrap().entry(address.to_owned()).or_default().push(payload);
            Ok(())
        }
        async fn pop(&self, address: &str, _timeout: PopTimeout) -> Result<Option<Vec<u8>>, BrokerError> {
            Ok(self.lists.lock().unwrap().get_mut(address).and_then(|v| (!v.is_empty()).then(|| v.remove(0))))
        }
        async fn disconnect(&self) {}
    }

    fn make_stack() -> (Arc<Stack>, Arc<TransportClient>) {
        let broker: Arc<dyn ListBroker> = Arc::new(NullBroker::default());
        let factory = Arc::new(move || broker.clone());
        let me: Address = "opensrf:service:router:private.localhost:opensrf.math".parse().unwrap();
        let transport = Arc::new(TransportClient::new(me, factory));
        let stack = Arc::new(Stack::new(transport.clone(), None, Some("opensrf.math".to_owned())));
        (stack, transport)
    }

    #[tokio::test]
    async fn warm_up_brings_pool_to_min_children() {
        let (stack, transport) = make_stack();
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                min_children: 2,
                ..Default::default()
            },
            stack,
            transport,
        ));
        pool.warm_up().await;
        assert_eq!(pool.active_count().await, 2);
        assert_eq!(pool.idle_count().await, 2);
    }

    #[tokio::test]
    async fn dispatch_beyond_max_children_queues_backlog() {
        let (stack, transport) = make_stack();
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                min_children: 0,
                max_children: 1,
                max_backlog_queue: 5,
                max_requests: 1000,
            },
            stack,
            transport,
        ));
        let sender: Address = "opensrf:client:router:private.localhost:h:1:aa".parse().unwrap();
        let recipient: Address = "opensrf:service:router:private.localhost:opensrf.math".parse().unwrap();

        // First dispatch spawns the one allowed worker and hands it the
        // envelope directly (it's sent before the worker can drain it).
        let e1 = Envelope::new(sender.clone(), recipient.clone(), "t1").unwrap();
        pool.dispatch(e1).await;
        assert_eq!(pool.active_count().await, 1);

        // Second dispatch: no idle worker (busy or not yet re-queued), at
        // max_children, so it lands in the backlog.
        let e2 = Envelope::new(sender, recipient, "t2").unwrap();
        pool.dispatch(e2).await;
        assert!(pool.idle_count().await + pool.backlog_len().await >= 1);
    }
}
