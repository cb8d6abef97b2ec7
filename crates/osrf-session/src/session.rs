//! A single application session: the unit the stack keys inbound traffic by
//! (spec §3 "Application session").

use std::collections::{HashMap, VecDeque};

use osrf_wire::{Address, ProtocolMessage};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

struct SessionState {
    remote: Address,
    original_remote: Address,
    connected: bool,
    next_trace: i64,
    inbound: VecDeque<ProtocolMessage>,
    transport_error: bool,
    pending: HashMap<i64, ProtocolMessage>,
}

/// Keyed by thread id in a [`crate::SessionRegistry`]. Exactly one exists
/// per (process, thread id) (spec §3 invariant).
///
/// Mutable fields live behind a single `tokio::sync::Mutex` rather than
/// several, since every mutation the stack makes touches more than one of
/// them at once (e.g. a REDIRECTED status clears the remote *and* flips
/// `connected`).
pub struct Session {
    pub thread: String,
    pub role: Role,
    pub service: Option<String>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(thread: impl Into<String>, role: Role, remote: Address, service: Option<String>) -> Self {
        let thread = thread.into();
        Session {
            thread,
            role,
            service,
            state: Mutex::new(SessionState {
                original_remote: remote.clone(),
                remote,
                connected: false,
                next_trace: 1,
                inbound: VecDeque::new(),
                transport_error: false,
                pending: HashMap::new(),
            }),
        }
    }

    pub async fn remote(&self) -> Address {
        self.state.lock().await.remote.clone()
    }

    pub async fn original_remote(&self) -> Address {
        self.state.lock().await.original_remote.clone()
    }

    pub async fn set_remote(&self, remote: Address) {
        self.state.lock().await.remote = remote;
    }

    /// Moves `original_remote` to the session's current remote. Called once
    /// a redirected resend has actually succeeded, per the resolved open
    /// question on REDIRECTED handling (see `DESIGN.md`).
    pub async fn promote_remote_to_original(&self) {
        let mut state = self.state.lock().await;
        state.original_remote = state.remote.clone();
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn mark_connected(&self) {
        self.state.lock().await.connected = true;
    }

    /// Clears the remote back to the original and marks disconnected — the
    /// shared action behind REDIRECTED, EXPFAILED, and TIMEOUT (spec §4.4).
    pub async fn clear_remote_and_disconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.remote = state.original_remote.clone();
    }

    pub async fn mark_disconnected(&self) {
        self.state.lock().await.connected = false;
    }

    pub async fn has_transport_error(&self) -> bool {
        self.state.lock().await.transport_error
    }

    pub async fn set_transport_error(&self) {
        self.state.lock().await.transport_error = true;
    }

    /// Remembers an outbound CONNECT/REQUEST so it can be resent if its
    /// reply turns out to be REDIRECTED/TIMEOUT (spec §4.4).
    pub async fn record_pending(&self, trace: i64, message: ProtocolMessage) {
        self.state.lock().await.pending.insert(trace, message);
    }

    /// Removes and returns the pending message for `trace`, if any.
    pub async fn take_pending(&self, trace: i64) -> Option<ProtocolMessage> {
        self.state.lock().await.pending.remove(&trace)
    }

    /// Removes and returns every pending message, oldest first. Used when a
    /// REDIRECTED/TIMEOUT arrives without a specific trace attached (a
    /// transport-error rewrite applies to the whole outstanding batch, not
    /// one request).
    pub async fn take_all_pending(&self) -> Vec<ProtocolMessage> {
        let mut state = self.state.lock().await;
        let mut traces: Vec<i64> = state.pending.keys().copied().collect();
        traces.sort_unstable();
        traces.into_iter().filter_map(|t| state.pending.remove(&t)).collect()
    }

    /// Drops the pending entry for `trace` without resending it (COMPLETE,
    /// EXPFAILED).
    pub async fn clear_pending(&self, trace: i64) {
        self.state.lock().await.pending.remove(&trace);
    }

    /// Allocates the next monotonically increasing thread-trace number
    /// within this session.
    pub async fn next_trace(&self) -> i64 {
        let mut state = self.state.lock().await;
        let trace = state.next_trace;
        state.next_trace += 1;
        trace
    }

    pub async fn push_inbound(&self, message: ProtocolMessage) {
        self.state.lock().await.inbound.push_back(message);
    }

    /// Removes and returns the first queued message matching `trace` or, if
    /// `accept_any_status` is set, the first queued STATUS regardless of
    /// trace (used to notice a session-wide REDIRECTED/TIMEOUT/EXPFAILED
    /// while waiting on a specific request). Messages that don't match are
    /// left in place for sibling waiters, per the spec's FIFO-per-session
    /// invariant.
    pub async fn take_matching(&self, trace: i64) -> Option<ProtocolMessage> {
        let mut state = self.state.lock().await;
        let idx = state.inbound.iter().position(|m| m.thread_trace() == trace)?;
        state.inbound.remove(idx)
    }

    pub async fn inbound_len(&self) -> usize {
        self.state.lock().await.inbound.len()
    }

    /// A session-wide STATUS carries `thread_trace == 0` when it was
    /// synthesized from a transport-error rewrite rather than tied to one
    /// outstanding request (spec §4.4's transport-error handling doesn't
    /// have a request trace to attach). Any caller blocked in
    /// `recv_response` should treat one of these as applying to its own
    /// wait.
    pub async fn take_broadcast_status(&self) -> Option<ProtocolMessage> {
        let mut state = self.state.lock().await;
        let idx = state
            .inbound
            .iter()
            .position(|m| matches!(m, ProtocolMessage::Status { thread_trace: 0, .. }))?;
        state.inbound.remove(idx)
    }
}
