//! Thread-indexed session registry (spec §3, §4.4).

use std::sync::Arc;

use indexmap::IndexMap;
use osrf_wire::Address;
use rand::Rng;
use tokio::sync::Mutex;

use crate::session::{Role, Session};

/// Process-wide registry of live sessions, keyed by thread id. Written at
/// session creation/destruction, read on every inbound envelope.
pub struct SessionRegistry {
    sessions: Mutex<IndexMap<String, Arc<Session>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry {
            sessions: Mutex::new(IndexMap::new()),
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, thread: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(thread).cloned()
    }

    /// Creates a new client session for a call the local process is
    /// initiating. The thread id is a fresh random hex string.
    pub async fn create_client(&self, remote: Address) -> Arc<Session> {
        let thread = random_thread_id();
        let session = Arc::new(Session::new(thread.clone(), Role::Client, remote, None));
        self.sessions.lock().await.insert(thread, session.clone());
        session
    }

    /// Finds the session for `thread`, or — if `service` is given —
    /// constructs a new server session for a REQUEST arriving on a
    /// previously unknown thread (spec §4.4 step 3).
    pub async fn find_or_create_server(&self, thread: &str, remote: Address, service: Option<&str>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(thread) {
            return Some(existing.clone());
        }
        let service = service?;
        let session = Arc::new(Session::new(thread, Role::Server, remote, Some(service.to_owned())));
        sessions.insert(thread.to_owned(), session.clone());
        Some(session)
    }

    pub async fn remove(&self, thread: &str) {
        self.sessions.lock().await.shift_remove(thread);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn random_thread_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
