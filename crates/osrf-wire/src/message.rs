//! Protocol message types carried inside an envelope body.

use serde_json::Value;

/// Status codes used on the wire. Not exhaustive — any `i32` is legal,
/// these are just the ones the runtime itself synthesizes or dispatches on.
pub mod status {
    pub const CONTINUE: i32 = 100;
    pub const OK: i32 = 200;
    pub const NOCONTENT: i32 = 204;
    pub const COMPLETE: i32 = 205;
    pub const REDIRECTED: i32 = 307;
    pub const TIMEOUT: i32 = 408;
    pub const NOT_FOUND: i32 = 404;
    pub const EXPFAILED: i32 = 417;
    pub const INTERNAL_SERVER_ERROR: i32 = 500;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
}

/// Fields shared by every message variant (spec §3: "Shared optional fields
/// on every message").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Common {
    pub locale: Option<String>,
    pub tz: Option<String>,
    pub ingress: Option<String>,
    pub protocol_level: Option<String>,
}

pub const DEFAULT_LOCALE: &str = "en-US";

/// One protocol message. `thread_trace` is the monotonic-within-thread
/// request/response correlation number; the conversation-scoping `thread id`
/// itself lives on the enclosing [`crate::Envelope`], not here.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Connect {
        thread_trace: i64,
        common: Common,
    },
    Disconnect {
        thread_trace: i64,
        common: Common,
    },
    Status {
        thread_trace: i64,
        status_code: i32,
        status_name: String,
        status_text: String,
        common: Common,
    },
    Request {
        thread_trace: i64,
        method: String,
        params: Vec<Value>,
        common: Common,
    },
    Result {
        thread_trace: i64,
        status_code: i32,
        status_name: String,
        status_text: String,
        content: Value,
        common: Common,
    },
}

impl ProtocolMessage {
    pub fn thread_trace(&self) -> i64 {
        match self {
            ProtocolMessage::Connect { thread_trace, .. }
            | ProtocolMessage::Disconnect { thread_trace, .. }
            | ProtocolMessage::Status { thread_trace, .. }
            | ProtocolMessage::Request { thread_trace, .. }
            | ProtocolMessage::Result { thread_trace, .. } => *thread_trace,
        }
    }

    pub fn common(&self) -> &Common {
        match self {
            ProtocolMessage::Connect { common, .. }
            | ProtocolMessage::Disconnect { common, .. }
            | ProtocolMessage::Status { common, .. }
            | ProtocolMessage::Request { common, .. }
            | ProtocolMessage::Result { common, .. } => common,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::Connect { .. } => "CONNECT",
            ProtocolMessage::Disconnect { .. } => "DISCONNECT",
            ProtocolMessage::Status { .. } => "STATUS",
            ProtocolMessage::Request { .. } => "REQUEST",
            ProtocolMessage::Result { .. } => "RESULT",
        }
    }

    /// Build a STATUS message, the common constructor for runtime-synthesized
    /// replies (OK, COMPLETE, errors, redirects, ...).
    pub fn status(thread_trace: i64, code: i32, name: &str, text: &str) -> Self {
        ProtocolMessage::Status {
            thread_trace,
            status_code: code,
            status_name: name.to_owned(),
            status_text: text.to_owned(),
            common: Common::default(),
        }
    }

    pub fn result(thread_trace: i64, code: i32, name: &str, text: &str, content: Value) -> Self {
        ProtocolMessage::Result {
            thread_trace,
            status_code: code,
            status_name: name.to_owned(),
            status_text: text.to_owned(),
            content,
            common: Common::default(),
        }
    }
}

/// Tracks the process's "last observed locale" side effect described in
/// spec §4.1: decoding a message with an explicit locale updates this, and
/// encoding falls back to it when a message doesn't specify its own.
///
/// Modeled as an explicit context threaded through codec calls rather than
/// global mutable state, per the redesign note on process-wide state.
#[derive(Debug, Clone)]
pub struct LocaleContext {
    last_observed: String,
}

impl Default for LocaleContext {
    fn default() -> Self {
        LocaleContext {
            last_observed: DEFAULT_LOCALE.to_owned(),
        }
    }
}

impl LocaleContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the effective locale for `message`, observing any explicit
    /// locale as a side effect (spec: "setting the locale from a
    /// deserialized message is a side effect on the process's
    /// last-observed locale").
    pub fn observe(&mut self, explicit: Option<&str>) -> String {
        if let Some(locale) = explicit {
            self.last_observed = locale.to_owned();
            locale.to_owned()
        } else {
            self.last_observed.clone()
        }
    }

    pub fn current(&self) -> &str {
        &self.last_observed
    }
}
