//! The envelope that carries a serialized message batch between peers.

use crate::Address;

/// Details of a transport-level delivery failure, as opposed to a protocol
/// error. Carried on the envelope itself so the session/stack layer can
/// treat it specially (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub error_type: Option<String>,
}

/// Maximum thread id length per spec §3 ("opaque string, <= 64 bytes").
pub const MAX_THREAD_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("thread id exceeds {MAX_THREAD_LEN} bytes")]
    ThreadTooLong,
}

/// One envelope: sender, recipient, conversation thread, and an opaque
/// serialized body (the output of an [`crate::codec::EnvelopeCodec`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    pub thread: String,
    pub body: Vec<u8>,
    pub trace_id: Option<String>,
    pub transport_error: Option<TransportError>,
}

impl Envelope {
    pub fn new(sender: Address, recipient: Address, thread: impl Into<String>) -> Result<Self, EnvelopeError> {
        let thread = thread.into();
        if thread.len() > MAX_THREAD_LEN {
            return Err(EnvelopeError::ThreadTooLong);
        }
        Ok(Envelope {
            sender,
            recipient,
            thread,
            body: Vec::new(),
            trace_id: None,
            transport_error: None,
        })
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn is_transport_error(&self) -> bool {
        self.transport_error.is_some()
    }
}
