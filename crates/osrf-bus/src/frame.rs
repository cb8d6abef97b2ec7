//! Serialization of [`Envelope`] to the bytes actually pushed onto a
//! broker list. Distinct from `osrf_wire`'s message-batch codec: this is
//! the bus layer's own framing of sender/recipient/thread/trace metadata
//! around that already-serialized body.

use osrf_wire::{Address, Envelope, TransportError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    sender: String,
    recipient: String,
    thread: String,
    body: Vec<u8>,
    trace_id: Option<String>,
    transport_error: Option<String>,
}

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let frame = Frame {
        sender: envelope.sender.to_string(),
        recipient: envelope.recipient.to_string(),
        thread: envelope.thread.clone(),
        body: envelope.body.clone(),
        trace_id: envelope.trace_id.clone(),
        transport_error: envelope
            .transport_error
            .as_ref()
            .map(|e| e.error_type.clone().unwrap_or_default()),
    };
    serde_json::to_vec(&frame).expect("frame always serializes")
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, String> {
    let frame: Frame = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let sender: Address = frame.sender.parse().map_err(|e| format!("{e:?}"))?;
    let recipient: Address = frame.recipient.parse().map_err(|e| format!("{e:?}"))?;
    let mut envelope = Envelope::new(sender, recipient, frame.thread).map_err(|e| e.to_string())?;
    envelope.body = frame.body;
    envelope.trace_id = frame.trace_id;
    envelope.transport_error = frame.transport_error.map(|error_type| TransportError {
        error_type: if error_type.is_empty() { None } else { Some(error_type) },
    });
    Ok(envelope)
}
