//! Envelope body codec: serialize/parse a batch of [`ProtocolMessage`]s.
//!
//! The canonical wire form is JSON ([`JsonCodec`]); a `legacy-xml` feature
//! adds a second implementor ([`crate::xml::XmlCodec`]) that lowers to and
//! from the same in-memory type.

use serde_json::{Map, Value, json};

use crate::message::{Common, DEFAULT_LOCALE, LocaleContext, ProtocolMessage};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WireError {
    #[error("malformed-envelope: {0}")]
    MalformedEnvelope(String),
}

/// A codec lowers a batch of protocol messages to bytes and back.
///
/// `locale_ctx` threads the process's "last observed locale" through calls
/// per spec §4.1, rather than relying on global mutable state.
pub trait EnvelopeCodec {
    fn serialize_batch(&self, messages: &[ProtocolMessage], locale_ctx: &mut LocaleContext) -> Vec<u8>;
    fn parse_batch(&self, body: &[u8], locale_ctx: &mut LocaleContext) -> Result<Vec<ProtocolMessage>, WireError>;
}

/// Canonical JSON wire encoding: an array of `{ "__c": class, "__p": payload }`
/// class-hash entries, `osrfMessage` at the outer level.
pub struct JsonCodec;

const CLASS_MESSAGE: &str = "osrfMessage";
const CLASS_METHOD: &str = "osrfMethod";
const CLASS_CONNECT: &str = "osrfConnect";
const CLASS_DISCONNECT: &str = "osrfDisconnect";
const CLASS_STATUS: &str = "osrfConnectStatus";

fn result_class(status_code: i32) -> &'static str {
    use crate::message::status;
    match status_code {
        status::NOCONTENT => "osrfResultPartialComplete",
        status::CONTINUE => "osrfResultPartial",
        _ => "osrfResult",
    }
}

fn class_hash(class: &str, payload: Value) -> Value {
    json!({ "__c": class, "__p": payload })
}

/// Accept both numeric and numeric-string status codes (spec §4.1).
fn parse_status_code(v: &Value) -> Option<i32> {
    match v {
        Value::Number(n) => n.as_i64().map(|n| n as i32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn opt_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_owned)
}

impl EnvelopeCodec for JsonCodec {
    fn serialize_batch(&self, messages: &[ProtocolMessage], locale_ctx: &mut LocaleContext) -> Vec<u8> {
        let entries: Vec<Value> = messages
            .iter()
            .map(|m| encode_message(m, locale_ctx))
            .collect();
        serde_json::to_vec(&Value::Array(entries)).expect("json array always serializes")
    }

    fn parse_batch(&self, body: &[u8], locale_ctx: &mut LocaleContext) -> Result<Vec<ProtocolMessage>, WireError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| WireError::MalformedEnvelope(format!("invalid json: {e}")))?;
        let Value::Array(entries) = value else {
            return Err(WireError::MalformedEnvelope("outer value is not an array".into()));
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_message(&entry, locale_ctx) {
                Ok(msg) => out.push(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed-envelope: discarding one batch entry");
                }
            }
        }
        Ok(out)
    }
}

fn encode_message(msg: &ProtocolMessage, locale_ctx: &mut LocaleContext) -> Value {
    let common = msg.common();
    let locale = locale_ctx.observe(common.locale.as_deref());

    let (msg_type, payload) = match msg {
        ProtocolMessage::Connect { .. } => ("CONNECT", class_hash(CLASS_CONNECT, json!({}))),
        ProtocolMessage::Disconnect { .. } => ("DISCONNECT", class_hash(CLASS_DISCONNECT, json!({}))),
        ProtocolMessage::Status {
            status_code,
            status_name,
            status_text,
            ..
        } => (
            "STATUS",
            class_hash(
                CLASS_STATUS,
                json!({
                    "statusCode": status_code.to_string(),
                    "status": status_name,
                    "text": status_text,
                }),
            ),
        ),
        ProtocolMessage::Request { method, params, .. } => (
            "REQUEST",
            class_hash(
                CLASS_METHOD,
                json!({
                    "method": method,
                    "params": params,
                }),
            ),
        ),
        ProtocolMessage::Result {
            status_code,
            status_name,
            status_text,
            content,
            ..
        } => (
            "RESULT",
            class_hash(
                result_class(*status_code),
                json!({
                    "status": status_name,
                    "statusCode": status_code.to_string(),
                    "text": status_text,
                    "content": content,
                }),
            ),
        ),
    };

    let mut p = Map::new();
    p.insert("threadTrace".into(), json!(msg.thread_trace().to_string()));
    p.insert("locale".into(), json!(locale));
    if let Some(tz) = &common.tz {
        p.insert("tz".into(), json!(tz));
    }
    if let Some(ingress) = &common.ingress {
        p.insert("ingress".into(), json!(ingress));
    }
    if let Some(level) = &common.protocol_level {
        p.insert("api_level".into(), json!(level));
    }
    p.insert("type".into(), json!(msg_type));
    p.insert("payload".into(), payload);

    class_hash(CLASS_MESSAGE, Value::Object(p))
}

fn decode_message(entry: &Value, locale_ctx: &mut LocaleContext) -> Result<ProtocolMessage, WireError> {
    let class = entry
        .get("__c")
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::MalformedEnvelope("missing __c".into()))?;
    if class != CLASS_MESSAGE {
        return Err(WireError::MalformedEnvelope(format!("unknown outer class: {class}")));
    }
    let p = entry
        .get("__p")
        .ok_or_else(|| WireError::MalformedEnvelope("missing __p".into()))?;

    let thread_trace: i64 = p
        .get("threadTrace")
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| WireError::MalformedEnvelope("missing/invalid threadTrace".into()))?;

    let locale = locale_ctx.observe(opt_str(p, "locale").as_deref());
    let common = Common {
        locale: Some(locale),
        tz: opt_str(p, "tz"),
        ingress: opt_str(p, "ingress"),
        protocol_level: opt_str(p, "api_level"),
    };

    let msg_type = p
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::MalformedEnvelope("missing type".into()))?;
    let payload = p.get("payload").and_then(|v| v.get("__p")).cloned().unwrap_or(Value::Null);

    Ok(match msg_type {
        "CONNECT" => ProtocolMessage::Connect { thread_trace, common },
        "DISCONNECT" => ProtocolMessage::Disconnect { thread_trace, common },
        "STATUS" => {
            let status_code = payload
                .get("statusCode")
                .and_then(parse_status_code)
                .ok_or_else(|| WireError::MalformedEnvelope("missing statusCode".into()))?;
            ProtocolMessage::Status {
                thread_trace,
                status_code,
                status_name: opt_str(&payload, "status").unwrap_or_default(),
                status_text: opt_str(&payload, "text").unwrap_or_default(),
                common,
            }
        }
        "REQUEST" => {
            let method = opt_str(&payload, "method")
                .ok_or_else(|| WireError::MalformedEnvelope("missing method".into()))?;
            let params = payload
                .get("params")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            ProtocolMessage::Request {
                thread_trace,
                method,
                params,
                common,
            }
        }
        "RESULT" => {
            let status_code = payload
                .get("statusCode")
                .and_then(parse_status_code)
                .ok_or_else(|| WireError::MalformedEnvelope("missing statusCode".into()))?;
            ProtocolMessage::Result {
                thread_trace,
                status_code,
                status_name: opt_str(&payload, "status").unwrap_or_default(),
                status_text: opt_str(&payload, "text").unwrap_or_default(),
                content: payload.get("content").cloned().unwrap_or(Value::Null),
                common,
            }
        }
        other => return Err(WireError::MalformedEnvelope(format!("unknown message type: {other}"))),
    })
}
