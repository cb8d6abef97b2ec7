//! Legacy XML envelope form (spec §1: "retained only as an alternative
//! external representation; the canonical form is JSON"). Gated behind the
//! `legacy-xml` feature and never used by the core session/dispatch path —
//! it exists purely as a second [`EnvelopeCodec`] implementor for gateway
//! ingress that still speaks the old wire format.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::codec::{EnvelopeCodec, WireError};
use crate::message::{Common, LocaleContext, ProtocolMessage};

pub struct XmlCodec;

impl EnvelopeCodec for XmlCodec {
    fn serialize_batch(&self, messages: &[ProtocolMessage], locale_ctx: &mut LocaleContext) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Start(BytesStart::new("batch")))
            .expect("xml writer");
        for msg in messages {
            write_message(&mut writer, msg, locale_ctx);
        }
        writer
            .write_event(Event::End(quick_xml::events::BytesEnd::new("batch")))
            .expect("xml writer");
        writer.into_inner().into_inner()
    }

    fn parse_batch(&self, body: &[u8], locale_ctx: &mut LocaleContext) -> Result<Vec<ProtocolMessage>, WireError> {
        let mut reader = Reader::from_reader(body);
        reader.config_mut().trim_text(true);
        let mut out = Vec::new();
        let mut buf = Vec::new();
        let mut current: Option<(String, i64, Vec<(String, String)>)> = None;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) if e.name().as_ref() != b"batch" => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let mut thread_trace = 0i64;
                    let mut fields = Vec::new();
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .unwrap_or_default()
                            .into_owned();
                        if key == "threadTrace" {
                            thread_trace = value.parse().unwrap_or(0);
                        } else {
                            fields.push((key, value));
                        }
                    }
                    current = Some((tag, thread_trace, fields));
                }
                Ok(Event::End(e)) if e.name().as_ref() != b"batch" => {
                    if let Some((tag, thread_trace, fields)) = current.take() {
                        match decode_message(&tag, thread_trace, &fields, locale_ctx) {
                            Some(msg) => out.push(msg),
                            None => {
                                tracing::warn!(tag = %tag, "malformed-envelope: discarding xml entry");
                            }
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(WireError::MalformedEnvelope(format!("xml parse error: {e}"))),
            }
            buf.clear();
        }
        Ok(out)
    }
}

fn write_message(writer: &mut Writer<Cursor<Vec<u8>>>, msg: &ProtocolMessage, locale_ctx: &mut LocaleContext) {
    let common = msg.common();
    let locale = locale_ctx.observe(common.locale.as_deref());
    let tag = msg.type_name();
    let mut start = BytesStart::new(tag);
    start.push_attribute(("threadTrace", msg.thread_trace().to_string().as_str()));
    start.push_attribute(("locale", locale.as_str()));
    match msg {
        ProtocolMessage::Request { method, .. } => {
            start.push_attribute(("method", method.as_str()));
        }
        ProtocolMessage::Status {
            status_code,
            status_name,
            ..
        }
        | ProtocolMessage::Result {
            status_code,
            status_name,
            ..
        } => {
            start.push_attribute(("statusCode", status_code.to_string().as_str()));
            start.push_attribute(("status", status_name.as_str()));
        }
        _ => {}
    }
    writer.write_event(Event::Start(start)).expect("xml writer");
    if let ProtocolMessage::Request { params, .. } = msg {
        let text = serde_json::to_string(params).unwrap_or_default();
        writer
            .write_event(Event::Text(BytesText::new(&text)))
            .expect("xml writer");
    }
    if let ProtocolMessage::Result { content, .. } = msg {
        let text = serde_json::to_string(content).unwrap_or_default();
        writer
            .write_event(Event::Text(BytesText::new(&text)))
            .expect("xml writer");
    }
    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new(tag)))
        .expect("xml writer");
}

fn decode_message(
    tag: &str,
    thread_trace: i64,
    fields: &[(String, String)],
    locale_ctx: &mut LocaleContext,
) -> Option<ProtocolMessage> {
    let get = |k: &str| fields.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
    let locale = locale_ctx.observe(get("locale").as_deref());
    let common = Common {
        locale: Some(locale),
        ..Default::default()
    };
    Some(match tag {
        "CONNECT" => ProtocolMessage::Connect { thread_trace, common },
        "DISCONNECT" => ProtocolMessage::Disconnect { thread_trace, common },
        "STATUS" => ProtocolMessage::Status {
            thread_trace,
            status_code: get("statusCode")?.parse().ok()?,
            status_name: get("status").unwrap_or_default(),
            status_text: String::new(),
            common,
        },
        "REQUEST" => ProtocolMessage::Request {
            thread_trace,
            method: get("method")?,
            params: Vec::new(),
            common,
        },
        "RESULT" => ProtocolMessage::Result {
            thread_trace,
            status_code: get("statusCode")?.parse().ok()?,
            status_name: get("status").unwrap_or_default(),
            status_text: String::new(),
            content: serde_json::Value::Null,
            common,
        },
        _ => return None,
    })
}
