//! Inbound envelope dispatch and outbound request/response bookkeeping
//! (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use osrf_wire::{status, Address, Envelope, EnvelopeCodec, LocaleContext, ProtocolMessage};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};

use osrf_bus::TransportClient;

use crate::registry::SessionRegistry;
use crate::session::{Role, Session};

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error(transparent)]
    Wire(#[from] osrf_wire::WireError),
    #[error(transparent)]
    Envelope(#[from] osrf_wire::EnvelopeError),
    #[error(transparent)]
    Transport(#[from] osrf_bus::ClientError),
    #[error("envelope has neither thread nor transport-error flag")]
    MissingThread,
}

/// What a REQUEST handler needs to reply: which service/method/session it's
/// running for, the request's thread-trace, and the accumulator ATOMIC
/// methods fold into (spec §4.5's handler context).
pub struct RequestContext<'a> {
    pub service: &'a str,
    pub method: &'a str,
    pub session: &'a Session,
    pub trace: i64,
    pub params: Vec<Value>,
}

/// Implemented by the dispatcher (`osrf-dispatch`). Kept as a trait here,
/// rather than a direct dependency, so the session layer doesn't need to
/// know about method registries.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn run_method(&self, ctx: RequestContext<'_>, reply: &ResponseSink) -> i32;
}

/// Handed to a running method so `respond`/`respond_complete` can reach the
/// transport without the dispatcher needing to hold a `TransportClient`
/// itself. Cheaply cloneable: every field is an `Arc`, address, or small
/// copy type.
#[derive(Clone)]
pub struct ResponseSink {
    transport: Arc<TransportClient>,
    local: Address,
    remote: Address,
    thread: String,
    trace: i64,
}

impl ResponseSink {
    pub async fn send_result(&self, code: i32, name: &str, text: &str, content: Value) -> Result<(), StackError> {
        self.send(ProtocolMessage::result(self.trace, code, name, text, content)).await
    }

    pub async fn send_status(&self, code: i32, name: &str, text: &str) -> Result<(), StackError> {
        self.send(ProtocolMessage::status(self.trace, code, name, text)).await
    }

    async fn send(&self, message: ProtocolMessage) -> Result<(), StackError> {
        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        let body = codec.serialize_batch(std::slice::from_ref(&message), &mut locale);
        let envelope = Envelope::new(self.local.clone(), self.remote.clone(), self.thread.clone())?.with_body(body);
        self.transport.send(&envelope).await?;
        Ok(())
    }
}

/// Owns the session registry and the routing needed to turn inbound
/// envelopes into dispatched protocol messages, and outbound REQUESTs into
/// envelopes on the wire.
pub struct Stack {
    pub registry: SessionRegistry,
    transport: Arc<TransportClient>,
    handler: Option<Arc<dyn RequestHandler>>,
    local_service: Option<String>,
    current_trace_id: Mutex<Option<String>>,
}

impl Stack {
    pub fn new(transport: Arc<TransportClient>, handler: Option<Arc<dyn RequestHandler>>, local_service: Option<String>) -> Self {
        Stack {
            registry: SessionRegistry::new(),
            transport,
            handler,
            local_service,
            current_trace_id: Mutex::new(None),
        }
    }

    pub async fn current_trace_id(&self) -> Option<String> {
        self.current_trace_id.lock().await.clone()
    }

    /// Processes one inbound envelope end to end (spec §4.4 steps 1-5).
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), StackError> {
        *self.current_trace_id.lock().await = envelope.trace_id.clone();

        if envelope.thread.is_empty() && !envelope.is_transport_error() {
            return Err(StackError::MissingThread);
        }

        let Some(session) = self
            .registry
            .find_or_create_server(&envelope.thread, envelope.sender.clone(), self.local_service.as_deref())
            .await
        else {
            debug!(thread = %envelope.thread, "dropping envelope: unknown session and no local service");
            return Ok(());
        };

        if envelope.is_transport_error() {
            self.handle_transport_error(&session, &envelope).await?;
            return Ok(());
        }

        session.set_remote(envelope.sender.clone()).await;
        session.promote_remote_to_original().await;

        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        let messages = codec.parse_batch(&envelope.body, &mut locale)?;
        for message in messages {
            self.dispatch_one(&session, message).await?;
        }
        Ok(())
    }

    async fn handle_transport_error(&self, session: &Session, envelope: &Envelope) -> Result<(), StackError> {
        let original = session.original_remote().await;
        if envelope.sender != original {
            info!(thread = %envelope.thread, "transport error from non-original remote; treating as redirect");
            let redirect = ProtocolMessage::status(0, status::REDIRECTED, "REDIRECTED", "router redirect");
            session.push_inbound(redirect).await;
            self.dispatch_client_status(session, status::REDIRECTED, 0).await?;
        } else {
            warn!(thread = %envelope.thread, "transport error from original remote; abandoning batch");
            session.set_transport_error().await;
        }
        Ok(())
    }

    async fn dispatch_one(&self, session: &Session, message: ProtocolMessage) -> Result<(), StackError> {
        match session.role {
            Role::Client => self.dispatch_client(session, message).await,
            Role::Server => self.dispatch_server(session, message).await,
        }
    }

    /// Client dispatch table (spec §4.4): acts on STATUS codes, and always
    /// enqueues RESULT for the caller.
    async fn dispatch_client(&self, session: &Session, message: ProtocolMessage) -> Result<(), StackError> {
        match &message {
            ProtocolMessage::Status { status_code, thread_trace, .. } => {
                self.dispatch_client_status(session, *status_code, *thread_trace).await?;
                session.push_inbound(message).await;
            }
            ProtocolMessage::Result { .. } => {
                session.push_inbound(message).await;
            }
            other => {
                warn!(thread = %session.thread, kind = other.type_name(), "unexpected message type on client session");
            }
        }
        Ok(())
    }

    async fn dispatch_client_status(&self, session: &Session, code: i32, trace: i64) -> Result<(), StackError> {
        match code {
            status::OK => session.mark_connected().await,
            status::COMPLETE => {
                session.clear_pending(trace).await;
                self.registry.remove(&session.thread).await;
            }
            status::CONTINUE => {}
            status::REDIRECTED | status::TIMEOUT => {
                session.clear_remote_and_disconnect().await;
                self.resend_after_requeue(session, trace).await?;
            }
            status::EXPFAILED => {
                session.clear_remote_and_disconnect().await;
                session.clear_pending(trace).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-issues whichever outbound CONNECT/REQUEST hasn't been answered yet
    /// after a REDIRECTED or TIMEOUT status, to the session's (now cleared)
    /// remote — spec §4.4, tested at §8 as "the next outbound REQUEST with
    /// the same thread-trace is resent to the new remote address". A
    /// transport-error rewrite carries no real trace (it's synthesized with
    /// `thread_trace == 0`, see `Session::take_broadcast_status`), so `trace
    /// == 0` resends the whole pending batch rather than a single entry.
    async fn resend_after_requeue(&self, session: &Session, trace: i64) -> Result<(), StackError> {
        let pending = if trace == 0 {
            session.take_all_pending().await
        } else {
            session.take_pending(trace).await.into_iter().collect()
        };
        for message in pending {
            info!(thread = %session.thread, trace = message.thread_trace(), "resending after redirect/timeout");
            self.send_one(session, message).await?;
        }
        Ok(())
    }

    /// Server dispatch table (spec §4.4).
    async fn dispatch_server(&self, session: &Session, message: ProtocolMessage) -> Result<(), StackError> {
        match message {
            ProtocolMessage::Connect { thread_trace, .. } => {
                session.mark_connected().await;
                self.reply_status(session, thread_trace, status::OK, "OK", "").await?;
            }
            ProtocolMessage::Disconnect { .. } => {
                session.mark_disconnected().await;
                self.registry.remove(&session.thread).await;
            }
            ProtocolMessage::Request { thread_trace, method, params, .. } => {
                self.run_request(session, thread_trace, method, params).await?;
            }
            ProtocolMessage::Status { .. } => {}
            other => {
                warn!(thread = %session.thread, kind = other.type_name(), "unexpected message type on server session");
                session.mark_disconnected().await;
            }
        }
        Ok(())
    }

    async fn run_request(&self, session: &Session, trace: i64, method: String, params: Vec<Value>) -> Result<(), StackError> {
        let Some(handler) = &self.handler else {
            warn!(method, "no handler registered for server session");
            return Ok(());
        };
        let Some(service) = session.service.clone() else {
            warn!(method, "server session has no bound service");
            return Ok(());
        };
        let sink = ResponseSink {
            transport: self.transport.clone(),
            local: self.transport.primary_address().clone(),
            remote: session.remote().await,
            thread: session.thread.clone(),
            trace,
        };
        let ctx = RequestContext {
            service: &service,
            method: &method,
            session,
            trace,
            params,
        };
        handler.run_method(ctx, &sink).await;
        Ok(())
    }

    async fn reply_status(&self, session: &Session, trace: i64, code: i32, name: &str, text: &str) -> Result<(), StackError> {
        let sink = ResponseSink {
            transport: self.transport.clone(),
            local: self.transport.primary_address().clone(),
            remote: session.remote().await,
            thread: session.thread.clone(),
            trace,
        };
        sink.send_status(code, name, text).await
    }

    /// Allocates a trace, serializes a REQUEST, and sends it (spec §4.4
    /// `send_request`).
    pub async fn send_request(&self, session: &Session, method: &str, params: Vec<Value>) -> Result<i64, StackError> {
        let trace = session.next_trace().await;
        let message = ProtocolMessage::Request {
            thread_trace: trace,
            method: method.to_owned(),
            params,
            common: osrf_wire::Common::default(),
        };
        self.send_one(session, message).await?;
        Ok(trace)
    }

    /// Sends a CONNECT on `session`'s thread, opening a stateful
    /// conversation (spec §4.2).
    pub async fn send_connect(&self, session: &Session) -> Result<i64, StackError> {
        let trace = session.next_trace().await;
        self.send_one(session, ProtocolMessage::Connect { thread_trace: trace, common: osrf_wire::Common::default() }).await?;
        Ok(trace)
    }

    /// Sends a DISCONNECT on `session`'s thread, closing the conversation.
    /// No reply is expected (spec §4.2).
    pub async fn send_disconnect(&self, session: &Session) -> Result<(), StackError> {
        let trace = session.next_trace().await;
        self.send_one(session, ProtocolMessage::Disconnect { thread_trace: trace, common: osrf_wire::Common::default() })
            .await?;
        self.registry.remove(&session.thread).await;
        Ok(())
    }

    async fn send_one(&self, session: &Session, message: ProtocolMessage) -> Result<(), StackError> {
        if matches!(message, ProtocolMessage::Connect { .. } | ProtocolMessage::Request { .. }) {
            session.record_pending(message.thread_trace(), message.clone()).await;
        }
        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        let body = codec.serialize_batch(&[message], &mut locale);
        let envelope = Envelope::new(self.transport.primary_address().clone(), session.remote().await, session.thread.clone())?
            .with_body(body);
        self.transport.send(&envelope).await?;
        Ok(())
    }

    /// Drains queued messages for `trace`, polling the bus until a RESULT
    /// or terminal STATUS for it arrives or `poll_timeout` elapses per
    /// attempt. The caller is expected to loop this until COMPLETE.
    pub async fn recv_response(&self, session: &Session, trace: i64, poll_timeout: Duration) -> Result<Option<ProtocolMessage>, StackError> {
        if let Some(message) = session.take_matching(trace).await {
            return Ok(Some(message));
        }
        if let Some(broadcast) = session.take_broadcast_status().await {
            return Ok(Some(broadcast));
        }
        let recv = self.transport.recv(osrf_bus::PopTimeout::Seconds(poll_timeout.as_secs().max(1) as u32));
        match tokio_timeout(poll_timeout, recv).await {
            Ok(Ok(Some(envelope))) => {
                self.handle_envelope(envelope).await?;
                if let Some(message) = session.take_matching(trace).await {
                    return Ok(Some(message));
                }
                Ok(session.take_broadcast_status().await)
            }
            Ok(Ok(None)) | Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use osrf_bus::{BrokerError, ListBroker, PopTimeout};
    use osrf_wire::TransportError;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingBroker {
        pushed: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ListBroker for RecordingBroker {
        async fn connect(&self, _h: &str, _p: u16, _u: &str, _pw: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn push(&self, address: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.pushed.lock().unwrap().push((address.to_owned(), payload));
            Ok(())
        }
        async fn pop(&self, _address: &str, _timeout: PopTimeout) -> Result<Option<Vec<u8>>, BrokerError> {
            Ok(None)
        }
        async fn disconnect(&self) {}
    }

    async fn make_stack() -> (Stack, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::default());
        let cloned: Arc<dyn ListBroker> = broker.clone();
        let factory: Arc<dyn Fn() -> Arc<dyn ListBroker> + Send + Sync> = Arc::new(move || cloned.clone());
        let me = Address::client("opensrf", "private.localhost", "host", 1, "aa");
        let transport = Arc::new(TransportClient::new(me, factory));
        transport.connect("private.localhost", "localhost", 0, "opensrf", "pw").await.unwrap();
        let stack = Stack::new(transport, None, None);
        (stack, broker)
    }

    fn decode_request(payload: &[u8]) -> ProtocolMessage {
        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        codec.parse_batch(payload, &mut locale).unwrap().into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn redirected_transport_error_resends_the_pending_request() {
        let (stack, broker) = make_stack().await;
        let original_remote = Address::service("opensrf", "private.localhost", "opensrf.math");
        let session = stack.registry.create_client(original_remote.clone()).await;

        let trace = stack.send_request(&session, "opensrf.math.add", vec![]).await.unwrap();
        assert_eq!(broker.pushed.lock().unwrap().len(), 1);

        let redirecting_remote = Address::service("opensrf", "private.localhost", "opensrf.math.backup");
        let error_envelope = Envelope {
            sender: redirecting_remote,
            recipient: stack.transport.primary_address().clone(),
            thread: session.thread.clone(),
            body: Vec::new(),
            trace_id: None,
            transport_error: Some(TransportError { error_type: None }),
        };
        stack.handle_envelope(error_envelope).await.unwrap();

        let pushed = broker.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 2);
        let resent = decode_request(&pushed[1].1);
        assert_eq!(resent.thread_trace(), trace);
        assert!(matches!(resent, ProtocolMessage::Request { .. }));
        drop(pushed);
        assert_eq!(session.remote().await, original_remote);
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn timeout_status_resends_the_matching_trace_only() {
        let (stack, broker) = make_stack().await;
        let original_remote = Address::service("opensrf", "private.localhost", "opensrf.math");
        let session = stack.registry.create_client(original_remote.clone()).await;

        let trace = stack.send_request(&session, "opensrf.math.add", vec![]).await.unwrap();
        assert_eq!(broker.pushed.lock().unwrap().len(), 1);

        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        let body = codec.serialize_batch(&[ProtocolMessage::status(trace, status::TIMEOUT, "TIMEOUT", "")], &mut locale);
        let envelope = Envelope::new(original_remote.clone(), stack.transport.primary_address().clone(), session.thread.clone())
            .unwrap()
            .with_body(body);
        stack.handle_envelope(envelope).await.unwrap();

        let pushed = broker.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 2);
        let resent = decode_request(&pushed[1].1);
        assert_eq!(resent.thread_trace(), trace);
        assert!(matches!(resent, ProtocolMessage::Request { .. }));
    }

    #[tokio::test]
    async fn expfailed_status_clears_pending_without_resending() {
        let (stack, broker) = make_stack().await;
        let original_remote = Address::service("opensrf", "private.localhost", "opensrf.math");
        let session = stack.registry.create_client(original_remote.clone()).await;

        let trace = stack.send_request(&session, "opensrf.math.add", vec![]).await.unwrap();
        assert_eq!(broker.pushed.lock().unwrap().len(), 1);

        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        let body = codec.serialize_batch(&[ProtocolMessage::status(trace, status::EXPFAILED, "EXPFAILED", "")], &mut locale);
        let envelope = Envelope::new(original_remote.clone(), stack.transport.primary_address().clone(), session.thread.clone())
            .unwrap()
            .with_body(body);
        stack.handle_envelope(envelope).await.unwrap();

        assert_eq!(broker.pushed.lock().unwrap().len(), 1);
        assert!(session.take_pending(trace).await.is_none());
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn complete_status_removes_the_session() {
        let (stack, broker) = make_stack().await;
        let original_remote = Address::service("opensrf", "private.localhost", "opensrf.math");
        let session = stack.registry.create_client(original_remote.clone()).await;

        let trace = stack.send_request(&session, "opensrf.math.add", vec![]).await.unwrap();
        assert_eq!(broker.pushed.lock().unwrap().len(), 1);

        let codec = osrf_wire::JsonCodec;
        let mut locale = LocaleContext::new();
        let body = codec.serialize_batch(&[ProtocolMessage::status(trace, status::COMPLETE, "COMPLETE", "")], &mut locale);
        let envelope = Envelope::new(original_remote, stack.transport.primary_address().clone(), session.thread.clone())
            .unwrap()
            .with_body(body);
        stack.handle_envelope(envelope).await.unwrap();

        assert!(stack.registry.get(&session.thread).await.is_none());
    }
}
