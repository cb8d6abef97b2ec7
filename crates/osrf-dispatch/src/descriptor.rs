//! Method descriptors and the handler closures they dispatch to (spec §3,
//! §4.5). Handlers are plain `Fn` closures registered at startup rather
//! than symbols resolved in a shared library, per the redesign recorded in
//! `SPEC_FULL.md`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use osrf_session::ResponseSink;
use osrf_wire::status;
use serde_json::Value;
use tokio::sync::Mutex;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered method's behavior: receives its call params and a
/// [`Responder`], returns the handler status int from spec §4.5 step 5
/// (`< 0` server exception, `0` ok, `> 0` ok + COMPLETE).
pub type HandlerFn = Arc<dyn Fn(Vec<Value>, Responder) -> BoxFuture<i32> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodOptions {
    pub system: bool,
    pub streaming: bool,
    pub atomic: bool,
    pub cacheable: bool,
}

impl MethodOptions {
    pub fn streaming() -> Self {
        MethodOptions {
            streaming: true,
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        MethodOptions {
            system: true,
            ..Default::default()
        }
    }

    pub fn system_streaming() -> Self {
        MethodOptions {
            system: true,
            streaming: true,
            ..Default::default()
        }
    }

    /// The options a STREAMING method's synthesized `.atomic` twin gets:
    /// streaming plus atomic (spec §3).
    fn as_atomic_twin(self) -> Self {
        MethodOptions {
            atomic: true,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub notes: String,
    pub argc: u32,
    pub options: MethodOptions,
}

impl MethodDescriptor {
    pub fn atomic_twin(&self) -> MethodDescriptor {
        MethodDescriptor {
            name: format!("{}.atomic", self.name),
            notes: self.notes.clone(),
            argc: self.argc,
            options: self.options.as_atomic_twin(),
        }
    }
}

/// Handed to a running handler so it can emit results without knowing
/// whether it's ATOMIC/CACHEABLE (both of those defer to the accumulator)
/// or streaming-and-immediate.
#[derive(Clone)]
pub struct Responder {
    sink: ResponseSink,
    defer: bool,
    accumulator: Arc<Mutex<Vec<Value>>>,
}


impl Responder {
    pub fn new(sink: ResponseSink, defer: bool, accumulator: Arc<Mutex<Vec<Value>>>) -> Self {
        Responder { sink, defer, accumulator }
    }

    /// `respond(context, value)`: for ATOMIC/CACHEABLE methods, append to
    /// the accumulator; otherwise send a RESULT immediately.
    pub async fn respond(&self, value: Value) -> Result<(), osrf_session::StackError> {
        if self.defer {
            self.accumulator.lock().await.push(value);
            Ok(())
        } else {
            self.sink.send_result(status::OK, "OK", "", value).await
        }
    }

    /// `respond_complete(context, value)`: same deferral rule, but for the
    /// immediate case also sends STATUS(COMPLETE) right after the RESULT.
    pub async fn respond_complete(&self, value: Value) -> Result<(), osrf_session::StackError> {
        if self.defer {
            self.accumulator.lock().await.push(value);
            Ok(())
        } else {
            self.sink.send_result(status::OK, "OK", "", value).await?;
            self.sink.send_status(status::COMPLETE, "COMPLETE", "").await
        }
    }

    /// Sends STATUS(CONTINUE), telling the caller to extend its recv
    /// deadline for a long-running handler (spec §4.4). Sent immediately
    /// regardless of deferral — it's a liveness signal, not a result.
    pub async fn send_continue(&self) -> Result<(), osrf_session::StackError> {
        self.sink.send_status(status::CONTINUE, "CONTINUE", "").await
    }
}
