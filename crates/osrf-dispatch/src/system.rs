//! The three system methods every application gets for free (spec §4.5):
//! `opensrf.system.method`, `opensrf.system.method.all`, `opensrf.system.echo`,
//! each registered in both streaming and atomic form by `register_application`.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::descriptor::{HandlerFn, MethodDescriptor, MethodOptions, Responder};
use crate::registry::ApplicationRegistry;

pub const METHOD_PREFIX: &str = "opensrf.system.method";
pub const METHOD_ALL: &str = "opensrf.system.method.all";
pub const ECHO: &str = "opensrf.system.echo";

/// These are `SYSTEM`-flagged. `opensrf.system.echo` resolves through this
/// lookup like any other handler; the two introspection methods need the
/// registry itself to list methods, so `ApplicationRegistry::run` handles
/// them inline instead of going through a stored closure (see that
/// function) — this only covers `echo`.
pub fn builtin_handler(name: &str) -> Option<HandlerFn> {
    let base = name.strip_suffix(".atomic").unwrap_or(name);
    match base {
        ECHO => Some(Arc::new(|params, responder| Box::pin(echo(params, responder)))),
        _ => None,
    }
}

pub fn is_introspect_prefix(name: &str) -> bool {
    name.strip_suffix(".atomic").unwrap_or(name) == METHOD_PREFIX
}

pub fn is_introspect_all(name: &str) -> bool {
    name.strip_suffix(".atomic").unwrap_or(name) == METHOD_ALL
}

/// Registers all three system methods, in streaming and atomic form, on
/// `service`. `register_application` calls this automatically.
pub async fn register_system_methods(registry: &ApplicationRegistry, service: &str) {
    let entries: [(&str, &str, u32); 3] = [
        (METHOD_PREFIX, "list methods whose name starts with a prefix", 1),
        (METHOD_ALL, "list every registered method", 0),
        (ECHO, "echo back each argument", 0),
    ];
    for (name, notes, argc) in entries {
        let descriptor = MethodDescriptor {
            name: name.to_owned(),
            notes: notes.to_owned(),
            argc,
            options: MethodOptions::system_streaming(),
        };
        // Introspection methods have no stored closure (see
        // `builtin_handler`); `register_method` still needs one to satisfy
        // its signature, so give them a no-op that `run` never calls.
        let handler = builtin_handler(name).unwrap_or_else(|| Arc::new(|_, _| Box::pin(async { 0 })));
        registry.register_method(service, descriptor, handler).await;
    }
}

async fn echo(params: Vec<Value>, responder: Responder) -> i32 {
    for value in &params {
        if responder.respond(value.clone()).await.is_err() {
            return -1;
        }
    }
    1
}

pub(crate) fn format_method_list(methods: &[MethodDescriptor]) -> Vec<Value> {
    methods
        .iter()
        .map(|m| {
            json!({
                "api_name": m.name,
                "notes": m.notes,
                "argc": m.argc,
                "stream": m.options.streaming,
                "atomic": m.options.atomic,
            })
        })
        .collect()
}
