//! The application/method registry and `run_method` dispatch (spec §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use osrf_session::{RequestContext, RequestHandler, ResponseSink};
use osrf_wire::status;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::{HandlerFn, MethodDescriptor, Responder};
use crate::system;

struct ApplicationEntry {
    methods: IndexMap<String, MethodDescriptor>,
    handlers: IndexMap<String, HandlerFn>,
}

/// Whether argument-count mismatches are rejected before a handler runs.
/// Spec §9 resolves the open question of this compile-time C flag to a
/// runtime field defaulting to `true`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub strict_params: bool,
    /// Method-name prefixes whose params are replaced with a redaction
    /// marker in the activity log, e.g. `opensrf.auth.authenticate`
    /// (`Config::log_protect`).
    pub log_protect: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            strict_params: true,
            log_protect: Vec::new(),
        }
    }
}

const REDACTED_PARAMS: &str = "**redacted**";

fn activity_params(log_protect: &[String], method: &str, params: &[Value]) -> String {
    if log_protect.iter().any(|prefix| method.starts_with(prefix.as_str())) {
        REDACTED_PARAMS.to_owned()
    } else {
        Value::Array(params.to_vec()).to_string()
    }
}

/// Process-wide mapping from service name to its methods and handlers.
/// Written at bootstrap and registration time, read from the request hot
/// path (spec §3 "Application registry").
pub struct ApplicationRegistry {
    config: DispatcherConfig,
    apps: Mutex<IndexMap<String, ApplicationEntry>>,
}

impl ApplicationRegistry {
    pub fn new(config: DispatcherConfig) -> Self {
        ApplicationRegistry {
            config,
            apps: Mutex::new(IndexMap::new()),
        }
    }

    /// Registers `service` and auto-registers the three system methods in
    /// both streaming and atomic form (spec §4.5).
    ///
    /// The C original loads a shared library here and runs its init hook;
    /// that step has no counterpart once methods are plain closures, so
    /// this only seeds the method table.
    pub async fn register_application(&self, service: &str) {
        let mut apps = self.apps.lock().await;
        apps.entry(service.to_owned()).or_insert_with(|| ApplicationEntry {
            methods: IndexMap::new(),
            handlers: IndexMap::new(),
        });
        drop(apps);
        system::register_system_methods(self, service).await;
        debug!(service, "application registered");
    }

    /// Stores `descriptor`'s handler and, if STREAMING, synthesizes and
    /// stores the `.atomic` twin with the same handler (it behaves
    /// identically — the deferral happens in `Responder`, keyed off the
    /// descriptor's `atomic` option, not a second closure).
    pub async fn register_method(&self, service: &str, descriptor: MethodDescriptor, handler: HandlerFn) {
        let mut apps = self.apps.lock().await;
        let Some(entry) = apps.get_mut(service) else {
            warn!(service, method = %descriptor.name, "register_method on unregistered application");
            return;
        };
        let streaming = descriptor.options.streaming;
        let name = descriptor.name.clone();
        entry.handlers.insert(name.clone(), handler.clone());
        entry.methods.insert(name, descriptor.clone());
        if streaming {
            let twin = descriptor.atomic_twin();
            entry.handlers.insert(twin.name.clone(), handler);
            entry.methods.insert(twin.name.clone(), twin);
        }
    }

    pub async fn list_methods(&self, service: &str, prefix: Option<&str>) -> Vec<MethodDescriptor> {
        let apps = self.apps.lock().await;
        let Some(entry) = apps.get(service) else {
            return Vec::new();
        };
        entry
            .methods
            .values()
            .filter(|m| prefix.is_none_or(|p| m.name.starts_with(p)))
            .cloned()
            .collect()
    }

    async fn run(&self, service: &str, method: &str, params: Vec<Value>, reply: &ResponseSink) -> i32 {
        let apps = self.apps.lock().await;
        let Some(entry) = apps.get(service) else {
            drop(apps);
            let _ = reply.send_status(status::NOT_FOUND, "osrfMethodException", &format!("application not found: {service}")).await;
            return 0;
        };
        let Some(descriptor) = entry.methods.get(method).cloned() else {
            drop(apps);
            let _ = reply.send_status(status::NOT_FOUND, "osrfMethodException", &format!("method not found: {method}")).await;
            return 0;
        };

        info!(target: "osrf::activity", service, method, params = %activity_params(&self.config.log_protect, method, &params), "request");

        if self.config.strict_params && descriptor.argc > 0 && (params.len() as u32) < descriptor.argc {
            drop(apps);
            let _ = reply
                .send_status(
                    status::INTERNAL_SERVER_ERROR,
                    "osrfMethodException",
                    &format!("{method} expects at least {} params, got {}", descriptor.argc, params.len()),
                )
                .await;
            return 0;
        }

        if system::is_introspect_prefix(&descriptor.name) || system::is_introspect_all(&descriptor.name) {
            let prefix = if system::is_introspect_prefix(&descriptor.name) {
                params.first().and_then(Value::as_str).map(str::to_owned)
            } else {
                None
            };
            let listed: Vec<MethodDescriptor> = entry
                .methods
                .values()
                .filter(|m| prefix.as_deref().is_none_or(|p| m.name.starts_with(p)))
                .cloned()
                .collect();
            drop(apps);
            return self.stream_method_list(reply, &descriptor, listed).await;
        }

        let handler = if descriptor.options.system {
            system::builtin_handler(&descriptor.name)
        } else {
            entry.handlers.get(method).cloned()
        };
        drop(apps);

        let Some(handler) = handler else {
            warn!(service, method, "descriptor registered with no handler");
            return 0;
        };

        let defer = descriptor.options.atomic || descriptor.options.cacheable;
        let accumulator = Arc::new(Mutex::new(Vec::new()));
        let responder = Responder::new(reply.clone(), defer, accumulator.clone());

        let outcome = handler(params, responder).await;

        if outcome < 0 {
            let _ = reply.send_status(status::INTERNAL_SERVER_ERROR, "osrfMethodException", "server exception").await;
            return 0;
        }

        if defer {
            let values = std::mem::take(&mut *accumulator.lock().await);
            let _ = reply.send_result(status::OK, "OK", "", Value::Array(values)).await;
        }

        if outcome > 0 {
            let _ = reply.send_status(status::COMPLETE, "COMPLETE", "").await;
        }

        outcome
    }

    /// Streams the introspection result set: one RESULT per method for the
    /// streaming form, one RESULT holding the whole array for the atomic
    /// twin (spec §4.5).
    async fn stream_method_list(&self, reply: &ResponseSink, descriptor: &MethodDescriptor, listed: Vec<MethodDescriptor>) -> i32 {
        let values = system::format_method_list(&listed);
        if descriptor.options.atomic {
            let _ = reply.send_result(status::OK, "OK", "", Value::Array(values)).await;
        } else {
            for value in values {
                let _ = reply.send_result(status::OK, "OK", "", value).await;
            }
        }
        let _ = reply.send_status(status::COMPLETE, "COMPLETE", "").await;
        1
    }
}

#[async_trait]
impl RequestHandler for ApplicationRegistry {
    async fn run_method(&self, ctx: RequestContext<'_>, reply: &ResponseSink) -> i32 {
        let RequestContext {
            service, method, params, ..
        } = ctx;
        self.run(service, method, params, reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MethodOptions;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_, _| Box::pin(async { 1 }))
    }

    #[tokio::test]
    async fn register_application_auto_registers_system_methods() {
        let registry = ApplicationRegistry::new(DispatcherConfig::default());
        registry.register_application("opensrf.math").await;
        let methods = registry.list_methods("opensrf.math", None).await;
        let names: Vec<&str> = methods.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"opensrf.system.method"));
        assert!(names.contains(&"opensrf.system.method.atomic"));
        assert!(names.contains(&"opensrf.system.method.all"));
        assert!(names.contains(&"opensrf.system.method.all.atomic"));
        assert!(names.contains(&"opensrf.system.echo"));
        assert!(names.contains(&"opensrf.system.echo.atomic"));
    }

    #[tokio::test]
    async fn register_method_synthesizes_atomic_twin_in_table() {
        let registry = ApplicationRegistry::new(DispatcherConfig::default());
        registry.register_application("opensrf.math").await;
        let descriptor = MethodDescriptor {
            name: "opensrf.math.add".into(),
            notes: String::new(),
            argc: 2,
            options: MethodOptions::streaming(),
        };
        registry.register_method("opensrf.math", descriptor, noop_handler()).await;
        let methods = registry.list_methods("opensrf.math", Some("opensrf.math.add")).await;
        assert_eq!(methods.len(), 2);
    }

    #[tokio::test]
    async fn list_methods_on_unknown_service_is_empty() {
        let registry = ApplicationRegistry::new(DispatcherConfig::default());
        assert!(registry.list_methods("nope", None).await.is_empty());
    }

    #[test]
    fn activity_params_redacts_matching_method_prefixes() {
        let log_protect = vec!["opensrf.auth.authenticate".to_owned()];
        let params = vec![Value::String("hunter2".into())];
        assert_eq!(
            activity_params(&log_protect, "opensrf.auth.authenticate.complete", &params),
            REDACTED_PARAMS
        );
        assert_eq!(
            activity_params(&log_protect, "opensrf.auth.session.retrieve", &params),
            Value::Array(params).to_string()
        );
    }
}
