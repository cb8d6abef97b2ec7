//! Application and method registry, and `run_method` dispatch (spec §4.5).

mod descriptor;
mod registry;
mod system;

pub use descriptor::{BoxFuture, HandlerFn, MethodDescriptor, MethodOptions, Responder};
pub use registry::{ApplicationRegistry, DispatcherConfig};
pub use system::{ECHO, METHOD_ALL, METHOD_PREFIX};
