//! Application session and stack (spec §3, §4.4): thread-indexed sessions
//! and the inbound/outbound dispatch built on top of them.

mod registry;
mod session;
mod stack;

pub use registry::SessionRegistry;
pub use session::{Role, Session};
pub use stack::{RequestContext, RequestHandler, ResponseSink, Stack, StackError};
