//! Wire types for the service-bus RPC runtime: addresses, envelopes,
//! protocol messages, and the codec that lowers message batches to bytes.

mod address;
mod codec;
mod envelope;
mod message;
#[cfg(feature = "legacy-xml")]
pub mod xml;

pub use address::{Address, AddressError, Purpose};
pub use codec::{EnvelopeCodec, JsonCodec, WireError};
pub use envelope::{Envelope, EnvelopeError, TransportError, MAX_THREAD_LEN};
pub use message::{status, Common, LocaleContext, ProtocolMessage, DEFAULT_LOCALE};
