//! The RPC protocol: wire messages, per-connection state, capability routing
//! and the dispatch loop. Socket I/O lives at the binary edge; everything the
//! protocol decides happens here.

mod capability;
mod connection;
mod messages;
mod transport;

pub use capability::{
    ActiveSubscription, Capability, CapabilityRouter, HandlerContext,
};
pub use connection::{ClientReadyOutcome, ConnectionKey, ConnectionTable, RpcConnection};
pub use messages::{resolve_principal, Gen, MessageType, Route, RpcMessage, PROTOCOL_VERSION};
pub use transport::{SocketSession, TransportCtx};
