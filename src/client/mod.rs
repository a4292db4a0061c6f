//! Client-side delivery runtime: connection lifecycle, reconnection with
//! backoff, outbound queueing while disconnected, ack and receipt emission.

mod runtime;

pub use runtime::{spawn, ClientConfig, ClientEvent, ClientHandle, ConnectionState};
