//! Debug Adapter Protocol plumbing: message envelopes, framed transports and
//! the request/response client.

pub mod client;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{ClientOptions, DapClient};
