//! dapmux is a process-local debugging core: it mediates between IDE clients
//! and external Debug Adapter Protocol servers, multiplexing several
//! concurrent debug sessions while keeping breakpoints and watches consistent
//! across session boundaries.
//!
//! The embedding application supplies two collaborators: an
//! [`debugger::AdapterRegistry`] that knows how to reach adapters, and an
//! [`debugger::EventHook`] that receives UI notifications. Everything else
//! lives here: framed DAP transport, request correlation, the session state
//! machine, breakpoint/watch bookkeeping and launch-configuration
//! resolution.

pub mod config;
pub mod dap;
pub mod debugger;

pub use debugger::{Debugger, DebuggerBuilder};
