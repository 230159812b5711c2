//! UI notification fan-out.
//!
//! The embedding UI transport implements [`EventHook`]; each session calls it
//! from its single event pump, so notifications for one session arrive in
//! adapter order, exactly once. Nothing orders notifications across sessions.

use crate::dap::types::{StackFrame, Thread};
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::session::{SessionId, SessionState};

/// Everything the UI needs to render one stop.
#[derive(Debug, Clone)]
pub struct StopContext {
    pub reason: String,
    pub description: Option<String>,
    pub thread_id: i64,
    pub frame: Option<StackFrame>,
    pub all_threads_stopped: bool,
    pub hit_breakpoint_ids: Vec<i64>,
}

/// Debugger interrupt with UI by EventHook trait.
pub trait EventHook: Send + Sync {
    fn on_session_created(&self, _session: SessionId, _name: &str, _state: SessionState) {}
    fn on_state_changed(&self, _session: SessionId, _state: SessionState) {}
    fn on_session_terminated(&self, _session: SessionId) {}
    fn on_stopped(&self, _session: SessionId, _stop: &StopContext) {}
    fn on_continued(&self, _session: SessionId, _all_threads_continued: bool) {}
    fn on_output(&self, _session: SessionId, _category: &str, _output: &str) {}
    fn on_breakpoint_validated(&self, _session: SessionId, _breakpoint: &Breakpoint) {}
    fn on_threads_updated(&self, _session: SessionId, _threads: &[Thread]) {}
    fn on_console_message(&self, _session: SessionId, _message: &str) {}
}

/// Hook that does nothing.
pub struct DoNothingHook;

impl EventHook for DoNothingHook {}
