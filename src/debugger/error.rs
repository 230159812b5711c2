use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error("transport closed")]
    TransportClosed,
    #[error("protocol violation: {0}")]
    Protocol(String),

    // --------------------------------- request errors --------------------------------------------
    #[error("request `{0}` timed out")]
    Timeout(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("adapter error: {message}")]
    Adapter { message: String, body: Option<Value> },

    // --------------------------------- session start errors --------------------------------------
    #[error("pre-launch task failed with exit code {exit_code}: {stderr}")]
    PreLaunchFailed { exit_code: i32, stderr: String },
    #[error("no debug adapter available for type `{0}`")]
    AdapterNotFound(String),

    // --------------------------------- configuration errors --------------------------------------
    #[error("launch configuration parse error: {0}")]
    ConfigParse(String),
    #[error("launch configuration `{0}` not found")]
    ConfigNotFound(String),
    #[error("compound `{0}` not found")]
    CompoundNotFound(String),

    // --------------------------------- entity not found ------------------------------------------
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(Uuid),
    #[error("watch expression {0} not found")]
    WatchNotFound(Uuid),

    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
