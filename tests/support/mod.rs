//! Shared test harness: an in-process mock adapter speaking framed DAP over
//! TCP, plus a recording event hook.

#![allow(dead_code)]

use dapmux::dap::types::Thread;
use dapmux::debugger::{
    AdapterLauncher, Breakpoint, EventHook, SessionId, SessionState, StaticAdapterRegistry,
    StopContext,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const MOCK_ADAPTER_TYPE: &str = "mock";

/// Scripted behavior of the mock adapter.
#[derive(Clone)]
pub struct MockBehavior {
    /// `initialize` response body.
    pub capabilities: Value,
    /// Per-command response body overrides.
    pub responses: HashMap<String, Value>,
    /// Commands that never get a response.
    pub silent: HashSet<String>,
    /// Per-command artificial latency before responding.
    pub delays: HashMap<String, Duration>,
    /// Drop the connection upon receiving this command, without responding.
    pub close_on: Option<String>,
    /// Send the `initialized` event right after the `initialize` response.
    pub emit_initialized: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior {
            capabilities: json!({ "supportsConfigurationDoneRequest": true }),
            responses: HashMap::new(),
            silent: HashSet::new(),
            delays: HashMap::new(),
            close_on: None,
            emit_initialized: true,
        }
    }
}

impl MockBehavior {
    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_response(mut self, command: &str, body: Value) -> Self {
        self.responses.insert(command.to_string(), body);
        self
    }

    pub fn silent_on(mut self, command: &str) -> Self {
        self.silent.insert(command.to_string());
        self
    }

    pub fn delay_on(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(command.to_string(), delay);
        self
    }

    pub fn close_on(mut self, command: &str) -> Self {
        self.close_on = Some(command.to_string());
        self
    }
}

/// Handle to a listening mock adapter. Accepts any number of connections,
/// each served by its own task against the same scripted behavior.
pub struct MockAdapter {
    pub port: u16,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    connections: Arc<AtomicUsize>,
    /// Frame injector for the most recent connection.
    latest: Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>>,
}

impl MockAdapter {
    pub async fn spawn(behavior: MockBehavior) -> MockAdapter {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock adapter");
        let port = listener.local_addr().unwrap().port();
        let requests: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        let connections: Arc<AtomicUsize> = Arc::default();
        let latest: Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>> = Arc::default();

        {
            let requests = requests.clone();
            let connections = connections.clone();
            let latest = latest.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else { return };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (inject_tx, inject_rx) = mpsc::unbounded_channel();
                    *latest.lock().unwrap() = Some(inject_tx);
                    tokio::spawn(handle_connection(
                        socket,
                        behavior.clone(),
                        requests.clone(),
                        inject_rx,
                    ));
                }
            });
        }

        MockAdapter {
            port,
            requests,
            connections,
            latest,
        }
    }

    /// Registry handing out this adapter for [`MOCK_ADAPTER_TYPE`].
    pub fn registry(&self) -> StaticAdapterRegistry {
        let registry = StaticAdapterRegistry::new();
        self.register_into(&registry, MOCK_ADAPTER_TYPE);
        registry
    }

    /// Register this adapter's endpoint under `adapter_type`.
    pub fn register_into(&self, registry: &StaticAdapterRegistry, adapter_type: &str) {
        registry.register(
            adapter_type,
            AdapterLauncher::Tcp {
                host: "127.0.0.1".into(),
                port: self.port,
            },
        );
    }

    /// Inject an event into the most recent session.
    pub fn emit(&self, event: &str, body: Value) {
        self.emit_frame(json!({
            "seq": 0,
            "type": "event",
            "event": event,
            "body": body,
        }));
    }

    /// Inject a raw frame, rogue messages included.
    pub fn emit_frame(&self, frame: Value) {
        let latest = self.latest.lock().unwrap();
        latest
            .as_ref()
            .expect("no adapter connection yet")
            .send(frame)
            .expect("adapter connection gone");
    }

    /// Commands received so far, across connections, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Arguments of the n-th occurrence of `command`.
    pub fn request_args(&self, command: &str, n: usize) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == command)
            .nth(n)
            .map(|(_, a)| a.clone())
    }

    pub fn command_count(&self, command: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == command)
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    socket: TcpStream,
    behavior: MockBehavior,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    mut inject_rx: mpsc::UnboundedReceiver<Value>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut next_seq = 1i64;

    // A dedicated writer keeps the read loop free of selects, so frames are
    // never dropped half-read. The connection closes when every sender to
    // `write_tx` is gone.
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            write_frame(&mut write_half, &frame).await;
        }
    });
    let forwarder = tokio::spawn({
        let write_tx = write_tx.clone();
        async move {
            while let Some(frame) = inject_rx.recv().await {
                if write_tx.send(frame).is_err() {
                    break;
                }
            }
        }
    });

    while let Some(frame) = read_frame(&mut reader).await {
        let command = frame["command"].as_str().unwrap_or_default().to_string();
        let request_seq = frame["seq"].as_i64().unwrap_or_default();
        let arguments = frame.get("arguments").cloned().unwrap_or(Value::Null);
        requests.lock().unwrap().push((command.clone(), arguments.clone()));

        if behavior.close_on.as_deref() == Some(command.as_str()) {
            break;
        }
        if behavior.silent.contains(&command) {
            continue;
        }
        if let Some(delay) = behavior.delays.get(&command) {
            tokio::time::sleep(*delay).await;
        }

        let body = response_body(&behavior, &command, &arguments);
        next_seq += 1;
        let _ = write_tx.send(json!({
            "seq": next_seq,
            "type": "response",
            "request_seq": request_seq,
            "success": true,
            "command": command,
            "body": body,
        }));

        if command == "initialize" && behavior.emit_initialized {
            next_seq += 1;
            let _ = write_tx.send(json!({
                "seq": next_seq,
                "type": "event",
                "event": "initialized",
            }));
        }
        if command == "disconnect" || command == "terminate" {
            next_seq += 1;
            let _ = write_tx.send(json!({
                "seq": next_seq,
                "type": "event",
                "event": "terminated",
            }));
            break;
        }
    }

    forwarder.abort();
    drop(write_tx);
    let _ = writer.await;
}

fn response_body(behavior: &MockBehavior, command: &str, arguments: &Value) -> Value {
    if command == "initialize" {
        return behavior.capabilities.clone();
    }
    if let Some(body) = behavior.responses.get(command) {
        return body.clone();
    }
    match command {
        "setBreakpoints" => {
            let verified: Vec<Value> = arguments["breakpoints"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .enumerate()
                .map(|(i, bp)| {
                    json!({ "id": i as i64 + 1, "verified": true, "line": bp["line"] })
                })
                .collect();
            json!({ "breakpoints": verified })
        }
        "setFunctionBreakpoints" | "setDataBreakpoints" => {
            json!({ "breakpoints": [] })
        }
        "threads" => json!({ "threads": [{ "id": 1, "name": "main" }] }),
        "stackTrace" => json!({
            "stackFrames": [{
                "id": 1000,
                "name": "main",
                "line": 3,
                "column": 1,
                "source": { "path": "/ws/app.js" }
            }],
            "totalFrames": 1
        }),
        "scopes" => json!({ "scopes": [{ "name": "Locals", "variablesReference": 100, "expensive": false }] }),
        "variables" => json!({ "variables": [{ "name": "x", "value": "1", "variablesReference": 0 }] }),
        "continue" => json!({ "allThreadsContinued": true }),
        "evaluate" => json!({ "result": "2", "variablesReference": 0 }),
        _ => json!({}),
    }
}

async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.ok()?;
        if n == 0 {
            return None;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = v.trim().parse().ok();
        }
    }
    let mut buf = vec![0u8; content_length?];
    reader.read_exact(&mut buf).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

async fn write_frame(writer: &mut OwnedWriteHalf, value: &Value) {
    let payload = serde_json::to_vec(value).expect("serialize frame");
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let _ = writer.write_all(header.as_bytes()).await;
    let _ = writer.write_all(&payload).await;
    let _ = writer.flush().await;
}

// ----------------------------- recording hook -----------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Created(SessionId, String, SessionState),
    State(SessionId, SessionState),
    Terminated(SessionId),
    Stopped {
        session: SessionId,
        reason: String,
        thread_id: i64,
        frame_id: Option<i64>,
    },
    Continued(SessionId, bool),
    Output(SessionId, String, String),
    BreakpointValidated(SessionId, Option<i64>, bool),
    ThreadsUpdated(SessionId, usize),
    Console(SessionId, String),
}

#[derive(Default, Clone)]
pub struct RecordingHook {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Notification) -> bool) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| predicate(n))
            .count()
    }
}

impl EventHook for RecordingHook {
    fn on_session_created(&self, session: SessionId, name: &str, state: SessionState) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::Created(session, name.to_string(), state));
    }

    fn on_state_changed(&self, session: SessionId, state: SessionState) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::State(session, state));
    }

    fn on_session_terminated(&self, session: SessionId) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::Terminated(session));
    }

    fn on_stopped(&self, session: SessionId, stop: &StopContext) {
        self.notifications.lock().unwrap().push(Notification::Stopped {
            session,
            reason: stop.reason.clone(),
            thread_id: stop.thread_id,
            frame_id: stop.frame.as_ref().map(|f| f.id),
        });
    }

    fn on_continued(&self, session: SessionId, all_threads_continued: bool) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::Continued(session, all_threads_continued));
    }

    fn on_output(&self, session: SessionId, category: &str, output: &str) {
        self.notifications.lock().unwrap().push(Notification::Output(
            session,
            category.to_string(),
            output.to_string(),
        ));
    }

    fn on_breakpoint_validated(&self, session: SessionId, breakpoint: &Breakpoint) {
        self.notifications.lock().unwrap().push(Notification::BreakpointValidated(
            session,
            breakpoint.line(),
            breakpoint.verified,
        ));
    }

    fn on_threads_updated(&self, session: SessionId, threads: &[Thread]) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::ThreadsUpdated(session, threads.len()));
    }

    fn on_console_message(&self, session: SessionId, message: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::Console(session, message.to_string()));
    }
}

/// Poll until `predicate` holds, failing the test after five seconds.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
