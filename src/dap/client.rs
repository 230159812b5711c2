//! DAP client: sequence-number correlation, typed request surface, event
//! fan-out.
//!
//! One reader task owns the receiving transport half and never awaits a
//! response itself, so event delivery is never blocked behind a pending
//! request (some adapters complete a response only after a follow-up event).

use crate::dap::protocol::{Event, Message, Request, Response};
use crate::dap::transport::{ChildGuard, TransportReader, TransportWriter};
use crate::dap::types::*;
use crate::debugger::error::Error;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Request deadlines. `initialize` gets a longer budget than steady-state
/// operations: adapters routinely resolve toolchains on first contact.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub initialize_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            request_timeout: Duration::from_secs(15),
            initialize_timeout: Duration::from_secs(60),
        }
    }
}

struct PendingRequest {
    command: String,
    sink: oneshot::Sender<Result<Value, Error>>,
}

struct Shared {
    next_seq: AtomicI64,
    pending: Mutex<HashMap<i64, PendingRequest>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    supports_cancel: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn alloc_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn complete(&self, resp: Response) {
        let pending = self.pending.lock().unwrap().remove(&resp.request_seq);
        let Some(pending) = pending else {
            log::warn!(
                "discarding response for unknown request_seq {} ({})",
                resp.request_seq,
                resp.command
            );
            return;
        };

        log::debug!("<- response {} `{}` success={}", resp.request_seq, pending.command, resp.success);
        let result = if resp.success {
            Ok(resp.body)
        } else {
            Err(Error::Adapter {
                message: resp
                    .message
                    .unwrap_or_else(|| format!("request `{}` failed", pending.command)),
                body: (!resp.body.is_null()).then_some(resp.body),
            })
        };
        let _ = pending.sink.send(result);
    }

    fn broadcast(&self, event: Event) {
        log::debug!("<- event `{}`", event.event);
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Fail every pending request. Every issued seq must resolve exactly once,
    /// transport death included.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (seq, pending) in drained {
            log::debug!("failing in-flight request {seq} `{}`: transport closed", pending.command);
            let _ = pending.sink.send(Err(Error::TransportClosed));
        }
    }

    fn close_subscribers(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

/// Async DAP client over one framed transport.
pub struct DapClient {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    options: ClientOptions,
    stop: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl DapClient {
    /// Take ownership of a transport (and the adapter child, if we spawned
    /// one) and start the IO tasks.
    pub fn start(
        reader: Box<dyn TransportReader>,
        writer: Box<dyn TransportWriter>,
        child: Option<ChildGuard>,
        options: ClientOptions,
    ) -> Arc<DapClient> {
        let shared = Arc::new(Shared {
            next_seq: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            supports_cancel: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, stop.clone()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            child,
            shared.clone(),
            outbound.clone(),
            stop.clone(),
        ));

        Arc::new(DapClient {
            shared,
            outbound,
            options,
            stop,
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    /// Subscribe to adapter events in transport order. The channel closes
    /// when the transport dies.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Register and send a request, returning its seq and completion sink.
    pub fn issue(
        &self,
        command: &str,
        arguments: Value,
    ) -> Result<(i64, oneshot::Receiver<Result<Value, Error>>), Error> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let seq = self.shared.alloc_seq();
        let (sink, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(
            seq,
            PendingRequest {
                command: command.to_string(),
                sink,
            },
        );
        let sent = self.outbound.send(Message::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        }));
        if sent.is_err() {
            self.shared.pending.lock().unwrap().remove(&seq);
            return Err(Error::TransportClosed);
        }
        log::debug!("-> request {seq} `{command}`");
        Ok((seq, rx))
    }

    pub async fn request(&self, command: &str, arguments: Value) -> Result<Value, Error> {
        self.request_with_timeout(command, arguments, self.options.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        command: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<Value, Error> {
        let (seq, rx) = self.issue(command, arguments)?;
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            // Completion sink dropped without an answer: the IO tasks died.
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&seq);
                log::warn!("request {seq} `{command}` timed out after {limit:?}");
                Err(Error::Timeout(command.to_string()))
            }
        }
    }

    /// Cancel an in-flight request. The caller observes `Cancelled`; when the
    /// adapter advertised `supportsCancelRequest` a `cancel` request is also
    /// sent on the wire (its response is matched to no pending entry and
    /// discarded by design).
    pub fn cancel(&self, seq: i64) {
        let removed = self.shared.pending.lock().unwrap().remove(&seq);
        let Some(pending) = removed else { return };
        log::debug!("cancelling request {seq} `{}`", pending.command);
        let _ = pending.sink.send(Err(Error::Cancelled));

        if self.shared.supports_cancel.load(Ordering::SeqCst) {
            let cancel_seq = self.shared.alloc_seq();
            let _ = self.outbound.send(Message::Request(Request {
                seq: cancel_seq,
                command: "cancel".into(),
                arguments: json!({ "requestId": seq }),
            }));
        }
    }

    /// Close the transport, fail all pending requests and reap the adapter
    /// child process. Idempotent.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let reader = self.reader_task.lock().unwrap().take();
        let writer = self.writer_task.lock().unwrap().take();
        if let Some(task) = writer {
            let _ = task.await;
        }
        if let Some(task) = reader {
            let _ = task.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    // ---------------------------- request surface -------------------------

    pub async fn initialize(&self, adapter_id: &str) -> Result<Capabilities, Error> {
        let body = self
            .request_with_timeout(
                "initialize",
                json!({
                    "clientID": "dapmux",
                    "clientName": "dapmux",
                    "adapterID": adapter_id,
                    "locale": "en-US",
                    "linesStartAt1": true,
                    "columnsStartAt1": true,
                    "pathFormat": "path",
                    "supportsVariableType": true,
                    "supportsRunInTerminalRequest": false,
                }),
                self.options.initialize_timeout,
            )
            .await?;
        let capabilities: Capabilities = parse_body(body)?;
        self.apply_capabilities(&capabilities);
        Ok(capabilities)
    }

    /// Remember the capability bits the client itself acts on.
    pub fn apply_capabilities(&self, capabilities: &Capabilities) {
        self.shared
            .supports_cancel
            .store(capabilities.supports_cancel_request, Ordering::SeqCst);
    }

    pub async fn launch(&self, arguments: Value) -> Result<Value, Error> {
        // Many adapters complete `launch` only after configurationDone, so it
        // shares the generous initialize budget.
        self.request_with_timeout("launch", arguments, self.options.initialize_timeout)
            .await
    }

    pub async fn attach(&self, arguments: Value) -> Result<Value, Error> {
        self.request_with_timeout("attach", arguments, self.options.initialize_timeout)
            .await
    }

    pub async fn disconnect(&self, terminate_debuggee: Option<bool>) -> Result<(), Error> {
        let mut args = serde_json::Map::new();
        if let Some(flag) = terminate_debuggee {
            args.insert("terminateDebuggee".into(), Value::Bool(flag));
        }
        self.request("disconnect", Value::Object(args)).await?;
        Ok(())
    }

    pub async fn terminate(&self) -> Result<(), Error> {
        self.request("terminate", json!({})).await?;
        Ok(())
    }

    pub async fn restart(&self, arguments: Value) -> Result<(), Error> {
        self.request_with_timeout("restart", arguments, self.options.initialize_timeout)
            .await?;
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<(), Error> {
        self.request("configurationDone", Value::Null).await?;
        Ok(())
    }

    pub async fn set_breakpoints(
        &self,
        path: &Path,
        breakpoints: &[SourceBreakpoint],
    ) -> Result<Vec<BreakpointState>, Error> {
        let body = self
            .request(
                "setBreakpoints",
                json!({
                    "source": { "path": path, "name": path.file_name().and_then(|n| n.to_str()) },
                    "breakpoints": breakpoints,
                    "sourceModified": false,
                }),
            )
            .await?;
        let body: SetBreakpointsResponseBody = parse_body(body)?;
        Ok(body.breakpoints)
    }

    pub async fn set_function_breakpoints(
        &self,
        breakpoints: &[FunctionBreakpoint],
    ) -> Result<Vec<BreakpointState>, Error> {
        let body = self
            .request("setFunctionBreakpoints", json!({ "breakpoints": breakpoints }))
            .await?;
        let body: SetBreakpointsResponseBody = parse_body(body)?;
        Ok(body.breakpoints)
    }

    pub async fn set_exception_breakpoints(
        &self,
        filters: &[String],
        filter_options: &[ExceptionFilterOptions],
    ) -> Result<(), Error> {
        let mut args = json!({ "filters": filters });
        if !filter_options.is_empty() {
            args["filterOptions"] = serde_json::to_value(filter_options)?;
        }
        self.request("setExceptionBreakpoints", args).await?;
        Ok(())
    }

    pub async fn set_data_breakpoints(
        &self,
        breakpoints: &[DataBreakpoint],
    ) -> Result<Vec<BreakpointState>, Error> {
        let body = self
            .request("setDataBreakpoints", json!({ "breakpoints": breakpoints }))
            .await?;
        let body: SetBreakpointsResponseBody = parse_body(body)?;
        Ok(body.breakpoints)
    }

    pub async fn continue_request(&self, thread_id: i64) -> Result<bool, Error> {
        let body = self
            .request("continue", json!({ "threadId": thread_id }))
            .await?;
        let body: ContinueResponseBody = parse_body(body)?;
        Ok(body.all_threads_continued.unwrap_or(true))
    }

    pub async fn pause(&self, thread_id: i64) -> Result<(), Error> {
        self.request("pause", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn next(&self, thread_id: i64) -> Result<(), Error> {
        self.request("next", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<(), Error> {
        self.request("stepIn", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<(), Error> {
        self.request("stepOut", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    pub async fn restart_frame(&self, frame_id: i64) -> Result<(), Error> {
        self.request("restartFrame", json!({ "frameId": frame_id })).await?;
        Ok(())
    }

    pub async fn threads(&self) -> Result<Vec<Thread>, Error> {
        let body = self.request("threads", Value::Null).await?;
        let body: ThreadsResponseBody = parse_body(body)?;
        Ok(body.threads)
    }

    pub async fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>, Error> {
        let body = self
            .request("stackTrace", json!({ "threadId": thread_id }))
            .await?;
        let body: StackTraceResponseBody = parse_body(body)?;
        Ok(body.stack_frames)
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>, Error> {
        let body = self.request("scopes", json!({ "frameId": frame_id })).await?;
        let body: ScopesResponseBody = parse_body(body)?;
        Ok(body.scopes)
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>, Error> {
        let body = self
            .request("variables", json!({ "variablesReference": variables_reference }))
            .await?;
        let body: VariablesResponseBody = parse_body(body)?;
        Ok(body.variables)
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<Variable, Error> {
        let body = self
            .request(
                "setVariable",
                json!({
                    "variablesReference": variables_reference,
                    "name": name,
                    "value": value,
                }),
            )
            .await?;
        let updated: Variable = serde_json::from_value(json!({
            "name": name,
            "value": body.get("value").and_then(Value::as_str).unwrap_or_default(),
            "type": body.get("type"),
            "variablesReference": body.get("variablesReference").and_then(Value::as_i64).unwrap_or(0),
        }))
        .map_err(|e| Error::Protocol(format!("malformed setVariable response: {e}")))?;
        Ok(updated)
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<EvaluateResult, Error> {
        let mut args = json!({ "expression": expression, "context": context });
        if let Some(frame_id) = frame_id {
            args["frameId"] = json!(frame_id);
        }
        let body = self.request("evaluate", args).await?;
        parse_body(body)
    }

    pub async fn completions(
        &self,
        text: &str,
        column: i64,
        frame_id: Option<i64>,
    ) -> Result<Vec<CompletionItem>, Error> {
        let mut args = json!({ "text": text, "column": column });
        if let Some(frame_id) = frame_id {
            args["frameId"] = json!(frame_id);
        }
        let body = self.request("completions", args).await?;
        let body: CompletionsResponseBody = parse_body(body)?;
        Ok(body.targets)
    }
}

fn parse_body<T: Default + DeserializeOwned>(body: Value) -> Result<T, Error> {
    if body.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(body).map_err(|e| Error::Protocol(format!("malformed response body: {e}")))
}

async fn write_loop(
    mut writer: Box<dyn TransportWriter>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = writer.send(&msg).await {
                    log::error!("transport write failed: {e}");
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: Box<dyn TransportReader>,
    child: Option<ChildGuard>,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            msg = reader.recv() => match msg {
                Ok(Message::Response(resp)) => shared.complete(resp),
                Ok(Message::Event(event)) => shared.broadcast(event),
                Ok(Message::Request(req)) => {
                    // Reverse requests (runInTerminal, startDebugging) belong
                    // to the embedding UI; refuse politely.
                    log::warn!("refusing reverse request `{}`", req.command);
                    let _ = outbound.send(Message::Response(Response {
                        seq: shared.alloc_seq(),
                        request_seq: req.seq,
                        success: false,
                        command: req.command,
                        message: Some("reverse requests are not supported".into()),
                        body: Value::Null,
                    }));
                }
                Err(Error::TransportClosed) => {
                    log::debug!("transport closed by adapter");
                    break;
                }
                Err(e) => {
                    log::error!("closing transport: {e}");
                    break;
                }
            }
        }
    }

    shared.fail_all();
    shared.close_subscribers();
    if let Some(mut child) = child {
        child.shutdown().await;
    }
}
