//! One live debugging relationship with one adapter.
//!
//! The session owns its DAP client exclusively and drives the lifecycle
//! ordering many adapters silently depend on: initialize, then breakpoints,
//! then launch/attach, then configurationDone after the `initialized` event.

use crate::config::{task, LaunchConfig, RequestKind};
use crate::dap::client::DapClient;
use crate::dap::protocol::Event;
use crate::dap::types::{
    BreakpointEventBody, Capabilities, CompletionItem, ContinuedEventBody, EvaluateResult,
    ExitedEventBody, OutputEventBody, Scope, StackFrame, StoppedEventBody, Thread, ThreadEventBody,
    Variable,
};
use crate::debugger::breakpoint::{BreakpointId, BreakpointRegistry};
use crate::debugger::error::Error;
use crate::debugger::event::{EventHook, StopContext};
use crate::debugger::watch::WatchRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type SessionId = Uuid;

/// How long to wait for a straggling `initialized` event once the launch
/// response already arrived. Adapters running with `noDebug` may never send
/// it.
const INITIALIZED_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Configuring,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone)]
struct Focus {
    thread_id: i64,
    frame: Option<StackFrame>,
}

/// Point-in-time view of a session, safe to hand to the UI.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub name: String,
    pub adapter_type: String,
    pub request: RequestKind,
    pub state: SessionState,
    pub threads: Vec<Thread>,
    pub current_thread: Option<i64>,
    pub current_frame: Option<i64>,
}

pub struct DebugSession {
    id: SessionId,
    name: String,
    adapter_type: String,
    request: RequestKind,
    workspace_root: PathBuf,
    /// Resolved configuration the session was started with; restart re-uses
    /// it verbatim.
    config: LaunchConfig,
    client: Arc<DapClient>,
    state: Mutex<SessionState>,
    capabilities: Mutex<Capabilities>,
    threads: Mutex<Vec<Thread>>,
    focus: Mutex<Option<Focus>>,
    /// Adapter-assigned breakpoint id -> registry id, learned from sync
    /// responses and used to route `breakpoint` events.
    adapter_breakpoint_ids: Mutex<HashMap<i64, BreakpointId>>,
    initialized: Notify,
    /// Serializes breakpoint synchronization: racing edits queue here and
    /// the adapter sees the latest registry state last.
    sync_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    hook: Arc<dyn EventHook>,
    breakpoints: Arc<BreakpointRegistry>,
    watches: Arc<WatchRegistry>,
}

impl DebugSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        config: LaunchConfig,
        workspace_root: &Path,
        client: Arc<DapClient>,
        hook: Arc<dyn EventHook>,
        breakpoints: Arc<BreakpointRegistry>,
        watches: Arc<WatchRegistry>,
    ) -> Arc<DebugSession> {
        Arc::new(DebugSession {
            id,
            name: config.name.clone(),
            adapter_type: config.adapter_type.clone(),
            request: config.request,
            workspace_root: workspace_root.to_path_buf(),
            config,
            client,
            state: Mutex::new(SessionState::Initializing),
            capabilities: Mutex::new(Capabilities::default()),
            threads: Mutex::new(Vec::new()),
            focus: Mutex::new(None),
            adapter_breakpoint_ids: Mutex::new(HashMap::new()),
            initialized: Notify::new(),
            sync_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            hook,
            breakpoints,
            watches,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != SessionState::Terminated
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SessionState::Stopped
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.lock().unwrap().clone()
    }

    pub(crate) fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub(crate) fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let focus = self.focus.lock().unwrap().clone();
        SessionSnapshot {
            id: self.id,
            name: self.name.clone(),
            adapter_type: self.adapter_type.clone(),
            request: self.request,
            state: self.state(),
            threads: self.threads.lock().unwrap().clone(),
            current_thread: focus.as_ref().map(|f| f.thread_id),
            current_frame: focus.as_ref().and_then(|f| f.frame.as_ref()).map(|f| f.id),
        }
    }

    /// `true` when the transition happened. Terminated is absorbing.
    fn set_state(&self, next: SessionState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == next || *state == SessionState::Terminated {
                return false;
            }
            log::debug!("session {}: {} -> {}", self.id, *state, next);
            *state = next;
        }
        self.hook.on_state_changed(self.id, next);
        true
    }

    // ------------------------------- lifecycle ----------------------------

    /// Drive the start sequence to `running`. Cancelled by `stop`, which
    /// makes the caller observe `Cancelled`.
    pub(crate) async fn start(&self) -> Result<(), Error> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.run_start_sequence() => res,
        };
        if let Err(e) = &result {
            log::warn!("session {} start failed: {e}", self.id);
            self.finish().await;
        }
        result
    }

    async fn run_start_sequence(&self) -> Result<(), Error> {
        let capabilities = self.client.initialize(&self.adapter_type).await?;
        *self.capabilities.lock().unwrap() = capabilities;
        self.set_state(SessionState::Configuring);

        // Breakpoints reach the adapter strictly after initialize and before
        // launch/attach.
        self.sync_all_breakpoints().await?;

        let arguments = self.config.request_arguments();
        let launch = async {
            match self.request {
                RequestKind::Launch => self.client.launch(arguments).await,
                RequestKind::Attach => self.client.attach(arguments).await,
            }
        };
        tokio::pin!(launch);

        // The initialized event may already have fired; the Notify permit
        // makes this wait race-free.
        let mut launch_result = None;
        tokio::select! {
            res = &mut launch => launch_result = Some(res),
            _ = self.initialized.notified() => {}
        }

        let supports_configuration_done = self
            .capabilities
            .lock()
            .unwrap()
            .supports_configuration_done_request;

        match launch_result {
            None => {
                if supports_configuration_done {
                    self.client.configuration_done().await?;
                }
                launch.await?;
            }
            Some(result) => {
                result?;
                let initialized =
                    tokio::time::timeout(INITIALIZED_GRACE, self.initialized.notified()).await;
                if initialized.is_ok() && supports_configuration_done {
                    self.client.configuration_done().await?;
                } else if initialized.is_err() {
                    log::debug!("session {}: no initialized event, skipping configurationDone", self.id);
                }
            }
        }

        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Graceful shutdown: `terminate` for launched debuggees, `disconnect`
    /// (leaving the debuggee alive) for attached ones. Errors are swallowed;
    /// the transport is closed and the adapter reaped unconditionally.
    pub(crate) async fn stop(&self) -> Result<(), Error> {
        self.cancel.cancel();
        if self.state() == SessionState::Terminated {
            return Ok(());
        }
        self.set_state(SessionState::Terminating);

        let graceful = match self.request {
            RequestKind::Launch => {
                if self.capabilities.lock().unwrap().supports_terminate_request {
                    self.client.terminate().await
                } else {
                    self.client.disconnect(Some(true)).await
                }
            }
            RequestKind::Attach => self.client.disconnect(Some(false)).await,
        };
        if let Err(e) = graceful {
            log::warn!("graceful shutdown of session {}: {e}", self.id);
        }

        self.finish().await;
        Ok(())
    }

    /// Forced detach, whatever the request kind.
    pub(crate) async fn disconnect(&self) -> Result<(), Error> {
        self.cancel.cancel();
        if self.state() == SessionState::Terminated {
            return Ok(());
        }
        self.set_state(SessionState::Terminating);
        if let Err(e) = self.client.disconnect(None).await {
            log::warn!("disconnect of session {}: {e}", self.id);
        }
        self.finish().await;
        Ok(())
    }

    pub(crate) fn supports_restart(&self) -> bool {
        self.capabilities.lock().unwrap().supports_restart_request
    }

    /// In-place restart via the adapter's `restart` request.
    pub(crate) async fn restart_in_place(&self) -> Result<(), Error> {
        self.client.restart(self.config.request_arguments()).await?;
        *self.focus.lock().unwrap() = None;
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Terminal cleanup: close the transport, reap the adapter, notify once.
    pub(crate) async fn finish(&self) {
        self.client.shutdown().await;
        if self.set_state(SessionState::Terminated) {
            *self.focus.lock().unwrap() = None;
            self.hook.on_session_terminated(self.id);
            self.spawn_post_debug_task();
        }
    }

    fn spawn_post_debug_task(&self) {
        let Some(task_cmd) = self.config.post_debug_task() else { return };
        let task_cmd = task_cmd.to_string();
        let cwd = self.workspace_root.clone();
        let hook = self.hook.clone();
        let id = self.id;
        tokio::spawn(async move {
            let stream = |line: &str| hook.on_console_message(id, line);
            if let Err(e) = task::run_task(&task_cmd, &cwd, task::TASK_TIMEOUT, stream).await {
                log::warn!("post-debug task failed: {e}");
            }
        });
    }

    // ------------------------------ event pump ----------------------------

    /// One task per session consumes adapter events in transport order; all
    /// hook notifications for this session come from here or from the
    /// command path, never concurrently for one event.
    pub(crate) fn spawn_pump(self: Arc<Self>) {
        let session = self;
        let mut events = session.client.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_event(event).await;
            }
            // Transport exit terminates the session from any state.
            session.finish().await;
        });
    }

    async fn handle_event(&self, event: Event) {
        match event.event.as_str() {
            "initialized" => self.initialized.notify_one(),
            "stopped" => self.handle_stopped(event.body).await,
            "continued" => {
                let body: ContinuedEventBody = parse_event_body(event.body);
                self.apply_continued(body.all_threads_continued.unwrap_or(false));
            }
            "output" => {
                let body: OutputEventBody = parse_event_body(event.body);
                let category = body.category.as_deref().unwrap_or("console");
                self.hook.on_output(self.id, category, &body.output);
            }
            "thread" => {
                let body: ThreadEventBody = parse_event_body(event.body);
                log::debug!("session {}: thread {} {}", self.id, body.thread_id, body.reason);
                if let Ok(threads) = self.fetch_threads().await {
                    self.hook.on_threads_updated(self.id, &threads);
                }
            }
            "breakpoint" => {
                let body: BreakpointEventBody = parse_event_body(event.body);
                let Some(adapter_id) = body.breakpoint.id else { return };
                let registry_id = self
                    .adapter_breakpoint_ids
                    .lock()
                    .unwrap()
                    .get(&adapter_id)
                    .copied();
                if let Some(registry_id) = registry_id {
                    if let Some(bp) = self
                        .breakpoints
                        .apply_adapter_update(registry_id, &body.breakpoint)
                    {
                        self.hook.on_breakpoint_validated(self.id, &bp);
                    }
                }
            }
            "capabilities" => {
                let update = event
                    .body
                    .get("capabilities")
                    .cloned()
                    .unwrap_or(event.body);
                let mut capabilities = self.capabilities.lock().unwrap();
                capabilities.merge(&update);
                self.client.apply_capabilities(&capabilities);
            }
            "exited" => {
                let body: ExitedEventBody = parse_event_body(event.body);
                self.hook.on_console_message(
                    self.id,
                    &format!("debuggee exited with code {}", body.exit_code),
                );
            }
            "terminated" => self.finish().await,
            other => log::debug!("session {}: unhandled event `{other}`", self.id),
        }
    }

    async fn handle_stopped(&self, body: Value) {
        let body: StoppedEventBody = parse_event_body(body);
        self.set_state(SessionState::Stopped);

        let threads = self.fetch_threads().await.unwrap_or_default();
        if !threads.is_empty() {
            self.hook.on_threads_updated(self.id, &threads);
        }
        let thread_id = body
            .thread_id
            .or_else(|| threads.first().map(|t| t.id))
            .unwrap_or(1);

        let frame = match self.client.stack_trace(thread_id).await {
            Ok(frames) => frames.into_iter().next(),
            Err(e) => {
                log::warn!("session {}: stack trace after stop failed: {e}", self.id);
                None
            }
        };
        *self.focus.lock().unwrap() = Some(Focus {
            thread_id,
            frame: frame.clone(),
        });

        self.refresh_watches().await;

        let stop = StopContext {
            reason: body.reason,
            description: body.description,
            thread_id,
            frame,
            all_threads_stopped: body.all_threads_stopped.unwrap_or(false),
            hit_breakpoint_ids: body.hit_breakpoint_ids,
        };
        self.hook.on_stopped(self.id, &stop);
    }

    fn apply_continued(&self, all_threads_continued: bool) {
        if !self.set_state(SessionState::Running) {
            return;
        }
        if all_threads_continued {
            *self.focus.lock().unwrap() = None;
        }
        self.hook.on_continued(self.id, all_threads_continued);
    }

    // --------------------------- breakpoint sync --------------------------

    pub(crate) async fn sync_all_breakpoints(&self) -> Result<(), Error> {
        for path in self.breakpoints.source_files() {
            self.sync_source_file(&path).await?;
        }
        self.sync_function_breakpoints().await?;
        self.sync_exception_filters().await?;
        self.sync_data_breakpoints().await?;
        Ok(())
    }

    /// Push the enabled source breakpoints for one file. `setBreakpoints`
    /// replaces the whole per-file set, so the registry is re-read under the
    /// sync lock right before issuing.
    pub(crate) async fn sync_source_file(&self, path: &Path) -> Result<(), Error> {
        let _guard = self.sync_lock.lock().await;
        let plan = self.breakpoints.sync_plan(path);
        let states = self.client.set_breakpoints(&plan.path, &plan.args).await?;

        {
            let mut mapping = self.adapter_breakpoint_ids.lock().unwrap();
            for (registry_id, state) in plan.ids.iter().zip(&states) {
                if let Some(adapter_id) = state.id {
                    mapping.insert(adapter_id, *registry_id);
                }
            }
        }
        for bp in self.breakpoints.apply_sync_result(&plan.ids, &states) {
            self.hook.on_breakpoint_validated(self.id, &bp);
        }
        Ok(())
    }

    pub(crate) async fn sync_function_breakpoints(&self) -> Result<(), Error> {
        if !self.capabilities.lock().unwrap().supports_function_breakpoints {
            return Ok(());
        }
        let _guard = self.sync_lock.lock().await;
        let (ids, args) = self.breakpoints.function_sync_args();
        let states = self.client.set_function_breakpoints(&args).await?;
        for bp in self.breakpoints.apply_sync_result(&ids, &states) {
            self.hook.on_breakpoint_validated(self.id, &bp);
        }
        Ok(())
    }

    pub(crate) async fn sync_exception_filters(&self) -> Result<(), Error> {
        let (filters, filter_options) = self.breakpoints.exception_sync_args();
        let advertises_filters = !self
            .capabilities
            .lock()
            .unwrap()
            .exception_breakpoint_filters
            .is_empty();
        if filters.is_empty() && !advertises_filters {
            return Ok(());
        }
        let _guard = self.sync_lock.lock().await;
        self.client
            .set_exception_breakpoints(&filters, &filter_options)
            .await
    }

    pub(crate) async fn sync_data_breakpoints(&self) -> Result<(), Error> {
        if !self.capabilities.lock().unwrap().supports_data_breakpoints {
            return Ok(());
        }
        let _guard = self.sync_lock.lock().await;
        let (ids, args) = self.breakpoints.data_sync_args();
        let states = self.client.set_data_breakpoints(&args).await?;
        for bp in self.breakpoints.apply_sync_result(&ids, &states) {
            self.hook.on_breakpoint_validated(self.id, &bp);
        }
        Ok(())
    }

    // --------------------------- execution control ------------------------

    fn focus_thread(&self) -> Option<i64> {
        self.focus.lock().unwrap().as_ref().map(|f| f.thread_id)
    }

    fn focus_frame(&self) -> Option<i64> {
        self.focus
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|f| f.frame.as_ref())
            .map(|f| f.id)
    }

    async fn control_thread(&self) -> i64 {
        if let Some(thread_id) = self.focus_thread() {
            return thread_id;
        }
        if let Some(first) = self.threads.lock().unwrap().first() {
            return first.id;
        }
        match self.fetch_threads().await {
            Ok(threads) => threads.first().map(|t| t.id).unwrap_or(1),
            Err(_) => 1,
        }
    }

    pub(crate) async fn continue_execution(&self) -> Result<(), Error> {
        let thread_id = self.control_thread().await;
        let all_threads_continued = self.client.continue_request(thread_id).await?;
        self.apply_continued(all_threads_continued);
        Ok(())
    }

    pub(crate) async fn pause(&self) -> Result<(), Error> {
        let thread_id = self.control_thread().await;
        self.client.pause(thread_id).await
    }

    pub(crate) async fn step_over(&self) -> Result<(), Error> {
        let Some(thread_id) = self.focus_thread() else { return Ok(()) };
        self.client.next(thread_id).await?;
        self.apply_continued(false);
        Ok(())
    }

    pub(crate) async fn step_into(&self) -> Result<(), Error> {
        let Some(thread_id) = self.focus_thread() else { return Ok(()) };
        self.client.step_in(thread_id).await?;
        self.apply_continued(false);
        Ok(())
    }

    pub(crate) async fn step_out(&self) -> Result<(), Error> {
        let Some(thread_id) = self.focus_thread() else { return Ok(()) };
        self.client.step_out(thread_id).await?;
        self.apply_continued(false);
        Ok(())
    }

    pub(crate) async fn restart_frame(&self) -> Result<(), Error> {
        let Some(frame_id) = self.focus_frame() else { return Ok(()) };
        if !self.capabilities.lock().unwrap().supports_restart_frame {
            return Ok(());
        }
        self.client.restart_frame(frame_id).await?;
        self.apply_continued(false);
        Ok(())
    }

    // ------------------------------- queries ------------------------------

    pub(crate) async fn fetch_threads(&self) -> Result<Vec<Thread>, Error> {
        let threads = self.client.threads().await?;
        *self.threads.lock().unwrap() = threads.clone();
        Ok(threads)
    }

    pub(crate) async fn stack_trace(&self, thread_id: Option<i64>) -> Result<Vec<StackFrame>, Error> {
        let Some(thread_id) = thread_id.or_else(|| self.focus_thread()) else {
            return Ok(Vec::new());
        };
        self.client.stack_trace(thread_id).await
    }

    pub(crate) async fn scopes(&self, frame_id: Option<i64>) -> Result<Vec<Scope>, Error> {
        let Some(frame_id) = frame_id.or_else(|| self.focus_frame()) else {
            return Ok(Vec::new());
        };
        self.client.scopes(frame_id).await
    }

    pub(crate) async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>, Error> {
        self.client.variables(variables_reference).await
    }

    pub(crate) async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<Variable, Error> {
        self.client
            .set_variable(variables_reference, name, value)
            .await
    }

    pub(crate) async fn evaluate(
        &self,
        expression: &str,
        context: &str,
    ) -> Result<EvaluateResult, Error> {
        self.client
            .evaluate(expression, self.focus_frame(), context)
            .await
    }

    pub(crate) async fn completions(
        &self,
        text: &str,
        column: i64,
    ) -> Result<Vec<CompletionItem>, Error> {
        self.client
            .completions(text, column, self.focus_frame())
            .await
    }

    /// Re-evaluate every watch in insertion order against the current frame.
    /// Failures are captured per watch and never halt the batch.
    pub(crate) async fn refresh_watches(&self) {
        let frame_id = self.focus_frame();
        for (id, expression) in self.watches.expressions() {
            let outcome = match self.client.evaluate(&expression, frame_id, "watch").await {
                Ok(result) => Ok(result.result),
                Err(e) => Err(e.to_string()),
            };
            self.watches.record(id, outcome);
        }
    }
}

fn parse_event_body<T: Default + serde::de::DeserializeOwned>(body: Value) -> T {
    if body.is_null() {
        return T::default();
    }
    serde_json::from_value(body).unwrap_or_default()
}
