pub mod adapter;
pub mod breakpoint;
pub mod error;
pub mod event;
pub mod session;
pub mod watch;

pub use adapter::{AdapterLauncher, AdapterRegistry, StaticAdapterRegistry};
pub use breakpoint::{Breakpoint, BreakpointId, BreakpointKind, BreakpointOptions};
pub use error::Error;
pub use event::{DoNothingHook, EventHook, StopContext};
pub use session::{SessionId, SessionSnapshot, SessionState};
pub use watch::{Watch, WatchId};

use crate::config::substitute::{substitute_config, SubstitutionContext};
use crate::config::{self, task, Compound, LaunchConfig, LaunchFile};
use crate::dap::client::{ClientOptions, DapClient};
use crate::dap::transport;
use crate::dap::types::{CompletionItem, EvaluateResult, Scope, StackFrame, Thread, Variable};
use crate::debugger::breakpoint::{BreakpointRegistry, DataBreakpointSpec, FunctionBreakpointSpec};
use crate::debugger::session::DebugSession;
use crate::debugger::watch::WatchRegistry;
use crate::dap::types::ExceptionFilterOptions;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Debugger builder.
pub struct DebuggerBuilder {
    hook: Arc<dyn EventHook>,
    adapters: Arc<dyn AdapterRegistry>,
    client_options: ClientOptions,
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        DebuggerBuilder {
            hook: Arc::new(DoNothingHook),
            adapters: Arc::new(StaticAdapterRegistry::new()),
            client_options: ClientOptions::default(),
        }
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// UI notification sink.
    pub fn with_hooks(mut self, hook: impl EventHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Adapter discovery collaborator.
    pub fn with_adapter_registry(mut self, adapters: impl AdapterRegistry + 'static) -> Self {
        self.adapters = Arc::new(adapters);
        self
    }

    pub fn with_client_options(mut self, client_options: ClientOptions) -> Self {
        self.client_options = client_options;
        self
    }

    pub fn build(self) -> Debugger {
        Debugger {
            hook: self.hook,
            adapters: self.adapters,
            client_options: self.client_options,
            breakpoints: Arc::new(BreakpointRegistry::new()),
            watches: Arc::new(WatchRegistry::new()),
            sessions: Mutex::new(IndexMap::new()),
            active: Mutex::new(None),
            compound_members: Mutex::new(HashMap::new()),
            focused_file: Mutex::new(None),
        }
    }
}

/// Main structure of dapmux. The single entry point the UI transport talks
/// to: owns the session map, the breakpoint and watch registries, and
/// coordinates them with the configuration resolver.
pub struct Debugger {
    hook: Arc<dyn EventHook>,
    adapters: Arc<dyn AdapterRegistry>,
    client_options: ClientOptions,
    breakpoints: Arc<BreakpointRegistry>,
    watches: Arc<WatchRegistry>,
    sessions: Mutex<IndexMap<SessionId, Arc<DebugSession>>>,
    active: Mutex<Option<SessionId>>,
    /// Session id -> (compound name, stopAll) for sessions started through a
    /// compound.
    compound_members: Mutex<HashMap<SessionId, (String, bool)>>,
    focused_file: Mutex<Option<PathBuf>>,
}

impl Debugger {
    /// Inform the core which editor file has focus; `${file}` substitution
    /// resolves against it.
    pub fn set_focused_file(&self, file: Option<&Path>) {
        *self.focused_file.lock().unwrap() = file.map(Path::to_path_buf);
    }

    // ------------------------------ sessions ------------------------------

    /// Resolve a configuration, run its pre-launch task, reach the adapter
    /// and drive the new session to `running`.
    pub async fn start_session(
        &self,
        config: LaunchConfig,
        workspace_root: &Path,
    ) -> Result<SessionSnapshot, Error> {
        let mut ctx = SubstitutionContext::new(workspace_root);
        if let Some(file) = self.focused_file.lock().unwrap().clone() {
            ctx = ctx.with_file(&file);
        }
        let config = substitute_config(&config, &ctx);

        let session_id = Uuid::new_v4();

        // The pre-launch task gates everything: on failure no adapter is
        // spawned and no session exists.
        if let Some(task_cmd) = config.pre_launch_task() {
            let hook = self.hook.clone();
            task::run_task(task_cmd, workspace_root, task::TASK_TIMEOUT, |line| {
                hook.on_console_message(session_id, line)
            })
            .await?;
        }

        let client = self.connect(&config, workspace_root).await?;
        let session = DebugSession::new(
            session_id,
            config,
            workspace_root,
            client,
            self.hook.clone(),
            self.breakpoints.clone(),
            self.watches.clone(),
        );
        session.clone().spawn_pump();

        // Registered before the start sequence so `stop_session` can cancel
        // an in-flight start.
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, session.clone());
        {
            let mut active = self.active.lock().unwrap();
            if active.is_none() {
                *active = Some(session_id);
            }
        }

        match session.start().await {
            Ok(()) => {
                log::info!("session {} ({}) started", session_id, session.name());
                self.hook
                    .on_session_created(session_id, session.name(), session.state());
                Ok(session.snapshot())
            }
            Err(e) => {
                self.remove_session(session_id);
                Err(e)
            }
        }
    }

    /// Start every configuration a compound names, in order. Missing names
    /// are skipped with a warning.
    pub async fn start_compound(
        &self,
        name: &str,
        workspace_root: &Path,
    ) -> Result<Vec<SessionSnapshot>, Error> {
        let file = config::read_launch_file(workspace_root).await?;
        let compound: Compound = file
            .compound(name)
            .cloned()
            .ok_or_else(|| Error::CompoundNotFound(name.to_string()))?;

        if let Some(task_cmd) = &compound.pre_launch_task {
            let hook = self.hook.clone();
            // The compound task belongs to no single session; the nil id
            // marks workspace-level console output.
            task::run_task(task_cmd, workspace_root, task::TASK_TIMEOUT, |line| {
                hook.on_console_message(Uuid::nil(), line)
            })
            .await?;
        }

        let mut started = Vec::new();
        for member in &compound.configurations {
            let Some(member_config) = file.configuration(member) else {
                log::warn!("compound `{name}`: configuration `{member}` not found, skipping");
                continue;
            };
            let snapshot = self
                .start_session(member_config.clone(), workspace_root)
                .await?;
            self.compound_members
                .lock()
                .unwrap()
                .insert(snapshot.id, (name.to_string(), compound.stop_all));
            started.push(snapshot);
        }
        Ok(started)
    }

    /// Gracefully stop a session (the active one when `id` is omitted).
    /// Stopping a `stopAll` compound member stops its siblings too.
    pub async fn stop_session(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };

        let siblings = self.compound_siblings(session.id());
        session.stop().await?;
        self.remove_session(session.id());

        for sibling in siblings {
            if let Err(e) = sibling.stop().await {
                log::warn!("stopping compound sibling {}: {e}", sibling.id());
            }
            self.remove_session(sibling.id());
        }
        Ok(())
    }

    /// Detach from a session without terminating the debuggee.
    pub async fn disconnect_session(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.disconnect().await?;
        self.remove_session(session.id());
        Ok(())
    }

    /// Restart a session: through the adapter's `restart` request when
    /// supported, otherwise a full teardown and a fresh start sequence (the
    /// pre-launch task runs again).
    pub async fn restart_session(
        &self,
        id: Option<SessionId>,
    ) -> Result<Option<SessionSnapshot>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(None);
        };

        if session.supports_restart() {
            session.restart_in_place().await?;
            return Ok(Some(session.snapshot()));
        }

        let config = session.config().clone();
        let workspace_root = session.workspace_root().to_path_buf();
        session.stop().await?;
        self.remove_session(session.id());
        self.start_session(config, &workspace_root).await.map(Some)
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.prune_terminated();
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| s.snapshot())
            .collect()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.sessions.lock().unwrap().get(&id).map(|s| s.snapshot())
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.prune_terminated();
        *self.active.lock().unwrap()
    }

    pub fn set_active_session(&self, id: SessionId) -> Result<(), Error> {
        let sessions = self.sessions.lock().unwrap();
        if !sessions.contains_key(&id) {
            return Err(Error::SessionNotFound(id));
        }
        drop(sessions);
        *self.active.lock().unwrap() = Some(id);
        Ok(())
    }

    // -------------------------- execution control -------------------------

    pub async fn continue_session(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.continue_execution().await
    }

    pub async fn pause_session(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.pause().await
    }

    pub async fn step_over(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.step_over().await
    }

    pub async fn step_into(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.step_into().await
    }

    pub async fn step_out(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.step_out().await
    }

    pub async fn restart_frame(&self, id: Option<SessionId>) -> Result<(), Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(());
        };
        session.restart_frame().await
    }

    // ------------------------------ queries -------------------------------

    pub async fn threads(&self, id: Option<SessionId>) -> Result<Vec<Thread>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(Vec::new());
        };
        session.fetch_threads().await
    }

    pub async fn stack_trace(
        &self,
        id: Option<SessionId>,
        thread_id: Option<i64>,
    ) -> Result<Vec<StackFrame>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(Vec::new());
        };
        session.stack_trace(thread_id).await
    }

    pub async fn scopes(
        &self,
        id: Option<SessionId>,
        frame_id: Option<i64>,
    ) -> Result<Vec<Scope>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(Vec::new());
        };
        session.scopes(frame_id).await
    }

    pub async fn variables(
        &self,
        id: Option<SessionId>,
        variables_reference: i64,
    ) -> Result<Vec<Variable>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(Vec::new());
        };
        session.variables(variables_reference).await
    }

    pub async fn set_variable(
        &self,
        id: Option<SessionId>,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<Option<Variable>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(None);
        };
        session
            .set_variable(variables_reference, name, value)
            .await
            .map(Some)
    }

    pub async fn evaluate(
        &self,
        id: Option<SessionId>,
        expression: &str,
        context: &str,
    ) -> Result<Option<EvaluateResult>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(None);
        };
        session.evaluate(expression, context).await.map(Some)
    }

    pub async fn completions(
        &self,
        id: Option<SessionId>,
        text: &str,
        column: i64,
    ) -> Result<Vec<CompletionItem>, Error> {
        let Some(session) = self.target_session(id)? else {
            return Ok(Vec::new());
        };
        session.completions(text, column).await
    }

    // ----------------------------- breakpoints ----------------------------

    pub async fn add_breakpoint(
        &self,
        path: &Path,
        line: i64,
        options: BreakpointOptions,
    ) -> Result<Breakpoint, Error> {
        let bp = self.breakpoints.add_source(path, line, options);
        self.sync_file_everywhere(path).await;
        Ok(self.breakpoints.find(bp.id).unwrap_or(bp))
    }

    pub async fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        let bp = self.breakpoints.remove(id)?;
        self.resync_for(&bp).await;
        Ok(())
    }

    pub async fn toggle_breakpoint(&self, id: BreakpointId) -> Result<Breakpoint, Error> {
        let bp = self.breakpoints.toggle_enabled(id)?;
        self.resync_for(&bp).await;
        Ok(self.breakpoints.find(bp.id).unwrap_or(bp))
    }

    /// Add a source breakpoint at `path:line` or remove the existing one.
    pub async fn toggle_breakpoint_at_line(
        &self,
        path: &Path,
        line: i64,
    ) -> Result<Option<Breakpoint>, Error> {
        let added = self.breakpoints.toggle_at_line(path, line);
        self.sync_file_everywhere(path).await;
        Ok(match added {
            Some(bp) => Some(self.breakpoints.find(bp.id).unwrap_or(bp)),
            None => None,
        })
    }

    pub async fn edit_breakpoint(
        &self,
        id: BreakpointId,
        options: BreakpointOptions,
    ) -> Result<Breakpoint, Error> {
        let bp = self.breakpoints.edit(id, options)?;
        self.resync_for(&bp).await;
        Ok(self.breakpoints.find(bp.id).unwrap_or(bp))
    }

    /// Total replacement of the function breakpoint set.
    pub async fn set_function_breakpoints(
        &self,
        specs: Vec<FunctionBreakpointSpec>,
    ) -> Result<Vec<Breakpoint>, Error> {
        let created = self.breakpoints.set_function_breakpoints(specs);
        for session in self.alive_sessions() {
            if let Err(e) = session.sync_function_breakpoints().await {
                log::warn!("function breakpoint sync to session {} failed: {e}", session.id());
            }
        }
        Ok(created)
    }

    /// Total replacement of the exception filter set.
    pub async fn set_exception_filters(
        &self,
        filters: Vec<String>,
        filter_options: Vec<ExceptionFilterOptions>,
    ) -> Result<Vec<Breakpoint>, Error> {
        let created = self.breakpoints.set_exception_filters(filters, filter_options);
        for session in self.alive_sessions() {
            if let Err(e) = session.sync_exception_filters().await {
                log::warn!("exception filter sync to session {} failed: {e}", session.id());
            }
        }
        Ok(created)
    }

    /// Total replacement of the data breakpoint set.
    pub async fn set_data_breakpoints(
        &self,
        specs: Vec<DataBreakpointSpec>,
    ) -> Result<Vec<Breakpoint>, Error> {
        let created = self.breakpoints.set_data_breakpoints(specs);
        for session in self.alive_sessions() {
            if let Err(e) = session.sync_data_breakpoints().await {
                log::warn!("data breakpoint sync to session {} failed: {e}", session.id());
            }
        }
        Ok(created)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.all()
    }

    pub fn breakpoints_for_file(&self, path: &Path) -> Vec<Breakpoint> {
        self.breakpoints.for_file(path)
    }

    pub fn find_breakpoint(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.breakpoints.find(id)
    }

    /// Snapshot for the external persistence layer.
    pub fn breakpoint_snapshot(&self) -> Vec<Breakpoint> {
        self.breakpoints.snapshot()
    }

    /// Load a persisted snapshot and mirror it into every attached session.
    pub async fn restore_breakpoints(&self, snapshot: Vec<Breakpoint>) {
        self.breakpoints.restore(snapshot);
        for session in self.alive_sessions() {
            if let Err(e) = session.sync_all_breakpoints().await {
                log::warn!("breakpoint restore sync to session {} failed: {e}", session.id());
            }
        }
    }

    // ------------------------------- watches ------------------------------

    pub async fn add_watch(&self, expression: &str) -> Watch {
        let watch = self.watches.add(expression);
        if let Some(session) = self.stopped_session() {
            session.refresh_watches().await;
        }
        self.watches
            .all()
            .into_iter()
            .find(|w| w.id == watch.id)
            .unwrap_or(watch)
    }

    pub fn remove_watch(&self, id: WatchId) -> Result<(), Error> {
        self.watches.remove(id).map(|_| ())
    }

    /// Watches carry results only while some session is stopped.
    pub fn watches(&self) -> Vec<Watch> {
        if self.stopped_session().is_some() {
            self.watches.all()
        } else {
            self.watches.all_blank()
        }
    }

    // ---------------------------- configuration ---------------------------

    pub async fn read_launch_configs(&self, workspace_root: &Path) -> Result<LaunchFile, Error> {
        config::read_launch_file(workspace_root).await
    }

    pub async fn write_launch_configs(
        &self,
        workspace_root: &Path,
        file: &LaunchFile,
    ) -> Result<(), Error> {
        config::write_launch_file(workspace_root, file).await
    }

    pub async fn import_from_secondary(&self, workspace_root: &Path) -> Result<LaunchFile, Error> {
        config::import_from_secondary(workspace_root).await
    }

    pub fn default_launch_config(&self, adapter_type: &str) -> LaunchConfig {
        config::template::default_config(adapter_type)
    }

    pub fn auto_generate_configs(
        &self,
        detected: &[String],
        workspace_root: &Path,
    ) -> Vec<LaunchConfig> {
        config::template::auto_generate(detected, workspace_root)
    }

    // ------------------------------ internals -----------------------------

    /// Push the per-file breakpoint set to every attached session. Sync
    /// failures degrade to unverified breakpoints, they never fail the user
    /// command that mutated the registry.
    async fn sync_file_everywhere(&self, path: &Path) {
        for session in self.alive_sessions() {
            if let Err(e) = session.sync_source_file(path).await {
                log::warn!("breakpoint sync to session {} failed: {e}", session.id());
            }
        }
    }

    /// Re-sync whatever breakpoint class `bp` belongs to.
    async fn resync_for(&self, bp: &Breakpoint) {
        if let Some(path) = bp.source_path() {
            let path = path.to_path_buf();
            self.sync_file_everywhere(&path).await;
            return;
        }
        for session in self.alive_sessions() {
            let result = match bp.kind {
                BreakpointKind::Function => session.sync_function_breakpoints().await,
                BreakpointKind::Exception => session.sync_exception_filters().await,
                BreakpointKind::Data => session.sync_data_breakpoints().await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("breakpoint sync to session {} failed: {e}", session.id());
            }
        }
    }

    async fn connect(
        &self,
        config: &LaunchConfig,
        workspace_root: &Path,
    ) -> Result<Arc<DapClient>, Error> {
        if let Some((host, port)) = config.remote_endpoint() {
            log::debug!("connecting to remote adapter at {host}:{port}");
            let (reader, writer) = transport::connect(&host, port).await?;
            return Ok(DapClient::start(
                Box::new(reader),
                Box::new(writer),
                None,
                self.client_options,
            ));
        }

        let launcher = adapter::resolve_launcher(&*self.adapters, &config.adapter_type)?;
        match launcher {
            AdapterLauncher::Spawn {
                command,
                args,
                env,
                cwd,
            } => {
                let cwd = cwd.unwrap_or_else(|| workspace_root.to_path_buf());
                let (reader, writer, guard) = transport::spawn(&command, &args, &env, Some(&cwd))?;
                log::debug!("spawned adapter `{command}` (pid {:?})", guard.id());
                Ok(DapClient::start(
                    Box::new(reader),
                    Box::new(writer),
                    Some(guard),
                    self.client_options,
                ))
            }
            AdapterLauncher::Tcp { host, port } => {
                log::debug!("connecting to adapter at {host}:{port}");
                let (reader, writer) = transport::connect(&host, port).await?;
                Ok(DapClient::start(
                    Box::new(reader),
                    Box::new(writer),
                    None,
                    self.client_options,
                ))
            }
        }
    }

    fn target_session(&self, id: Option<SessionId>) -> Result<Option<Arc<DebugSession>>, Error> {
        self.prune_terminated();
        match id {
            Some(id) => self
                .sessions
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .map(Some)
                .ok_or(Error::SessionNotFound(id)),
            None => {
                let active = *self.active.lock().unwrap();
                Ok(active.and_then(|id| self.sessions.lock().unwrap().get(&id).cloned()))
            }
        }
    }

    fn alive_sessions(&self) -> Vec<Arc<DebugSession>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_alive())
            .cloned()
            .collect()
    }

    fn stopped_session(&self) -> Option<Arc<DebugSession>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.is_stopped())
            .cloned()
    }

    fn compound_siblings(&self, id: SessionId) -> Vec<Arc<DebugSession>> {
        let members = self.compound_members.lock().unwrap();
        let Some((compound, stop_all)) = members.get(&id) else {
            return Vec::new();
        };
        if !*stop_all {
            return Vec::new();
        }
        let sibling_ids: Vec<SessionId> = members
            .iter()
            .filter(|(other, (name, _))| **other != id && name == compound)
            .map(|(other, _)| *other)
            .collect();
        drop(members);

        let sessions = self.sessions.lock().unwrap();
        sibling_ids
            .iter()
            .filter_map(|id| sessions.get(id).cloned())
            .collect()
    }

    /// Drop terminated sessions from the map and advance the active id to
    /// the next session in insertion order.
    fn prune_terminated(&self) {
        let dead: Vec<SessionId> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.is_alive())
            .map(|s| s.id())
            .collect();
        for id in dead {
            self.remove_session(id);
        }
    }

    fn remove_session(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.shift_remove(&id);
        self.compound_members.lock().unwrap().remove(&id);

        let mut active = self.active.lock().unwrap();
        if *active == Some(id) || active.map(|a| !sessions.contains_key(&a)).unwrap_or(false) {
            *active = sessions.keys().next().copied();
        }
        let none_left = sessions.is_empty();
        drop(sessions);
        drop(active);

        if none_left {
            // No attached session: verification no longer means anything.
            self.breakpoints.clear_verification();
        }
    }
}
