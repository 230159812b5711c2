//! Process-wide breakpoint registry.
//!
//! Breakpoints outlive debug sessions: they are created and removed only by
//! user commands, and every attached session mirrors the registry into its
//! adapter. `verified` is purely the adapter's last answer and means nothing
//! once no session is attached.

use crate::dap::types::{
    BreakpointState, DataBreakpoint, ExceptionFilterOptions, FunctionBreakpoint, SourceBreakpoint,
};
use crate::debugger::error::Error;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub type BreakpointId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointKind {
    Line,
    Conditional,
    Logpoint,
    Function,
    Exception,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointLocation {
    Source {
        path: PathBuf,
        line: i64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        column: Option<i64>,
    },
    Function {
        name: String,
    },
    Exception {
        filter_id: String,
    },
    Data {
        data_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        access_type: Option<String>,
    },
}

/// One user-owned breakpoint. Survives all sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub location: BreakpointLocation,
    pub enabled: bool,
    pub verified: bool,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

impl Breakpoint {
    pub fn source_path(&self) -> Option<&Path> {
        match &self.location {
            BreakpointLocation::Source { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn line(&self) -> Option<i64> {
        match &self.location {
            BreakpointLocation::Source { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// Kind is derived: a log message makes a logpoint, otherwise a condition
    /// makes a conditional breakpoint. Non-source kinds keep their kind.
    fn reclassify(&mut self) {
        if !matches!(self.location, BreakpointLocation::Source { .. }) {
            return;
        }
        self.kind = if self.log_message.is_some() {
            BreakpointKind::Logpoint
        } else if self.condition.is_some() {
            BreakpointKind::Conditional
        } else {
            BreakpointKind::Line
        };
    }
}

/// Mutable attributes of a breakpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakpointOptions {
    pub column: Option<i64>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

/// Requested function breakpoint (total-replacement input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionBreakpointSpec {
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
}

/// Requested data breakpoint (total-replacement input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBreakpointSpec {
    pub data_id: String,
    #[serde(default)]
    pub access_type: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
}

/// What a session must send for one file: the enabled source breakpoints at
/// the moment the plan was taken, in registry order.
#[derive(Debug, Clone)]
pub struct FileSyncPlan {
    pub path: PathBuf,
    pub ids: Vec<BreakpointId>,
    pub args: Vec<SourceBreakpoint>,
}

#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: Mutex<IndexMap<BreakpointId, Breakpoint>>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, path: &Path, line: i64, options: BreakpointOptions) -> Breakpoint {
        let mut bp = Breakpoint {
            id: Uuid::new_v4(),
            kind: BreakpointKind::Line,
            location: BreakpointLocation::Source {
                path: path.to_path_buf(),
                line,
                column: options.column,
            },
            enabled: true,
            verified: false,
            condition: options.condition,
            hit_condition: options.hit_condition,
            log_message: options.log_message,
        };
        bp.reclassify();
        self.breakpoints.lock().unwrap().insert(bp.id, bp.clone());
        bp
    }

    pub fn remove(&self, id: BreakpointId) -> Result<Breakpoint, Error> {
        self.breakpoints
            .lock()
            .unwrap()
            .shift_remove(&id)
            .ok_or(Error::BreakpointNotFound(id))
    }

    pub fn toggle_enabled(&self, id: BreakpointId) -> Result<Breakpoint, Error> {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let bp = breakpoints.get_mut(&id).ok_or(Error::BreakpointNotFound(id))?;
        bp.enabled = !bp.enabled;
        if !bp.enabled {
            bp.verified = false;
        }
        Ok(bp.clone())
    }

    /// Add a breakpoint at `path:line`, or remove the one already there.
    /// Returns the created breakpoint, `None` when one was removed.
    pub fn toggle_at_line(&self, path: &Path, line: i64) -> Option<Breakpoint> {
        let existing = {
            let breakpoints = self.breakpoints.lock().unwrap();
            breakpoints
                .values()
                .find(|bp| bp.source_path() == Some(path) && bp.line() == Some(line))
                .map(|bp| bp.id)
        };
        match existing {
            Some(id) => {
                self.breakpoints.lock().unwrap().shift_remove(&id);
                None
            }
            None => Some(self.add_source(path, line, BreakpointOptions::default())),
        }
    }

    pub fn edit(&self, id: BreakpointId, options: BreakpointOptions) -> Result<Breakpoint, Error> {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let bp = breakpoints.get_mut(&id).ok_or(Error::BreakpointNotFound(id))?;
        bp.condition = options.condition;
        bp.hit_condition = options.hit_condition;
        bp.log_message = options.log_message;
        if let (BreakpointLocation::Source { column, .. }, Some(new_column)) =
            (&mut bp.location, options.column)
        {
            *column = Some(new_column);
        }
        bp.reclassify();
        Ok(bp.clone())
    }

    /// Replace the whole function breakpoint set.
    pub fn set_function_breakpoints(&self, specs: Vec<FunctionBreakpointSpec>) -> Vec<Breakpoint> {
        self.replace_kind(BreakpointKind::Function, specs.into_iter().map(|spec| Breakpoint {
            id: Uuid::new_v4(),
            kind: BreakpointKind::Function,
            location: BreakpointLocation::Function { name: spec.name },
            enabled: true,
            verified: false,
            condition: spec.condition,
            hit_condition: spec.hit_condition,
            log_message: None,
        }))
    }

    /// Replace the whole exception filter set.
    pub fn set_exception_filters(
        &self,
        filters: Vec<String>,
        filter_options: Vec<ExceptionFilterOptions>,
    ) -> Vec<Breakpoint> {
        let entries: Vec<Breakpoint> = filters
            .into_iter()
            .map(|filter_id| {
                let condition = filter_options
                    .iter()
                    .find(|opt| opt.filter_id == filter_id)
                    .and_then(|opt| opt.condition.clone());
                Breakpoint {
                    id: Uuid::new_v4(),
                    kind: BreakpointKind::Exception,
                    location: BreakpointLocation::Exception { filter_id },
                    enabled: true,
                    verified: false,
                    condition,
                    hit_condition: None,
                    log_message: None,
                }
            })
            .collect();
        self.replace_kind(BreakpointKind::Exception, entries)
    }

    /// Replace the whole data breakpoint set.
    pub fn set_data_breakpoints(&self, specs: Vec<DataBreakpointSpec>) -> Vec<Breakpoint> {
        self.replace_kind(BreakpointKind::Data, specs.into_iter().map(|spec| Breakpoint {
            id: Uuid::new_v4(),
            kind: BreakpointKind::Data,
            location: BreakpointLocation::Data {
                data_id: spec.data_id,
                access_type: spec.access_type,
            },
            enabled: true,
            verified: false,
            condition: spec.condition,
            hit_condition: spec.hit_condition,
            log_message: None,
        }))
    }

    fn replace_kind(
        &self,
        kind: BreakpointKind,
        entries: impl IntoIterator<Item = Breakpoint>,
    ) -> Vec<Breakpoint> {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        breakpoints.retain(|_, bp| bp.kind != kind);
        let mut created = Vec::new();
        for bp in entries {
            breakpoints.insert(bp.id, bp.clone());
            created.push(bp);
        }
        created
    }

    pub fn all(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().unwrap().values().cloned().collect()
    }

    pub fn for_file(&self, path: &Path) -> Vec<Breakpoint> {
        self.breakpoints
            .lock()
            .unwrap()
            .values()
            .filter(|bp| bp.source_path() == Some(path))
            .cloned()
            .collect()
    }

    pub fn find(&self, id: BreakpointId) -> Option<Breakpoint> {
        self.breakpoints.lock().unwrap().get(&id).cloned()
    }

    /// Files that currently hold at least one source breakpoint, enabled or
    /// not.
    pub fn source_files(&self) -> Vec<PathBuf> {
        self.breakpoints
            .lock()
            .unwrap()
            .values()
            .filter_map(|bp| bp.source_path().map(Path::to_path_buf))
            .unique()
            .collect_vec()
    }

    /// Atomic snapshot of what `setBreakpoints` for `path` must carry right
    /// now. Disabled breakpoints stay local and are omitted.
    pub fn sync_plan(&self, path: &Path) -> FileSyncPlan {
        let breakpoints = self.breakpoints.lock().unwrap();
        let mut ids = Vec::new();
        let mut args = Vec::new();
        for bp in breakpoints.values() {
            if !bp.enabled || bp.source_path() != Some(path) {
                continue;
            }
            let (line, column) = match &bp.location {
                BreakpointLocation::Source { line, column, .. } => (*line, *column),
                _ => continue,
            };
            ids.push(bp.id);
            args.push(SourceBreakpoint {
                line,
                column,
                condition: bp.condition.clone(),
                hit_condition: bp.hit_condition.clone(),
                log_message: bp.log_message.clone(),
            });
        }
        FileSyncPlan {
            path: path.to_path_buf(),
            ids,
            args,
        }
    }

    /// Enabled function breakpoints in registry order.
    pub fn function_sync_args(&self) -> (Vec<BreakpointId>, Vec<FunctionBreakpoint>) {
        let breakpoints = self.breakpoints.lock().unwrap();
        let mut ids = Vec::new();
        let mut args = Vec::new();
        for bp in breakpoints.values() {
            if !bp.enabled {
                continue;
            }
            if let BreakpointLocation::Function { name } = &bp.location {
                ids.push(bp.id);
                args.push(FunctionBreakpoint {
                    name: name.clone(),
                    condition: bp.condition.clone(),
                    hit_condition: bp.hit_condition.clone(),
                });
            }
        }
        (ids, args)
    }

    /// Enabled exception filters in registry order.
    pub fn exception_sync_args(&self) -> (Vec<String>, Vec<ExceptionFilterOptions>) {
        let breakpoints = self.breakpoints.lock().unwrap();
        let mut filters = Vec::new();
        let mut options = Vec::new();
        for bp in breakpoints.values() {
            if !bp.enabled {
                continue;
            }
            if let BreakpointLocation::Exception { filter_id } = &bp.location {
                filters.push(filter_id.clone());
                if bp.condition.is_some() {
                    options.push(ExceptionFilterOptions {
                        filter_id: filter_id.clone(),
                        condition: bp.condition.clone(),
                    });
                }
            }
        }
        (filters, options)
    }

    /// Enabled data breakpoints in registry order.
    pub fn data_sync_args(&self) -> (Vec<BreakpointId>, Vec<DataBreakpoint>) {
        let breakpoints = self.breakpoints.lock().unwrap();
        let mut ids = Vec::new();
        let mut args = Vec::new();
        for bp in breakpoints.values() {
            if !bp.enabled {
                continue;
            }
            if let BreakpointLocation::Data { data_id, access_type } = &bp.location {
                ids.push(bp.id);
                args.push(DataBreakpoint {
                    data_id: data_id.clone(),
                    access_type: access_type.clone(),
                    condition: bp.condition.clone(),
                    hit_condition: bp.hit_condition.clone(),
                });
            }
        }
        (ids, args)
    }

    /// Mirror the adapter's verification answer onto the breakpoints a sync
    /// carried, pairwise in request order. An adapter-corrected line rewrites
    /// the stored line. Most recent answer wins, whichever session it came
    /// from. Returns the updated breakpoints.
    pub fn apply_sync_result(
        &self,
        ids: &[BreakpointId],
        states: &[BreakpointState],
    ) -> Vec<Breakpoint> {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let mut updated = Vec::new();
        for (id, state) in ids.iter().zip(states) {
            let Some(bp) = breakpoints.get_mut(id) else { continue };
            bp.verified = state.verified;
            if let (BreakpointLocation::Source { line, .. }, Some(new_line)) =
                (&mut bp.location, state.line)
            {
                *line = new_line;
            }
            updated.push(bp.clone());
        }
        updated
    }

    /// Apply a `breakpoint` event body to one registry entry.
    pub fn apply_adapter_update(
        &self,
        id: BreakpointId,
        state: &BreakpointState,
    ) -> Option<Breakpoint> {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let bp = breakpoints.get_mut(&id)?;
        bp.verified = state.verified;
        if let (BreakpointLocation::Source { line, .. }, Some(new_line)) =
            (&mut bp.location, state.line)
        {
            *line = new_line;
        }
        Some(bp.clone())
    }

    /// Verification is meaningless without an attached session.
    pub fn clear_verification(&self) {
        for bp in self.breakpoints.lock().unwrap().values_mut() {
            bp.verified = false;
        }
    }

    /// Snapshot for the delegated persistence layer.
    pub fn snapshot(&self) -> Vec<Breakpoint> {
        self.all()
    }

    /// Pure load of a previously taken snapshot. Verification state does not
    /// survive persistence.
    pub fn restore(&self, snapshot: Vec<Breakpoint>) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        breakpoints.clear();
        for mut bp in snapshot {
            bp.verified = false;
            breakpoints.insert(bp.id, bp);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry_with_one(path: &str, line: i64) -> (BreakpointRegistry, Breakpoint) {
        let registry = BreakpointRegistry::new();
        let bp = registry.add_source(Path::new(path), line, BreakpointOptions::default());
        (registry, bp)
    }

    #[test]
    fn kind_classification() {
        let registry = BreakpointRegistry::new();
        let plain = registry.add_source(Path::new("/ws/a.js"), 1, BreakpointOptions::default());
        assert_eq!(plain.kind, BreakpointKind::Line);

        let cond = registry.add_source(
            Path::new("/ws/a.js"),
            2,
            BreakpointOptions {
                condition: Some("x > 0".into()),
                ..Default::default()
            },
        );
        assert_eq!(cond.kind, BreakpointKind::Conditional);

        // A log message wins over a condition.
        let logpoint = registry.add_source(
            Path::new("/ws/a.js"),
            3,
            BreakpointOptions {
                condition: Some("x > 0".into()),
                log_message: Some("x is {x}".into()),
                ..Default::default()
            },
        );
        assert_eq!(logpoint.kind, BreakpointKind::Logpoint);
    }

    #[test]
    fn edit_reclassifies() {
        let (registry, bp) = registry_with_one("/ws/a.js", 10);
        let edited = registry
            .edit(
                bp.id,
                BreakpointOptions {
                    log_message: Some("hit".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.kind, BreakpointKind::Logpoint);

        let edited = registry.edit(bp.id, BreakpointOptions::default()).unwrap();
        assert_eq!(edited.kind, BreakpointKind::Line);
        assert!(edited.condition.is_none());
    }

    #[test]
    fn toggle_at_line_round_trips() {
        let registry = BreakpointRegistry::new();
        let path = Path::new("/ws/a.js");
        assert!(registry.toggle_at_line(path, 10).is_some());
        assert_eq!(registry.for_file(path).len(), 1);
        assert!(registry.toggle_at_line(path, 10).is_none());
        assert!(registry.for_file(path).is_empty());
    }

    #[test]
    fn disabled_breakpoints_stay_local() {
        let (registry, bp) = registry_with_one("/ws/a.js", 10);
        registry.add_source(Path::new("/ws/a.js"), 20, BreakpointOptions::default());
        registry.toggle_enabled(bp.id).unwrap();

        let plan = registry.sync_plan(Path::new("/ws/a.js"));
        assert_eq!(plan.args.len(), 1);
        assert_eq!(plan.args[0].line, 20);
        // Still tracked locally.
        assert_eq!(registry.for_file(Path::new("/ws/a.js")).len(), 2);
    }

    #[test]
    fn sync_result_rewrites_line() {
        let (registry, bp) = registry_with_one("/ws/a.js", 10);
        let plan = registry.sync_plan(Path::new("/ws/a.js"));
        let updated = registry.apply_sync_result(
            &plan.ids,
            &[BreakpointState {
                id: Some(1),
                verified: true,
                line: Some(11),
                ..Default::default()
            }],
        );
        assert_eq!(updated.len(), 1);
        assert!(updated[0].verified);
        assert_eq!(updated[0].line(), Some(11));
        assert_eq!(registry.find(bp.id).unwrap().line(), Some(11));
    }

    #[test]
    fn function_set_is_total_replacement() {
        let registry = BreakpointRegistry::new();
        registry.set_function_breakpoints(vec![FunctionBreakpointSpec {
            name: "main".into(),
            condition: None,
            hit_condition: None,
        }]);
        registry.set_function_breakpoints(vec![FunctionBreakpointSpec {
            name: "other".into(),
            condition: None,
            hit_condition: None,
        }]);
        let (_, args) = registry.function_sync_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].name, "other");
    }

    #[test]
    fn snapshot_restore_drops_verification() {
        let (registry, bp) = registry_with_one("/ws/a.js", 10);
        registry.apply_sync_result(
            &[bp.id],
            &[BreakpointState {
                verified: true,
                ..Default::default()
            }],
        );
        let snapshot = registry.snapshot();
        assert!(snapshot[0].verified);

        let restored = BreakpointRegistry::new();
        restored.restore(snapshot);
        assert!(!restored.find(bp.id).unwrap().verified);
    }
}
