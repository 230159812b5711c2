//! `${...}` variable substitution in launch configurations.
//!
//! Substitution runs over every string leaf of the resolved configuration;
//! arrays and maps are traversed recursively. Unknown tokens are preserved
//! verbatim, since adapters have their own `${...}` dialects.

use crate::config::LaunchConfig;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::path::{Path, PathBuf};

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z][A-Za-z0-9]*)(?::([^}]*))?\}").expect("valid token regex"));

/// Values the tokens resolve against.
#[derive(Debug, Clone)]
pub struct SubstitutionContext {
    pub workspace_root: PathBuf,
    /// Currently focused file in the editor, if any.
    pub file: Option<PathBuf>,
}

impl SubstitutionContext {
    pub fn new(workspace_root: &Path) -> Self {
        SubstitutionContext {
            workspace_root: workspace_root.to_path_buf(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: &Path) -> Self {
        self.file = Some(file.to_path_buf());
        self
    }

    fn resolve(&self, name: &str, arg: Option<&str>) -> Option<String> {
        match name {
            "workspaceFolder" => Some(self.workspace_root.to_string_lossy().into_owned()),
            "env" => Some(std::env::var(arg.unwrap_or_default()).unwrap_or_default()),
            "pathSeparator" => Some(std::path::MAIN_SEPARATOR.to_string()),
            "file" => self.file().map(|f| f.to_string_lossy().into_owned()),
            "fileBasename" => self
                .file()
                .and_then(|f| f.file_name().map(|n| n.to_string_lossy().into_owned())),
            "fileBasenameNoExtension" => self
                .file()
                .and_then(|f| f.file_stem().map(|n| n.to_string_lossy().into_owned())),
            "fileDirname" => self
                .file()
                .and_then(|f| f.parent().map(|p| p.to_string_lossy().into_owned())),
            "fileExtname" => self
                .file()
                .and_then(|f| f.extension().map(|e| format!(".{}", e.to_string_lossy()))),
            "relativeFile" => self.relative_file().map(|f| f.to_string_lossy().into_owned()),
            "relativeFileDirname" => self
                .relative_file()
                .and_then(|f| f.parent().map(|p| p.to_string_lossy().into_owned())),
            _ => None,
        }
    }

    fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    fn relative_file(&self) -> Option<PathBuf> {
        let file = self.file()?;
        file.strip_prefix(&self.workspace_root)
            .map(Path::to_path_buf)
            .ok()
            .or_else(|| Some(file.to_path_buf()))
    }
}

/// Substitute tokens in one string. Applying this to a string without
/// recognized tokens is the identity.
pub fn substitute_str(input: &str, ctx: &SubstitutionContext) -> String {
    TOKEN_RE
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            let arg = caps.get(2).map(|m| m.as_str());
            ctx.resolve(name, arg)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Recursive substitution over string leaves.
pub fn substitute_value(value: &Value, ctx: &SubstitutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a configuration for launching: every string leaf substituted,
/// the name included.
pub fn substitute_config(config: &LaunchConfig, ctx: &SubstitutionContext) -> LaunchConfig {
    LaunchConfig {
        name: substitute_str(&config.name, ctx),
        adapter_type: config.adapter_type.clone(),
        request: config.request,
        options: config
            .options
            .iter()
            .map(|(k, v)| (k.clone(), substitute_value(v, ctx)))
            .collect(),
    }
}
