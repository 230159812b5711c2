//! Launch configuration files.
//!
//! Configurations live in two well-known places under the workspace root:
//! the primary store `.dapmux/launch.json` (plain JSON, written by us) and
//! the secondary store `.vscode/launch.json`, which may carry `//` and
//! `/* ... */` comments and is only ever read.

pub mod substitute;
pub mod task;
pub mod template;

use crate::debugger::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const PRIMARY_STORE: &str = ".dapmux/launch.json";
pub const SECONDARY_STORE: &str = ".vscode/launch.json";

const LAUNCH_FILE_VERSION: &str = "0.2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Launch,
    Attach,
}

/// One launch configuration. Adapter-specific keys stay untyped in `options`
/// and round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub request: RequestKind,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl LaunchConfig {
    pub fn new(name: &str, adapter_type: &str, request: RequestKind) -> Self {
        LaunchConfig {
            name: name.to_string(),
            adapter_type: adapter_type.to_string(),
            request,
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn pre_launch_task(&self) -> Option<&str> {
        self.option_str("preLaunchTask")
    }

    pub fn post_debug_task(&self) -> Option<&str> {
        self.option_str("postDebugTask")
    }

    pub fn no_debug(&self) -> bool {
        self.options
            .get("noDebug")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Remote debugging endpoint, when the configuration carries a `remote`
    /// block. A session with an endpoint talks TCP instead of spawning the
    /// adapter locally.
    pub fn remote_endpoint(&self) -> Option<(String, u16)> {
        let remote = self.options.get("remote")?.as_object()?;
        let host = remote.get("remoteHost")?.as_str()?.to_string();
        let port = remote.get("remotePort")?.as_u64()?;
        u16::try_from(port).ok().map(|port| (host, port))
    }

    /// Body of the `launch`/`attach` request: the whole configuration,
    /// adapter-specific keys included.
    pub fn request_arguments(&self) -> Value {
        let mut body = self.options.clone();
        body.insert("name".into(), Value::String(self.name.clone()));
        body.insert("type".into(), Value::String(self.adapter_type.clone()));
        body.insert(
            "request".into(),
            Value::String(match self.request {
                RequestKind::Launch => "launch".into(),
                RequestKind::Attach => "attach".into(),
            }),
        );
        Value::Object(body)
    }
}

/// Compound entry: a list of configurations started together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compound {
    pub name: String,
    pub configurations: Vec<String>,
    #[serde(default)]
    pub stop_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_launch_task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchFile {
    pub version: String,
    #[serde(default)]
    pub configurations: Vec<LaunchConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compounds: Vec<Compound>,
}

impl Default for LaunchFile {
    fn default() -> Self {
        LaunchFile {
            version: LAUNCH_FILE_VERSION.to_string(),
            configurations: Vec::new(),
            compounds: Vec::new(),
        }
    }
}

impl LaunchFile {
    pub fn configuration(&self, name: &str) -> Option<&LaunchConfig> {
        self.configurations.iter().find(|c| c.name == name)
    }

    pub fn compound(&self, name: &str) -> Option<&Compound> {
        self.compounds.iter().find(|c| c.name == name)
    }
}

pub fn primary_store_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(PRIMARY_STORE)
}

pub fn secondary_store_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(SECONDARY_STORE)
}

/// Read the workspace launch file: primary store first, secondary store
/// (with comment stripping) as a fallback. A workspace with neither yields
/// an empty file.
pub async fn read_launch_file(workspace_root: &Path) -> Result<LaunchFile, Error> {
    let primary = primary_store_path(workspace_root);
    if primary.exists() {
        let raw = tokio::fs::read_to_string(&primary).await?;
        return parse_store(&raw, &primary);
    }

    let secondary = secondary_store_path(workspace_root);
    if secondary.exists() {
        let raw = tokio::fs::read_to_string(&secondary).await?;
        return parse_store(&strip_json_comments(&raw), &secondary);
    }

    Ok(LaunchFile::default())
}

/// Write always goes to the primary store.
pub async fn write_launch_file(workspace_root: &Path, file: &LaunchFile) -> Result<(), Error> {
    let path = primary_store_path(workspace_root);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut raw = serde_json::to_string_pretty(file)?;
    raw.push('\n');
    tokio::fs::write(&path, raw).await?;
    Ok(())
}

/// Copy the secondary store into the primary one and return the result.
pub async fn import_from_secondary(workspace_root: &Path) -> Result<LaunchFile, Error> {
    let secondary = secondary_store_path(workspace_root);
    if !secondary.exists() {
        return Err(Error::ConfigParse(format!(
            "{} does not exist",
            secondary.display()
        )));
    }
    let raw = tokio::fs::read_to_string(&secondary).await?;
    let file = parse_store(&strip_json_comments(&raw), &secondary)?;
    write_launch_file(workspace_root, &file).await?;
    Ok(file)
}

fn parse_store(raw: &str, path: &Path) -> Result<LaunchFile, Error> {
    serde_json::from_str(raw)
        .map_err(|e| Error::ConfigParse(format!("{}: {e}", path.display())))
}

/// Remove `//` and `/* ... */` comments, leaving comment-like sequences
/// inside quoted strings alone. Newlines survive so parse errors still point
/// at the right line.
pub fn strip_json_comments(input: &str) -> String {
    enum State {
        Code,
        Str,
        StrEscape,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    out.push(c);
                    state = State::Str;
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                _ => out.push(c),
            },
            State::Str => match c {
                '\\' => {
                    out.push(c);
                    state = State::StrEscape;
                }
                '"' => {
                    out.push(c);
                    state = State::Code;
                }
                _ => out.push(c),
            },
            State::StrEscape => {
                out.push(c);
                state = State::Str;
            }
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '\n' {
                    out.push('\n');
                } else if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_keeps_comment_lookalikes_in_strings() {
        let raw = r#"{"url": "http://x//y", "path": "a/*b*/c"} // trailing"#;
        let stripped = strip_json_comments(raw);
        let v: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(v["url"], "http://x//y");
        assert_eq!(v["path"], "a/*b*/c");
    }

    #[test]
    fn strip_handles_block_comments() {
        let raw = "{\n  /* a\n     multi-line note */\n  \"a\": 1 // line\n}\n";
        let stripped = strip_json_comments(raw);
        let v: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(v["a"], 1);
        // Newlines survive stripping.
        assert_eq!(stripped.matches('\n').count(), raw.matches('\n').count());
    }

    #[test]
    fn strip_handles_escaped_quote() {
        let raw = r#"{"a": "say \"hi\" // not a comment"}"#;
        let v: Value = serde_json::from_str(&strip_json_comments(raw)).unwrap();
        assert_eq!(v["a"], "say \"hi\" // not a comment");
    }

    #[test]
    fn unknown_config_keys_round_trip() {
        let raw = json!({
            "version": "0.2.0",
            "configurations": [{
                "name": "run",
                "type": "node",
                "request": "launch",
                "program": "/ws/app.js",
                "vendorSpecific": {"deep": [1, 2]}
            }]
        });
        let file: LaunchFile = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(file.configurations[0].option_str("program"), Some("/ws/app.js"));
        let back = serde_json::to_value(&file).unwrap();
        assert_eq!(back["configurations"][0]["vendorSpecific"], raw["configurations"][0]["vendorSpecific"]);
    }

    #[test]
    fn request_arguments_carry_the_whole_config() {
        let config = LaunchConfig::new("run", "node", RequestKind::Launch)
            .with_option("program", json!("/ws/app.js"));
        let args = config.request_arguments();
        assert_eq!(args["program"], "/ws/app.js");
        assert_eq!(args["request"], "launch");
        assert_eq!(args["type"], "node");
    }
}
