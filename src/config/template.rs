//! Default configuration templates and workspace-driven generation.

use crate::config::{LaunchConfig, RequestKind};
use serde_json::json;
use std::path::Path;

/// Platform-appropriate machine-interface mode for native debuggers.
fn native_mi_mode() -> &'static str {
    if cfg!(target_os = "macos") {
        "lldb"
    } else {
        "gdb"
    }
}

/// Minimally valid configuration for an adapter type.
pub fn default_config(adapter_type: &str) -> LaunchConfig {
    match adapter_type {
        "node" | "pwa-node" | "node2" => {
            LaunchConfig::new("Launch Program", adapter_type, RequestKind::Launch)
                .with_option("program", json!("${workspaceFolder}/index.js"))
                .with_option("cwd", json!("${workspaceFolder}"))
                .with_option("console", json!("integratedTerminal"))
        }
        "python" | "debugpy" => {
            LaunchConfig::new("Python: Current File", adapter_type, RequestKind::Launch)
                .with_option("program", json!("${file}"))
                .with_option("cwd", json!("${workspaceFolder}"))
                .with_option("console", json!("integratedTerminal"))
        }
        "chrome" | "pwa-chrome" | "msedge" => {
            LaunchConfig::new("Launch Browser", adapter_type, RequestKind::Launch)
                .with_option("url", json!("http://localhost:3000"))
                .with_option("webRoot", json!("${workspaceFolder}"))
        }
        "cppdbg" | "gdb" | "lldb" => {
            LaunchConfig::new("Launch Native", adapter_type, RequestKind::Launch)
                .with_option("program", json!("${workspaceFolder}/a.out"))
                .with_option("cwd", json!("${workspaceFolder}"))
                .with_option("MIMode", json!(native_mi_mode()))
                .with_option("console", json!("integratedTerminal"))
        }
        _ => LaunchConfig::new("Launch", adapter_type, RequestKind::Launch)
            .with_option("program", json!("${workspaceFolder}/main"))
            .with_option("cwd", json!("${workspaceFolder}"))
            .with_option("console", json!("integratedTerminal")),
    }
}

/// Compose configurations for the debuggers the adapter manager detected,
/// tailored to the project files present in the workspace.
pub fn auto_generate(detected: &[String], workspace_root: &Path) -> Vec<LaunchConfig> {
    let mut configs = Vec::new();
    let has = |name: &str| workspace_root.join(name).exists();

    for adapter_type in detected {
        match adapter_type.as_str() {
            "node" | "pwa-node" => {
                if !has("package.json") {
                    configs.push(default_config(adapter_type));
                    continue;
                }
                let mut config = LaunchConfig::new("Launch via Node", adapter_type, RequestKind::Launch)
                    .with_option("program", json!("${workspaceFolder}/index.js"))
                    .with_option("cwd", json!("${workspaceFolder}"))
                    .with_option("console", json!("integratedTerminal"));
                if has("tsconfig.json") {
                    config = config
                        .with_option("sourceMaps", json!(true))
                        .with_option("outFiles", json!(["${workspaceFolder}/dist/**/*.js"]));
                }
                configs.push(config);
            }
            "python" | "debugpy" => {
                if has("manage.py") {
                    configs.push(
                        LaunchConfig::new("Django", adapter_type, RequestKind::Launch)
                            .with_option("program", json!("${workspaceFolder}/manage.py"))
                            .with_option("args", json!(["runserver"]))
                            .with_option("cwd", json!("${workspaceFolder}"))
                            .with_option("console", json!("integratedTerminal")),
                    );
                } else if has("app.py") || has("wsgi.py") {
                    configs.push(
                        LaunchConfig::new("Flask", adapter_type, RequestKind::Launch)
                            .with_option("module", json!("flask"))
                            .with_option("args", json!(["run", "--no-debugger"]))
                            .with_option("cwd", json!("${workspaceFolder}"))
                            .with_option("console", json!("integratedTerminal")),
                    );
                } else {
                    configs.push(default_config(adapter_type));
                }
            }
            "cppdbg" | "gdb" | "lldb" => {
                let mut config = default_config(adapter_type);
                if has("CMakeLists.txt") {
                    config = config
                        .with_option("program", json!("${workspaceFolder}/build/main"))
                        .with_option("preLaunchTask", json!("cmake --build build"));
                } else if has("Makefile") {
                    config = config.with_option("preLaunchTask", json!("make"));
                } else if has("Cargo.toml") {
                    config = config
                        .with_option("program", json!("${workspaceFolder}/target/debug/main"))
                        .with_option("preLaunchTask", json!("cargo build"));
                }
                configs.push(config);
            }
            other => configs.push(default_config(other)),
        }
    }
    configs
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn native_default_has_mi_mode() {
        let config = default_config("cppdbg");
        assert!(config.option_str("MIMode").is_some());
        assert_eq!(config.option_str("console"), Some("integratedTerminal"));
    }

    #[test]
    fn unknown_type_still_yields_valid_config() {
        let config = default_config("mystery");
        assert_eq!(config.adapter_type, "mystery");
        assert_eq!(config.request, RequestKind::Launch);
        assert!(config.option_str("program").is_some());
    }
}
