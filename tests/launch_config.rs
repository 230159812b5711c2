//! Configuration resolver tests: pre-launch gating, variable substitution on
//! the wire, store round trips and compound starts.

mod support;

use dapmux::config::{self, Compound, LaunchConfig, LaunchFile, RequestKind};
use dapmux::debugger::{Debugger, DebuggerBuilder, Error};
use serde_json::json;
use std::path::Path;
use support::*;

fn debugger_for(adapter: &MockAdapter, hook: RecordingHook) -> Debugger {
    DebuggerBuilder::new()
        .with_hooks(hook)
        .with_adapter_registry(adapter.registry())
        .build()
}

#[tokio::test]
async fn failing_pre_launch_task_aborts_without_touching_the_adapter() {
    let adapter = MockAdapter::spawn(MockBehavior::default()).await;
    let hook = RecordingHook::new();
    let debugger = debugger_for(&adapter, hook.clone());

    let config = LaunchConfig::new("app", MOCK_ADAPTER_TYPE, RequestKind::Launch)
        .with_option("program", json!("/ws/app.js"))
        .with_option("preLaunchTask", json!("sh -c exit\\ 2"));

    let err = debugger
        .start_session(config, Path::new("/tmp"))
        .await
        .unwrap_err();
    match err {
        Error::PreLaunchFailed { exit_code, .. } => assert_eq!(exit_code, 2),
        other => panic!("unexpected error: {other}"),
    }

    // No session entered the store, no adapter connection was made.
    assert!(debugger.sessions().is_empty());
    assert_eq!(adapter.connection_count(), 0);
}

#[tokio::test]
async fn pre_launch_output_streams_to_the_console() {
    let adapter = MockAdapter::spawn(MockBehavior::default()).await;
    let hook = RecordingHook::new();
    let debugger = debugger_for(&adapter, hook.clone());

    let config = LaunchConfig::new("app", MOCK_ADAPTER_TYPE, RequestKind::Launch)
        .with_option("program", json!("/ws/app.js"))
        .with_option("preLaunchTask", json!("echo compiling"));

    debugger
        .start_session(config, Path::new("/tmp"))
        .await
        .unwrap();

    assert_eq!(
        hook.count(|n| matches!(n, Notification::Console(_, msg) if msg == "compiling")),
        1
    );
    assert_eq!(adapter.connection_count(), 1);
}

#[tokio::test]
async fn substitution_resolves_before_the_adapter_sees_the_config() {
    let adapter = MockAdapter::spawn(MockBehavior::default()).await;
    let hook = RecordingHook::new();
    let debugger = debugger_for(&adapter, hook.clone());
    debugger.set_focused_file(Some(Path::new("/ws/src/a.ts")));

    let config = LaunchConfig::new("app", MOCK_ADAPTER_TYPE, RequestKind::Launch)
        .with_option("program", json!("${workspaceFolder}/${relativeFile}"))
        .with_option("args", json!(["${fileBasenameNoExtension}"]));

    debugger.start_session(config, Path::new("/ws")).await.unwrap();

    let args = adapter.request_args("launch", 0).unwrap();
    assert_eq!(args["program"], "/ws/src/a.ts");
    assert_eq!(args["args"][0], "a");
}

#[tokio::test]
async fn write_then_read_round_trips_through_the_primary_store() {
    let workspace = tempfile::tempdir().unwrap();
    let file = LaunchFile {
        configurations: vec![LaunchConfig::new("app", "node", RequestKind::Launch)
            .with_option("program", json!("${workspaceFolder}/app.js"))
            .with_option("env", json!({ "NODE_ENV": "test" }))],
        ..Default::default()
    };

    config::write_launch_file(workspace.path(), &file).await.unwrap();
    let read_back = config::read_launch_file(workspace.path()).await.unwrap();

    assert_eq!(
        serde_json::to_value(&read_back).unwrap(),
        serde_json::to_value(&file).unwrap()
    );
}

#[tokio::test]
async fn read_falls_back_to_the_commented_secondary_store() {
    let workspace = tempfile::tempdir().unwrap();
    let secondary = config::secondary_store_path(workspace.path());
    tokio::fs::create_dir_all(secondary.parent().unwrap()).await.unwrap();
    tokio::fs::write(
        &secondary,
        r#"{
  // launch the backend
  "version": "0.2.0",
  "configurations": [{
    "name": "backend", /* comments everywhere */
    "type": "node",
    "request": "launch",
    "program": "${workspaceFolder}/server.js" // main entry
  }]
}"#,
    )
    .await
    .unwrap();

    let file = config::read_launch_file(workspace.path()).await.unwrap();
    assert_eq!(file.configurations.len(), 1);
    assert_eq!(file.configurations[0].name, "backend");

    // Importing materializes it in the primary store.
    config::import_from_secondary(workspace.path()).await.unwrap();
    assert!(config::primary_store_path(workspace.path()).exists());
    let imported = config::read_launch_file(workspace.path()).await.unwrap();
    assert_eq!(imported.configurations[0].name, "backend");
}

#[tokio::test]
async fn unparseable_store_surfaces_a_config_error() {
    let workspace = tempfile::tempdir().unwrap();
    let primary = config::primary_store_path(workspace.path());
    tokio::fs::create_dir_all(primary.parent().unwrap()).await.unwrap();
    tokio::fs::write(&primary, "{ not json").await.unwrap();

    let err = config::read_launch_file(workspace.path()).await.unwrap_err();
    assert!(matches!(err, Error::ConfigParse(_)), "got {err}");
}

#[tokio::test]
async fn auto_generation_reflects_project_markers() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("package.json"), "{}").unwrap();
    std::fs::write(workspace.path().join("tsconfig.json"), "{}").unwrap();
    std::fs::write(workspace.path().join("manage.py"), "").unwrap();

    let debugger = DebuggerBuilder::new().build();
    let configs = debugger.auto_generate_configs(
        &["node".to_string(), "python".to_string()],
        workspace.path(),
    );

    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].adapter_type, "node");
    assert_eq!(configs[0].options["sourceMaps"], json!(true));
    assert_eq!(configs[1].name, "Django");
}

#[tokio::test]
async fn compound_start_skips_missing_members() {
    let workspace = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::spawn(MockBehavior::default()).await;
    let second = MockAdapter::spawn(MockBehavior::default()).await;
    let registry = adapter.registry();
    second.register_into(&registry, "mock2");

    let hook = RecordingHook::new();
    let debugger = DebuggerBuilder::new()
        .with_hooks(hook.clone())
        .with_adapter_registry(registry)
        .build();

    let file = LaunchFile {
        configurations: vec![
            LaunchConfig::new("api", MOCK_ADAPTER_TYPE, RequestKind::Launch),
            LaunchConfig::new("worker", "mock2", RequestKind::Launch),
        ],
        compounds: vec![Compound {
            name: "full stack".into(),
            configurations: vec!["api".into(), "ghost".into(), "worker".into()],
            stop_all: true,
            pre_launch_task: None,
        }],
        ..Default::default()
    };
    config::write_launch_file(workspace.path(), &file).await.unwrap();

    let started = debugger
        .start_compound("full stack", workspace.path())
        .await
        .unwrap();
    assert_eq!(started.len(), 2);
    assert_eq!(debugger.sessions().len(), 2);

    // stopAll: stopping one member stops the whole compound.
    debugger.stop_session(Some(started[0].id)).await.unwrap();
    assert!(debugger.sessions().is_empty());
}

#[tokio::test]
async fn unknown_compound_is_an_error() {
    let workspace = tempfile::tempdir().unwrap();
    let debugger = DebuggerBuilder::new().build();
    let err = debugger
        .start_compound("nope", workspace.path())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CompoundNotFound(_)), "got {err}");
}
