#![cfg(unix)]

use local_toolbox_lib::models::{OutputLine, OutputOrigin, RunEventEnvelope};
use local_toolbox_lib::secrets::MemorySecretStore;
use local_toolbox_lib::ToolboxCore;
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("script metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod script");
    path
}

fn write_tool(dir: &Path, tool: serde_json::Value) {
    let tools_dir = dir.join("tools");
    std::fs::create_dir_all(&tools_dir).expect("tools dir");
    let name = tool["name"].as_str().expect("tool name").to_string();
    std::fs::write(
        tools_dir.join(format!("{}.json", name)),
        serde_json::to_string_pretty(&tool).expect("tool json"),
    )
    .expect("write tool");
}

/// Tool that runs `script` through `/bin/sh`, so the script needs no exec bit.
fn sh_tool(name: &str, script: &Path) -> serde_json::Value {
    json!({
        "name": name,
        "icon": "terminal",
        "description": "fixture",
        "command": "/bin/sh",
        "arguments": [
            {"name": "script", "label": "Script", "type": "file", "default": script.to_string_lossy()}
        ]
    })
}

async fn open_core(dir: &Path) -> ToolboxCore {
    ToolboxCore::with_secret_store(dir.to_path_buf(), Arc::new(MemorySecretStore::new()))
        .await
        .expect("core")
}

fn texts(lines: &[OutputLine]) -> Vec<&str> {
    lines.iter().map(|line| line.text.as_str()).collect()
}

#[tokio::test]
async fn required_directory_and_bool_flag_build_expected_argv() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "lister.sh",
        "if [ \"$#\" -eq 2 ] && [ \"$1\" = \"--verbose\" ] && [ \"$2\" = \"/tmp\" ]; then\n  echo hello\n  exit 0\nfi\necho \"unexpected args: $*\" >&2\nexit 9",
    );
    write_tool(
        dir.path(),
        json!({
            "name": "lister",
            "command": script.to_string_lossy(),
            "arguments": [{"name": "dir", "label": "Directory", "type": "directory", "required": true}],
            "flags": [{"name": "verbose", "flag": "--verbose", "label": "Verbose", "type": "bool"}]
        }),
    );
    let core = open_core(dir.path()).await;

    let mut session = core.create_session("lister").await.expect("session");
    session.argument_values.insert("dir".to_string(), "/tmp".to_string());
    session.flag_values.insert("verbose".to_string(), true);

    let run = core.run(&session).await.expect("run");
    assert_eq!(run.wait().await, 0);

    let snapshot = core.snapshot(&session.id).await.expect("snapshot");
    assert_eq!(snapshot.lines, vec![OutputLine::new("hello", OutputOrigin::Stdout)]);
    assert!(!snapshot.running);
    assert_eq!(snapshot.exit_code, Some(0));
}

#[tokio::test]
async fn output_written_right_before_exit_is_drained() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "burst.sh",
        "i=0\nwhile [ $i -lt 2000 ]; do echo \"line $i\"; i=$((i+1)); done\necho tail >&2\nexit 3",
    );
    write_tool(dir.path(), sh_tool("burst", &script));
    let core = open_core(dir.path()).await;
    let session = core.create_session("burst").await.expect("session");

    let run = core.run(&session).await.expect("run");
    assert_eq!(run.wait().await, 3);

    let snapshot = core.snapshot(&session.id).await.expect("snapshot");
    let stdout: Vec<_> = snapshot.lines.iter().filter(|line| !line.is_error()).collect();
    assert_eq!(stdout.len(), 2000);
    assert_eq!(stdout[1999].text, "line 1999");
    assert!(snapshot
        .lines
        .iter()
        .any(|line| line.is_error() && line.text == "tail"));
    assert_eq!(snapshot.exit_code, Some(3));
}

#[tokio::test]
async fn persisted_output_is_capped_with_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "flood.sh",
        "i=1\nwhile [ $i -le 5001 ]; do echo \"row $i\"; i=$((i+1)); done",
    );
    write_tool(dir.path(), sh_tool("flood", &script));
    let core = open_core(dir.path()).await;
    let session = core.create_session("flood").await.expect("session");

    let run = core.run(&session).await.expect("run");
    assert_eq!(run.wait().await, 0);

    assert_eq!(core.snapshot(&session.id).await.expect("snapshot").lines.len(), 5001);
    let stored = core.get_session(&session.id).expect("stored");
    assert_eq!(stored.output_lines.len(), 5000);
    assert!(stored.output_lines[0].text.contains("4999"));
    assert!(stored.output_lines[0].text.contains("5001"));
    assert_eq!(stored.output_lines[4999].text, "row 5001");
}

#[tokio::test]
async fn missing_executable_reports_one_error_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tool(
        dir.path(),
        json!({"name": "ghost", "command": dir.path().join("no-such-tool").to_string_lossy()}),
    );
    let core = open_core(dir.path()).await;
    let session = core.create_session("ghost").await.expect("session");
    let mut events = core.subscribe();

    let run = core.run(&session).await.expect("run");
    assert_eq!(run.wait().await, -1);

    let snapshot = core.snapshot(&session.id).await.expect("snapshot");
    assert_eq!(snapshot.lines.len(), 1);
    assert!(snapshot.lines[0].is_error());
    assert!(snapshot.lines[0].text.starts_with("Failed to launch"));
    assert_eq!(snapshot.exit_code, Some(-1));

    let mut phases = Vec::new();
    while let Ok(RunEventEnvelope { r#type, payload, .. }) = events.try_recv() {
        if r#type == "run.phase" {
            phases.push(payload["phase"].as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(phases, vec!["launching", "terminated"]);
}

#[tokio::test]
async fn continuation_appends_echo_and_reply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "chat.sh",
        "if [ \"$1\" = \"reply\" ]; then echo \"got: $2\"; else echo first; fi",
    );
    let mut tool = sh_tool("chat", &script);
    tool["continuation"] = json!({"arguments": [script.to_string_lossy(), "reply"]});
    write_tool(dir.path(), tool);
    let core = open_core(dir.path()).await;
    let session = core.create_session("chat").await.expect("session");

    core.run(&session).await.expect("run").wait().await;
    let follow_up = core.continue_run(&session.id, "  hi there  ").await.expect("continue");
    assert_eq!(follow_up.wait().await, 0);

    let snapshot = core.snapshot(&session.id).await.expect("snapshot");
    assert_eq!(texts(&snapshot.lines), vec!["first", "> hi there", "got: hi there"]);
    let stored = core.get_session(&session.id).expect("stored");
    assert_eq!(texts(&stored.output_lines), vec!["first", "> hi there", "got: hi there"]);
}

#[tokio::test]
async fn stored_secret_reaches_child_environment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "env.sh", "echo \"token=$API_TOKEN\"");
    let mut tool = sh_tool("deploy", &script);
    tool["environment"] = json!([{"name": "API_TOKEN", "label": "Token"}]);
    write_tool(dir.path(), tool);
    let core = open_core(dir.path()).await;
    core.save_secret("deploy", "API_TOKEN", "s3cret").expect("save secret");
    let session = core.create_session("deploy").await.expect("session");

    core.run(&session).await.expect("run").wait().await;

    let snapshot = core.snapshot(&session.id).await.expect("snapshot");
    assert_eq!(texts(&snapshot.lines), vec!["token=s3cret"]);
    assert_eq!(
        core.secret_values("deploy").expect("values").get("API_TOKEN").map(String::as_str),
        Some("s3cret")
    );
}

#[tokio::test]
async fn clear_during_run_discards_late_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "slow.sh", "echo early\nsleep 1\necho late\nexit 5");
    write_tool(dir.path(), sh_tool("slow", &script));
    let core = open_core(dir.path()).await;
    let session = core.create_session("slow").await.expect("session");

    let run = core.run(&session).await.expect("run");
    core.clear(&session.id).await.expect("clear");
    assert_eq!(run.wait().await, 5);

    let snapshot = core.snapshot(&session.id).await.expect("snapshot");
    assert!(snapshot.lines.is_empty());
    assert!(!snapshot.running);
    assert_eq!(snapshot.exit_code, None);
    assert_eq!(core.get_session(&session.id).expect("stored").exit_code, None);
}

#[tokio::test]
async fn finished_sessions_are_replayed_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "once.sh", "echo persisted\necho warn >&2\nexit 2");
    write_tool(dir.path(), sh_tool("once", &script));

    let session_id = {
        let core = open_core(dir.path()).await;
        let session = core.create_session("once").await.expect("session");
        core.run(&session).await.expect("run").wait().await;
        session.id
    };

    let core = open_core(dir.path()).await;
    let snapshot = core.snapshot(&session_id).await.expect("replayed");
    // Order across the two pipes is not fixed.
    assert_eq!(snapshot.lines.len(), 2);
    assert!(snapshot
        .lines
        .contains(&OutputLine::new("persisted", OutputOrigin::Stdout)));
    assert!(snapshot
        .lines
        .contains(&OutputLine::new("warn", OutputOrigin::Stderr)));
    assert_eq!(snapshot.exit_code, Some(2));
    assert!(!snapshot.running);
}
