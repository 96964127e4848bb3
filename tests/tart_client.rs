//! TartClient integration tests.
//!
//! The `tart` binary is replaced by a small shell script that records every
//! invocation (arguments plus a sentinel environment variable) to a log
//! file, so the tests can assert on the exact subprocess traffic without a
//! real virtualizer installed.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tart_driver::plugin::{Resources, TaskSpec};
use tart_driver::registry_auth::RegistryAuth;
use tart_driver::virt::{TartClient, Virtualizer, VmConfig, VmState};
use tart_driver::{Error, TaskConfig};

/// Write a fake `tart` script into `dir`.
///
/// Every invocation appends two lines to the log: `cmd: <args...>` and
/// `sentinel:<value of $sentinel_var>`. `extra_cases` adds verb-specific
/// behavior to the case block.
fn write_fake_tart(dir: &Path, log: &Path, sentinel_var: &str, extra_cases: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
LOG="{log}"
{{
  printf 'cmd:'
  for a in "$@"; do printf ' %s' "$a"; done
  printf '\n'
  printf 'sentinel:%s\n' "${{{sentinel}:-}}"
}} >> "$LOG"
case "$1" in
  --version) echo "tart 2.12.0" ;;
  login) cat > /dev/null ;;
  ip) echo "192.168.64.2" ;;
{extra}
  list) echo "[]" ;;
esac
exit 0
"#,
        log = log.display(),
        sentinel = sentinel_var,
        extra = extra_cases,
    );

    let path = dir.join("tart");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Parse the recorded log into (args, sentinel) pairs.
fn read_invocations(log: &Path) -> Vec<(String, String)> {
    let raw = std::fs::read_to_string(log).unwrap_or_default();
    let lines: Vec<&str> = raw.lines().collect();
    lines
        .chunks(2)
        .filter_map(|chunk| match chunk {
            [cmd, sentinel] => Some((
                cmd.strip_prefix("cmd: ").unwrap_or(cmd).to_string(),
                sentinel
                    .strip_prefix("sentinel:")
                    .unwrap_or_default()
                    .to_string(),
            )),
            _ => None,
        })
        .collect()
}

fn vm_config(dir: &Path, task: TaskConfig) -> VmConfig {
    VmConfig {
        task,
        spec: TaskSpec {
            id: "task-1".into(),
            name: "vm".into(),
            alloc_id: "123".into(),
            env: HashMap::new(),
            resources: Resources::default(),
            driver_config: serde_json::Value::Null,
            stdout_path: dir.join("stdout"),
            stderr_path: dir.join("stderr"),
            task_dir: dir.to_path_buf(),
            secrets_dir: dir.join("secrets"),
            user: None,
        },
    }
}

#[tokio::test]
async fn setup_with_auth_logs_in_before_cloning_and_propagates_env() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(dir.path(), &log, "SETUP_AUTH_SENTINEL", "");

    std::env::set_var("SETUP_AUTH_SENTINEL", "present");

    let mut task =
        TaskConfig::decode(&serde_json::json!({"image": "ghcr.io/example/private:latest"}))
            .unwrap();
    task.auth = Some(RegistryAuth {
        username: "user1".into(),
        password: "pass1".into(),
    });

    let client = TartClient::with_binary(&tart);
    let name = client.setup(&vm_config(dir.path(), task)).await.unwrap();
    assert_eq!(name, "alloc-123");

    let invocations = read_invocations(&log);
    let login_index = invocations
        .iter()
        .position(|(cmd, _)| cmd.starts_with("login"))
        .expect("expected a login invocation");
    let clone_index = invocations
        .iter()
        .position(|(cmd, _)| cmd.starts_with("clone"))
        .expect("expected a clone invocation");
    assert!(login_index < clone_index, "login must precede clone");

    let (login_cmd, login_sentinel) = &invocations[login_index];
    assert!(login_cmd.contains("ghcr.io"), "login scoped to registry host");
    assert!(login_cmd.contains("--username user1"));
    assert!(login_cmd.contains("--password-stdin"));
    assert!(
        !login_cmd.contains("pass1"),
        "password must not appear on the command line"
    );
    assert_eq!(login_sentinel, "present");

    let (clone_cmd, clone_sentinel) = &invocations[clone_index];
    assert_eq!(clone_cmd, "clone ghcr.io/example/private:latest alloc-123");
    assert_eq!(clone_sentinel, "present");
}

#[tokio::test]
async fn setup_without_auth_skips_login_and_applies_default_resources() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(dir.path(), &log, "NO_AUTH_SENTINEL", "");

    let task =
        TaskConfig::decode(&serde_json::json!({"image": "ghcr.io/example/base:latest"})).unwrap();

    let client = TartClient::with_binary(&tart);
    client.setup(&vm_config(dir.path(), task)).await.unwrap();

    let invocations = read_invocations(&log);
    assert!(
        !invocations.iter().any(|(cmd, _)| cmd.starts_with("login")),
        "no login expected without credentials"
    );

    let (set_cmd, _) = invocations
        .iter()
        .find(|(cmd, _)| cmd.starts_with("set"))
        .expect("expected a set invocation");
    assert!(set_cmd.contains("--cpu 4"), "default cores: {}", set_cmd);
    assert!(
        set_cmd.contains("--memory 4096"),
        "default memory: {}",
        set_cmd
    );
    assert!(
        !set_cmd.contains("--disk-size"),
        "disk size 0 leaves the image unchanged: {}",
        set_cmd
    );
}

#[tokio::test]
async fn setup_honors_allocated_resources_and_disk_size() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(dir.path(), &log, "RES_SENTINEL", "");

    let task = TaskConfig::decode(
        &serde_json::json!({"image": "ghcr.io/example/base:latest", "disk_size": 64}),
    )
    .unwrap();
    let mut config = vm_config(dir.path(), task);
    config.spec.resources = Resources {
        cpu_cores: Some(8),
        memory_mb: Some(8192),
    };

    let client = TartClient::with_binary(&tart);
    client.setup(&config).await.unwrap();

    let invocations = read_invocations(&log);
    let (set_cmd, _) = invocations
        .iter()
        .find(|(cmd, _)| cmd.starts_with("set"))
        .unwrap();
    assert_eq!(set_cmd, "set alloc-123 --cpu 8 --memory 8192 --disk-size 64");
}

#[tokio::test]
async fn available_returns_trimmed_version() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(dir.path(), &log, "VER_SENTINEL", "");

    let client = TartClient::with_binary(&tart);
    assert_eq!(client.available().await.unwrap(), "tart 2.12.0");
}

#[tokio::test]
async fn available_classifies_missing_binary() {
    let client = TartClient::with_binary("/nonexistent/path/to/tart");
    let err = client.available().await.unwrap_err();
    assert!(err.to_string().contains("not installed or not in PATH"));
}

#[tokio::test]
async fn list_normalizes_states_and_status_reports_absence() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let list_json = r#"[{"Name":"alloc-123","State":"RUNNING","SizeOnDisk":20,"Running":true,"Size":50,"Disk":20,"Source":"oci"},{"Name":"other","State":"banana","SizeOnDisk":1,"Running":false,"Size":1,"Disk":1,"Source":"local"}]"#;
    let tart = write_fake_tart(
        dir.path(),
        &log,
        "LIST_SENTINEL",
        &format!("  list) echo '{}' ;;\n  ignore-me) : ;;", list_json),
    );

    let client = TartClient::with_binary(&tart);
    let vms = client.list().await.unwrap();
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].state, VmState::Running);
    assert_eq!(vms[1].state, VmState::Stopped);

    assert_eq!(client.status("alloc-123").await.unwrap(), VmState::Running);
    let err = client.status("missing").await.unwrap_err();
    assert!(matches!(err, Error::VmNotFound { .. }));
}

#[tokio::test]
async fn stop_times_out_when_the_tool_hangs() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(dir.path(), &log, "STOP_SENTINEL", "  stop) sleep 10 ;;");

    let client = TartClient::with_binary(&tart);
    let err = client
        .stop("alloc-123", Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "got: {}", err);
}

#[tokio::test]
async fn failed_commands_carry_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(
        dir.path(),
        &log,
        "DEL_SENTINEL",
        "  delete) echo 'no such vm' >&2; exit 1 ;;",
    );

    let client = TartClient::with_binary(&tart);
    let err = client.delete("ghost").await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("delete ghost"), "got: {}", msg);
    assert!(msg.contains("no such vm"), "got: {}", msg);
}

#[tokio::test]
async fn start_launches_detached_and_reports_pid() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("cmd.log");
    let tart = write_fake_tart(dir.path(), &log, "RUN_SENTINEL", "  run) sleep 30 ;;");

    let task = TaskConfig::decode(&serde_json::json!({
        "image": "ghcr.io/example/base:latest",
        "directories": [{"path": "/host/data", "read_only": true}]
    }))
    .unwrap();
    let config = vm_config(dir.path(), task);

    let client = TartClient::with_binary(&tart);
    let mut launched = client.start(&config).await.unwrap();
    assert!(launched.pid > 0);

    let mut child = launched.child.take().expect("real backend returns a child");
    child.kill().await.unwrap();
    child.wait().await.unwrap();

    let invocations = read_invocations(&log);
    let (run_cmd, _) = invocations
        .iter()
        .find(|(cmd, _)| cmd.starts_with("run"))
        .expect("expected a run invocation");
    assert!(run_cmd.contains("--no-graphics"));
    assert!(run_cmd.contains(&format!("--dir={}:ro", dir.path().join("secrets").display())));
    assert!(run_cmd.contains("--dir=/host/data:ro"));
}
