//! The `batch-exec` binary.

mod common;

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};

use common::{diff_available, Harness};

fn batch_exec(h: &Harness, args: &[&str]) -> Output {
    let config = h.side_file("config.toml");
    if !config.exists() {
        fs::write(&config, "").unwrap();
    }
    Command::new(env!("CARGO_BIN_EXE_batch-exec"))
        .args(args)
        .arg("--config")
        .arg(&config)
        .arg("--cache-dir")
        .arg(h.cache_dir())
        .env_remove("BATCH_EXEC_TOKEN")
        .output()
        .unwrap()
}

fn write_tasks(path: &Path, repositories: Value, steps: Value) {
    let file = json!({"repositories": repositories, "steps": steps});
    fs::write(path, serde_json::to_string(&file).unwrap()).unwrap();
}

#[test]
fn test_run_prints_patches() {
    if !diff_available() {
        return;
    }
    let h = Harness::new();
    h.add_repo("github.com/acme/api", "rev1", &[]);
    let tasks = h.side_file("tasks.json");
    write_tasks(
        &tasks,
        json!([{"id": "id-github.com/acme/api", "name": "github.com/acme/api", "rev": "rev1"}]),
        json!([{"type": "command", "args": ["sh", "-c", "echo hello > README.md"]}]),
    );

    let store = h.store_dir();
    let tmp = h.tmp_dir();
    let out = batch_exec(
        &h,
        &[
            "run",
            tasks.to_str().unwrap(),
            "--store",
            store.to_str().unwrap(),
            "--temp-dir",
            tmp.to_str().unwrap(),
            "--timeout",
            "30s",
        ],
    );
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));

    let patches: Value = serde_json::from_slice(&out.stdout).unwrap();
    let patches = patches.as_array().unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0]["repository"]["name"], "github.com/acme/api");
    assert!(patches[0]["diff"].as_str().unwrap().contains("+hello"));
}

#[test]
fn test_cache_key_is_stable() {
    let h = Harness::new();
    let tasks = h.side_file("tasks.json");
    write_tasks(
        &tasks,
        json!([
            {"id": "a", "name": "github.com/acme/a", "rev": "1"},
            {"id": "b", "name": "github.com/acme/b", "rev": "1"}
        ]),
        json!([{"type": "command", "args": ["true"], "env": {"B": "2", "A": "1"}}]),
    );

    let first = batch_exec(&h, &["cache-key", tasks.to_str().unwrap()]);
    let second = batch_exec(&h, &["cache-key", tasks.to_str().unwrap()]);
    assert_eq!(first.status.code(), Some(0), "{}", String::from_utf8_lossy(&first.stderr));
    assert_eq!(first.stdout, second.stdout);

    let keys: Value = serde_json::from_slice(&first.stdout).unwrap();
    let keys = keys.as_array().unwrap();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0]["key"], keys[1]["key"]);
}

#[test]
fn test_invalid_steps_exit_with_config_error() {
    let h = Harness::new();
    let tasks = h.side_file("tasks.json");
    write_tasks(
        &tasks,
        json!([{"id": "a", "name": "github.com/acme/a", "rev": "1"}]),
        json!([{"type": "docker", "image": "alpine:3", "dockerfile": "FROM alpine:3", "args": ["true"]}]),
    );

    let out = batch_exec(&h, &["run", tasks.to_str().unwrap(), "--store", "/nonexistent"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("dockerfile"));
}

#[test]
fn test_clear_cache() {
    let h = Harness::new();
    fs::create_dir_all(h.cache_dir()).unwrap();
    fs::write(h.cache_dir().join("abc.json"), "{}").unwrap();
    fs::write(h.cache_dir().join("keep.txt"), "").unwrap();

    let out = batch_exec(&h, &["clear-cache"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("removed 1"));
    assert!(h.cache_dir().join("keep.txt").exists());
}
