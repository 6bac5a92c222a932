use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn rs_onyx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rs-onyx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[source]
subdomain = "acme"

[sync]
state_path = "{}/data/state.json"
include_invoices = true
"#,
        root.display()
    );

    let config_path = config_dir.join("rs-onyx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rs_onyx(config_path: &Path, args: &[&str]) -> Output {
    Command::new(rs_onyx_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("RS_SUBDOMAIN")
        .env_remove("RS_API_KEY")
        .env_remove("ONYX_API_URL")
        .env_remove("ONYX_API_KEY")
        .output()
        .expect("failed to run rs-onyx")
}

#[test]
fn test_init_writes_template_once() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("nested/rs-onyx.toml");

    let output = run_rs_onyx(&config_path, &["init"]);
    assert!(
        output.status.success(),
        "init failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let written = fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("[source]"));
    assert!(written.contains("subdomain"));

    let again = run_rs_onyx(&config_path, &["init"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));
}

#[test]
fn test_status_without_checkpoint() {
    let (_tmp, config_path) = setup_test_env();

    let output = run_rs_onyx(&config_path, &["status"]);
    assert!(
        output.status.success(),
        "status failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Last full:   never"));
    assert!(stdout.contains("Next sync:   full"));
}

#[test]
fn test_status_reads_checkpoint_and_reset_clears_it() {
    let (tmp, config_path) = setup_test_env();
    let state = tmp.path().join("data/state.json");
    fs::create_dir_all(state.parent().unwrap()).unwrap();
    fs::write(
        &state,
        r#"{
  "last_full_sync": "2024-05-01T08:00:00Z",
  "sync_started_at": "2024-05-02T08:00:00Z",
  "sync_type": "poll",
  "customers": {"seen_ids": [1, 2, 3], "complete": true},
  "documents_processed": 3,
  "errors": ["tickets: server error 502: bad gateway"]
}"#,
    )
    .unwrap();

    let output = run_rs_onyx(&config_path, &["status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2024-05-01 08:00:00 UTC"));
    assert!(stdout.contains("poll sync, interrupted"));
    assert!(stdout.contains("bad gateway"));

    let output = run_rs_onyx(&config_path, &["reset"]);
    assert!(output.status.success());
    assert!(!state.exists());

    // Resetting twice is fine.
    let output = run_rs_onyx(&config_path, &["reset"]);
    assert!(output.status.success());
}

#[test]
fn test_sync_requires_api_key() {
    let (_tmp, config_path) = setup_test_env();

    let output = run_rs_onyx(&config_path, &["sync", "--dry-run", "--progress", "off"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("API key"), "unexpected stderr: {}", stderr);
}

#[test]
fn test_invalid_config_is_reported() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("rs-onyx.toml");
    fs::write(&config_path, "[source]\nsubdomain = \"acme\"\n[sync]\nbatch_size = 0\n").unwrap();

    let output = run_rs_onyx(&config_path, &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("batch_size"));
}
