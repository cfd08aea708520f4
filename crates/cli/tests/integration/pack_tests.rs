use std::fs;

use predicates::prelude::*;
use serde_json::Value;

use lockwrap_lib::digest_lock::{DigestLock, LockWait};
use lockwrap_lib::util::hash::hash_bytes;

use crate::common::{Stub, TestEnv, success_path};

const PAYLOAD: &str = "\x7fELF-not-really-a-program";

// =============================================================================
// Success
// =============================================================================

#[test]
fn successful_build_prints_success_line() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  let output = env.cmd().arg(&payload).assert().success().get_output().clone();

  let expected = env.artifact_path("app.exe", PAYLOAD);
  assert_eq!(success_path(&output.stdout), Some(expected.clone()));
  let artifact = fs::read_to_string(&expected).unwrap();
  assert!(artifact.contains("static string filename =\"app.exe\";"));
  assert!(artifact.contains("static int isDotNet =0;"));
  assert_eq!(env.compile_count(), 1);
}

#[test]
fn sequential_runs_both_succeed() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  env.cmd().arg(&payload).assert().success();
  env
    .cmd()
    .arg(&payload)
    .assert()
    .success()
    .stdout(predicate::str::contains("SUCCESS: "))
    .stderr(predicate::str::contains("already exists").not());

  assert_eq!(env.compile_count(), 1);
}

#[test]
fn force_rebuilds() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  env.cmd().arg(&payload).assert().success();
  env.cmd().arg("--force").arg(&payload).assert().success();

  assert_eq!(env.compile_count(), 2);
  assert!(env.artifact_path("app.exe", PAYLOAD).exists());
}

#[test]
fn keep_workspace_leaves_generated_source() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  env.cmd().arg("--keep-workspace").arg(&payload).assert().success();

  let digest = hash_bytes(PAYLOAD.as_bytes());
  assert!(env.work_root().join(digest.as_str()).join("app.exe.cs").exists());
}

#[test]
fn explicit_icon_reaches_compiler() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);
  let icon = env.write_file("brand.ico", "icon");

  env.cmd().arg(&payload).arg(&icon).assert().success();

  let expected = format!("/win32icon:{}", icon.display());
  assert!(env.compiler_args().contains(&expected));
}

#[test]
fn json_output_summarizes_build() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  let output = env
    .cmd()
    .args(["-o", "json"])
    .arg(&payload)
    .assert()
    .success()
    .get_output()
    .clone();

  let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(summary["status"], "success");
  assert_eq!(summary["managed"], false);
  assert_eq!(summary["cached"], false);
  assert_eq!(summary["digest"], hash_bytes(PAYLOAD.as_bytes()).as_str());
  assert_eq!(
    summary["artifact"].as_str().map(std::path::PathBuf::from),
    Some(env.artifact_path("app.exe", PAYLOAD))
  );
}

// =============================================================================
// Failure
// =============================================================================

#[test]
fn compile_failure_prints_errors_then_error_marker() {
  let env = TestEnv::new(Stub::Fail);
  let payload = env.payload("app.exe", PAYLOAD);

  env
    .cmd()
    .arg(&payload)
    .assert()
    .code(1)
    .stdout(predicate::str::contains("Template.cs(12,9): error CS1002: ; expected"))
    .stdout(predicate::str::contains("warning CS0168").not())
    .stdout(predicate::str::ends_with("\nERROR\n"));

  assert!(!env.artifact_path("app.exe", PAYLOAD).exists());
}

#[test]
fn failure_then_success_recovers() {
  let env = TestEnv::new(Stub::Fail);
  let payload = env.payload("app.exe", PAYLOAD);

  env.cmd().arg(&payload).assert().code(1);
  env.write_compiler(Stub::Succeed);
  env.cmd().arg(&payload).assert().success();

  assert!(env.artifact_path("app.exe", PAYLOAD).exists());
}

#[test]
fn json_failure_includes_diagnostics() {
  let env = TestEnv::new(Stub::Fail);
  let payload = env.payload("app.exe", PAYLOAD);

  let output = env
    .cmd()
    .args(["--output", "json"])
    .arg(&payload)
    .assert()
    .code(1)
    .get_output()
    .clone();

  let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(summary["status"], "error");
  assert_eq!(summary["diagnostics"].as_array().map(Vec::len), Some(2));
}

#[test]
fn missing_compiler_is_environment_failure() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  env
    .cmd()
    .env("LOCKWRAP_COMPILER", env.temp.path().join("tools").join("nope"))
    .arg(&payload)
    .assert()
    .code(3)
    .stdout(predicate::str::ends_with("\nERROR\n"))
    .stderr(predicate::str::contains("compiler not found"));
}

#[test]
fn missing_explicit_icon_is_environment_failure() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);

  env
    .cmd()
    .arg(&payload)
    .arg(env.temp.path().join("missing.ico"))
    .assert()
    .code(3);

  assert_eq!(env.compile_count(), 0);
}

#[test]
fn timeout_is_environment_failure() {
  let env = TestEnv::new(Stub::Hang);
  let payload = env.payload("app.exe", PAYLOAD);

  env
    .cmd()
    .args(["--timeout", "300ms"])
    .arg(&payload)
    .timeout(std::time::Duration::from_secs(20))
    .assert()
    .code(3)
    .stderr(predicate::str::contains("did not finish"));
}

#[test]
fn no_wait_fails_while_payload_is_locked() {
  let env = TestEnv::new(Stub::Succeed);
  let payload = env.payload("app.exe", PAYLOAD);
  let digest = hash_bytes(PAYLOAD.as_bytes());
  let _held = DigestLock::acquire(&env.work_root(), &digest, "test holder", LockWait::Block).unwrap();

  env
    .cmd()
    .arg("--no-wait")
    .arg(&payload)
    .assert()
    .code(3)
    .stderr(predicate::str::contains("already running"));

  assert_eq!(env.compile_count(), 0);
}
