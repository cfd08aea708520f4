//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Template exercising every marker.
pub const TEMPLATE: &str = "namespace LockwrapTemplate {\n  class Template {\n    static string binary /*@BINARY*/;\n    static string filename /*@FILENAME*/;\n    static int isDotNet /*@IS_DOT_NET*/;\n    static string hash /*@EXE_HASH*/;\n  }\n}\n";

/// How the stub compiler behaves.
#[derive(Debug, Clone, Copy)]
pub enum Stub {
  Succeed,
  Fail,
  Hang,
}

/// Isolated test environment.
///
/// Each test gets its own template, stub compiler, work and output roots.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new(stub: Stub) -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };
    env.write_file("template/Template.cs", TEMPLATE);
    env.write_file("template/LoginForm.cs", "// login form\n");
    env.write_compiler(stub);
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Replace the stub compiler.
  pub fn write_compiler(&self, stub: Stub) {
    use std::os::unix::fs::PermissionsExt;

    let body = match stub {
      Stub::Succeed => {
        r#"out=""
srcs=""
for arg in "$@"; do
  case "$arg" in
    /out:*) out="${arg#/out:}" ;;
    /*:*) ;;
    *) srcs="$srcs
$arg" ;;
  esac
done
echo "$srcs" | while IFS= read -r src; do
  [ -n "$src" ] && cat "$src"
done > "$out"
exit 0"#
      }
      Stub::Fail => {
        r#"echo "Template.cs(12,9): error CS1002: ; expected"
echo "warning CS0168: The variable 'e' is declared but never used"
exit 1"#
      }
      Stub::Hang => "sleep 30\nexit 0",
    };

    let script = format!(
      "#!/bin/sh\nfor arg in \"$@\"; do printf '%s\\n' \"$arg\" >> '{}'; done\n{}\n",
      self.args_log().display(),
      body
    );
    let path = self.write_file("tools/csc", &script);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  }

  /// Write a payload and return its path.
  pub fn payload(&self, name: &str, content: &str) -> PathBuf {
    self.write_file(&format!("input/{}", name), content)
  }

  pub fn work_root(&self) -> PathBuf {
    self.temp.path().join("work")
  }

  pub fn output_root(&self) -> PathBuf {
    self.temp.path().join("out")
  }

  fn args_log(&self) -> PathBuf {
    self.temp.path().join("tools").join("csc.args")
  }

  /// Arguments of every compiler run so far, one per line.
  pub fn compiler_args(&self) -> Vec<String> {
    std::fs::read_to_string(self.args_log())
      .map(|s| s.lines().map(str::to_string).collect())
      .unwrap_or_default()
  }

  pub fn compile_count(&self) -> usize {
    self.compiler_args().iter().filter(|a| a.starts_with("/main:")).count()
  }

  /// Command with all `LOCKWRAP_*` locations pointing into the temp directory.
  pub fn cmd(&self) -> Command {
    let tpl = self.temp.path().join("template");
    let mut cmd = cargo_bin_cmd!("lockwrap");
    cmd
      .env("LOCKWRAP_TEMPLATE", tpl.join("Template.cs"))
      .env("LOCKWRAP_AUX_SOURCES", tpl.join("LoginForm.cs"))
      .env("LOCKWRAP_COMPILER", self.temp.path().join("tools").join("csc"))
      .env("LOCKWRAP_WORK_DIR", self.work_root())
      .env("LOCKWRAP_OUTPUT_DIR", self.output_root())
      .env_remove("LOCKWRAP_ENTRY_POINT")
      .env_remove("LOCKWRAP_COMPILE_TIMEOUT")
      .env_remove("RUST_LOG");
    cmd
  }

  /// Expected promoted artifact for a payload with `content` named `name`.
  pub fn artifact_path(&self, name: &str, content: &str) -> PathBuf {
    let digest = lockwrap_lib::util::hash::hash_bytes(content.as_bytes());
    self.output_root().join(digest.as_str()).join(name)
  }
}

/// Extract the path from a `SUCCESS: <path>` line.
pub fn success_path(stdout: &[u8]) -> Option<PathBuf> {
  String::from_utf8_lossy(stdout)
    .lines()
    .find_map(|l| l.strip_prefix("SUCCESS: ").map(PathBuf::from))
}
