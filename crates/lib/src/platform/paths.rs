use std::io;
use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the root under which per-digest workspaces and lock files live.
///
/// This is `<system temp dir>/lockwrap`.
pub fn temp_root() -> PathBuf {
  std::env::temp_dir().join(APP_NAME)
}

/// Returns the directory the running executable was installed into.
///
/// Default template, auxiliary sources and promoted artifacts are resolved
/// relative to this directory.
pub fn install_dir() -> io::Result<PathBuf> {
  let exe = std::env::current_exe()?;
  let exe = dunce::canonicalize(&exe).unwrap_or(exe);
  exe
    .parent()
    .map(PathBuf::from)
    .ok_or_else(|| io::Error::other(format!("executable has no parent directory: {}", exe.display())))
}

/// Returns the directory holding the bundled template sources.
pub fn template_dir() -> io::Result<PathBuf> {
  Ok(install_dir()?.join("template"))
}

/// Default location of the C# compiler.
#[cfg(windows)]
pub fn default_compiler() -> PathBuf {
  let windir = std::env::var("WINDIR").unwrap_or_else(|_| r"C:\Windows".to_string());
  PathBuf::from(windir)
    .join("Microsoft.NET")
    .join("Framework")
    .join("v4.0.30319")
    .join("csc.exe")
}

/// Default location of the C# compiler.
///
/// Resolved through `PATH` when the child is spawned.
#[cfg(not(windows))]
pub fn default_compiler() -> PathBuf {
  PathBuf::from("csc")
}
