//! Per-digest scratch directories.
//!
//! Every build of a payload works inside `<work_root>/<digest>/`. The
//! directory is created lazily and shared by all builds of that digest, so
//! each generated file is cleared at its exact path before it is regenerated.
//!
//! # Layout
//!
//! ```text
//! <work_root>/
//! ├── <digest>.lock           # per-digest lock (see digest_lock)
//! └── <digest>/
//!     ├── app.exe.cs          # instantiated template
//!     ├── app.exe.ico         # extracted icon (optional)
//!     └── app.exe.out.exe     # raw compiler output
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::consts::{BUILD_OUTPUT_SUFFIX, ICON_EXT, SOURCE_EXT};
use crate::util::hash::ContentHash;

/// A digest-keyed working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
  dir: PathBuf,
}

impl Workspace {
  /// Create the workspace for `digest` under `root` if it does not exist yet.
  ///
  /// Repeated calls for the same digest are no-ops once the directory exists.
  pub fn ensure(root: &Path, digest: &ContentHash) -> io::Result<Self> {
    let dir = root.join(digest.as_str());
    fs::create_dir_all(&dir)?;
    debug!(path = ?dir, "workspace ready");
    Ok(Self { dir })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Path of `name` inside the workspace, with no side effects.
  pub fn path_for(&self, name: &str) -> PathBuf {
    self.dir.join(name)
  }

  /// Path of `name` inside the workspace, with any existing file removed.
  ///
  /// A build never sees a file left behind by a previous run at this path.
  pub fn fresh_path(&self, name: &str) -> io::Result<PathBuf> {
    let path = self.path_for(name);
    remove_stale(&path)?;
    Ok(path)
  }

  pub fn source_name(filename: &str) -> String {
    format!("{}.{}", filename, SOURCE_EXT)
  }

  pub fn build_output_name(filename: &str) -> String {
    format!("{}.{}", filename, BUILD_OUTPUT_SUFFIX)
  }

  pub fn icon_name(filename: &str) -> String {
    format!("{}.{}", filename, ICON_EXT)
  }

  /// Delete the workspace and everything in it.
  pub fn remove(self) -> io::Result<()> {
    match fs::remove_dir_all(&self.dir) {
      Ok(()) => {
        debug!(path = ?self.dir, "workspace removed");
        Ok(())
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }
}

/// Remove a file if it exists. A missing file is not an error.
pub fn remove_stale(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Ok(()) => {
      debug!(path = ?path, "removed stale file");
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}
