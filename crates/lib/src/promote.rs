//! Artifact promotion and the build marker cache.
//!
//! A finished build is moved from the workspace to
//! `<output_root>/<digest>/<filename>`. The move is staged beside the
//! destination and renamed over it, so the final path always holds either the
//! previous artifact or the new one. When two builds race, the last rename wins.
//!
//! A marker file next to the artifact records what it was built from. A later
//! run with identical inputs reuses the artifact after checking its hash.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::template::write_atomic;
use crate::util::hash::{ContentHash, ObjectHash, hash_file};

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PromoteError {
  #[error("failed to create output directory {}: {source}", path.display())]
  CreateDir { path: PathBuf, source: io::Error },

  #[error("failed to move build output {} into place: {source}", path.display())]
  Stage { path: PathBuf, source: io::Error },

  #[error("failed to replace {}: {source}", path.display())]
  Replace { path: PathBuf, source: io::Error },

  #[error("failed to write build marker {}: {source}", path.display())]
  Marker { path: PathBuf, source: io::Error },
}

/// Record of a promoted artifact and the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMarker {
  pub version: u32,
  /// Payload digest.
  pub digest: String,
  /// Fingerprint of everything that went into the build.
  pub inputs_hash: String,
  /// SHA-256 of the promoted artifact.
  pub artifact_hash: String,
  pub managed: bool,
}

impl BuildMarker {
  pub fn new(digest: &ContentHash, inputs: &ObjectHash, artifact: &ContentHash, managed: bool) -> Self {
    Self {
      version: MARKER_VERSION,
      digest: digest.to_string(),
      inputs_hash: inputs.to_string(),
      artifact_hash: artifact.to_string(),
      managed,
    }
  }
}

/// Final location of the artifact for `digest`.
pub fn final_path(output_root: &Path, digest: &ContentHash, filename: &str) -> PathBuf {
  output_root.join(digest.as_str()).join(filename)
}

/// Location of the marker belonging to `artifact`.
pub fn marker_path(artifact: &Path) -> PathBuf {
  let name = artifact.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
  artifact.with_file_name(format!(".{}.lockwrap.json", name))
}

/// Move `build_output` to `final_dir/final_name`, replacing any existing file.
pub fn promote(build_output: &Path, final_dir: &Path, final_name: &str) -> Result<PathBuf, PromoteError> {
  fs::create_dir_all(final_dir).map_err(|source| PromoteError::CreateDir {
    path: final_dir.to_path_buf(),
    source,
  })?;
  let final_path = final_dir.join(final_name);

  let staged = tempfile::Builder::new()
    .prefix(".lockwrap-")
    .suffix(".tmp")
    .make_in(final_dir, |staging| move_file(build_output, staging))
    .map_err(|source| PromoteError::Stage {
      path: build_output.to_path_buf(),
      source,
    })?;
  staged.persist(&final_path).map_err(|e| PromoteError::Replace {
    path: final_path.clone(),
    source: e.error,
  })?;

  info!(from = ?build_output, to = ?final_path, "artifact promoted");
  Ok(final_path)
}

/// Rename, or copy then delete when source and destination are on different
/// filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
  match fs::rename(from, to) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
    Err(e) => {
      debug!(error = %e, "rename failed, copying instead");
      if let Err(e) = fs::copy(from, to) {
        let _ = fs::remove_file(to);
        return Err(e);
      }
      fs::remove_file(from)
    }
  }
}

/// Write the marker for `artifact`.
pub fn write_marker(artifact: &Path, marker: &BuildMarker) -> Result<(), PromoteError> {
  let path = marker_path(artifact);
  serde_json::to_vec_pretty(marker)
    .map_err(io::Error::other)
    .and_then(|content| write_atomic(&path, &content))
    .map_err(|source| PromoteError::Marker { path, source })
}

/// Read the marker for `artifact`.
///
/// Returns `None` when there is no marker or it cannot be parsed.
pub fn read_marker(artifact: &Path) -> Option<BuildMarker> {
  let path = marker_path(artifact);
  let content = match fs::read(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
    Err(e) => {
      debug!(path = ?path, error = %e, "unreadable build marker");
      return None;
    }
  };
  match serde_json::from_slice::<BuildMarker>(&content) {
    Ok(marker) if marker.version == MARKER_VERSION => Some(marker),
    Ok(marker) => {
      debug!(path = ?path, version = marker.version, "unsupported build marker version");
      None
    }
    Err(e) => {
      debug!(path = ?path, error = %e, "invalid build marker");
      None
    }
  }
}

/// Return the cached marker if `artifact` was built from `inputs` and has not
/// been modified since.
pub fn check_cache(artifact: &Path, inputs: &ObjectHash) -> Option<BuildMarker> {
  let marker = read_marker(artifact)?;

  if marker.inputs_hash != inputs.0 {
    debug!(path = ?artifact, "inputs changed since last build");
    return None;
  }

  match hash_file(artifact) {
    Ok(actual) if actual.0 == marker.artifact_hash => {
      debug!(path = ?artifact, "cached artifact verified");
      Some(marker)
    }
    Ok(actual) => {
      warn!(
        path = ?artifact,
        expected = %marker.artifact_hash,
        actual = %actual,
        "cached artifact was modified, rebuilding"
      );
      None
    }
    Err(e) => {
      debug!(path = ?artifact, error = %e, "cached artifact unreadable");
      None
    }
  }
}
