//! Pipeline configuration.
//!
//! Everything the pipeline needs to locate on disk is gathered into a
//! [`PackConfig`] once at startup. Each field can be overridden through a
//! `LOCKWRAP_*` environment variable; otherwise it falls back to a location
//! derived from the installation directory or the system temp directory.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::consts::{DEFAULT_COMPILE_TIMEOUT_SECS, DEFAULT_ENTRY_POINT};
use crate::platform::paths::{default_compiler, install_dir, temp_root, template_dir};

pub const ENV_TEMPLATE: &str = "LOCKWRAP_TEMPLATE";
pub const ENV_AUX_SOURCES: &str = "LOCKWRAP_AUX_SOURCES";
pub const ENV_COMPILER: &str = "LOCKWRAP_COMPILER";
pub const ENV_ENTRY_POINT: &str = "LOCKWRAP_ENTRY_POINT";
pub const ENV_WORK_DIR: &str = "LOCKWRAP_WORK_DIR";
pub const ENV_OUTPUT_DIR: &str = "LOCKWRAP_OUTPUT_DIR";
pub const ENV_COMPILE_TIMEOUT: &str = "LOCKWRAP_COMPILE_TIMEOUT";

const TEMPLATE_FILE: &str = "Template.cs";
const AUX_SOURCE_FILES: &[&str] = &["LoginForm.cs", "LoginForm.Designer.cs"];

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to locate installation directory: {0}")]
  InstallDir(#[source] std::io::Error),

  #[error("invalid {ENV_COMPILE_TIMEOUT} value '{value}': expected a whole number of seconds")]
  InvalidTimeout { value: String },
}

/// Locations and limits used by a [`crate::pipeline::Packager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackConfig {
  /// Source skeleton containing the placeholder markers.
  pub template_path: PathBuf,
  /// Fixed sources compiled alongside the generated one.
  pub aux_sources: Vec<PathBuf>,
  /// Compiler executable. A bare name is resolved through `PATH`.
  pub compiler_path: PathBuf,
  /// Type passed to the compiler as the program entry point.
  pub entry_point: String,
  /// Root of the per-digest workspaces and lock files.
  pub work_root: PathBuf,
  /// Root of the promoted `<digest>/<filename>` artifacts.
  pub output_root: PathBuf,
  /// Upper bound on one compiler run.
  pub compile_timeout: Duration,
}

impl PackConfig {
  /// Build the configuration from `LOCKWRAP_*` variables and platform defaults.
  pub fn from_env() -> Result<Self, ConfigError> {
    let template_path = match env_path(ENV_TEMPLATE) {
      Some(path) => path,
      None => template_dir().map_err(ConfigError::InstallDir)?.join(TEMPLATE_FILE),
    };

    let aux_sources = match std::env::var_os(ENV_AUX_SOURCES) {
      Some(list) => std::env::split_paths(&list)
        .filter(|p| !p.as_os_str().is_empty())
        .collect(),
      None => {
        let dir = template_dir().map_err(ConfigError::InstallDir)?;
        AUX_SOURCE_FILES.iter().map(|name| dir.join(name)).collect()
      }
    };

    let compiler_path = env_path(ENV_COMPILER).unwrap_or_else(default_compiler);

    let entry_point = std::env::var(ENV_ENTRY_POINT)
      .ok()
      .filter(|s| !s.is_empty())
      .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string());

    let work_root = env_path(ENV_WORK_DIR).unwrap_or_else(temp_root);

    let output_root = match env_path(ENV_OUTPUT_DIR) {
      Some(path) => path,
      None => install_dir().map_err(ConfigError::InstallDir)?,
    };

    let compile_timeout = match std::env::var(ENV_COMPILE_TIMEOUT) {
      Ok(value) => {
        let secs = value
          .trim()
          .parse::<u64>()
          .map_err(|_| ConfigError::InvalidTimeout { value: value.clone() })?;
        Duration::from_secs(secs)
      }
      Err(_) => Duration::from_secs(DEFAULT_COMPILE_TIMEOUT_SECS),
    };

    Ok(Self {
      template_path,
      aux_sources,
      compiler_path,
      entry_point,
      work_root,
      output_root,
      compile_timeout,
    })
  }
}

fn env_path(var: &str) -> Option<PathBuf> {
  std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}
