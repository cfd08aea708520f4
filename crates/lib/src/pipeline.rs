//! The packaging pipeline.
//!
//! ```text
//! Start → Hashed → Locked → WorkspaceReady → SourceGenerated → IconResolved
//!       → Compiled → Promoted
//!                  ↘ Cached (inputs unchanged, artifact verified)
//!                  ↘ Failed
//! ```
//!
//! One [`Packager::pack`] call produces one artifact from one payload. Builds
//! of the same payload are serialized through a [`DigestLock`]; a build that
//! waited for another usually finds its artifact cached.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compile::{self, CancelToken, CompileError, Diagnostic, Invocation, ToolchainError};
use crate::config::PackConfig;
use crate::consts::APP_NAME;
use crate::digest_lock::{DigestLock, DigestLockError, LockWait};
use crate::icon::{IconSource, resolve_icon};
use crate::promote::{self, BuildMarker, PromoteError};
use crate::template::{self, TemplateError};
use crate::util::hash::{ContentHash, HashError, Hashable, hash_bytes, hash_file};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum PackError {
  #[error("{}: {source}", path.display())]
  Io { path: PathBuf, source: io::Error },

  #[error("payload path has no file name: {}", path.display())]
  InvalidPayloadPath { path: PathBuf },

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Lock(#[from] DigestLockError),

  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error("compilation failed (exit code {})", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
  CompileFailed {
    exit_code: Option<i32>,
    diagnostics: Vec<Diagnostic>,
  },

  #[error("compiler did not finish within {0:?}")]
  TimedOut(Duration),

  #[error("build was cancelled")]
  Cancelled,

  #[error(transparent)]
  Promote(#[from] PromoteError),

  #[error("failed to fingerprint build inputs: {0}")]
  Hash(#[from] HashError),
}

impl PackError {
  /// Whether the compiler ran and rejected the generated program, as opposed
  /// to the environment preventing a build.
  pub fn is_compile_failure(&self) -> bool {
    matches!(self, PackError::CompileFailed { .. })
  }

  fn io(path: &Path) -> impl FnOnce(io::Error) -> PackError + '_ {
    move |source| PackError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  fn from_compile(err: CompileError, compiler: &Path) -> Self {
    match err {
      CompileError::Toolchain(e) => PackError::Toolchain(e),
      CompileError::Output(source) => PackError::Io {
        path: compiler.to_path_buf(),
        source,
      },
      CompileError::TimedOut(d) => PackError::TimedOut(d),
      CompileError::Cancelled => PackError::Cancelled,
    }
  }
}

/// The input executable, read fully into memory.
#[derive(Debug, Clone)]
pub struct Payload {
  bytes: Vec<u8>,
}

impl Payload {
  pub fn read(path: &Path) -> Result<Self, PackError> {
    let bytes = std::fs::read(path).map_err(PackError::io(path))?;
    Ok(Self { bytes })
  }

  pub fn from_bytes(bytes: Vec<u8>) -> Self {
    Self { bytes }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn digest(&self) -> ContentHash {
    hash_bytes(&self.bytes)
  }
}

/// Everything that identifies one build. All paths derive from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
  pub payload_path: PathBuf,
  pub icon_path: Option<PathBuf>,
  /// Final component of `payload_path`; names the artifact.
  pub filename: String,
  pub digest: ContentHash,
}

impl BuildRequest {
  pub fn new(payload_path: &Path, icon_path: Option<&Path>, payload: &Payload) -> Result<Self, PackError> {
    let filename = payload_path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .ok_or_else(|| PackError::InvalidPayloadPath {
        path: payload_path.to_path_buf(),
      })?;

    Ok(Self {
      payload_path: payload_path.to_path_buf(),
      icon_path: icon_path.map(Path::to_path_buf),
      filename,
      digest: payload.digest(),
    })
  }
}

/// Per-invocation switches.
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
  /// Rebuild even when a verified artifact exists.
  pub force: bool,
  pub lock_wait: LockWait,
  /// Leave the workspace in place after promotion.
  pub keep_workspace: bool,
  /// Overrides [`PackConfig::compile_timeout`].
  pub timeout: Option<Duration>,
  pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct PackOutcome {
  pub artifact: PathBuf,
  pub digest: ContentHash,
  pub managed: bool,
  pub icon: Option<IconSource>,
  /// The artifact was reused from a previous build.
  pub cached: bool,
  pub diagnostics: Vec<Diagnostic>,
  pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
  Start,
  Hashed,
  Locked,
  WorkspaceReady,
  SourceGenerated,
  IconResolved,
  Compiled,
  Promoted,
  Cached,
  Failed,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Start => "start",
      Stage::Hashed => "hashed",
      Stage::Locked => "locked",
      Stage::WorkspaceReady => "workspace-ready",
      Stage::SourceGenerated => "source-generated",
      Stage::IconResolved => "icon-resolved",
      Stage::Compiled => "compiled",
      Stage::Promoted => "promoted",
      Stage::Cached => "cached",
      Stage::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// Fingerprint of every input that affects the artifact's bytes.
///
/// Files that cannot be read hash to `None`; the stage that actually needs
/// them reports the error.
#[derive(Debug, Serialize)]
struct BuildInputs<'a> {
  digest: &'a str,
  filename: &'a str,
  template: Option<String>,
  aux_sources: Vec<Option<String>>,
  icon: Option<String>,
  entry_point: &'a str,
  compiler: &'a Path,
}

impl Hashable for BuildInputs<'_> {}

fn file_fingerprint(path: &Path) -> Option<String> {
  match hash_file(path) {
    Ok(hash) => Some(hash.0),
    Err(e) => {
      debug!(path = ?path, error = %e, "input not readable for fingerprint");
      None
    }
  }
}

pub struct Packager {
  config: PackConfig,
}

impl Packager {
  pub fn new(config: PackConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PackConfig {
    &self.config
  }

  /// Build (or reuse) the wrapped artifact for `payload`.
  ///
  /// `on_error` receives each error diagnostic as soon as the compiler prints
  /// it.
  pub async fn pack<F>(
    &self,
    request: &BuildRequest,
    payload: &Payload,
    options: &PackOptions,
    on_error: F,
  ) -> Result<PackOutcome, PackError>
  where
    F: FnMut(&Diagnostic),
  {
    let started = Instant::now();
    info!(stage = %Stage::Start, payload = ?request.payload_path, "packing");

    let result = self.run(request, payload, options, on_error, started).await;
    if let Err(e) = &result {
      warn!(stage = %Stage::Failed, digest = %request.digest, error = %e, "build failed");
    }
    result
  }

  async fn run<F>(
    &self,
    request: &BuildRequest,
    payload: &Payload,
    options: &PackOptions,
    mut on_error: F,
    started: Instant,
  ) -> Result<PackOutcome, PackError>
  where
    F: FnMut(&Diagnostic),
  {
    let config = &self.config;
    let digest = &request.digest;
    info!(stage = %Stage::Hashed, digest = %digest, bytes = payload.bytes().len());

    let lock = self.lock(request, options).await?;
    info!(stage = %Stage::Locked, digest = %digest);

    let inputs_hash = BuildInputs {
      digest: digest.as_str(),
      filename: &request.filename,
      template: file_fingerprint(&config.template_path),
      aux_sources: config.aux_sources.iter().map(|p| file_fingerprint(p)).collect(),
      icon: request.icon_path.as_deref().and_then(file_fingerprint),
      entry_point: &config.entry_point,
      compiler: &config.compiler_path,
    }
    .compute_hash()?;

    let final_dir = config.output_root.join(digest.as_str());
    let final_path = promote::final_path(&config.output_root, digest, &request.filename);

    if options.force {
      debug!("cache bypassed");
    } else if let Some(marker) = promote::check_cache(&final_path, &inputs_hash) {
      info!(stage = %Stage::Cached, artifact = ?final_path);
      lock.remove();
      return Ok(PackOutcome {
        artifact: final_path,
        digest: digest.clone(),
        managed: marker.managed,
        icon: None,
        cached: true,
        diagnostics: Vec::new(),
        duration: started.elapsed(),
      });
    }

    let workspace = Workspace::ensure(&config.work_root, digest).map_err(PackError::io(&config.work_root))?;
    info!(stage = %Stage::WorkspaceReady, path = ?workspace.dir());

    let source_path = workspace
      .fresh_path(&Workspace::source_name(&request.filename))
      .map_err(PackError::io(workspace.dir()))?;
    let managed = template::instantiate(
      &config.template_path,
      &source_path,
      payload.bytes(),
      &request.filename,
      Some(digest),
    )?;
    info!(stage = %Stage::SourceGenerated, managed, path = ?source_path);

    let icon_dest = workspace.path_for(&Workspace::icon_name(&request.filename));
    let icon_err_path = request.icon_path.as_deref().unwrap_or(&icon_dest);
    let icon = resolve_icon(payload.bytes(), request.icon_path.as_deref(), &icon_dest)
      .map_err(PackError::io(icon_err_path))?;
    info!(stage = %Stage::IconResolved, icon = ?icon.as_ref().map(IconSource::path));

    let build_output = workspace
      .fresh_path(&Workspace::build_output_name(&request.filename))
      .map_err(PackError::io(workspace.dir()))?;

    let mut sources = Vec::with_capacity(1 + config.aux_sources.len());
    sources.push(source_path);
    sources.extend(config.aux_sources.iter().cloned());

    let invocation = Invocation {
      compiler: config.compiler_path.clone(),
      output: build_output.clone(),
      icon: icon.as_ref().map(|i| i.path().to_path_buf()),
      entry_point: config.entry_point.clone(),
      sources,
    };
    let timeout = options.timeout.unwrap_or(config.compile_timeout);

    let output = compile::compile(&invocation, timeout, &options.cancel, |d| {
      if d.is_error() {
        on_error(d);
      }
    })
    .await
    .map_err(|e| PackError::from_compile(e, &config.compiler_path))?;

    if !output.success() {
      return Err(PackError::CompileFailed {
        exit_code: output.exit_code,
        diagnostics: output.diagnostics,
      });
    }
    info!(stage = %Stage::Compiled, diagnostics = output.diagnostics.len());

    let artifact = promote::promote(&build_output, &final_dir, &request.filename)?;
    let artifact_hash = hash_file(&artifact).map_err(PackError::io(&artifact))?;
    promote::write_marker(&artifact, &BuildMarker::new(digest, &inputs_hash, &artifact_hash, managed))?;

    if options.keep_workspace {
      debug!(path = ?workspace.dir(), "keeping workspace");
    } else {
      let dir = workspace.dir().to_path_buf();
      if let Err(e) = workspace.remove() {
        warn!(path = ?dir, error = %e, "failed to remove workspace");
      }
    }

    lock.remove();
    info!(stage = %Stage::Promoted, artifact = ?artifact);
    Ok(PackOutcome {
      artifact,
      digest: digest.clone(),
      managed,
      icon,
      cached: false,
      diagnostics: output.diagnostics,
      duration: started.elapsed(),
    })
  }

  /// Take the per-digest lock without blocking the runtime. Cancellation
  /// abandons the wait; a lock acquired afterwards is released immediately.
  async fn lock(&self, request: &BuildRequest, options: &PackOptions) -> Result<DigestLock, PackError> {
    let root = self.config.work_root.clone();
    let digest = request.digest.clone();
    let command = format!("{} {}", APP_NAME, request.payload_path.display());
    let wait = options.lock_wait;

    let task = tokio::task::spawn_blocking(move || DigestLock::acquire(&root, &digest, &command, wait));

    tokio::select! {
      joined = task => match joined {
        Ok(lock) => Ok(lock?),
        Err(e) => Err(PackError::Io {
          path: DigestLock::lock_path_for(&self.config.work_root, &request.digest),
          source: io::Error::other(e),
        }),
      },
      _ = options.cancel.cancelled() => Err(PackError::Cancelled),
    }
  }
}
