//! Compiler invocation.
//!
//! The compiler is started directly with an argument vector (no shell), its
//! output is streamed line by line through the diagnostic parser, and the
//! whole run is bounded by a timeout and a [`CancelToken`]. When either fires
//! the compiler is killed, on Unix together with its process group.

pub mod cancel;
pub mod diagnostic;

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use cancel::CancelToken;
pub use diagnostic::{Diagnostic, Severity, parse_line};

#[cfg(windows)]
use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;

/// The compiler could not be started at all.
#[derive(Debug, Error)]
pub enum ToolchainError {
  #[error("compiler not found at {}", path.display())]
  NotFound { path: PathBuf },

  #[error("failed to start compiler {}: {source}", path.display())]
  Spawn { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum CompileError {
  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error("failed to read compiler output: {0}")]
  Output(#[source] io::Error),

  #[error("compiler did not finish within {0:?}")]
  TimedOut(Duration),

  #[error("compilation was cancelled")]
  Cancelled,
}

/// One compiler run: what to build and from which sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
  pub compiler: PathBuf,
  pub output: PathBuf,
  pub icon: Option<PathBuf>,
  pub entry_point: String,
  /// Generated source first, then auxiliary sources.
  pub sources: Vec<PathBuf>,
}

impl Invocation {
  /// Arguments in the order the compiler expects them. Each path is its own
  /// element, so spaces need no quoting.
  pub fn args(&self) -> Vec<OsString> {
    let mut args = Vec::with_capacity(3 + self.sources.len());
    args.push(flag("/out:", &self.output));
    if let Some(icon) = &self.icon {
      args.push(flag("/win32icon:", icon));
    }
    args.push(OsString::from(format!("/main:{}", self.entry_point)));
    args.extend(self.sources.iter().map(|s| s.as_os_str().to_owned()));
    args
  }
}

fn flag(name: &str, path: &Path) -> OsString {
  let mut arg = OsString::from(name);
  arg.push(path.as_os_str());
  arg
}

/// Outcome of a compiler run that finished on its own.
#[derive(Debug, Clone)]
pub struct CompileOutput {
  /// `None` when the process was terminated by a signal.
  pub exit_code: Option<i32>,
  pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
  pub fn success(&self) -> bool {
    self.exit_code == Some(0)
  }

  pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
    self.diagnostics.iter().filter(|d| d.is_error())
  }
}

/// Run the compiler to completion.
///
/// `on_diagnostic` sees every parsed diagnostic as soon as its line is read.
/// A non-zero exit is not an error here; callers inspect
/// [`CompileOutput::success`].
pub async fn compile<F>(
  invocation: &Invocation,
  timeout: Duration,
  cancel: &CancelToken,
  mut on_diagnostic: F,
) -> Result<CompileOutput, CompileError>
where
  F: FnMut(&Diagnostic),
{
  if cancel.is_cancelled() {
    return Err(CompileError::Cancelled);
  }

  let args = invocation.args();
  info!(compiler = ?invocation.compiler, sources = invocation.sources.len(), "compiling");
  debug!(?args, "compiler arguments");

  let mut child = spawn(&invocation.compiler, &args)?;

  let (tx, mut rx) = mpsc::unbounded_channel::<io::Result<String>>();
  if let Some(stdout) = child.stdout.take() {
    forward_lines(stdout, tx.clone());
  }
  if let Some(stderr) = child.stderr.take() {
    forward_lines(stderr, tx.clone());
  }
  drop(tx);

  let mut diagnostics = Vec::new();
  let run = async {
    while let Some(line) = rx.recv().await {
      let line = line.map_err(CompileError::Output)?;
      debug!(target: "lockwrap::compiler", "{}", line);
      if let Some(diag) = parse_line(&line) {
        on_diagnostic(&diag);
        diagnostics.push(diag);
      }
    }
    child.wait().await.map_err(CompileError::Output)
  };

  let status: ExitStatus = tokio::select! {
    result = tokio::time::timeout(timeout, run) => match result {
      Ok(status) => status?,
      Err(_) => {
        warn!(timeout = ?timeout, "compiler timed out, killing it");
        terminate(&mut child).await;
        return Err(CompileError::TimedOut(timeout));
      }
    },
    _ = cancel.cancelled() => {
      warn!("compilation cancelled, killing compiler");
      terminate(&mut child).await;
      return Err(CompileError::Cancelled);
    }
  };

  let output = CompileOutput {
    exit_code: status.code(),
    diagnostics,
  };
  info!(exit_code = ?output.exit_code, errors = output.errors().count(), "compiler finished");
  Ok(output)
}

fn spawn(compiler: &Path, args: &[OsString]) -> Result<Child, ToolchainError> {
  let mut command = Command::new(compiler);
  command
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  #[cfg(unix)]
  command.process_group(0);

  #[cfg(windows)]
  command.creation_flags(CREATE_NO_WINDOW);

  command.spawn().map_err(|source| {
    if source.kind() == io::ErrorKind::NotFound {
      ToolchainError::NotFound {
        path: compiler.to_path_buf(),
      }
    } else {
      ToolchainError::Spawn {
        path: compiler.to_path_buf(),
        source,
      }
    }
  })
}

/// Stream `reader` line by line. Lines that are not valid UTF-8 (localized
/// banners in a legacy code page) are decoded lossily.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<io::Result<String>>)
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
      buf.clear();
      match reader.read_until(b'\n', &mut buf).await {
        Ok(0) => break,
        Ok(_) => {
          let line = String::from_utf8_lossy(&buf);
          let line = line.trim_end_matches(['\n', '\r']).to_string();
          if tx.send(Ok(line)).is_err() {
            break;
          }
        }
        Err(e) => {
          let _ = tx.send(Err(e));
          break;
        }
      }
    }
  });
}

/// Kill the compiler and anything it started, then reap it.
async fn terminate(child: &mut Child) {
  #[cfg(unix)]
  if let Some(id) = child.id() {
    use rustix::process::{Pid, Signal, kill_process_group};
    if let Some(pid) = i32::try_from(id).ok().and_then(Pid::from_raw) {
      if let Err(e) = kill_process_group(pid, Signal::KILL) {
        debug!(error = %e, "failed to kill compiler process group");
      }
    }
  }

  if let Err(e) = child.start_kill() {
    debug!(error = %e, "failed to kill compiler");
  }
  let _ = child.wait().await;
}
