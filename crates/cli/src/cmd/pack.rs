//! Implementation of the packaging command.
//!
//! Reads the payload, runs the pipeline, streams compiler errors to stdout as
//! they arrive and reports the result either as a status line or as JSON.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use lockwrap_lib::compile::Diagnostic;
use lockwrap_lib::digest_lock::LockWait;
use lockwrap_lib::{BuildRequest, PackConfig, PackError, PackOptions, PackOutcome, Packager, Payload};

use crate::output::{OutputFormat, format_duration, print_error, print_info, print_json, print_stat, truncate_hash};

pub const EXIT_COMPILE_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_ENVIRONMENT: u8 = 3;

/// Inputs of one packaging run, as parsed from the command line.
#[derive(Debug, Clone)]
pub struct PackArgs {
  pub payload: PathBuf,
  pub icon: Option<PathBuf>,
  pub force: bool,
  pub no_wait: bool,
  pub keep_workspace: bool,
  pub timeout: Option<Duration>,
  pub output: OutputFormat,
  pub verbose: bool,
}

#[derive(Serialize)]
struct PackSummary<'a> {
  status: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  artifact: Option<&'a Path>,
  #[serde(skip_serializing_if = "Option::is_none")]
  digest: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  managed: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  cached: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  icon: Option<&'a Path>,
  #[serde(skip_serializing_if = "Option::is_none")]
  duration_ms: Option<u128>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
  diagnostics: &'a [Diagnostic],
}

/// Execute the packaging command and return the process exit code.
///
/// - `0`: artifact promoted (or reused)
/// - `1`: the compiler rejected the generated program
/// - `3`: anything else prevented the build
pub fn cmd_pack(args: &PackArgs) -> ExitCode {
  let json = args.output.is_json();

  match run(args) {
    Ok(outcome) => match report_success(&outcome, args) {
      Ok(()) => ExitCode::SUCCESS,
      Err(err) => {
        print_error(&format!("{:#}", err));
        ExitCode::from(EXIT_ENVIRONMENT)
      }
    },
    Err(err) => {
      print_error(&format!("{:#}", err));
      let pack_error = err.downcast_ref::<PackError>();

      if json {
        let diagnostics: &[Diagnostic] = match pack_error {
          Some(PackError::CompileFailed { diagnostics, .. }) => diagnostics.as_slice(),
          _ => &[],
        };
        let summary = PackSummary {
          status: "error",
          artifact: None,
          digest: None,
          managed: None,
          cached: None,
          icon: None,
          duration_ms: None,
          error: Some(format!("{:#}", err)),
          diagnostics,
        };
        if let Err(e) = print_json(&summary) {
          print_error(&format!("{:#}", e));
        }
      } else {
        println!();
        println!("ERROR");
      }

      ExitCode::from(exit_status(pack_error))
    }
  }
}

fn exit_status(err: Option<&PackError>) -> u8 {
  match err {
    Some(e) if e.is_compile_failure() => EXIT_COMPILE_FAILURE,
    _ => EXIT_ENVIRONMENT,
  }
}

fn run(args: &PackArgs) -> Result<PackOutcome> {
  let config = PackConfig::from_env().context("Failed to load configuration")?;
  let payload = Payload::read(&args.payload)?;
  let request = BuildRequest::new(&args.payload, args.icon.as_deref(), &payload)?;

  let options = PackOptions {
    force: args.force,
    lock_wait: if args.no_wait { LockWait::FailFast } else { LockWait::Block },
    keep_workspace: args.keep_workspace,
    timeout: args.timeout,
    ..PackOptions::default()
  };

  let packager = Packager::new(config);
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;

  let outcome = rt.block_on(async {
    let cancel = options.cancel.clone();
    let interrupt = tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling build");
        cancel.cancel();
      }
    });

    // Error lines go to stdout as soon as the compiler prints them. JSON
    // output keeps stdout to the single summary, which lists them anyway.
    let json = args.output.is_json();
    let result = packager
      .pack(&request, &payload, &options, |d| {
        if !json {
          println!("{}", d.raw);
        }
      })
      .await;

    interrupt.abort();
    result
  })?;

  Ok(outcome)
}

fn report_success(outcome: &PackOutcome, args: &PackArgs) -> Result<()> {
  if args.output.is_json() {
    return print_json(&PackSummary {
      status: "success",
      artifact: Some(&outcome.artifact),
      digest: Some(outcome.digest.as_str()),
      managed: Some(outcome.managed),
      cached: Some(outcome.cached),
      icon: outcome.icon.as_ref().map(|i| i.path()),
      duration_ms: Some(outcome.duration.as_millis()),
      error: None,
      diagnostics: &outcome.diagnostics,
    });
  }

  if outcome.cached {
    print_info("Reused previously built artifact");
  }
  if args.verbose {
    print_stat("Digest", truncate_hash(outcome.digest.as_str()));
    print_stat("Managed", if outcome.managed { "yes" } else { "no" });
    print_stat(
      "Icon",
      &outcome
        .icon
        .as_ref()
        .map_or_else(|| "none".to_string(), |i| i.path().display().to_string()),
    );
    print_stat("Duration", &format_duration(outcome.duration));
  }

  println!("SUCCESS: {}", outcome.artifact.display());
  Ok(())
}
