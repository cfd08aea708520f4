mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

use cmd::{EXIT_USAGE, PackArgs, cmd_pack};
use output::OutputFormat;

/// Wrap an executable in a password-gated launcher
#[derive(Parser)]
#[command(name = "lockwrap")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Executable to wrap
  payload: PathBuf,

  /// Icon for the wrapped executable (default: the payload's own icon)
  icon: Option<PathBuf>,

  /// Rebuild even if an up-to-date artifact exists
  #[arg(long)]
  force: bool,

  /// Fail instead of waiting when the same payload is being built elsewhere
  #[arg(long)]
  no_wait: bool,

  /// Keep the generated sources after a successful build
  #[arg(long)]
  keep_workspace: bool,

  /// Compiler timeout (e.g. "90s", "5m")
  #[arg(long, value_parser = humantime::parse_duration)]
  timeout: Option<Duration>,

  /// Output format
  #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,
}

impl Cli {
  fn pack_args(self) -> PackArgs {
    PackArgs {
      payload: self.payload,
      icon: self.icon,
      force: self.force,
      no_wait: self.no_wait,
      keep_workspace: self.keep_workspace,
      timeout: self.timeout,
      output: self.output,
      verbose: self.verbose,
    }
  }
}

fn main() -> ExitCode {
  let cli = match Cli::try_parse() {
    Ok(cli) => cli,
    Err(err) => return usage_error(err),
  };

  init_tracing(cli.verbose);
  cmd_pack(&cli.pack_args())
}

/// Help and version go to stdout with status 0; real usage errors are
/// printed to stdout as well, with status 2.
fn usage_error(err: clap::Error) -> ExitCode {
  match err.kind() {
    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
      let _ = err.print();
      ExitCode::SUCCESS
    }
    _ => {
      println!("{}", err.render());
      ExitCode::from(EXIT_USAGE)
    }
  }
}

fn init_tracing(verbose: bool) {
  let filter = if verbose {
    EnvFilter::new("warn,lockwrap=debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}
