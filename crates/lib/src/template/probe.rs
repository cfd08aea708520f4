//! Managed-image detection.
//!
//! A payload is "managed" when it is a PE image carrying a CLR runtime
//! header, i.e. a .NET assembly that the generated program can load in
//! process instead of writing it out and starting it.

use goblin::pe::PE;
use thiserror::Error;
use tracing::debug;

const DOS_SIGNATURE: &[u8] = b"MZ";

/// Kind of payload, as far as the template cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  /// PE image with a CLR runtime header.
  Managed,
  /// Anything else that is still a wrappable file.
  NotManaged,
}

impl ProbeOutcome {
  pub fn is_managed(self) -> bool {
    matches!(self, ProbeOutcome::Managed)
  }
}

/// The payload cannot be classified and should not be wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
  #[error("payload is empty")]
  Empty,

  #[error("payload has an MZ header but is not a valid PE image: {0}")]
  MalformedImage(String),
}

/// Classify payload bytes.
///
/// - no `MZ` signature: [`ProbeOutcome::NotManaged`]
/// - valid PE with a non-empty CLR directory: [`ProbeOutcome::Managed`]
/// - valid PE without one: [`ProbeOutcome::NotManaged`]
/// - empty input or an `MZ` file that does not parse: [`ProbeError`]
pub fn probe(bytes: &[u8]) -> Result<ProbeOutcome, ProbeError> {
  if bytes.is_empty() {
    return Err(ProbeError::Empty);
  }

  if !bytes.starts_with(DOS_SIGNATURE) {
    debug!("payload has no DOS signature, treating as native");
    return Ok(ProbeOutcome::NotManaged);
  }

  let pe = PE::parse(bytes).map_err(|e| ProbeError::MalformedImage(e.to_string()))?;

  let clr = pe
    .header
    .optional_header
    .as_ref()
    .and_then(|oh| oh.data_directories.get_clr_runtime_header().as_ref())
    .map(|dir| (dir.virtual_address, dir.size));

  match clr {
    Some((rva, size)) if rva != 0 && size != 0 => {
      debug!(rva, size, "found CLR runtime header");
      Ok(ProbeOutcome::Managed)
    }
    _ => Ok(ProbeOutcome::NotManaged),
  }
}
