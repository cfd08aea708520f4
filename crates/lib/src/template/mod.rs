//! Template instantiation.
//!
//! Reads the source skeleton line by line, replaces the placeholder markers
//! with literals describing the payload, and writes the result as a new source
//! file. The output is staged in a temporary file beside the destination and
//! renamed into place, so a reader never sees half-written source.

pub mod probe;

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tracing::{debug, info};

use crate::placeholder::{self, Placeholder, PlaceholderError, Resolver};
use crate::util::hash::ContentHash;

pub use probe::{ProbeError, ProbeOutcome, probe};

#[derive(Debug, Error)]
pub enum TemplateError {
  #[error("failed to read template {}: {source}", path.display())]
  ReadTemplate { path: PathBuf, source: io::Error },

  #[error("failed to write generated source {}: {source}", path.display())]
  WriteSource { path: PathBuf, source: io::Error },

  #[error("template {} line {line}: {source}", path.display())]
  Marker {
    path: PathBuf,
    line: usize,
    source: PlaceholderError,
  },

  #[error("template {} is missing required marker {marker}", path.display())]
  MissingMarker { path: PathBuf, marker: Placeholder },

  #[error("cannot classify payload: {0}")]
  Probe(#[from] ProbeError),
}

/// Replacement text for each marker, rendered as C# field initializers.
#[derive(Debug, Clone)]
pub struct Substitution {
  binary: String,
  filename: String,
  managed: String,
  digest: Option<String>,
}

impl Substitution {
  pub fn new(payload: &[u8], filename: &str, managed: bool, digest: Option<&ContentHash>) -> Self {
    Self {
      binary: format!("=\"{}\"", STANDARD.encode(payload)),
      filename: format!("=\"{}\"", escape_literal(filename)),
      managed: format!("={}", u8::from(managed)),
      digest: digest.map(|d| format!("=\"{}\"", d)),
    }
  }
}

impl Resolver for Substitution {
  fn resolve(&self, placeholder: Placeholder) -> Result<&str, PlaceholderError> {
    match placeholder {
      Placeholder::Binary => Ok(&self.binary),
      Placeholder::Filename => Ok(&self.filename),
      Placeholder::IsManaged => Ok(&self.managed),
      Placeholder::ExeHash => self.digest.as_deref().ok_or(PlaceholderError::Unresolved(placeholder)),
    }
  }
}

/// Escape text for a regular (non-verbatim) C# string literal.
fn escape_literal(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for ch in value.chars() {
    match ch {
      '\\' => out.push_str("\\\\"),
      '"' => out.push_str("\\\""),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\t' => out.push_str("\\t"),
      c => out.push(c),
    }
  }
  out
}

/// Apply `resolver` to every line of `template`, preserving line terminators.
///
/// `origin` is only used in error messages.
pub fn render(template: &str, resolver: &impl Resolver, origin: &Path) -> Result<String, TemplateError> {
  let mut out = String::with_capacity(template.len());
  let mut seen = BTreeSet::new();

  for (idx, line) in template.split_inclusive('\n').enumerate() {
    let replaced = placeholder::substitute_into(line, resolver, &mut out).map_err(|source| TemplateError::Marker {
      path: origin.to_path_buf(),
      line: idx + 1,
      source,
    })?;
    seen.extend(replaced);
  }

  if let Some(marker) = Placeholder::REQUIRED.into_iter().find(|m| !seen.contains(m)) {
    return Err(TemplateError::MissingMarker {
      path: origin.to_path_buf(),
      marker,
    });
  }

  Ok(out)
}

/// Generate the payload-specific source file from the template.
///
/// Returns whether the payload was detected as a managed image, which is also
/// the value written for `/*@IS_DOT_NET*/`.
pub fn instantiate(
  template_path: &Path,
  dest_path: &Path,
  payload: &[u8],
  filename: &str,
  digest: Option<&ContentHash>,
) -> Result<bool, TemplateError> {
  let managed = probe(payload)?.is_managed();
  debug!(managed, "payload probed");

  let template = std::fs::read_to_string(template_path).map_err(|source| TemplateError::ReadTemplate {
    path: template_path.to_path_buf(),
    source,
  })?;

  let substitution = Substitution::new(payload, filename, managed, digest);
  let source = render(&template, &substitution, template_path)?;

  write_atomic(dest_path, source.as_bytes()).map_err(|source| TemplateError::WriteSource {
    path: dest_path.to_path_buf(),
    source,
  })?;

  info!(path = ?dest_path, bytes = source.len(), "source generated");
  Ok(managed)
}

/// Write `contents` to a temporary file in the same directory as `dest` and
/// rename it over `dest`.
pub(crate) fn write_atomic(dest: &Path, contents: &[u8]) -> io::Result<()> {
  let dir = dest
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));

  let mut staged = tempfile::Builder::new().prefix(".lockwrap-").suffix(".tmp").tempfile_in(dir)?;
  staged.write_all(contents)?;
  staged.as_file().sync_all()?;
  staged.persist(dest).map_err(|e| e.error)?;
  Ok(())
}
