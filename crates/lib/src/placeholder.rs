//! Placeholder parsing and substitution for template skeletons.
//!
//! A template is ordinary source text with a fixed set of markers written as
//! block comments, so the skeleton still compiles on its own:
//!
//! - `/*@BINARY*/` - the payload, base64-encoded
//! - `/*@FILENAME*/` - the payload's file name
//! - `/*@IS_DOT_NET*/` - `1` when the payload is a managed image, else `0`
//! - `/*@EXE_HASH*/` - the payload digest
//!
//! Any other `/*@NAME*/` token whose name is made of ASCII letters, digits and
//! underscores is a defect in the template and fails parsing. Comments that do
//! not have that shape (`/*@ see below */`) pass through as literal text.
//!
//! Substitution is single-pass: text produced by a resolver is never scanned
//! for markers again.
//!
//! # Example
//!
//! ```
//! use lockwrap_lib::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("static string name /*@FILENAME*/;").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("static string name "),
//!     Segment::Placeholder(Placeholder::Filename),
//!     Segment::Literal(";"),
//! ]);
//! ```

use std::fmt;

use thiserror::Error;

const OPEN: &str = "/*@";
const CLOSE: &str = "*/";

/// A recognised template marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Placeholder {
  /// `/*@BINARY*/`
  Binary,
  /// `/*@FILENAME*/`
  Filename,
  /// `/*@IS_DOT_NET*/`
  IsManaged,
  /// `/*@EXE_HASH*/`
  ExeHash,
}

impl Placeholder {
  pub const ALL: [Placeholder; 4] = [
    Placeholder::Binary,
    Placeholder::Filename,
    Placeholder::IsManaged,
    Placeholder::ExeHash,
  ];

  /// Markers a template must contain to produce a usable program.
  pub const REQUIRED: [Placeholder; 3] = [Placeholder::Binary, Placeholder::Filename, Placeholder::IsManaged];

  pub fn name(self) -> &'static str {
    match self {
      Placeholder::Binary => "BINARY",
      Placeholder::Filename => "FILENAME",
      Placeholder::IsManaged => "IS_DOT_NET",
      Placeholder::ExeHash => "EXE_HASH",
    }
  }

  /// The full marker text as it appears in a template.
  pub fn token(self) -> String {
    format!("{}{}{}", OPEN, self.name(), CLOSE)
  }

  fn from_name(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|p| p.name() == name)
  }
}

impl fmt::Display for Placeholder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.token())
  }
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
  /// Literal text, copied through unchanged
  Literal(&'a str),

  /// A marker to be resolved
  Placeholder(Placeholder),
}

/// Errors that can occur during placeholder parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unknown template marker '/*@{0}*/'")]
  UnknownMarker(String),

  #[error("no value for template marker {0}")]
  Unresolved(Placeholder),
}

/// Supplies replacement text for markers.
pub trait Resolver {
  fn resolve(&self, placeholder: Placeholder) -> Result<&str, PlaceholderError>;
}

/// Parse a line (or any string) into literal and marker segments.
///
/// # Errors
///
/// Returns [`PlaceholderError::UnknownMarker`] for a marker-shaped token that
/// is not one of [`Placeholder::ALL`].
pub fn parse(input: &str) -> Result<Vec<Segment<'_>>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal_start = 0;
  let mut search_from = 0;

  while let Some(rel) = input[search_from..].find(OPEN) {
    let open = search_from + rel;
    let name_start = open + OPEN.len();

    let Some(close_rel) = input[name_start..].find(CLOSE) else {
      break;
    };
    let name = &input[name_start..name_start + close_rel];
    let end = name_start + close_rel + CLOSE.len();

    if !is_marker_name(name) {
      // Ordinary comment that happens to start with '@'
      search_from = name_start;
      continue;
    }

    let placeholder = Placeholder::from_name(name).ok_or_else(|| PlaceholderError::UnknownMarker(name.to_string()))?;

    if open > literal_start {
      segments.push(Segment::Literal(&input[literal_start..open]));
    }
    segments.push(Segment::Placeholder(placeholder));
    literal_start = end;
    search_from = end;
  }

  if literal_start < input.len() {
    segments.push(Segment::Literal(&input[literal_start..]));
  }

  Ok(segments)
}

fn is_marker_name(name: &str) -> bool {
  !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Substitute markers in `input`, appending the result to `out`.
///
/// Returns the markers that were replaced, in order of appearance.
pub fn substitute_into(input: &str, resolver: &impl Resolver, out: &mut String) -> Result<Vec<Placeholder>, PlaceholderError> {
  let segments = parse(input)?;
  let mut replaced = Vec::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => out.push_str(s),
      Segment::Placeholder(p) => {
        out.push_str(resolver.resolve(p)?);
        replaced.push(p);
      }
    }
  }

  Ok(replaced)
}

/// Substitute markers in `input` and return the new string.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut out = String::with_capacity(input.len());
  substitute_into(input, resolver, &mut out)?;
  Ok(out)
}
