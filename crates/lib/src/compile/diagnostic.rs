//! Compiler output classification.
//!
//! Recognised line shapes:
//!
//! ```text
//! Template.cs(12,9): error CS1002: ; expected
//! error CS2001: Source file 'x.cs' could not be found
//! warning CS0168: The variable 'e' is declared but never used
//! ```
//!
//! A line that does not match but contains `error` is kept as an approximate
//! error so compilers with unusual output still surface something.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Error,
  Warning,
  Info,
}

impl Severity {
  pub fn is_error(self) -> bool {
    matches!(self, Severity::Error)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
  pub severity: Severity,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub column: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  pub message: String,
  /// The line exactly as the compiler printed it.
  pub raw: String,
  /// Set when the line was matched by the `error` substring fallback.
  pub approximate: bool,
}

impl Diagnostic {
  pub fn is_error(&self) -> bool {
    self.severity.is_error()
  }
}

/// Parse one line of compiler output. Returns `None` for lines that carry no
/// diagnostic (banners, summaries without `error`, blank lines).
pub fn parse_line(line: &str) -> Option<Diagnostic> {
  let raw = line.trim_end_matches(['\r', '\n']);
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }

  if let Some(diag) = parse_located(raw, trimmed).or_else(|| parse_unlocated(raw, trimmed)) {
    return Some(diag);
  }

  if trimmed.contains("error") {
    return Some(Diagnostic {
      severity: Severity::Error,
      file: None,
      line: None,
      column: None,
      code: None,
      message: trimmed.to_string(),
      raw: raw.to_string(),
      approximate: true,
    });
  }

  None
}

/// `file(line,col): severity CODE: message`
fn parse_located(raw: &str, text: &str) -> Option<Diagnostic> {
  let sep = text.find("): ")?;
  let open = text[..sep].rfind('(')?;
  let file = &text[..open];
  if file.is_empty() {
    return None;
  }

  let mut pos = text[open + 1..sep].split(',');
  let line = pos.next()?.trim().parse().ok()?;
  let column = match pos.next() {
    Some(c) => Some(c.trim().parse().ok()?),
    None => None,
  };

  let (severity, code, message) = parse_body(&text[sep + 3..])?;
  Some(Diagnostic {
    severity,
    file: Some(file.to_string()),
    line: Some(line),
    column,
    code,
    message,
    raw: raw.to_string(),
    approximate: false,
  })
}

/// `severity CODE: message`
fn parse_unlocated(raw: &str, text: &str) -> Option<Diagnostic> {
  let (severity, code, message) = parse_body(text)?;
  Some(Diagnostic {
    severity,
    file: None,
    line: None,
    column: None,
    code,
    message,
    raw: raw.to_string(),
    approximate: false,
  })
}

fn parse_body(body: &str) -> Option<(Severity, Option<String>, String)> {
  const PREFIXES: [(&str, Severity); 4] = [
    ("fatal error", Severity::Error),
    ("error", Severity::Error),
    ("warning", Severity::Warning),
    ("info", Severity::Info),
  ];

  let (severity, rest) = PREFIXES
    .iter()
    .find_map(|(prefix, sev)| body.strip_prefix(prefix).map(|rest| (*sev, rest)))?;

  if let Some(rest) = rest.strip_prefix(':') {
    return Some((severity, None, rest.trim().to_string()));
  }

  let rest = rest.strip_prefix(' ')?;
  let (code, message) = rest.split_once(':')?;
  let code = code.trim();
  if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
    return None;
  }
  Some((severity, Some(code.to_string()), message.trim().to_string()))
}
