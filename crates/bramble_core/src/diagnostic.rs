use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// How severe a diagnostic is.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
  /// The build cannot produce valid output.
  Error,
  /// Something is likely misconfigured, but the build proceeds.
  #[default]
  Warning,
}

/// This is a user facing message emitted by bramble.
///
/// Diagnostics cover conditions the user can act on (a misconfigured manual
/// shared bundle, an unsupported bundle behavior combination). Internal
/// invariant failures are not diagnostics; those abort the build as errors.
#[derive(Error, Debug, Deserialize, PartialEq, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
  /// A summary user-facing message
  pub message: String,

  /// Indicates where this diagnostic was emitted from
  pub origin: Option<String>,

  pub severity: DiagnosticSeverity,

  /// Hints for the user
  pub hints: Option<Vec<String>>,

  /// URL for the user to refer to documentation
  #[serde(rename = "documentationURL")]
  pub documentation_url: Option<String>,
}

impl Display for Diagnostic {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.message)
  }
}

impl Diagnostic {
  pub fn warning(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      severity: DiagnosticSeverity::Warning,
      ..Self::default()
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      severity: DiagnosticSeverity::Error,
      ..Self::default()
    }
  }

  pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
    self.origin = Some(origin.into());
    self
  }

  pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
    self.hints.get_or_insert_with(Vec::new).push(hint.into());
    self
  }
}
