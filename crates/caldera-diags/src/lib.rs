//! Accumulating diagnostics.
//!
//! Every public engine entry point reports problems through a [`Diagnostics`]
//! collection rather than returning on the first error, so a user sees all
//! problems found in one pass. A collection containing at least one
//! error-severity item means the operation did not complete successfully.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
  Error,
  Warning,
}

/// A single problem report.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
  pub severity: Severity,
  /// Short problem statement, e.g. "Duplicate provider instance".
  pub summary: String,
  /// Longer explanation with addresses and remediation hints.
  pub detail: String,
  /// The configuration block or address the problem is attributed to.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subject: Option<String>,
}

/// Sentence appended to diagnostics that indicate an internal bug rather than
/// a user error.
const BUG_REPORT: &str = "This is a bug in Caldera; please report it.";

impl Diagnostic {
  pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
    Self {
      severity: Severity::Error,
      summary: summary.into(),
      detail: detail.into(),
      subject: None,
    }
  }

  pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
    Self {
      severity: Severity::Warning,
      summary: summary.into(),
      detail: detail.into(),
      subject: None,
    }
  }

  /// An internal-consistency error. The detail is suffixed with a request to
  /// report the problem, since a user cannot fix it through configuration.
  pub fn bug(summary: impl Into<String>, detail: impl Into<String>) -> Self {
    let detail = detail.into();
    let detail = if detail.ends_with('.') {
      format!("{} {}", detail, BUG_REPORT)
    } else {
      format!("{}. {}", detail, BUG_REPORT)
    };
    Self::error(summary, detail)
  }

  pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
    self.subject = Some(subject.into());
    self
  }

  pub fn is_error(&self) -> bool {
    self.severity == Severity::Error
  }

  /// Whether this diagnostic was produced by the `bug` constructor.
  pub fn is_bug(&self) -> bool {
    self.detail.ends_with(BUG_REPORT)
  }
}

impl fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let sev = match self.severity {
      Severity::Error => "Error",
      Severity::Warning => "Warning",
    };
    match &self.subject {
      Some(subject) => write!(f, "{}: {} ({}): {}", sev, self.summary, subject, self.detail),
      None => write!(f, "{}: {}: {}", sev, self.summary, self.detail),
    }
  }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, diag: Diagnostic) {
    self.0.push(diag);
  }

  pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
    self.0.extend(other);
  }

  /// Append an error built from any error value, with a summary line.
  pub fn push_error(&mut self, summary: impl Into<String>, err: impl fmt::Display) {
    self.0.push(Diagnostic::error(summary, err.to_string()));
  }

  pub fn has_errors(&self) -> bool {
    self.0.iter().any(Diagnostic::is_error)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
    self.0.iter()
  }

  /// Sort into a stable order. Concurrent graph walks produce diagnostics in
  /// a nondeterministic sequence; only the set is meaningful, so results are
  /// sorted before being returned to callers.
  pub fn sort(&mut self) {
    self.0.sort();
    self.0.dedup();
  }
}

impl IntoIterator for Diagnostics {
  type Item = Diagnostic;
  type IntoIter = std::vec::IntoIter<Diagnostic>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

impl<'a> IntoIterator for &'a Diagnostics {
  type Item = &'a Diagnostic;
  type IntoIter = std::slice::Iter<'a, Diagnostic>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.iter()
  }
}

impl From<Diagnostic> for Diagnostics {
  fn from(diag: Diagnostic) -> Self {
    Self(vec![diag])
  }
}

impl FromIterator<Diagnostic> for Diagnostics {
  fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bug_diagnostics_carry_report_request() {
    let diag = Diagnostic::bug("Invalid planned change", "The plan is inconsistent");
    assert!(diag.is_bug());
    assert!(diag.detail.contains("please report it"));

    let user = Diagnostic::error("Duplicate provider instance", "already declared");
    assert!(!user.is_bug());
  }

  #[test]
  fn has_errors_ignores_warnings() {
    let mut diags = Diagnostics::new();
    diags.push(Diagnostic::warning("deprecated", "do not use"));
    assert!(!diags.has_errors());
    diags.push(Diagnostic::error("broken", "very"));
    assert!(diags.has_errors());
    assert_eq!(diags.len(), 2);
  }

  #[test]
  fn sort_dedups_identical_diagnostics() {
    let mut diags = Diagnostics::new();
    diags.push(Diagnostic::error("b", "x"));
    diags.push(Diagnostic::error("a", "x"));
    diags.push(Diagnostic::error("b", "x"));
    diags.sort();
    assert_eq!(diags.len(), 2);
    assert_eq!(diags.iter().next().map(|d| d.summary.as_str()), Some("a"));
  }
}
