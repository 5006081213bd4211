//! Node-local diagnostics
//!
//! Failures attributed to a single graph node never abort a walk. They are
//! collected here and returned alongside whatever state resulted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How serious a diagnostic is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Dependency graph is cyclic
    GraphCycle,
    /// Invalid or unsatisfiable configuration
    Configuration,
    /// A provider call returned an error
    ProviderOperation,
    /// A user-declared precondition did not hold
    PreconditionFailure,
    /// A user-declared postcondition did not hold
    PostconditionFailure,
    /// The node was not run because something upstream failed
    UpstreamFailure,
    /// The node was not run because the operation was stopped
    Cancelled,
    /// A reference could not be resolved
    Evaluation,
    /// A provider returned a value that breaks an engine invariant
    InvalidResult,
}

/// One diagnostic message, optionally attributed to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub summary: String,
    pub detail: String,
    /// Address of the node the diagnostic belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl Diagnostic {
    pub fn error(
        kind: DiagnosticKind,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            summary: summary.into(),
            detail: detail.into(),
            subject: None,
        }
    }

    pub fn warning(
        kind: DiagnosticKind,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(kind, summary, detail)
        }
    }

    /// Attach the address this diagnostic is about
    pub fn with_subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    /// Error raised by a provider call
    pub fn provider(operation: &str, err: &anyhow::Error) -> Self {
        Self::error(
            DiagnosticKind::ProviderOperation,
            format!("Provider {operation} failed"),
            format!("{err:#}"),
        )
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.summary)
        } else {
            write!(f, "{}: {}", self.summary, self.detail)
        }
    }
}

/// An ordered collection of diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| !d.is_error())
    }

    /// Diagnostics of one kind
    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(move |d| d.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Join all errors into one message, for callers that want a single line
    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<String> = self.errors().map(ToString::to_string).collect();
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_summary_and_detail() {
        let diag = Diagnostic::error(
            DiagnosticKind::PostconditionFailure,
            "Resource postcondition failed",
            "Output must not be blank.",
        );
        assert_eq!(
            diag.to_string(),
            "Resource postcondition failed: Output must not be blank."
        );
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning(
            DiagnosticKind::UpstreamFailure,
            "Skipped",
            "",
        ));
        assert!(!diags.has_errors());
        diags.push(
            Diagnostic::error(DiagnosticKind::Configuration, "Bad", "thing")
                .with_subject("test_object.a"),
        );
        assert!(diags.has_errors());
        assert_eq!(diags.errors().count(), 1);
        assert_eq!(diags.warnings().count(), 1);
        assert_eq!(diags.error_summary().as_deref(), Some("Bad: thing"));
    }

    #[test]
    fn test_provider_error_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("dial");
        let diag = Diagnostic::provider("apply", &err);
        assert_eq!(diag.summary, "Provider apply failed");
        assert_eq!(diag.detail, "dial: connection refused");
    }
}
